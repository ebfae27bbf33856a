use std::fmt::{self, Display, Formatter};

use crate::byte_iter::ByteIter;
use crate::error::*;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    FuncRef,
    ExternRef,
}

impl ValType {
    #[inline]
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7f => Some(ValType::I32),
            0x7e => Some(ValType::I64),
            0x7d => Some(ValType::F32),
            0x7c => Some(ValType::F64),
            0x7b => Some(ValType::V128),
            0x70 => Some(ValType::FuncRef),
            0x6f => Some(ValType::ExternRef),
            _ => None,
        }
    }

    #[inline]
    pub fn is_ref(self) -> bool { matches!(self, ValType::FuncRef | ValType::ExternRef) }

    #[inline]
    pub fn is_num(self) -> bool { matches!(self, ValType::I32 | ValType::I64 | ValType::F32 | ValType::F64) }

    pub(crate) fn read(it: &mut ByteIter) -> Result<Self, Error> {
        let byte = it.read_u8()?;
        ValType::from_byte(byte).ok_or(Error::Malformed(INVALID_VALUE_TYPE))
    }
}

impl Display for ValType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValType::I32 => "i32",
            ValType::I64 => "i64",
            ValType::F32 => "f32",
            ValType::F64 => "f64",
            ValType::V128 => "v128",
            ValType::FuncRef => "funcref",
            ValType::ExternRef => "externref",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RefType {
    FuncRef,
    ExternRef,
}

impl RefType {
    pub(crate) fn read(it: &mut ByteIter) -> Result<Self, Error> {
        match it.read_u8()? {
            0x70 => Ok(RefType::FuncRef),
            0x6f => Ok(RefType::ExternRef),
            _ => malformed(MALFORMED_REF_TYPE),
        }
    }
}

impl From<RefType> for ValType {
    fn from(ty: RefType) -> Self {
        match ty {
            RefType::FuncRef => ValType::FuncRef,
            RefType::ExternRef => ValType::ExternRef,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: impl Into<Vec<ValType>>, results: impl Into<Vec<ValType>>) -> Self {
        Self { params: params.into(), results: results.into() }
    }
}

impl Display for FuncType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fn list(f: &mut Formatter<'_>, types: &[ValType]) -> fmt::Result {
            f.write_str("(")?;
            for (i, ty) in types.iter().enumerate() {
                if i > 0 { f.write_str(", ")?; }
                write!(f, "{ty}")?;
            }
            f.write_str(")")
        }
        list(f, &self.params)?;
        f.write_str(" -> ")?;
        list(f, &self.results)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Limits {
    pub min: u64,
    pub max: Option<u64>,
}

impl Limits {
    /// Import matching: `self` (the provided entity) must fit inside `required`.
    pub fn fits(&self, required: &Limits) -> bool {
        if self.min < required.min { return false; }
        match (required.max, self.max) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(req), Some(have)) => have <= req,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TableType {
    pub element: RefType,
    pub limits: Limits,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryType {
    pub limits: Limits,
    pub shared: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GlobalType {
    pub content: ValType,
    pub mutable: bool,
}

/// Block signature as written in the code section.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    Func(u32),
}

impl BlockType {
    pub(crate) fn read(it: &mut ByteIter) -> Result<Self, Error> {
        const EMPTY_TYPE: u8 = 0x40;
        let byte = it.peek_u8()?;
        if byte == EMPTY_TYPE {
            it.advance(1);
            return Ok(BlockType::Empty);
        }
        if let Some(ty) = ValType::from_byte(byte) {
            it.advance(1);
            return Ok(BlockType::Value(ty));
        }
        let n = it.read_i33()?;
        if n < 0 {
            return malformed(INVALID_VALUE_TYPE);
        }
        Ok(BlockType::Func(n as u32))
    }
}
