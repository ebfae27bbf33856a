use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use log::debug;
use nohash_hasher::{IntMap, IntSet};

use crate::byte_iter::*;
use crate::error::*;
use crate::types::*;

// ---------------- Import/Export related ----------------
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportRef { pub module: String, pub name: String }

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternKind {
    Func = 0,
    Table = 1,
    Memory = 2,
    Global = 3,
}

impl ExternKind {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ExternKind::Func),
            1 => Some(ExternKind::Table),
            2 => Some(ExternKind::Memory),
            3 => Some(ExternKind::Global),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ExternKind::Func => "function",
            ExternKind::Table => "table",
            ExternKind::Memory => "memory",
            ExternKind::Global => "global",
        }
    }
}

// ---------------- Structures ----------------
/// A constant expression, kept as the byte range of its instructions including `end`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstExpr(pub Range<usize>);

#[derive(Clone, Debug)]
pub struct Function {
    pub type_index: u32,
    /// Byte range of the instructions, after the local declarations.
    pub body: Range<usize>,
    /// Declared locals, excluding parameters.
    pub locals: Vec<ValType>,
    pub import: Option<ImportRef>,
}

#[derive(Clone, Debug)]
pub struct Table { pub ty: TableType, pub import: Option<ImportRef> }

#[derive(Clone, Debug)]
pub struct Memory { pub ty: MemoryType, pub import: Option<ImportRef> }

#[derive(Clone, Debug)]
pub struct Global { pub ty: GlobalType, pub init: Option<ConstExpr>, pub import: Option<ImportRef> }

#[derive(Clone, Debug)]
pub struct Export { pub name: String, pub kind: ExternKind, pub index: u32 }

#[derive(Clone, Debug)]
pub enum ElementMode {
    Passive,
    Active { table: u32, offset: ConstExpr },
    Declarative,
}

#[derive(Clone, Debug)]
pub enum ElementItems {
    Functions(Vec<u32>),
    Expressions(Vec<ConstExpr>),
}

impl ElementItems {
    pub fn len(&self) -> usize {
        match self {
            ElementItems::Functions(f) => f.len(),
            ElementItems::Expressions(e) => e.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[derive(Clone, Debug)]
pub struct ElementSegment { pub ty: RefType, pub mode: ElementMode, pub items: ElementItems }

#[derive(Clone, Debug)]
pub enum DataMode {
    Passive,
    Active { memory: u32, offset: ConstExpr },
}

#[derive(Clone, Debug)]
pub struct DataSegment { pub mode: DataMode, pub bytes: Range<usize> }

// ---------------- Module Structure ----------------
/// A decoded module. Function bodies stay as byte ranges; they are translated on demand.
pub struct Module {
    pub(crate) bytes: Arc<[u8]>,
    pub types: Vec<FuncType>,
    pub imports: Vec<(ImportRef, ExternKind)>,
    pub functions: Vec<Function>,
    pub tables: Vec<Table>,
    pub memories: Vec<Memory>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export>,
    pub start: Option<u32>,
    pub elements: Vec<ElementSegment>,
    pub data_count: Option<u32>,
    pub data_segments: Vec<DataSegment>,
    pub function_names: IntMap<u32, String>,
    /// Functions named outside of code bodies, the only ones `ref.func` may take in a body.
    pub declared_functions: IntSet<u32>,
}

const MAGIC_HEADER: &[u8; 4] = b"\0asm";
const CUSTOM_SECTION: u8 = 0;
const DATA_COUNT_SECTION: u8 = 12;

macro_rules! assert_not_empty {
    ($it:expr) => { if $it.empty() { return malformed(UNEXPECTED_END); } };
}

impl Module {
    pub const MAX_PAGES: u64 = 65536;
    pub const MAX_LOCALS: usize = 50000;

    pub fn parse(bytes: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let bytes: Vec<u8> = bytes.into();
        let mut m = Module {
            bytes: Arc::from(bytes),
            types: Vec::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exports: Vec::new(),
            start: None,
            elements: Vec::new(),
            data_count: None,
            data_segments: Vec::new(),
            function_names: IntMap::default(),
            declared_functions: IntSet::default(),
        };
        m.initialize()?;
        debug!(
            "decoded module: {} types, {} functions, {} exports",
            m.types.len(),
            m.functions.len(),
            m.exports.len()
        );
        Ok(m)
    }

    pub fn bytes(&self) -> &[u8] { &self.bytes }

    pub fn func_type(&self, function_index: u32) -> Option<&FuncType> {
        let f = self.functions.get(function_index as usize)?;
        self.types.get(f.type_index as usize)
    }

    pub fn imported_function_count(&self) -> usize {
        self.functions.iter().take_while(|f| f.import.is_some()).count()
    }

    pub fn export(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }

    fn initialize(&mut self) -> Result<(), Error> {
        let bytes_arc = self.bytes.clone();
        let bytes: &[u8] = &bytes_arc[..];

        if bytes.len() < 4 { return malformed(UNEXPECTED_END); }
        if &bytes[0..4] != MAGIC_HEADER { return malformed(NO_MAGIC_HEADER); }
        if bytes.len() < 8 { return malformed(UNEXPECTED_END); }
        if bytes[4..8] != [1, 0, 0, 0] { return malformed(UNKNOWN_BINARY_VERSION); }

        let mut it = ByteIter::new(bytes, 8);
        let mut last_rank = 0u8;
        let mut code_seen = false;
        while !it.empty() {
            let id = it.read_u8()?;
            let section_length = it.read_u32()? as usize;
            let section_start = it.cur();
            if !it.has_n_left(section_length) { return malformed(UNEXPECTED_END_SHORT); }
            let mut body = ByteIter::bounded(bytes, section_start..section_start + section_length);

            if id == CUSTOM_SECTION {
                self.parse_custom_section(&mut body);
                it.advance(section_length);
                continue;
            }
            let rank = section_rank(id).ok_or(Error::Malformed(INVALID_SECTION_ID))?;
            if rank <= last_rank { return malformed(SECTION_OUT_OF_ORDER); }
            last_rank = rank;

            match id {
                1 => self.parse_type_section(&mut body)?,
                2 => self.parse_import_section(&mut body)?,
                3 => self.parse_function_section(&mut body)?,
                4 => self.parse_table_section(&mut body)?,
                5 => self.parse_memory_section(&mut body)?,
                6 => self.parse_global_section(&mut body)?,
                7 => self.parse_export_section(&mut body)?,
                8 => self.parse_start_section(&mut body)?,
                9 => self.parse_element_section(&mut body)?,
                10 => { code_seen = true; self.parse_code_section(&mut body)? }
                11 => self.parse_data_section(&mut body)?,
                DATA_COUNT_SECTION => self.data_count = Some(body.read_u32()?),
                _ => return malformed(INVALID_SECTION_ID),
            }
            if !body.empty() { return malformed(SECTION_SIZE_MISMATCH); }
            it.advance(section_length);
        }

        if !code_seen && self.functions.iter().any(|f| f.import.is_none()) {
            return malformed(FUNC_CODE_INCONSISTENT);
        }
        if let Some(count) = self.data_count {
            if count as usize != self.data_segments.len() { return malformed(DATA_COUNT_MISMATCH); }
        }
        Ok(())
    }

    fn parse_type_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_types = it.read_u32()?;
        self.types.reserve_exact(n_types as usize);
        for _ in 0..n_types {
            assert_not_empty!(it);
            if it.read_u8()? != 0x60 { return malformed(INVALID_FUNC_TYPE); }
            let n_params = it.read_u32()?;
            let mut params = Vec::with_capacity(n_params.min(1024) as usize);
            for _ in 0..n_params { params.push(ValType::read(it)?); }
            let n_results = it.read_u32()?;
            let mut results = Vec::with_capacity(n_results.min(1024) as usize);
            for _ in 0..n_results { results.push(ValType::read(it)?); }
            self.types.push(FuncType { params, results });
        }
        Ok(())
    }

    fn parse_import_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_imports = it.read_u32()?;
        for _ in 0..n_imports {
            assert_not_empty!(it);
            let module = it.read_name()?;
            let name = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::Malformed(MALFORMED_IMPORT_KIND))?;
            let import = Some(ImportRef { module, name });

            match kind {
                ExternKind::Func => {
                    let type_index = it.read_u32()?;
                    if type_index as usize >= self.types.len() { return invalid(UNKNOWN_TYPE, it.cur()); }
                    self.functions.push(Function { type_index, body: 0..0, locals: vec![], import: import.clone() });
                }
                ExternKind::Table => {
                    let ty = read_table_type(it)?;
                    self.tables.push(Table { ty, import: import.clone() });
                }
                ExternKind::Memory => {
                    let ty = read_memory_type(it)?;
                    self.memories.push(Memory { ty, import: import.clone() });
                }
                ExternKind::Global => {
                    let ty = read_global_type(it)?;
                    self.globals.push(Global { ty, init: None, import: import.clone() });
                }
            }
            if let Some(import) = import {
                self.imports.push((import, kind));
            }
        }
        if self.memories.len() > 1 { return invalid(MULTIPLE_MEMORIES, it.cur()); }
        Ok(())
    }

    fn parse_function_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_functions = it.read_u32()?;
        self.functions.reserve(n_functions as usize);
        for _ in 0..n_functions {
            assert_not_empty!(it);
            let type_index = it.read_u32()?;
            if type_index as usize >= self.types.len() { return invalid(UNKNOWN_TYPE, it.cur()); }
            self.functions.push(Function { type_index, body: 0..0, locals: vec![], import: None });
        }
        Ok(())
    }

    fn parse_table_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_tables = it.read_u32()?;
        for _ in 0..n_tables {
            assert_not_empty!(it);
            let ty = read_table_type(it)?;
            self.tables.push(Table { ty, import: None });
        }
        Ok(())
    }

    fn parse_memory_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_memories = it.read_u32()?;
        for _ in 0..n_memories {
            assert_not_empty!(it);
            let ty = read_memory_type(it)?;
            self.memories.push(Memory { ty, import: None });
        }
        if self.memories.len() > 1 { return invalid(MULTIPLE_MEMORIES, it.cur()); }
        Ok(())
    }

    fn parse_global_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_globals = it.read_u32()?;
        for _ in 0..n_globals {
            assert_not_empty!(it);
            let ty = read_global_type(it)?;
            let init = self.read_const_expr(it)?;
            self.globals.push(Global { ty, init: Some(init), import: None });
        }
        Ok(())
    }

    fn parse_export_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_exports = it.read_u32()?;
        let mut seen = HashSet::new();
        for _ in 0..n_exports {
            assert_not_empty!(it);
            let name = it.read_name()?;
            let kind = ExternKind::from_byte(it.read_u8()?).ok_or(Error::Malformed(MALFORMED_EXPORT_KIND))?;
            let index = it.read_u32()?;
            if !seen.insert(name.clone()) { return invalid(DUP_EXPORT_NAME, it.cur()); }
            let (count, msg) = match kind {
                ExternKind::Func => (self.functions.len(), UNKNOWN_FUNC),
                ExternKind::Table => (self.tables.len(), UNKNOWN_TABLE),
                ExternKind::Memory => (self.memories.len(), UNKNOWN_MEMORY),
                ExternKind::Global => (self.globals.len(), UNKNOWN_GLOBAL),
            };
            if index as usize >= count { return invalid(msg, it.cur()); }
            if kind == ExternKind::Func {
                self.declared_functions.insert(index);
            }
            self.exports.push(Export { name, kind, index });
        }
        Ok(())
    }

    fn parse_start_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let start = it.read_u32()?;
        let Some(ty) = self.func_type(start) else { return invalid(UNKNOWN_FUNC, it.cur()) };
        if !ty.params.is_empty() || !ty.results.is_empty() { return invalid(START_FUNC, it.cur()); }
        self.start = Some(start);
        Ok(())
    }

    fn parse_element_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_segments = it.read_u32()?;
        for _ in 0..n_segments {
            assert_not_empty!(it);
            let flags = it.read_u32()?;
            if flags > 7 { return malformed(MALFORMED_SEGMENT_FLAGS); }
            let passive_or_declarative = flags & 0b001 != 0;
            let explicit_table = flags & 0b010 != 0;
            let uses_expressions = flags & 0b100 != 0;

            let mode = if !passive_or_declarative {
                let table = if explicit_table { it.read_u32()? } else { 0 };
                if table as usize >= self.tables.len() { return invalid(UNKNOWN_TABLE, it.cur()); }
                let offset = self.read_const_expr(it)?;
                ElementMode::Active { table, offset }
            } else if explicit_table {
                ElementMode::Declarative
            } else {
                ElementMode::Passive
            };

            // Flags 0 and 4 imply funcref; the others spell out the element kind or type.
            let has_kind = flags & 0b011 != 0;
            let ty = if !has_kind {
                RefType::FuncRef
            } else if uses_expressions {
                RefType::read(it)?
            } else {
                if it.read_u8()? != 0x00 { return malformed(MALFORMED_ELEM_KIND); }
                RefType::FuncRef
            };

            let n_items = it.read_u32()?;
            let items = if uses_expressions {
                let mut exprs = Vec::with_capacity(n_items.min(4096) as usize);
                for _ in 0..n_items { exprs.push(self.read_const_expr(it)?); }
                ElementItems::Expressions(exprs)
            } else {
                let mut funcs = Vec::with_capacity(n_items.min(4096) as usize);
                for _ in 0..n_items {
                    let f = it.read_u32()?;
                    if f as usize >= self.functions.len() { return invalid(UNKNOWN_FUNC, it.cur()); }
                    self.declared_functions.insert(f);
                    funcs.push(f);
                }
                ElementItems::Functions(funcs)
            };
            self.elements.push(ElementSegment { ty, mode, items });
        }
        Ok(())
    }

    fn parse_code_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_functions = it.read_u32()? as usize;
        let n_imports = self.imported_function_count();
        if n_functions + n_imports != self.functions.len() { return malformed(FUNC_CODE_INCONSISTENT); }

        for i in n_imports..self.functions.len() {
            let function_length = it.read_u32()? as usize;
            let func_start = it.cur();
            if !it.has_n_left(function_length) { return malformed(UNEXPECTED_END); }
            let func_end = func_start + function_length;
            let mut body = ByteIter::bounded(it.bytes, func_start..func_end);

            let mut locals = Vec::new();
            let n_local_decls = body.read_u32()?;
            for _ in 0..n_local_decls {
                let n_locals = body.read_u32()? as usize;
                let ty = ValType::read(&mut body)?;
                if locals.len() + n_locals > Module::MAX_LOCALS { return malformed(TOO_MANY_LOCALS); }
                locals.extend(std::iter::repeat(ty).take(n_locals));
            }

            let function = &mut self.functions[i];
            function.locals = locals;
            function.body = body.cur()..func_end;
            it.advance(function_length);
        }
        Ok(())
    }

    fn parse_data_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        let n_data_segments = it.read_u32()?;
        for _ in 0..n_data_segments {
            assert_not_empty!(it);
            let flags = it.read_u32()?;
            let mode = match flags {
                0 => DataMode::Active { memory: 0, offset: self.read_const_expr(it)? },
                1 => DataMode::Passive,
                2 => {
                    let memory = it.read_u32()?;
                    DataMode::Active { memory, offset: self.read_const_expr(it)? }
                }
                _ => return malformed(MALFORMED_SEGMENT_FLAGS),
            };
            if let DataMode::Active { memory, .. } = &mode {
                if *memory as usize >= self.memories.len() { return invalid(UNKNOWN_MEMORY, it.cur()); }
            }
            let len = it.read_u32()? as usize;
            let start = it.cur();
            it.read_bytes(len)?;
            self.data_segments.push(DataSegment { mode, bytes: start..start + len });
        }
        Ok(())
    }

    fn parse_custom_section(&mut self, it: &mut ByteIter) {
        // A broken name section is ignored rather than failing the module.
        let Ok(name) = it.read_name() else { return };
        if name != "name" { return; }
        let _ = self.parse_name_section(it);
    }

    fn parse_name_section(&mut self, it: &mut ByteIter) -> Result<(), Error> {
        const FUNCTION_NAMES: u8 = 1;
        while !it.empty() {
            let id = it.read_u8()?;
            let len = it.read_u32()? as usize;
            if id != FUNCTION_NAMES {
                it.read_bytes(len)?;
                continue;
            }
            let count = it.read_u32()?;
            for _ in 0..count {
                let index = it.read_u32()?;
                let name = it.read_name()?;
                self.function_names.insert(index, name);
            }
        }
        Ok(())
    }

    /// Checks the shape of a constant expression and returns its byte range.
    fn read_const_expr(&mut self, it: &mut ByteIter) -> Result<ConstExpr, Error> {
        let start = it.cur();
        loop {
            let op_offset = it.cur();
            match it.read_u8()? {
                0x0b => break,
                0x41 => { it.read_i32()?; }
                0x42 => { it.read_i64()?; }
                0x43 => { it.read_f32_bits()?; }
                0x44 => { it.read_f64_bits()?; }
                0x23 => {
                    // Only imported globals are visible, and they must be immutable.
                    let g = it.read_u32()?;
                    let Some(global) = self.globals.get(g as usize).filter(|g| g.import.is_some()) else {
                        return invalid(UNKNOWN_GLOBAL, op_offset);
                    };
                    if global.ty.mutable { return invalid(CONST_EXP_REQUIRED, op_offset); }
                }
                0xd0 => { RefType::read(it)?; }
                0xd2 => {
                    let f = it.read_u32()?;
                    if f as usize >= self.functions.len() { return invalid(UNKNOWN_FUNC, op_offset); }
                    self.declared_functions.insert(f);
                }
                0x6a | 0x6b | 0x6c | 0x7c | 0x7d | 0x7e => {}
                _ => return invalid(CONST_EXP_REQUIRED, op_offset),
            }
        }
        Ok(ConstExpr(start..it.cur()))
    }
}

// ---------------- Helper Functions ----------------
fn section_rank(id: u8) -> Option<u8> {
    match id {
        1..=9 => Some(id),
        DATA_COUNT_SECTION => Some(10),
        10 => Some(11),
        11 => Some(12),
        _ => None,
    }
}

/// Returns `(min, max, shared)`.
fn read_limits(it: &mut ByteIter) -> Result<(u64, Option<u64>, bool), Error> {
    let flags = it.read_u8()?;
    if flags > 0x03 { return malformed(INVALID_LIMITS); }
    let min = it.read_u32()? as u64;
    let max = if flags & 0x01 != 0 { Some(it.read_u32()? as u64) } else { None };
    if let Some(max) = max {
        if max < min { return invalid(MIN_GREATER_THAN_MAX, it.cur()); }
    }
    Ok((min, max, flags & 0x02 != 0))
}

fn read_table_type(it: &mut ByteIter) -> Result<TableType, Error> {
    let element = RefType::read(it)?;
    let (min, max, shared) = read_limits(it)?;
    if shared { return malformed(INVALID_LIMITS); }
    Ok(TableType { element, limits: Limits { min, max } })
}

fn read_memory_type(it: &mut ByteIter) -> Result<MemoryType, Error> {
    let (min, max, shared) = read_limits(it)?;
    if min > Module::MAX_PAGES || max.is_some_and(|m| m > Module::MAX_PAGES) {
        return invalid(MEMORY_SIZE_LIMIT, it.cur());
    }
    if shared && max.is_none() { return invalid(SHARED_MEMORY_NEEDS_MAX, it.cur()); }
    Ok(MemoryType { limits: Limits { min, max }, shared })
}

fn read_global_type(it: &mut ByteIter) -> Result<GlobalType, Error> {
    let content = ValType::read(it)?;
    let mutable = match it.read_u8()? {
        0 => false,
        1 => true,
        _ => return malformed(INVALID_MUTABILITY),
    };
    Ok(GlobalType { content, mutable })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_header() {
        assert!(matches!(Module::parse(b"\0asn\x01\0\0\0".to_vec()), Err(Error::Malformed(NO_MAGIC_HEADER))));
        assert!(matches!(Module::parse(b"\0asm\x02\0\0\0".to_vec()), Err(Error::Malformed(UNKNOWN_BINARY_VERSION))));
    }

    #[test]
    fn empty_module() {
        let m = Module::parse(b"\0asm\x01\0\0\0".to_vec()).unwrap();
        assert!(m.functions.is_empty());
        assert!(m.start.is_none());
    }

    #[test]
    fn function_with_locals() {
        let bytes = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00,
            0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7f, // type () -> i32
            0x03, 0x02, 0x01, 0x00, // one function of type 0
            0x0a, 0x08, 0x01, 0x06, 0x01, 0x02, 0x7e, 0x41, 0x07, 0x0b, // 2 x i64 locals, i32.const 7
        ];
        let m = Module::parse(bytes.to_vec()).unwrap();
        assert_eq!(m.functions[0].locals, vec![ValType::I64, ValType::I64]);
        assert_eq!(&m.bytes()[m.functions[0].body.clone()], &[0x41, 0x07, 0x0b]);
    }
}
