use crate::func::Func;
use crate::types::ValType;

/// One interpreter slot. The translator guarantees the producer and the consumer of a slot
/// agree on its type, so the bits are reinterpreted without a runtime tag.
#[derive(Copy, Clone, Default, Debug, PartialEq, Eq)]
pub struct UntypedValue(pub u64);

impl UntypedValue {
    /// Reserved bit marking a null reference.
    pub const NULL_REF_BIT: u64 = 1 << 63;

    #[inline] pub fn from_i32(v: i32) -> Self { Self(v as u32 as u64) }
    #[inline] pub fn as_i32(self) -> i32 { self.0 as u32 as i32 }
    #[inline] pub fn from_u32(v: u32) -> Self { Self(v as u64) }
    #[inline] pub fn as_u32(self) -> u32 { self.0 as u32 }
    #[inline] pub fn from_i64(v: i64) -> Self { Self(v as u64) }
    #[inline] pub fn as_i64(self) -> i64 { self.0 as i64 }
    #[inline] pub fn from_u64(v: u64) -> Self { Self(v) }
    #[inline] pub fn as_u64(self) -> u64 { self.0 }
    #[inline] pub fn from_f32(v: f32) -> Self { Self(v.to_bits() as u64) }
    #[inline] pub fn as_f32(self) -> f32 { f32::from_bits(self.0 as u32) }
    #[inline] pub fn from_f64(v: f64) -> Self { Self(v.to_bits()) }
    #[inline] pub fn as_f64(self) -> f64 { f64::from_bits(self.0) }
    #[inline] pub fn from_bool(v: bool) -> Self { Self(v as u64) }

    #[inline] pub fn null_ref() -> Self { Self(Self::NULL_REF_BIT) }
    #[inline] pub fn is_null_ref(self) -> bool { self.0 & Self::NULL_REF_BIT != 0 }
    #[inline]
    pub fn from_ref(index: Option<u32>) -> Self {
        match index {
            Some(index) => Self(index as u64),
            None => Self::null_ref(),
        }
    }
    #[inline]
    pub fn as_ref(self) -> Option<u32> {
        if self.is_null_ref() { None } else { Some(self.0 as u32) }
    }
}

/// A typed WebAssembly value as seen by the embedder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128(u128),
    FuncRef(Option<Func>),
    ExternRef(Option<u32>),
}

impl Value {
    pub fn ty(&self) -> ValType {
        match self {
            Value::I32(_) => ValType::I32,
            Value::I64(_) => ValType::I64,
            Value::F32(_) => ValType::F32,
            Value::F64(_) => ValType::F64,
            Value::V128(_) => ValType::V128,
            Value::FuncRef(_) => ValType::FuncRef,
            Value::ExternRef(_) => ValType::ExternRef,
        }
    }

    pub fn i32(&self) -> Option<i32> { if let Value::I32(v) = self { Some(*v) } else { None } }
    pub fn i64(&self) -> Option<i64> { if let Value::I64(v) = self { Some(*v) } else { None } }
    pub fn f32(&self) -> Option<f32> { if let Value::F32(v) = self { Some(*v) } else { None } }
    pub fn f64(&self) -> Option<f64> { if let Value::F64(v) = self { Some(*v) } else { None } }

    /// The zero value of `ty`; references default to null.
    pub fn default_for(ty: ValType) -> Self {
        match ty {
            ValType::I32 => Value::I32(0),
            ValType::I64 => Value::I64(0),
            ValType::F32 => Value::F32(0.0),
            ValType::F64 => Value::F64(0.0),
            ValType::V128 => Value::V128(0),
            ValType::FuncRef => Value::FuncRef(None),
            ValType::ExternRef => Value::ExternRef(None),
        }
    }

    pub(crate) fn to_untyped(self) -> UntypedValue {
        match self {
            Value::I32(v) => UntypedValue::from_i32(v),
            Value::I64(v) => UntypedValue::from_i64(v),
            Value::F32(v) => UntypedValue::from_f32(v),
            Value::F64(v) => UntypedValue::from_f64(v),
            Value::V128(v) => UntypedValue(v as u64),
            Value::FuncRef(f) => UntypedValue::from_ref(f.map(|f| f.0.index())),
            Value::ExternRef(r) => UntypedValue::from_ref(r),
        }
    }

    pub(crate) fn from_untyped(raw: UntypedValue, ty: ValType) -> Self {
        match ty {
            ValType::I32 => Value::I32(raw.as_i32()),
            ValType::I64 => Value::I64(raw.as_i64()),
            ValType::F32 => Value::F32(raw.as_f32()),
            ValType::F64 => Value::F64(raw.as_f64()),
            ValType::V128 => Value::V128(raw.0 as u128),
            ValType::FuncRef => Value::FuncRef(raw.as_ref().map(Func::from_index)),
            ValType::ExternRef => Value::ExternRef(raw.as_ref()),
        }
    }
}

impl From<i32> for Value { fn from(v: i32) -> Self { Value::I32(v) } }
impl From<i64> for Value { fn from(v: i64) -> Self { Value::I64(v) } }
impl From<f32> for Value { fn from(v: f32) -> Self { Value::F32(v) } }
impl From<f64> for Value { fn from(v: f64) -> Self { Value::F64(v) } }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_reference_uses_high_bit() {
        assert_eq!(UntypedValue::null_ref().0, 1 << 63);
        assert!(UntypedValue::from_ref(None).is_null_ref());
        assert_eq!(UntypedValue::from_ref(Some(7)).as_ref(), Some(7));
    }

    #[test]
    fn i32_round_trips_through_slot() {
        let raw = Value::I32(-5).to_untyped();
        assert_eq!(raw.0, 0xffff_fffb);
        assert_eq!(Value::from_untyped(raw, ValType::I32), Value::I32(-5));
    }
}
