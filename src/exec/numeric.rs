//! Numeric handlers, one function per opcode. Every one of them reads its operands from the
//! registers packed in the first immediate word and writes lane 0.

use paste::paste;

use super::{Execution, Signal};
use crate::error::TrapReason;
use crate::isa::reg;
use crate::value::UntypedValue;

#[inline(always)]
fn nonzero<T: PartialEq + Default>(divisor: T) -> Result<T, TrapReason> {
    if divisor == T::default() {
        return Err(TrapReason::IntegerDividedByZero);
    }
    Ok(divisor)
}

macro_rules! min_max {
    ($($t:ident),*) => { paste! { $(
        #[inline(always)]
        fn [<$t _min>](a: $t, b: $t) -> $t {
            if a.is_nan() || b.is_nan() {
                a + b
            } else if a == 0.0 && b == 0.0 {
                if a.is_sign_negative() { a } else { b }
            } else {
                a.min(b)
            }
        }

        #[inline(always)]
        fn [<$t _max>](a: $t, b: $t) -> $t {
            if a.is_nan() || b.is_nan() {
                a + b
            } else if a == 0.0 && b == 0.0 {
                if a.is_sign_negative() { b } else { a }
            } else {
                a.max(b)
            }
        }
    )* } };
}
min_max!(f32, f64);

macro_rules! unary {
    ($($name:ident: $in:ident -> $out:ident = |$a:ident| $body:expr;)*) => { paste! { $(
        #[inline(always)]
        pub(crate) fn [<op_ $name:snake>](ex: &mut Execution<'_>) -> Result<(), Signal> {
            let w = ex.imm(1);
            let $a = ex.get(reg(w, 1)).[<as_ $in>]();
            ex.set(reg(w, 0), UntypedValue::[<from_ $out>]($body));
            ex.advance(2);
            Ok(())
        }
    )* } };
}

macro_rules! binary {
    ($($name:ident: $in:ident -> $out:ident = |$a:ident, $b:ident| $body:expr;)*) => { paste! { $(
        #[inline(always)]
        pub(crate) fn [<op_ $name:snake>](ex: &mut Execution<'_>) -> Result<(), Signal> {
            let w = ex.imm(1);
            let $a = ex.get(reg(w, 1)).[<as_ $in>]();
            let $b = ex.get(reg(w, 2)).[<as_ $in>]();
            ex.set(reg(w, 0), UntypedValue::[<from_ $out>]($body));
            ex.advance(2);
            Ok(())
        }
    )* } };
}

/// Trapping float-to-int conversions. The bounds are the first values outside the target range.
macro_rules! trunc {
    ($($name:ident: $in:ident -> $out:ident in ($min:expr, $max:expr);)*) => { paste! { $(
        #[inline(always)]
        pub(crate) fn [<op_ $name:snake>](ex: &mut Execution<'_>) -> Result<(), Signal> {
            let w = ex.imm(1);
            let x = ex.get(reg(w, 1)).[<as_ $in>]();
            if x.is_nan() {
                return Err(TrapReason::InvalidConversionToInteger.into());
            }
            if !x.is_finite() || x <= $min || x >= $max {
                return Err(TrapReason::IntegerOverflow.into());
            }
            ex.set(reg(w, 0), UntypedValue::[<from_ $out>](x as $out));
            ex.advance(2);
            Ok(())
        }
    )* } };
}

unary! {
    I32Eqz: i32 -> bool = |a| a == 0;
    I64Eqz: i64 -> bool = |a| a == 0;

    I32Clz: u32 -> u32 = |a| a.leading_zeros();
    I32Ctz: u32 -> u32 = |a| a.trailing_zeros();
    I32Popcnt: u32 -> u32 = |a| a.count_ones();
    I64Clz: u64 -> u64 = |a| a.leading_zeros() as u64;
    I64Ctz: u64 -> u64 = |a| a.trailing_zeros() as u64;
    I64Popcnt: u64 -> u64 = |a| a.count_ones() as u64;

    F32Abs: f32 -> f32 = |a| a.abs();
    F32Neg: f32 -> f32 = |a| -a;
    F32Ceil: f32 -> f32 = |a| a.ceil();
    F32Floor: f32 -> f32 = |a| a.floor();
    F32Trunc: f32 -> f32 = |a| a.trunc();
    F32Nearest: f32 -> f32 = |a| a.round_ties_even();
    F32Sqrt: f32 -> f32 = |a| a.sqrt();
    F64Abs: f64 -> f64 = |a| a.abs();
    F64Neg: f64 -> f64 = |a| -a;
    F64Ceil: f64 -> f64 = |a| a.ceil();
    F64Floor: f64 -> f64 = |a| a.floor();
    F64Trunc: f64 -> f64 = |a| a.trunc();
    F64Nearest: f64 -> f64 = |a| a.round_ties_even();
    F64Sqrt: f64 -> f64 = |a| a.sqrt();

    I32WrapI64: i64 -> i32 = |a| a as i32;
    I64ExtendI32S: i32 -> i64 = |a| a as i64;
    I64ExtendI32U: u32 -> u64 = |a| a as u64;
    F32ConvertI32S: i32 -> f32 = |a| a as f32;
    F32ConvertI32U: u32 -> f32 = |a| a as f32;
    F32ConvertI64S: i64 -> f32 = |a| a as f32;
    F32ConvertI64U: u64 -> f32 = |a| a as f32;
    F32DemoteF64: f64 -> f32 = |a| a as f32;
    F64ConvertI32S: i32 -> f64 = |a| a as f64;
    F64ConvertI32U: u32 -> f64 = |a| a as f64;
    F64ConvertI64S: i64 -> f64 = |a| a as f64;
    F64ConvertI64U: u64 -> f64 = |a| a as f64;
    F64PromoteF32: f32 -> f64 = |a| a as f64;

    I32Extend8S: i32 -> i32 = |a| a as i8 as i32;
    I32Extend16S: i32 -> i32 = |a| a as i16 as i32;
    I64Extend8S: i64 -> i64 = |a| a as i8 as i64;
    I64Extend16S: i64 -> i64 = |a| a as i16 as i64;
    I64Extend32S: i64 -> i64 = |a| a as i32 as i64;

    // `as` already saturates and maps NaN to zero.
    I32TruncSatF32S: f32 -> i32 = |a| a as i32;
    I32TruncSatF32U: f32 -> u32 = |a| a as u32;
    I32TruncSatF64S: f64 -> i32 = |a| a as i32;
    I32TruncSatF64U: f64 -> u32 = |a| a as u32;
    I64TruncSatF32S: f32 -> i64 = |a| a as i64;
    I64TruncSatF32U: f32 -> u64 = |a| a as u64;
    I64TruncSatF64S: f64 -> i64 = |a| a as i64;
    I64TruncSatF64U: f64 -> u64 = |a| a as u64;
}

binary! {
    I32Eq: i32 -> bool = |a, b| a == b;
    I32Ne: i32 -> bool = |a, b| a != b;
    I32LtS: i32 -> bool = |a, b| a < b;
    I32LtU: u32 -> bool = |a, b| a < b;
    I32GtS: i32 -> bool = |a, b| a > b;
    I32GtU: u32 -> bool = |a, b| a > b;
    I32LeS: i32 -> bool = |a, b| a <= b;
    I32LeU: u32 -> bool = |a, b| a <= b;
    I32GeS: i32 -> bool = |a, b| a >= b;
    I32GeU: u32 -> bool = |a, b| a >= b;

    I64Eq: i64 -> bool = |a, b| a == b;
    I64Ne: i64 -> bool = |a, b| a != b;
    I64LtS: i64 -> bool = |a, b| a < b;
    I64LtU: u64 -> bool = |a, b| a < b;
    I64GtS: i64 -> bool = |a, b| a > b;
    I64GtU: u64 -> bool = |a, b| a > b;
    I64LeS: i64 -> bool = |a, b| a <= b;
    I64LeU: u64 -> bool = |a, b| a <= b;
    I64GeS: i64 -> bool = |a, b| a >= b;
    I64GeU: u64 -> bool = |a, b| a >= b;

    F32Eq: f32 -> bool = |a, b| a == b;
    F32Ne: f32 -> bool = |a, b| a != b;
    F32Lt: f32 -> bool = |a, b| a < b;
    F32Gt: f32 -> bool = |a, b| a > b;
    F32Le: f32 -> bool = |a, b| a <= b;
    F32Ge: f32 -> bool = |a, b| a >= b;
    F64Eq: f64 -> bool = |a, b| a == b;
    F64Ne: f64 -> bool = |a, b| a != b;
    F64Lt: f64 -> bool = |a, b| a < b;
    F64Gt: f64 -> bool = |a, b| a > b;
    F64Le: f64 -> bool = |a, b| a <= b;
    F64Ge: f64 -> bool = |a, b| a >= b;

    I32Add: i32 -> i32 = |a, b| a.wrapping_add(b);
    I32Sub: i32 -> i32 = |a, b| a.wrapping_sub(b);
    I32Mul: i32 -> i32 = |a, b| a.wrapping_mul(b);
    I32DivS: i32 -> i32 = |a, b| a.checked_div(nonzero(b)?).ok_or(TrapReason::IntegerOverflow)?;
    I32DivU: u32 -> u32 = |a, b| a / nonzero(b)?;
    I32RemS: i32 -> i32 = |a, b| a.wrapping_rem(nonzero(b)?);
    I32RemU: u32 -> u32 = |a, b| a % nonzero(b)?;
    I32And: u32 -> u32 = |a, b| a & b;
    I32Or: u32 -> u32 = |a, b| a | b;
    I32Xor: u32 -> u32 = |a, b| a ^ b;
    I32Shl: u32 -> u32 = |a, b| a.wrapping_shl(b);
    I32ShrS: i32 -> i32 = |a, b| a.wrapping_shr(b as u32);
    I32ShrU: u32 -> u32 = |a, b| a.wrapping_shr(b);
    I32Rotl: u32 -> u32 = |a, b| a.rotate_left(b % 32);
    I32Rotr: u32 -> u32 = |a, b| a.rotate_right(b % 32);

    I64Add: i64 -> i64 = |a, b| a.wrapping_add(b);
    I64Sub: i64 -> i64 = |a, b| a.wrapping_sub(b);
    I64Mul: i64 -> i64 = |a, b| a.wrapping_mul(b);
    I64DivS: i64 -> i64 = |a, b| a.checked_div(nonzero(b)?).ok_or(TrapReason::IntegerOverflow)?;
    I64DivU: u64 -> u64 = |a, b| a / nonzero(b)?;
    I64RemS: i64 -> i64 = |a, b| a.wrapping_rem(nonzero(b)?);
    I64RemU: u64 -> u64 = |a, b| a % nonzero(b)?;
    I64And: u64 -> u64 = |a, b| a & b;
    I64Or: u64 -> u64 = |a, b| a | b;
    I64Xor: u64 -> u64 = |a, b| a ^ b;
    I64Shl: u64 -> u64 = |a, b| a.wrapping_shl(b as u32);
    I64ShrS: i64 -> i64 = |a, b| a.wrapping_shr(b as u32);
    I64ShrU: u64 -> u64 = |a, b| a.wrapping_shr(b as u32);
    I64Rotl: u64 -> u64 = |a, b| a.rotate_left((b % 64) as u32);
    I64Rotr: u64 -> u64 = |a, b| a.rotate_right((b % 64) as u32);

    F32Add: f32 -> f32 = |a, b| a + b;
    F32Sub: f32 -> f32 = |a, b| a - b;
    F32Mul: f32 -> f32 = |a, b| a * b;
    F32Div: f32 -> f32 = |a, b| a / b;
    F32Min: f32 -> f32 = |a, b| f32_min(a, b);
    F32Max: f32 -> f32 = |a, b| f32_max(a, b);
    F32Copysign: f32 -> f32 = |a, b| a.copysign(b);
    F64Add: f64 -> f64 = |a, b| a + b;
    F64Sub: f64 -> f64 = |a, b| a - b;
    F64Mul: f64 -> f64 = |a, b| a * b;
    F64Div: f64 -> f64 = |a, b| a / b;
    F64Min: f64 -> f64 = |a, b| f64_min(a, b);
    F64Max: f64 -> f64 = |a, b| f64_max(a, b);
    F64Copysign: f64 -> f64 = |a, b| a.copysign(b);
}

trunc! {
    I32TruncF32S: f32 -> i32 in (-2147483777.0, 2147483648.0);
    I32TruncF32U: f32 -> u32 in (-1.0, 4294967296.0);
    I32TruncF64S: f64 -> i32 in (-2147483649.0, 2147483648.0);
    I32TruncF64U: f64 -> u32 in (-1.0, 4294967296.0);
    I64TruncF32S: f32 -> i64 in (-9223373136366404000.0, 9223372036854776000.0);
    I64TruncF32U: f32 -> u64 in (-1.0, 18446744073709552000.0);
    I64TruncF64S: f64 -> i64 in (-9223372036854777856.0, 9223372036854776000.0);
    I64TruncF64U: f64 -> u64 in (-1.0, 18446744073709552000.0);
}
