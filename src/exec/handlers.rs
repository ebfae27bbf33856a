//! Handlers for everything but the plain numeric operators.

use std::time::{Duration, Instant};

use paste::paste;

use super::{Execution, Signal};
use crate::error::TrapReason;
use crate::externs::{DataHandle, ElementHandle, GlobalHandle, TableHandle};
use crate::func::FuncHandle;
use crate::isa::{high32, low32, reg, RmwOp};
use crate::parking_lot::ParkingKey;
use crate::value::UntypedValue;

pub(crate) use super::numeric::*;

#[inline(always)]
fn effective_address(base: UntypedValue, offset: u64) -> u64 {
    base.as_u32() as u64 + offset
}

fn no_memory() -> Signal {
    TrapReason::Message("instance has no memory".into()).into()
}

// ---------------- Control ----------------

pub(crate) fn op_unreachable(_: &mut Execution<'_>) -> Result<(), Signal> {
    Err(TrapReason::Unreachable.into())
}

pub(crate) fn op_end_of_execution(_: &mut Execution<'_>) -> Result<(), Signal> {
    Err(Signal::End)
}

/// Leaves `pc` on the breakpoint so a debugger can report and later step over it.
pub(crate) fn op_breakpoint(_: &mut Execution<'_>) -> Result<(), Signal> {
    Err(Signal::Breakpoint)
}

#[inline(always)]
pub(crate) fn op_copy(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    ex.set(reg(w, 0), ex.get(reg(w, 1)));
    ex.advance(2);
    Ok(())
}

#[inline(always)]
pub(crate) fn op_const32(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    ex.set(reg(w, 0), UntypedValue(high32(w) as u64));
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_const64(ex: &mut Execution<'_>) -> Result<(), Signal> {
    ex.set(reg(ex.imm(1), 0), UntypedValue(ex.imm(2)));
    ex.advance(3);
    Ok(())
}

#[inline(always)]
pub(crate) fn op_br(ex: &mut Execution<'_>) -> Result<(), Signal> {
    ex.jump(ex.imm(1) as i64);
    Ok(())
}

#[inline(always)]
pub(crate) fn op_br_if(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    if ex.get(reg(w, 0)).as_u32() != 0 {
        ex.jump(high32(w) as i32 as i64);
    } else {
        ex.advance(2);
    }
    Ok(())
}

#[inline(always)]
pub(crate) fn op_br_if_not(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    if ex.get(reg(w, 0)).as_u32() == 0 {
        ex.jump(high32(w) as i32 as i64);
    } else {
        ex.advance(2);
    }
    Ok(())
}

pub(crate) fn op_br_table(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let index = ex.get(reg(w, 0)).as_u32() as usize;
    // The last target is the default.
    let last = (high32(w) as usize).saturating_sub(1);
    let offset = ex.imm(2 + index.min(last)) as i64;
    ex.jump(offset);
    Ok(())
}

pub(crate) fn op_return(ex: &mut Execution<'_>) -> Result<(), Signal> {
    ex.return_from_frame()
}

pub(crate) fn op_call(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let func = FuncHandle::from_index(low32(w));
    let new_sp = ex.st.sp + high32(w) as usize;
    let return_pc = ex.st.pc + 2;
    ex.call(func, new_sp, return_pc)
}

pub(crate) fn op_call_indirect(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let target = ex.imm(1);
    let w = ex.imm(2);
    let func = ex.resolve_indirect(low32(target), high32(target), ex.get(reg(w, 0)).as_u32())?;
    let new_sp = ex.st.sp + high32(w) as usize;
    let return_pc = ex.st.pc + 3;
    ex.call(func, new_sp, return_pc)
}

pub(crate) fn op_return_call(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let func = FuncHandle::from_index(low32(w));
    let arg_base = (w >> 32) as u16 as usize;
    let caller_header = (w >> 48) as usize;
    ex.tail_call(func, arg_base, caller_header)
}

pub(crate) fn op_return_call_indirect(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let target = ex.imm(1);
    let w = ex.imm(2);
    let func = ex.resolve_indirect(low32(target), high32(target), ex.get(reg(w, 0)).as_u32())?;
    ex.tail_call(func, reg(w, 1) as usize, high32(w) as usize)
}

pub(crate) fn op_select(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let value = if ex.get(reg(w, 3)).as_u32() != 0 { ex.get(reg(w, 1)) } else { ex.get(reg(w, 2)) };
    ex.set(reg(w, 0), value);
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_ref_is_null(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    ex.set(reg(w, 0), UntypedValue::from_bool(ex.get(reg(w, 1)).is_null_ref()));
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_ref_func(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    ex.set(reg(w, 0), UntypedValue::from_ref(Some(high32(w))));
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_global_get(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let value = ex.store.alloc.globals.get(GlobalHandle::from_index(high32(w))).value;
    ex.set(reg(w, 0), value);
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_global_set(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let value = ex.get(reg(w, 0));
    ex.store.alloc.globals.get_mut(GlobalHandle::from_index(high32(w))).value = value;
    ex.advance(2);
    Ok(())
}

// ---------------- Memory ----------------

macro_rules! load {
    ($($name:ident: $load:ident => |$v:ident| $convert:expr;)*) => { paste! { $(
        #[inline(always)]
        pub(crate) fn [<op_ $name:snake>](ex: &mut Execution<'_>) -> Result<(), Signal> {
            let w = ex.imm(1);
            let addr = effective_address(ex.get(reg(w, 1)), ex.imm(2));
            let $v = ex.memory()?.$load(addr)?;
            ex.set(reg(w, 0), $convert);
            ex.advance(3);
            Ok(())
        }
    )* } };
}

macro_rules! store {
    ($($name:ident: $store:ident => |$v:ident| $convert:expr;)*) => { paste! { $(
        #[inline(always)]
        pub(crate) fn [<op_ $name:snake>](ex: &mut Execution<'_>) -> Result<(), Signal> {
            let w = ex.imm(1);
            let addr = effective_address(ex.get(reg(w, 0)), ex.imm(2));
            let $v = ex.get(reg(w, 1));
            ex.memory_mut()?.$store(addr, $convert)?;
            ex.advance(3);
            Ok(())
        }
    )* } };
}

load! {
    I32Load: load_u32 => |v| UntypedValue::from_u32(v);
    I64Load: load_u64 => |v| UntypedValue::from_u64(v);
    F32Load: load_u32 => |v| UntypedValue::from_u32(v);
    F64Load: load_u64 => |v| UntypedValue::from_u64(v);
    I32Load8S: load_u8 => |v| UntypedValue::from_i32(v as i8 as i32);
    I32Load8U: load_u8 => |v| UntypedValue::from_u32(v as u32);
    I32Load16S: load_u16 => |v| UntypedValue::from_i32(v as i16 as i32);
    I32Load16U: load_u16 => |v| UntypedValue::from_u32(v as u32);
    I64Load8S: load_u8 => |v| UntypedValue::from_i64(v as i8 as i64);
    I64Load8U: load_u8 => |v| UntypedValue::from_u64(v as u64);
    I64Load16S: load_u16 => |v| UntypedValue::from_i64(v as i16 as i64);
    I64Load16U: load_u16 => |v| UntypedValue::from_u64(v as u64);
    I64Load32S: load_u32 => |v| UntypedValue::from_i64(v as i32 as i64);
    I64Load32U: load_u32 => |v| UntypedValue::from_u64(v as u64);
}

store! {
    I32Store: store_u32 => |v| v.as_u32();
    I64Store: store_u64 => |v| v.as_u64();
    F32Store: store_u32 => |v| v.as_u32();
    F64Store: store_u64 => |v| v.as_u64();
    I32Store8: store_u8 => |v| v.as_u32() as u8;
    I32Store16: store_u16 => |v| v.as_u32() as u16;
    I64Store8: store_u8 => |v| v.as_u64() as u8;
    I64Store16: store_u16 => |v| v.as_u64() as u16;
    I64Store32: store_u32 => |v| v.as_u64() as u32;
}

pub(crate) fn op_memory_size(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let pages = ex.memory()?.pages();
    ex.set(reg(ex.imm(1), 0), UntypedValue::from_u32(pages as u32));
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_memory_grow(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let delta = ex.get(reg(w, 1)).as_u32() as u64;
    let handle = ex.st.memory.ok_or_else(no_memory)?;
    let store = &mut *ex.store;
    let old = store.alloc.memories.get_mut(handle).grow(delta, store.limiter.as_deref_mut())?;
    ex.set(reg(w, 0), UntypedValue::from_i32(old as i32));
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_memory_init(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (d, s, n) = (ex.get(reg(w, 0)).as_u32(), ex.get(reg(w, 1)).as_u32(), ex.get(reg(w, 2)).as_u32());
    let data = DataHandle::from_index(ex.imm(2) as u32);
    let handle = ex.st.memory.ok_or_else(no_memory)?;
    let store = &mut *ex.store;
    let bytes = &store.alloc.data.get(data).bytes;
    let end = s as usize + n as usize;
    if end > bytes.len() {
        return Err(TrapReason::MemoryOutOfBounds.into());
    }
    store.alloc.memories.get_mut(handle).write(d as u64, &bytes[s as usize..end])?;
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_data_drop(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let data = DataHandle::from_index(ex.imm(1) as u32);
    ex.store.alloc.data.get_mut(data).bytes = Vec::new();
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_memory_copy(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (d, s, n) = (ex.get(reg(w, 0)).as_u32(), ex.get(reg(w, 1)).as_u32(), ex.get(reg(w, 2)).as_u32());
    ex.memory_mut()?.copy_within(d as u64, s as u64, n as u64)?;
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_memory_fill(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (d, value, n) = (ex.get(reg(w, 0)).as_u32(), ex.get(reg(w, 1)).as_u32(), ex.get(reg(w, 2)).as_u32());
    ex.memory_mut()?.fill(d as u64, value as u8, n as u64)?;
    ex.advance(2);
    Ok(())
}

// ---------------- Tables ----------------

pub(crate) fn op_table_get(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let index = ex.get(reg(w, 1)).as_u32() as u64;
    let value = ex.store.alloc.tables.get(TableHandle::from_index(high32(w))).get(index)?;
    ex.set(reg(w, 0), value);
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_table_set(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (index, value) = (ex.get(reg(w, 0)).as_u32() as u64, ex.get(reg(w, 1)));
    ex.store.alloc.tables.get_mut(TableHandle::from_index(high32(w))).set(index, value)?;
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_table_size(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let size = ex.store.alloc.tables.get(TableHandle::from_index(high32(w))).size();
    ex.set(reg(w, 0), UntypedValue::from_u32(size as u32));
    ex.advance(2);
    Ok(())
}

pub(crate) fn op_table_grow(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (init, n) = (ex.get(reg(w, 1)), ex.get(reg(w, 2)).as_u32() as u64);
    let table = TableHandle::from_index(ex.imm(2) as u32);
    let store = &mut *ex.store;
    let old = store.alloc.tables.get_mut(table).grow(n, init, store.limiter.as_deref_mut())?;
    ex.set(reg(w, 0), UntypedValue::from_i32(old as i32));
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_table_fill(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (d, value, n) = (ex.get(reg(w, 0)).as_u32() as u64, ex.get(reg(w, 1)), ex.get(reg(w, 2)).as_u32() as u64);
    let table = TableHandle::from_index(ex.imm(2) as u32);
    ex.store.alloc.tables.get_mut(table).fill(d, value, n)?;
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_table_copy(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (d, s, n) =
        (ex.get(reg(w, 0)).as_u32() as u64, ex.get(reg(w, 1)).as_u32() as u64, ex.get(reg(w, 2)).as_u32() as u64);
    let tables = ex.imm(2);
    let (dst, src) = (TableHandle::from_index(low32(tables)), TableHandle::from_index(high32(tables)));
    let alloc = &mut ex.store.alloc;
    if dst == src {
        alloc.tables.get_mut(dst).copy_within(d, s, n)?;
    } else {
        let items = alloc.tables.get(src).slice(s, n)?.to_vec();
        alloc.tables.get_mut(dst).write(d, &items)?;
    }
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_table_init(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (d, s, n) = (ex.get(reg(w, 0)).as_u32(), ex.get(reg(w, 1)).as_u32(), ex.get(reg(w, 2)).as_u32());
    let operands = ex.imm(2);
    let table = TableHandle::from_index(low32(operands));
    let elem = ElementHandle::from_index(high32(operands));
    let alloc = &mut ex.store.alloc;
    let items = &alloc.elements.get(elem).items;
    let end = s as usize + n as usize;
    if end > items.len() {
        return Err(TrapReason::TableOutOfBounds(s as u64).into());
    }
    alloc.tables.get_mut(table).write(d as u64, &items[s as usize..end])?;
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_elem_drop(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let elem = ElementHandle::from_index(ex.imm(1) as u32);
    ex.store.alloc.elements.get_mut(elem).items = Vec::new();
    ex.advance(2);
    Ok(())
}

// ---------------- Atomics ----------------

/// Address and access width of an atomic instruction; traps when misaligned.
#[inline(always)]
fn atomic_address(ex: &Execution<'_>, base: UntypedValue) -> Result<(u64, usize), Signal> {
    let memarg = ex.imm(2);
    let width = high32(memarg) as usize;
    let addr = effective_address(base, low32(memarg) as u64);
    if addr % width as u64 != 0 {
        return Err(TrapReason::UnalignedAtomic.into());
    }
    Ok((addr, width))
}

fn width_mask(width: usize) -> u64 {
    if width >= 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 }
}

pub(crate) fn op_atomic_notify(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (addr, width) = atomic_address(ex, ex.get(reg(w, 1)))?;
    let count = ex.get(reg(w, 2)).as_u32();
    let memory = ex.memory()?;
    memory.load_width(addr, width)?;
    let woken = match memory.shared() {
        Some(shared) => {
            ex.store.engine.parking_lot().unpark(ParkingKey::new(shared, addr), count)
        }
        // Nobody can wait on an unshared memory.
        None => 0,
    };
    ex.set(reg(w, 0), UntypedValue::from_u32(woken));
    ex.advance(3);
    Ok(())
}

fn atomic_wait(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let memory = ex.memory()?;
    let Some(shared) = memory.shared() else {
        return Err(TrapReason::ExpectedSharedMemory.into());
    };
    let (addr, width) = atomic_address(ex, ex.get(reg(w, 1)))?;
    memory.load_width(addr, width)?;
    let expected = ex.get(reg(w, 2)).as_u64() & width_mask(width);
    let timeout = ex.get(reg(w, 3)).as_i64();
    let deadline = if timeout < 0 { None } else { Instant::now().checked_add(Duration::from_nanos(timeout as u64)) };
    let outcome = ex.store.engine.parking_lot().park_conditionally(
        ParkingKey::new(shared, addr),
        || memory.load_width(addr, width).is_ok_and(|current| current == expected),
        deadline,
    );
    ex.set(reg(w, 0), UntypedValue::from_i32(outcome.code()));
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_atomic_wait32(ex: &mut Execution<'_>) -> Result<(), Signal> {
    atomic_wait(ex)
}

pub(crate) fn op_atomic_wait64(ex: &mut Execution<'_>) -> Result<(), Signal> {
    atomic_wait(ex)
}

pub(crate) fn op_atomic_load(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (addr, width) = atomic_address(ex, ex.get(reg(w, 1)))?;
    let value = ex.memory()?.load_width(addr, width)?;
    ex.set(reg(w, 0), UntypedValue(value));
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_atomic_store(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (addr, width) = atomic_address(ex, ex.get(reg(w, 0)))?;
    let value = ex.get(reg(w, 1)).as_u64();
    ex.memory_mut()?.atomic_update(addr, width, |_| value)?;
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_atomic_rmw(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (addr, width) = atomic_address(ex, ex.get(reg(w, 1)))?;
    let operand = ex.get(reg(w, 2)).as_u64();
    let Some(op) = RmwOp::from_u8(reg(w, 3) as u8) else {
        return Err(TrapReason::Message(format!("invalid atomic operation {}", reg(w, 3))).into());
    };
    let old = ex.memory_mut()?.atomic_update(addr, width, |old| op.apply(old, operand))?;
    ex.set(reg(w, 0), UntypedValue(old));
    ex.advance(3);
    Ok(())
}

pub(crate) fn op_atomic_cmpxchg(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let w = ex.imm(1);
    let (addr, width) = atomic_address(ex, ex.get(reg(w, 1)))?;
    let expected = ex.get(reg(w, 2)).as_u64() & width_mask(width);
    let replacement = ex.get(reg(w, 3)).as_u64();
    let old = ex
        .memory_mut()?
        .atomic_update(addr, width, |old| if old == expected { replacement } else { old })?;
    ex.set(reg(w, 0), UntypedValue(old));
    ex.advance(3);
    Ok(())
}
