use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::engine::ResourceLimiter;
use crate::error::{Trap, TrapReason};
use crate::types::MemoryType;

pub const PAGE_SIZE: usize = 65536;
pub const MAX_PAGES: u64 = 65536;

/// Bytes of a memory declared `shared`. Several stores, possibly on different threads, may
/// hold the same `SharedMemory`.
#[derive(Debug)]
pub struct SharedMemory {
    bytes: RwLock<Vec<u8>>,
    ty: MemoryType,
}

impl SharedMemory {
    pub fn ty(&self) -> MemoryType { self.ty }

    fn read(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.bytes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<u8>> {
        self.bytes.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug)]
enum MemoryData {
    Local(Vec<u8>),
    Shared(Arc<SharedMemory>),
}

macro_rules! impl_access {
    ($type:ty, $size:literal, $load_name:ident, $store_name:ident) => {
        #[inline(always)]
        pub fn $load_name(&self, addr: u64) -> Result<$type, TrapReason> {
            let mut buf = [0u8; $size];
            self.read(addr, &mut buf)?;
            Ok(<$type>::from_le_bytes(buf))
        }
        #[inline(always)]
        pub fn $store_name(&mut self, addr: u64, v: $type) -> Result<(), TrapReason> {
            self.write(addr, &v.to_le_bytes())
        }
    };
}

/// A linear memory. Every access is bounds-checked before any byte moves.
#[derive(Debug)]
pub struct MemoryEntity {
    data: MemoryData,
    ty: MemoryType,
}

#[inline(always)]
fn checked_range(addr: u64, len: usize, size: usize) -> Result<std::ops::Range<usize>, TrapReason> {
    let start = usize::try_from(addr).map_err(|_| TrapReason::MemoryOutOfBounds)?;
    let end = start.checked_add(len).ok_or(TrapReason::MemoryOutOfBounds)?;
    if end > size { return Err(TrapReason::MemoryOutOfBounds); }
    Ok(start..end)
}

impl MemoryEntity {
    pub(crate) fn new(ty: MemoryType, limiter: Option<&mut (dyn ResourceLimiter + 'static)>) -> Result<Self, Trap> {
        let bytes = ty.limits.min as usize * PAGE_SIZE;
        if let Some(limiter) = limiter {
            if !limiter.limit_memory_growth(bytes)? {
                return Err(Trap::message(format!(
                    "initial memory size exceeds the resource limit: {bytes} bytes"
                )));
            }
        }
        let data = if ty.shared {
            MemoryData::Shared(Arc::new(SharedMemory { bytes: RwLock::new(vec![0; bytes]), ty }))
        } else {
            MemoryData::Local(vec![0; bytes])
        };
        Ok(Self { data, ty })
    }

    pub(crate) fn from_shared(shared: Arc<SharedMemory>) -> Self {
        let ty = shared.ty;
        Self { data: MemoryData::Shared(shared), ty }
    }

    pub fn ty(&self) -> MemoryType {
        MemoryType { limits: crate::types::Limits { min: self.pages(), max: self.ty.limits.max }, shared: self.ty.shared }
    }

    pub fn shared(&self) -> Option<&Arc<SharedMemory>> {
        match &self.data {
            MemoryData::Shared(shared) => Some(shared),
            MemoryData::Local(_) => None,
        }
    }

    #[inline]
    fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match &self.data {
            MemoryData::Local(bytes) => f(bytes),
            MemoryData::Shared(shared) => f(&shared.read()),
        }
    }

    #[inline]
    fn with_mut<R>(&mut self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        match &mut self.data {
            MemoryData::Local(bytes) => f(bytes),
            MemoryData::Shared(shared) => f(&mut shared.write()),
        }
    }

    pub fn byte_len(&self) -> usize { self.with(|b| b.len()) }

    pub fn pages(&self) -> u64 { (self.byte_len() / PAGE_SIZE) as u64 }

    fn max_pages(&self) -> u64 { self.ty.limits.max.unwrap_or(MAX_PAGES).min(MAX_PAGES) }

    /// Returns the previous page count, or -1 when the memory cannot grow by `delta` pages.
    pub(crate) fn grow(&mut self, delta: u64, limiter: Option<&mut (dyn ResourceLimiter + 'static)>) -> Result<i64, Trap> {
        let max = self.max_pages();
        self.with_mut(|bytes| {
            let old = (bytes.len() / PAGE_SIZE) as u64;
            let Some(new) = old.checked_add(delta).filter(|n| *n <= max) else { return Ok(-1) };
            if delta == 0 { return Ok(old as i64); }
            if let Some(limiter) = limiter {
                if !limiter.limit_memory_growth(new as usize * PAGE_SIZE)? { return Ok(-1); }
            }
            bytes.resize(new as usize * PAGE_SIZE, 0);
            Ok(old as i64)
        })
    }

    #[inline]
    pub fn read(&self, addr: u64, out: &mut [u8]) -> Result<(), TrapReason> {
        self.with(|bytes| {
            let range = checked_range(addr, out.len(), bytes.len())?;
            out.copy_from_slice(&bytes[range]);
            Ok(())
        })
    }

    #[inline]
    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), TrapReason> {
        self.with_mut(|bytes| {
            let range = checked_range(addr, data.len(), bytes.len())?;
            bytes[range].copy_from_slice(data);
            Ok(())
        })
    }

    impl_access!(u8,  1, load_u8, store_u8);    impl_access!(u16, 2, load_u16, store_u16);
    impl_access!(u32, 4, load_u32, store_u32);  impl_access!(u64, 8, load_u64, store_u64);

    /// Little-endian load of `width` bytes, zero-extended.
    #[inline]
    pub fn load_width(&self, addr: u64, width: usize) -> Result<u64, TrapReason> {
        match width {
            1 => self.load_u8(addr).map(u64::from),
            2 => self.load_u16(addr).map(u64::from),
            4 => self.load_u32(addr).map(u64::from),
            _ => self.load_u64(addr),
        }
    }

    /// Stores the low `width` bytes of `value`.
    #[inline]
    pub fn store_width(&mut self, addr: u64, width: usize, value: u64) -> Result<(), TrapReason> {
        let bytes = value.to_le_bytes();
        self.write(addr, &bytes[..width.min(8)])
    }

    pub fn fill(&mut self, dst: u64, value: u8, len: u64) -> Result<(), TrapReason> {
        self.with_mut(|bytes| {
            let len = usize::try_from(len).map_err(|_| TrapReason::MemoryOutOfBounds)?;
            let range = checked_range(dst, len, bytes.len())?;
            bytes[range].fill(value);
            Ok(())
        })
    }

    pub fn copy_within(&mut self, dst: u64, src: u64, len: u64) -> Result<(), TrapReason> {
        self.with_mut(|bytes| {
            let len = usize::try_from(len).map_err(|_| TrapReason::MemoryOutOfBounds)?;
            let src = checked_range(src, len, bytes.len())?;
            let dst = checked_range(dst, len, bytes.len())?;
            bytes.copy_within(src, dst.start);
            Ok(())
        })
    }

    /// Applies `f` to the `width`-byte value at `addr` under one lock, returning the old value.
    pub(crate) fn atomic_update(
        &mut self,
        addr: u64,
        width: usize,
        f: impl FnOnce(u64) -> u64,
    ) -> Result<u64, TrapReason> {
        if addr % width as u64 != 0 { return Err(TrapReason::UnalignedAtomic); }
        self.with_mut(|bytes| {
            let range = checked_range(addr, width, bytes.len())?;
            let mut buf = [0u8; 8];
            buf[..width].copy_from_slice(&bytes[range.clone()]);
            let old = u64::from_le_bytes(buf);
            let new = f(old).to_le_bytes();
            bytes[range].copy_from_slice(&new[..width]);
            Ok(old)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Limits;

    fn memory(min: u64, max: Option<u64>) -> MemoryEntity {
        MemoryEntity::new(MemoryType { limits: Limits { min, max }, shared: false }, None).unwrap()
    }

    #[test]
    fn store_out_of_bounds_leaves_memory_untouched() {
        let mut mem = memory(1, None);
        let last = (PAGE_SIZE - 2) as u64;
        mem.store_u16(last, 0xbeef).unwrap();
        assert_eq!(mem.store_u32(last, 0x1234_5678), Err(TrapReason::MemoryOutOfBounds));
        assert_eq!(mem.load_u16(last).unwrap(), 0xbeef);
    }

    #[test]
    fn grow_respects_maximum() {
        let mut mem = memory(1, Some(2));
        assert_eq!(mem.grow(1, None).unwrap(), 1);
        assert_eq!(mem.grow(1, None).unwrap(), -1);
        assert_eq!(mem.pages(), 2);
    }

    #[test]
    fn atomic_update_checks_alignment() {
        let mut mem = memory(1, None);
        assert_eq!(mem.atomic_update(2, 4, |v| v + 1), Err(TrapReason::UnalignedAtomic));
        assert_eq!(mem.atomic_update(4, 4, |v| v + 5).unwrap(), 0);
        assert_eq!(mem.load_u32(4).unwrap(), 5);
    }
}
