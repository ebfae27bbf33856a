use crate::engine::ResourceLimiter;
use crate::error::{Trap, TrapReason};
use crate::types::{Limits, TableType};
use crate::value::UntypedValue;

/// Upper bound on table length; matches the 32-bit index space.
pub const MAX_TABLE_SIZE: u64 = u32::MAX as u64;

#[derive(Debug)]
pub struct TableEntity {
    elements: Vec<UntypedValue>,
    ty: TableType,
}

impl TableEntity {
    pub(crate) fn new(ty: TableType, init: UntypedValue, limiter: Option<&mut (dyn ResourceLimiter + 'static)>) -> Result<Self, Trap> {
        let size = ty.limits.min as usize;
        if let Some(limiter) = limiter {
            if !limiter.limit_table_growth(size)? {
                return Err(Trap::message(format!(
                    "initial table size exceeds the resource limit: {size} elements"
                )));
            }
        }
        Ok(Self { elements: vec![init; size], ty })
    }

    pub fn ty(&self) -> TableType {
        TableType { element: self.ty.element, limits: Limits { min: self.size(), max: self.ty.limits.max } }
    }

    pub fn size(&self) -> u64 { self.elements.len() as u64 }

    /// Returns the previous size, or -1 when growth is refused.
    pub(crate) fn grow(&mut self, delta: u64, init: UntypedValue, limiter: Option<&mut (dyn ResourceLimiter + 'static)>) -> Result<i64, Trap> {
        let old = self.size();
        let max = self.ty.limits.max.unwrap_or(MAX_TABLE_SIZE).min(MAX_TABLE_SIZE);
        let Some(new) = old.checked_add(delta).filter(|n| *n <= max) else { return Ok(-1) };
        if delta == 0 { return Ok(old as i64); }
        if let Some(limiter) = limiter {
            if !limiter.limit_table_growth(new as usize)? { return Ok(-1); }
        }
        self.elements.resize(new as usize, init);
        Ok(old as i64)
    }

    #[inline]
    pub fn get(&self, index: u64) -> Result<UntypedValue, TrapReason> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.elements.get(i).copied())
            .ok_or(TrapReason::TableOutOfBounds(index))
    }

    #[inline]
    pub fn set(&mut self, index: u64, value: UntypedValue) -> Result<(), TrapReason> {
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.elements.get_mut(i))
            .ok_or(TrapReason::TableOutOfBounds(index))?;
        *slot = value;
        Ok(())
    }

    fn range(&self, start: u64, len: u64) -> Result<std::ops::Range<usize>, TrapReason> {
        let end = start.checked_add(len).filter(|end| *end <= self.size()).ok_or(TrapReason::TableOutOfBounds(start))?;
        Ok(start as usize..end as usize)
    }

    pub fn fill(&mut self, start: u64, value: UntypedValue, len: u64) -> Result<(), TrapReason> {
        let range = self.range(start, len)?;
        self.elements[range].fill(value);
        Ok(())
    }

    pub fn copy_within(&mut self, dst: u64, src: u64, len: u64) -> Result<(), TrapReason> {
        let src = self.range(src, len)?;
        let dst = self.range(dst, len)?;
        self.elements.copy_within(src, dst.start);
        Ok(())
    }

    pub fn slice(&self, start: u64, len: u64) -> Result<&[UntypedValue], TrapReason> {
        let range = self.range(start, len)?;
        Ok(&self.elements[range])
    }

    /// Writes `items` starting at `dst`.
    pub fn write(&mut self, dst: u64, items: &[UntypedValue]) -> Result<(), TrapReason> {
        let range = self.range(dst, items.len() as u64)?;
        self.elements[range].copy_from_slice(items);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RefType;

    fn table(min: u64, max: Option<u64>) -> TableEntity {
        let ty = TableType { element: RefType::FuncRef, limits: Limits { min, max } };
        TableEntity::new(ty, UntypedValue::null_ref(), None).unwrap()
    }

    #[test]
    fn grow_past_maximum_fails_with_sentinel() {
        let mut t = table(1, Some(2));
        assert_eq!(t.grow(1, UntypedValue::null_ref(), None).unwrap(), 1);
        assert_eq!(t.grow(1, UntypedValue::null_ref(), None).unwrap(), -1);
        assert_eq!(t.size(), 2);
    }

    #[test]
    fn out_of_bounds_access() {
        let mut t = table(2, None);
        assert_eq!(t.get(2), Err(TrapReason::TableOutOfBounds(2)));
        assert!(t.fill(1, UntypedValue::from_ref(Some(3)), 2).is_err());
        t.fill(0, UntypedValue::from_ref(Some(3)), 2).unwrap();
        assert_eq!(t.get(1).unwrap().as_ref(), Some(3));
    }
}
