//! Arena storage for runtime entities.
//!
//! Every entity the interpreter touches (functions, tables, memories, globals, segments,
//! instances and compiled instruction sequences) lives in a page of a [`BumpAllocator`].
//! Pages are allocated with a fixed capacity and never grow, so an element never moves once
//! placed and a [`Handle`] issued for it stays valid until the owning store is dropped.
//! There is no per-entity free: the whole arena goes away with the store.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Non-owning reference to an entity in a [`BumpAllocator`].
pub struct Handle<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    #[inline]
    pub(crate) fn from_index(index: u32) -> Self { Self { index, _marker: PhantomData } }
    #[inline]
    pub(crate) fn index(self) -> u32 { self.index }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self { *self }
}
impl<T> Copy for Handle<T> {}
impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool { self.index == other.index }
}
impl<T> Eq for Handle<T> {}
impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) { self.index.hash(state) }
}
impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Handle({})", self.index) }
}

pub struct BumpAllocator<T> {
    pages: Vec<Vec<T>>,
    page_capacity: usize,
    len: usize,
}

impl<T> BumpAllocator<T> {
    pub const DEFAULT_PAGE_CAPACITY: usize = 64;

    pub fn new() -> Self { Self::with_page_capacity(Self::DEFAULT_PAGE_CAPACITY) }

    pub fn with_page_capacity(page_capacity: usize) -> Self {
        Self { pages: Vec::new(), page_capacity: page_capacity.max(1), len: 0 }
    }

    pub fn allocate(&mut self, value: T) -> Handle<T> {
        let full = self.pages.last().map_or(true, |page| page.len() == self.page_capacity);
        if full {
            self.pages.push(Vec::with_capacity(self.page_capacity));
        }
        let page = self.pages.len() - 1;
        self.pages[page].push(value);
        let index = self.len as u32;
        self.len += 1;
        Handle::from_index(index)
    }

    #[inline]
    fn locate(&self, handle: Handle<T>) -> (usize, usize) {
        let index = handle.index as usize;
        (index / self.page_capacity, index % self.page_capacity)
    }

    #[inline]
    pub fn get(&self, handle: Handle<T>) -> &T {
        let (page, slot) = self.locate(handle);
        &self.pages[page][slot]
    }

    #[inline]
    pub fn get_mut(&mut self, handle: Handle<T>) -> &mut T {
        let (page, slot) = self.locate(handle);
        &mut self.pages[page][slot]
    }

    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn page_count(&self) -> usize { self.pages.len() }
}

impl<T> Default for BumpAllocator<T> {
    fn default() -> Self { Self::new() }
}

/// Deduplicating table that maps structurally equal values to one small id.
pub struct Interner<T> {
    ids: HashMap<T, u32>,
    items: Vec<T>,
}

impl<T: Clone + Eq + Hash> Interner<T> {
    pub fn new() -> Self { Self { ids: HashMap::new(), items: Vec::new() } }

    pub fn intern(&mut self, value: &T) -> u32 {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = self.items.len() as u32;
        self.items.push(value.clone());
        self.ids.insert(value.clone(), id);
        id
    }

    pub fn resolve(&self, id: u32) -> &T { &self.items[id as usize] }
}

impl<T: Clone + Eq + Hash> Default for Interner<T> {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_stay_valid_across_pages() {
        let mut alloc = BumpAllocator::with_page_capacity(2);
        let handles: Vec<_> = (0..7).map(|i| alloc.allocate(i * 10)).collect();
        assert_eq!(alloc.page_count(), 4);
        for (i, h) in handles.iter().enumerate() {
            assert_eq!(*alloc.get(*h), i * 10);
        }
        *alloc.get_mut(handles[3]) = 99;
        assert_eq!(*alloc.get(handles[3]), 99);
        assert_eq!(*alloc.get(handles[6]), 60);
    }

    #[test]
    fn element_address_is_stable() {
        let mut alloc = BumpAllocator::with_page_capacity(4);
        let first = alloc.allocate(String::from("first"));
        let before = alloc.get(first) as *const String;
        for i in 0..32 {
            alloc.allocate(i.to_string());
        }
        assert_eq!(before, alloc.get(first) as *const String);
    }

    #[test]
    fn interner_dedups() {
        let mut types = Interner::new();
        let a = types.intern(&vec![1, 2]);
        let b = types.intern(&vec![3]);
        assert_eq!(types.intern(&vec![1, 2]), a);
        assert_ne!(a, b);
        assert_eq!(types.resolve(b), &vec![3]);
    }
}
