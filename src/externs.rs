use std::sync::Arc;

use crate::alloc::Handle;
use crate::error::{Error, Trap, TrapReason};
use crate::func::Func;
use crate::memory::{MemoryEntity, SharedMemory};
use crate::store::Store;
use crate::table::TableEntity;
use crate::types::{GlobalType, MemoryType, RefType, TableType};
use crate::value::{UntypedValue, Value};

pub(crate) type TableHandle = Handle<TableEntity>;
pub(crate) type MemoryHandle = Handle<MemoryEntity>;
pub(crate) type GlobalHandle = Handle<GlobalEntity>;
pub(crate) type ElementHandle = Handle<ElementEntity>;
pub(crate) type DataHandle = Handle<DataEntity>;

pub(crate) struct GlobalEntity {
    pub(crate) ty: GlobalType,
    pub(crate) value: UntypedValue,
}

/// Runtime copy of an element segment; `elem.drop` empties it.
pub(crate) struct ElementEntity {
    pub(crate) ty: RefType,
    pub(crate) items: Vec<UntypedValue>,
}

/// Runtime copy of a data segment; `data.drop` empties it.
pub(crate) struct DataEntity {
    pub(crate) bytes: Vec<u8>,
}

/// Anything that can be imported or exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extern {
    Func(Func),
    Table(Table),
    Memory(Memory),
    Global(Global),
}

impl Extern {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Extern::Func(_) => "function",
            Extern::Table(_) => "table",
            Extern::Memory(_) => "memory",
            Extern::Global(_) => "global",
        }
    }
}

impl From<Func> for Extern {
    fn from(f: Func) -> Self { Extern::Func(f) }
}
impl From<Table> for Extern {
    fn from(t: Table) -> Self { Extern::Table(t) }
}
impl From<Memory> for Extern {
    fn from(m: Memory) -> Self { Extern::Memory(m) }
}
impl From<Global> for Extern {
    fn from(g: Global) -> Self { Extern::Global(g) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory(pub(crate) MemoryHandle);

impl Memory {
    pub fn new(store: &mut Store, ty: MemoryType) -> Result<Memory, Trap> {
        let entity = MemoryEntity::new(ty, store.limiter.as_deref_mut())?;
        Ok(Memory(store.alloc.memories.allocate(entity)))
    }

    /// Wraps bytes shared with another store.
    pub fn from_shared(store: &mut Store, shared: Arc<SharedMemory>) -> Memory {
        Memory(store.alloc.memories.allocate(MemoryEntity::from_shared(shared)))
    }

    pub fn ty(&self, store: &Store) -> MemoryType { store.alloc.memories.get(self.0).ty() }

    pub fn pages(&self, store: &Store) -> u64 { store.alloc.memories.get(self.0).pages() }

    pub fn shared(&self, store: &Store) -> Option<Arc<SharedMemory>> {
        store.alloc.memories.get(self.0).shared().cloned()
    }

    /// Returns the previous page count, or `None` when the memory cannot grow.
    pub fn grow(&self, store: &mut Store, delta: u64) -> Result<Option<u64>, Trap> {
        let old = store.alloc.memories.get_mut(self.0).grow(delta, store.limiter.as_deref_mut())?;
        Ok(u64::try_from(old).ok())
    }

    pub fn read(&self, store: &Store, offset: u64, buf: &mut [u8]) -> Result<(), Trap> {
        store.alloc.memories.get(self.0).read(offset, buf).map_err(Trap::from)
    }

    pub fn write(&self, store: &mut Store, offset: u64, bytes: &[u8]) -> Result<(), Trap> {
        store.alloc.memories.get_mut(self.0).write(offset, bytes).map_err(Trap::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Table(pub(crate) TableHandle);

impl Table {
    pub fn new(store: &mut Store, ty: TableType, init: Value) -> Result<Table, Error> {
        let init = ref_slot(ty.element, init)?;
        let entity = TableEntity::new(ty, init, store.limiter.as_deref_mut())?;
        Ok(Table(store.alloc.tables.allocate(entity)))
    }

    pub fn ty(&self, store: &Store) -> TableType { store.alloc.tables.get(self.0).ty() }

    pub fn size(&self, store: &Store) -> u64 { store.alloc.tables.get(self.0).size() }

    pub fn get(&self, store: &Store, index: u64) -> Option<Value> {
        let table = store.alloc.tables.get(self.0);
        let raw = table.get(index).ok()?;
        Some(Value::from_untyped(raw, table.ty().element.into()))
    }

    pub fn set(&self, store: &mut Store, index: u64, value: Value) -> Result<(), Error> {
        let table = store.alloc.tables.get_mut(self.0);
        let raw = ref_slot(table.ty().element, value)?;
        table.set(index, raw)?;
        Ok(())
    }

    /// Returns the previous size, or `None` when growth is refused.
    pub fn grow(&self, store: &mut Store, delta: u64, init: Value) -> Result<Option<u64>, Error> {
        let table = store.alloc.tables.get_mut(self.0);
        let init = ref_slot(table.ty().element, init)?;
        let old = table.grow(delta, init, store.limiter.as_deref_mut())?;
        Ok(u64::try_from(old).ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Global(pub(crate) GlobalHandle);

impl Global {
    pub fn new(store: &mut Store, ty: GlobalType, value: Value) -> Result<Global, Error> {
        if value.ty() != ty.content {
            return Err(Trap::message(format!("global type mismatch: expected {}, got {}", ty.content, value.ty())).into());
        }
        Ok(Global(store.alloc.globals.allocate(GlobalEntity { ty, value: value.to_untyped() })))
    }

    pub fn ty(&self, store: &Store) -> GlobalType { store.alloc.globals.get(self.0).ty }

    pub fn get(&self, store: &Store) -> Value {
        let global = store.alloc.globals.get(self.0);
        Value::from_untyped(global.value, global.ty.content)
    }

    pub fn set(&self, store: &mut Store, value: Value) -> Result<(), Error> {
        let global = store.alloc.globals.get_mut(self.0);
        if !global.ty.mutable {
            return Err(Trap::message("cannot set an immutable global").into());
        }
        if value.ty() != global.ty.content {
            return Err(Trap::message(format!("global type mismatch: expected {}, got {}", global.ty.content, value.ty())).into());
        }
        global.value = value.to_untyped();
        Ok(())
    }
}

fn ref_slot(element: RefType, value: Value) -> Result<UntypedValue, Error> {
    match (element, value) {
        (RefType::FuncRef, Value::FuncRef(_)) | (RefType::ExternRef, Value::ExternRef(_)) => Ok(value.to_untyped()),
        _ => Err(TrapReason::Message(format!("expected a {:?} element, got {}", element, value.ty())).into()),
    }
}
