use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::alloc::Handle;
use crate::error::{Error, Trap};
use crate::exec;
use crate::instance::{Instance, InstanceHandle};
use crate::isa::InstructionSequence;
use crate::store::Store;
use crate::types::FuncType;
use crate::value::Value;

pub(crate) type FuncHandle = Handle<FunctionEntity>;
pub(crate) type IseqHandle = Handle<Arc<InstructionSequence>>;

/// Signature of a host function body.
pub type HostFn = dyn Fn(Caller<'_>, &[Value]) -> Result<Vec<Value>, Trap> + Send + Sync;

pub(crate) struct FunctionEntity {
    /// Interned id of the function type in the store.
    pub(crate) type_id: u32,
    pub(crate) header_size: usize,
    pub(crate) kind: FunctionKind,
}

pub(crate) enum FunctionKind {
    Host(Arc<HostFn>),
    Wasm(WasmFunction),
}

pub(crate) struct WasmFunction {
    pub(crate) instance: InstanceHandle,
    /// Index in the defining module's function space.
    pub(crate) index: u32,
    /// Set once, by whichever caller compiles first.
    pub(crate) compiled: OnceLock<IseqHandle>,
}

/// A function owned by a [`Store`], either defined by a module or by the host.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Func(pub(crate) FuncHandle);

impl fmt::Debug for Func {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Func({})", self.0.index())
    }
}

impl Func {
    pub(crate) fn from_index(index: u32) -> Self { Func(Handle::from_index(index)) }

    /// Defines a host function.
    pub fn wrap<F>(store: &mut Store, ty: FuncType, body: F) -> Func
    where
        F: Fn(Caller<'_>, &[Value]) -> Result<Vec<Value>, Trap> + Send + Sync + 'static,
    {
        store.allocate_function(&ty, FunctionKind::Host(Arc::new(body)))
    }

    pub fn ty(&self, store: &Store) -> FuncType {
        store.func_type(self.0).clone()
    }

    /// Invokes the function. Arguments must match the parameter types exactly.
    pub fn call(&self, store: &mut Store, args: &[Value]) -> Result<Vec<Value>, Error> {
        exec::invoke(store, self.0, args)
    }

    /// The translated body, compiling it first if needed. `None` for host functions.
    pub fn instruction_sequence(&self, store: &mut Store) -> Result<Option<Arc<InstructionSequence>>, Error> {
        let iseq = store.ensure_compiled(self.0)?;
        Ok(iseq.map(|handle| store.iseq(handle).clone()))
    }

    /// Name from the defining module's name section.
    pub fn name(&self, store: &Store) -> Option<String> {
        store.function_name(self.0)
    }
}

/// Context handed to host functions.
pub struct Caller<'a> {
    pub(crate) store: &'a mut Store,
    pub(crate) instance: Option<InstanceHandle>,
}

impl<'a> Caller<'a> {
    pub fn store(&self) -> &Store { self.store }

    pub fn store_mut(&mut self) -> &mut Store { self.store }

    /// The instance of the calling guest function, if any.
    pub fn instance(&self) -> Option<Instance> { self.instance.map(Instance) }
}
