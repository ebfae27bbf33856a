#[cfg(feature = "debugger")]
use std::collections::HashMap;
use std::sync::Arc;

use log::debug;

use crate::alloc::{BumpAllocator, Interner};
use crate::engine::{Engine, ResourceLimiter};
use crate::error::Error;
use crate::externs::{DataEntity, ElementEntity, GlobalEntity};
use crate::func::{Func, FuncHandle, FunctionEntity, FunctionKind, IseqHandle};
use crate::instance::InstanceEntity;
use crate::isa::InstructionSequence;
use crate::layout::frame_header_size;
use crate::memory::MemoryEntity;
use crate::table::TableEntity;
use crate::translator::{TranslationContext, Translator};
use crate::types::FuncType;

/// Owns the backing storage of every entity reachable from a store.
///
/// Nothing is freed individually; all pages go away together with the store.
#[derive(Default)]
pub(crate) struct StoreAllocator {
    pub(crate) functions: BumpAllocator<FunctionEntity>,
    pub(crate) tables: BumpAllocator<TableEntity>,
    pub(crate) memories: BumpAllocator<MemoryEntity>,
    pub(crate) globals: BumpAllocator<GlobalEntity>,
    pub(crate) elements: BumpAllocator<ElementEntity>,
    pub(crate) data: BumpAllocator<DataEntity>,
    pub(crate) instances: BumpAllocator<InstanceEntity>,
    pub(crate) iseqs: BumpAllocator<Arc<InstructionSequence>>,
    pub(crate) types: Interner<FuncType>,
}

pub struct Store {
    pub(crate) engine: Engine,
    pub(crate) alloc: StoreAllocator,
    pub(crate) limiter: Option<Box<dyn ResourceLimiter>>,
    root_iseq: IseqHandle,
    /// Original instruction words displaced by breakpoints, keyed by (iseq, pc).
    #[cfg(feature = "debugger")]
    pub(crate) breakpoints: HashMap<(u32, usize), u64>,
}

impl Store {
    pub fn new(engine: &Engine) -> Self {
        let mut alloc = StoreAllocator::default();
        let root_iseq = alloc.iseqs.allocate(Arc::new(InstructionSequence::end_of_execution()));
        Self {
            engine: engine.clone(),
            alloc,
            limiter: None,
            root_iseq,
            #[cfg(feature = "debugger")]
            breakpoints: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine { &self.engine }

    /// Installs a limiter consulted on every memory and table allocation or growth.
    pub fn set_limiter(&mut self, limiter: impl ResourceLimiter + 'static) {
        self.limiter = Some(Box::new(limiter));
    }

    pub(crate) fn root_iseq(&self) -> IseqHandle { self.root_iseq }

    pub(crate) fn allocate_function(&mut self, ty: &FuncType, kind: FunctionKind) -> Func {
        let type_id = self.alloc.types.intern(ty);
        let header_size = frame_header_size(ty);
        Func(self.alloc.functions.allocate(FunctionEntity { type_id, header_size, kind }))
    }

    pub(crate) fn func_type(&self, func: FuncHandle) -> &FuncType {
        self.alloc.types.resolve(self.alloc.functions.get(func).type_id)
    }

    pub(crate) fn function_name(&self, func: FuncHandle) -> Option<String> {
        let FunctionKind::Wasm(wasm) = &self.alloc.functions.get(func).kind else { return None };
        let instance = self.alloc.instances.get(wasm.instance);
        instance.module.function_names.get(&wasm.index).cloned()
    }

    /// Index of a guest function in its module, for backtraces.
    pub(crate) fn function_index(&self, func: FuncHandle) -> Option<u32> {
        match &self.alloc.functions.get(func).kind {
            FunctionKind::Wasm(wasm) => Some(wasm.index),
            FunctionKind::Host(_) => None,
        }
    }

    pub(crate) fn iseq(&self, handle: IseqHandle) -> &Arc<InstructionSequence> {
        self.alloc.iseqs.get(handle)
    }

    /// Translates a guest function on first use. Host functions have no instruction sequence.
    pub(crate) fn ensure_compiled(&mut self, func: FuncHandle) -> Result<Option<IseqHandle>, Error> {
        let (instance, index) = match &self.alloc.functions.get(func).kind {
            FunctionKind::Host(_) => return Ok(None),
            FunctionKind::Wasm(wasm) => {
                if let Some(handle) = wasm.compiled.get() {
                    return Ok(Some(*handle));
                }
                (wasm.instance, wasm.index)
            }
        };

        let iseq = {
            let instance = self.alloc.instances.get(instance);
            let ctx = TranslationContext {
                module: &instance.module,
                instance,
                features: self.engine.config().features,
            };
            Translator::translate(&ctx, index, func)?
        };
        debug!(
            "compiled function {index}: {} words, max stack height {}, {} constants",
            iseq.code.len(),
            iseq.max_stack_height,
            iseq.constants().len()
        );
        let handle = self.alloc.iseqs.allocate(Arc::new(iseq));
        match &self.alloc.functions.get(func).kind {
            FunctionKind::Wasm(wasm) => Ok(Some(*wasm.compiled.get_or_init(|| handle))),
            FunctionKind::Host(_) => Ok(None),
        }
    }

    #[cfg(feature = "debugger")]
    pub(crate) fn iseq_mut(&mut self, handle: IseqHandle) -> &mut InstructionSequence {
        Arc::make_mut(self.alloc.iseqs.get_mut(handle))
    }
}
