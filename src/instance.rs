use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use log::debug;

use crate::alloc::Handle;
use crate::byte_iter::ByteIter;
use crate::engine::{CompilationMode, WasmFeatures};
use crate::error::*;
use crate::externs::*;
use crate::externs::{Global, Memory, Table};
use crate::func::{Func, FuncHandle, FunctionKind, WasmFunction};
use crate::memory::MemoryEntity;
use crate::module::*;
use crate::store::Store;
use crate::table::TableEntity;
use crate::types::ValType;
use crate::value::UntypedValue;

pub(crate) type InstanceHandle = Handle<InstanceEntity>;

pub(crate) struct InstanceEntity {
    pub(crate) module: Arc<Module>,
    pub(crate) functions: Vec<FuncHandle>,
    pub(crate) tables: Vec<TableHandle>,
    pub(crate) memories: Vec<MemoryHandle>,
    pub(crate) globals: Vec<GlobalHandle>,
    pub(crate) elements: Vec<ElementHandle>,
    pub(crate) data: Vec<DataHandle>,
    /// Store-interned id of each entry of the module's type section.
    pub(crate) type_ids: Vec<u32>,
    pub(crate) exports: HashMap<String, Extern>,
}

/// Externs made available to a module, keyed by `(module, name)`.
#[derive(Default, Clone)]
pub struct Imports {
    entries: HashMap<String, HashMap<String, Extern>>,
}

impl Imports {
    pub fn new() -> Self { Self::default() }

    pub fn define(&mut self, module: &str, name: &str, value: impl Into<Extern>) -> Result<&mut Self, ImportError> {
        let names = self.entries.entry(module.to_owned()).or_default();
        if names.contains_key(name) {
            return Err(ImportError::AlreadyRegistered { module: module.to_owned(), name: name.to_owned() });
        }
        names.insert(name.to_owned(), value.into());
        Ok(self)
    }

    /// Makes every export of `instance` importable under `module`.
    pub fn define_instance(&mut self, store: &Store, module: &str, instance: Instance) -> Result<&mut Self, ImportError> {
        let exports: Vec<(String, Extern)> = store.alloc.instances.get(instance.0)
            .exports
            .iter()
            .map(|(name, value)| (name.clone(), *value))
            .collect();
        for (name, value) in exports {
            self.define(module, &name, value)?;
        }
        Ok(self)
    }

    pub fn get(&self, module: &str, name: &str) -> Option<Extern> {
        self.entries.get(module).and_then(|names| names.get(name)).copied()
    }

    fn resolve(&self, import: &ImportRef) -> Result<Extern, ImportError> {
        self.get(&import.module, &import.name)
            .ok_or_else(|| ImportError::Missing { module: import.module.clone(), name: import.name.clone() })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instance(pub(crate) InstanceHandle);

fn incompatible(import: &ImportRef, expected: impl ToString, actual: impl ToString) -> ImportError {
    ImportError::IncompatibleType {
        module: import.module.clone(),
        name: import.name.clone(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
}

impl Instance {
    pub fn instantiate(store: &mut Store, module: Arc<Module>, imports: &Imports) -> Result<Self, Error> {
        let type_ids: Vec<u32> = module.types.iter().map(|ty| store.alloc.types.intern(ty)).collect();
        let handle = store.alloc.instances.allocate(InstanceEntity {
            module: module.clone(),
            functions: Vec::with_capacity(module.functions.len()),
            tables: Vec::with_capacity(module.tables.len()),
            memories: Vec::with_capacity(module.memories.len()),
            globals: Vec::with_capacity(module.globals.len()),
            elements: Vec::with_capacity(module.elements.len()),
            data: Vec::with_capacity(module.data_segments.len()),
            type_ids,
            exports: HashMap::new(),
        });

        let mut functions = Vec::with_capacity(module.functions.len());
        for (index, function) in module.functions.iter().enumerate() {
            let ty = &module.types[function.type_index as usize];
            let func = match &function.import {
                Some(import) => {
                    let value = imports.resolve(import)?;
                    let Extern::Func(func) = value else {
                        return Err(incompatible(import, "function", value.kind_name()).into());
                    };
                    let actual = store.func_type(func.0);
                    if actual != ty {
                        return Err(incompatible(import, ty, actual).into());
                    }
                    func.0
                }
                None => {
                    let kind = FunctionKind::Wasm(WasmFunction {
                        instance: handle,
                        index: index as u32,
                        compiled: OnceLock::new(),
                    });
                    store.allocate_function(ty, kind).0
                }
            };
            functions.push(func);
        }
        store.alloc.instances.get_mut(handle).functions = functions;

        let mut tables = Vec::with_capacity(module.tables.len());
        for table in &module.tables {
            let table_handle = match &table.import {
                Some(import) => {
                    let value = imports.resolve(import)?;
                    let Extern::Table(t) = value else {
                        return Err(incompatible(import, "table", value.kind_name()).into());
                    };
                    let actual = store.alloc.tables.get(t.0).ty();
                    if actual.element != table.ty.element || !actual.limits.fits(&table.ty.limits) {
                        return Err(incompatible(import, format!("{:?}", table.ty), format!("{actual:?}")).into());
                    }
                    t.0
                }
                None => {
                    let entity = TableEntity::new(table.ty, UntypedValue::null_ref(), store.limiter.as_deref_mut())?;
                    store.alloc.tables.allocate(entity)
                }
            };
            tables.push(table_handle);
        }
        store.alloc.instances.get_mut(handle).tables = tables;

        let mut memories = Vec::with_capacity(module.memories.len());
        for memory in &module.memories {
            let memory_handle = match &memory.import {
                Some(import) => {
                    let value = imports.resolve(import)?;
                    let Extern::Memory(m) = value else {
                        return Err(incompatible(import, "memory", value.kind_name()).into());
                    };
                    let actual = store.alloc.memories.get(m.0).ty();
                    if actual.shared != memory.ty.shared || !actual.limits.fits(&memory.ty.limits) {
                        return Err(incompatible(import, format!("{:?}", memory.ty), format!("{actual:?}")).into());
                    }
                    m.0
                }
                None => {
                    let entity = MemoryEntity::new(memory.ty, store.limiter.as_deref_mut())?;
                    store.alloc.memories.allocate(entity)
                }
            };
            memories.push(memory_handle);
        }
        store.alloc.instances.get_mut(handle).memories = memories;

        for global in &module.globals {
            let global_handle = match (&global.import, &global.init) {
                (Some(import), _) => {
                    let value = imports.resolve(import)?;
                    let Extern::Global(g) = value else {
                        return Err(incompatible(import, "global", value.kind_name()).into());
                    };
                    let actual = store.alloc.globals.get(g.0).ty;
                    if actual != global.ty {
                        return Err(incompatible(import, format!("{:?}", global.ty), format!("{actual:?}")).into());
                    }
                    g.0
                }
                (None, Some(init)) => {
                    let value = eval_const(store, handle, &module, init, global.ty.content)?;
                    store.alloc.globals.allocate(GlobalEntity { ty: global.ty, value })
                }
                (None, None) => return Err(Error::Malformed(CONST_EXP_REQUIRED)),
            };
            store.alloc.instances.get_mut(handle).globals.push(global_handle);
        }

        let mut exports = HashMap::with_capacity(module.exports.len());
        {
            let entity = store.alloc.instances.get(handle);
            for export in &module.exports {
                let i = export.index as usize;
                let value = match export.kind {
                    ExternKind::Func => Extern::Func(Func(entity.functions[i])),
                    ExternKind::Table => Extern::Table(Table(entity.tables[i])),
                    ExternKind::Memory => Extern::Memory(Memory(entity.memories[i])),
                    ExternKind::Global => Extern::Global(Global(entity.globals[i])),
                };
                exports.insert(export.name.clone(), value);
            }
        }
        store.alloc.instances.get_mut(handle).exports = exports;

        // Active segments are applied in order; a trap part way through keeps earlier writes.
        for segment in &module.elements {
            let items = match &segment.items {
                ElementItems::Functions(indices) => {
                    let entity = store.alloc.instances.get(handle);
                    indices.iter().map(|f| UntypedValue::from_ref(Some(entity.functions[*f as usize].index()))).collect()
                }
                ElementItems::Expressions(exprs) => exprs
                    .iter()
                    .map(|expr| eval_const(store, handle, &module, expr, segment.ty.into()))
                    .collect::<Result<Vec<_>, _>>()?,
            };
            let element = store.alloc.elements.allocate(ElementEntity { ty: segment.ty, items });
            store.alloc.instances.get_mut(handle).elements.push(element);
        }
        for segment in &module.data_segments {
            let bytes = module.bytes()[segment.bytes.clone()].to_vec();
            let data = store.alloc.data.allocate(DataEntity { bytes });
            store.alloc.instances.get_mut(handle).data.push(data);
        }

        for (i, segment) in module.elements.iter().enumerate() {
            let element = store.alloc.instances.get(handle).elements[i];
            match &segment.mode {
                ElementMode::Active { table, offset } => {
                    let offset = eval_const(store, handle, &module, offset, ValType::I32)?.as_u32() as u64;
                    let table = store.alloc.instances.get(handle).tables[*table as usize];
                    let items = std::mem::take(&mut store.alloc.elements.get_mut(element).items);
                    store.alloc.tables.get_mut(table).write(offset, &items)?;
                }
                ElementMode::Declarative => store.alloc.elements.get_mut(element).items.clear(),
                ElementMode::Passive => {}
            }
        }
        for (i, segment) in module.data_segments.iter().enumerate() {
            let DataMode::Active { memory, offset } = &segment.mode else { continue };
            let data = store.alloc.instances.get(handle).data[i];
            let offset = eval_const(store, handle, &module, offset, ValType::I32)?.as_u32() as u64;
            let memory = store.alloc.instances.get(handle).memories[*memory as usize];
            let bytes = std::mem::take(&mut store.alloc.data.get_mut(data).bytes);
            store.alloc.memories.get_mut(memory).write(offset, &bytes)?;
        }

        if store.engine.config().compilation_mode == CompilationMode::Eager {
            let defined: Vec<FuncHandle> = {
                let entity = store.alloc.instances.get(handle);
                let n_imported = module.imported_function_count();
                entity.functions[n_imported..].to_vec()
            };
            for func in defined {
                store.ensure_compiled(func)?;
            }
        }

        debug!(
            "instantiated module: {} functions, {} tables, {} memories, {} globals",
            module.functions.len(),
            module.tables.len(),
            module.memories.len(),
            module.globals.len()
        );

        let instance = Instance(handle);
        if let Some(start) = module.start {
            let func = Func(store.alloc.instances.get(handle).functions[start as usize]);
            func.call(store, &[])?;
        }
        Ok(instance)
    }

    pub fn module<'s>(&self, store: &'s Store) -> &'s Arc<Module> {
        &store.alloc.instances.get(self.0).module
    }

    /// Function `index` of the module's function index space, imports included.
    pub fn function(&self, store: &Store, index: u32) -> Option<Func> {
        store.alloc.instances.get(self.0).functions.get(index as usize).copied().map(Func)
    }

    pub fn export(&self, store: &Store, name: &str) -> Option<Extern> {
        store.alloc.instances.get(self.0).exports.get(name).copied()
    }

    pub fn export_func(&self, store: &Store, name: &str) -> Option<Func> {
        match self.export(store, name)? {
            Extern::Func(f) => Some(f),
            _ => None,
        }
    }

    pub fn export_memory(&self, store: &Store, name: &str) -> Option<Memory> {
        match self.export(store, name)? {
            Extern::Memory(m) => Some(m),
            _ => None,
        }
    }

    pub fn export_table(&self, store: &Store, name: &str) -> Option<Table> {
        match self.export(store, name)? {
            Extern::Table(t) => Some(t),
            _ => None,
        }
    }

    pub fn export_global(&self, store: &Store, name: &str) -> Option<Global> {
        match self.export(store, name)? {
            Extern::Global(g) => Some(g),
            _ => None,
        }
    }
}

/// Evaluates a constant expression against the partially built instance. The expression must
/// leave exactly one value of type `expected`.
fn eval_const(
    store: &Store,
    instance: InstanceHandle,
    module: &Module,
    expr: &ConstExpr,
    expected: ValType,
) -> Result<UntypedValue, Error> {
    let entity = store.alloc.instances.get(instance);
    let features = store.engine.config().features;
    let mut it = ByteIter::bounded(module.bytes(), expr.0.clone());
    let mut stack: Vec<(UntypedValue, ValType)> = Vec::new();

    macro_rules! binary {
        ($ty:ident, $as:ident, $from:ident, $method:ident) => {{
            if !features.contains(WasmFeatures::EXTENDED_CONST) {
                return invalid(CONST_EXP_REQUIRED, it.cur());
            }
            match (stack.pop(), stack.pop()) {
                (Some((b, ValType::$ty)), Some((a, ValType::$ty))) => {
                    stack.push((UntypedValue::$from(a.$as().$method(b.$as())), ValType::$ty));
                }
                _ => return invalid("type mismatch", it.cur()),
            }
        }};
    }

    loop {
        let op = it.read_u8()?;
        match op {
            0x0b => break,
            0x41 => stack.push((UntypedValue::from_i32(it.read_i32()?), ValType::I32)),
            0x42 => stack.push((UntypedValue::from_i64(it.read_i64()?), ValType::I64)),
            0x43 => stack.push((UntypedValue(it.read_f32_bits()? as u64), ValType::F32)),
            0x44 => stack.push((UntypedValue(it.read_f64_bits()?), ValType::F64)),
            0x23 => {
                let g = it.read_u32()? as usize;
                let Some(global) = entity.globals.get(g) else { return invalid(UNKNOWN_GLOBAL, it.cur()) };
                let global = store.alloc.globals.get(*global);
                stack.push((global.value, global.ty.content));
            }
            0xd0 => {
                let ty = crate::types::RefType::read(&mut it)?;
                stack.push((UntypedValue::null_ref(), ty.into()));
            }
            0xd2 => {
                let f = it.read_u32()? as usize;
                let Some(func) = entity.functions.get(f) else { return invalid(UNKNOWN_FUNC, it.cur()) };
                stack.push((UntypedValue::from_ref(Some(func.index())), ValType::FuncRef));
            }
            0x6a => binary!(I32, as_u32, from_u32, wrapping_add),
            0x6b => binary!(I32, as_u32, from_u32, wrapping_sub),
            0x6c => binary!(I32, as_u32, from_u32, wrapping_mul),
            0x7c => binary!(I64, as_u64, from_u64, wrapping_add),
            0x7d => binary!(I64, as_u64, from_u64, wrapping_sub),
            0x7e => binary!(I64, as_u64, from_u64, wrapping_mul),
            _ => return invalid(CONST_EXP_REQUIRED, it.cur()),
        }
    }
    match stack.as_slice() {
        [(value, ty)] if *ty == expected => Ok(*value),
        _ => invalid("type mismatch", it.cur()),
    }
}
