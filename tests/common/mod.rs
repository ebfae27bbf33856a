#![allow(dead_code)]

use std::sync::Arc;

use wari::{CompilationMode, Engine, EngineConfig, Imports, Instance, Module, Store, ThreadingModel};
use wasm_encoder::{
    CodeSection, ConstExpr, DataCountSection, DataSection, ElementSection, Elements, EntityType, ExportKind,
    ExportSection, Function, FunctionSection, GlobalSection, GlobalType, ImportSection, Instruction, MemArg, MemorySection, MemoryType,
    NameMap, NameSection, RefType, TableSection, TableType, TypeSection, ValType,
};

pub const MODELS: [ThreadingModel; 2] = [ThreadingModel::Token, ThreadingModel::Direct];

/// Assembles a module section by section. Function indices count imports first.
#[derive(Default)]
pub struct ModuleBuilder {
    types: TypeSection,
    imports: ImportSection,
    functions: FunctionSection,
    tables: TableSection,
    memories: MemorySection,
    globals: GlobalSection,
    exports: ExportSection,
    start: Option<u32>,
    elements: ElementSection,
    code: CodeSection,
    data: DataSection,
    names: NameMap,
    name_count: u32,
    type_count: u32,
    func_count: u32,
    data_count: u32,
}

impl ModuleBuilder {
    pub fn new() -> Self { Self::default() }

    pub fn ty(&mut self, params: &[ValType], results: &[ValType]) -> u32 {
        self.types.ty().function(params.iter().copied(), results.iter().copied());
        self.type_count += 1;
        self.type_count - 1
    }

    pub fn import_func(&mut self, module: &str, name: &str, ty: u32) -> u32 {
        self.imports.import(module, name, EntityType::Function(ty));
        self.func_count += 1;
        self.func_count - 1
    }

    pub fn import_memory(&mut self, module: &str, name: &str, min: u64, max: Option<u64>, shared: bool) {
        self.imports.import(module, name, EntityType::Memory(memory_type(min, max, shared)));
    }

    pub fn func(&mut self, ty: u32, locals: &[ValType], body: &[Instruction<'_>]) -> u32 {
        self.functions.function(ty);
        let mut f = Function::new_with_locals_types(locals.iter().copied());
        for instruction in body {
            f.instruction(instruction);
        }
        f.instruction(&Instruction::End);
        self.code.function(&f);
        self.func_count += 1;
        self.func_count - 1
    }

    pub fn export(&mut self, name: &str, func: u32) -> &mut Self {
        self.exports.export(name, ExportKind::Func, func);
        self
    }

    pub fn export_memory(&mut self, name: &str) -> &mut Self {
        self.exports.export(name, ExportKind::Memory, 0);
        self
    }

    pub fn export_table(&mut self, name: &str) -> &mut Self {
        self.exports.export(name, ExportKind::Table, 0);
        self
    }

    pub fn name(&mut self, func: u32, name: &str) -> &mut Self {
        self.names.append(func, name);
        self.name_count += 1;
        self
    }

    pub fn start(&mut self, func: u32) -> &mut Self {
        self.start = Some(func);
        self
    }

    pub fn memory(&mut self, min: u64, max: Option<u64>, shared: bool) -> &mut Self {
        self.memories.memory(memory_type(min, max, shared));
        self
    }

    pub fn table(&mut self, min: u64, max: Option<u64>) -> &mut Self {
        self.tables.table(TableType {
            element_type: RefType::FUNCREF,
            table64: false,
            minimum: min,
            maximum: max,
            shared: false,
        });
        self
    }

    pub fn global_i32(&mut self, mutable: bool, init: i32) -> &mut Self {
        self.global(ValType::I32, mutable, &ConstExpr::i32_const(init))
    }

    pub fn global(&mut self, val_type: ValType, mutable: bool, init: &ConstExpr) -> &mut Self {
        self.globals.global(GlobalType { val_type, mutable, shared: false }, init);
        self
    }

    pub fn import_global(&mut self, module: &str, name: &str, val_type: ValType, mutable: bool) -> &mut Self {
        self.imports.import(module, name, EntityType::Global(GlobalType { val_type, mutable, shared: false }));
        self
    }

    pub fn export_global(&mut self, name: &str, index: u32) -> &mut Self {
        self.exports.export(name, ExportKind::Global, index);
        self
    }

    /// A declarative segment, which only makes `funcs` referenceable by `ref.func`.
    pub fn declare(&mut self, funcs: &[u32]) -> &mut Self {
        self.elements.declared(Elements::Functions(funcs.into()));
        self
    }

    pub fn elements(&mut self, offset: i32, funcs: &[u32]) -> &mut Self {
        self.elements.active(Some(0), &ConstExpr::i32_const(offset), Elements::Functions(funcs.into()));
        self
    }

    pub fn data(&mut self, offset: i32, bytes: &[u8]) -> &mut Self {
        self.data.active(0, &ConstExpr::i32_const(offset), bytes.iter().copied());
        self.data_count += 1;
        self
    }

    pub fn passive_data(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.passive(bytes.iter().copied());
        self.data_count += 1;
        self
    }

    pub fn finish(&self) -> Vec<u8> {
        let mut module = wasm_encoder::Module::new();
        module.section(&self.types);
        if !self.imports.is_empty() {
            module.section(&self.imports);
        }
        module.section(&self.functions);
        if !self.tables.is_empty() {
            module.section(&self.tables);
        }
        if !self.memories.is_empty() {
            module.section(&self.memories);
        }
        if !self.globals.is_empty() {
            module.section(&self.globals);
        }
        module.section(&self.exports);
        if let Some(function_index) = self.start {
            module.section(&wasm_encoder::StartSection { function_index });
        }
        if !self.elements.is_empty() {
            module.section(&self.elements);
        }
        if self.data_count > 0 {
            module.section(&DataCountSection { count: self.data_count });
        }
        module.section(&self.code);
        if self.data_count > 0 {
            module.section(&self.data);
        }
        if self.name_count > 0 {
            let mut names = NameSection::new();
            names.functions(&self.names);
            module.section(&names);
        }
        module.finish()
    }
}

fn memory_type(min: u64, max: Option<u64>, shared: bool) -> MemoryType {
    MemoryType { minimum: min, maximum: max, memory64: false, shared, page_size_log2: None }
}

pub fn mem(offset: u64, align: u32) -> MemArg {
    MemArg { offset, align, memory_index: 0 }
}

pub fn config(model: ThreadingModel) -> EngineConfig {
    EngineConfig::default().threading_model(model)
}

pub fn engine(model: ThreadingModel) -> Engine {
    Engine::new(config(model))
}

pub fn eager_engine(model: ThreadingModel) -> Engine {
    Engine::new(config(model).compilation_mode(CompilationMode::Eager))
}

pub fn parse(bytes: Vec<u8>) -> Arc<Module> {
    Arc::new(Module::parse(bytes).unwrap())
}

pub fn instantiate(engine: &Engine, bytes: Vec<u8>) -> (Store, Instance) {
    instantiate_with(engine, bytes, &Imports::new())
}

pub fn instantiate_with(engine: &Engine, bytes: Vec<u8>, imports: &Imports) -> (Store, Instance) {
    let mut store = Store::new(engine);
    let instance = Instance::instantiate(&mut store, parse(bytes), imports).unwrap();
    (store, instance)
}
