mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{engine, instantiate, mem, ModuleBuilder, MODELS};
use wari::{Error, Instance, ResourceLimiter, Store, Trap, TrapReason, Value, PAGE_SIZE};
use wasm_encoder::{Instruction as I, ValType};

fn call(store: &mut Store, instance: &Instance, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
    instance.export_func(store, name).unwrap().call(store, args)
}

fn trap_reason(result: Result<Vec<Value>, Error>) -> TrapReason {
    match result {
        Err(Error::Trap(trap)) => trap.reason().clone(),
        other => panic!("expected a trap, got {other:?}"),
    }
}

/// Exports `load(addr) -> i32`, `store(addr, value)`, `store64(addr, value: i64)`,
/// `grow(delta) -> i32`, `size() -> i32`, plus the bulk operations.
fn memory_module(max_pages: Option<u64>) -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    b.memory(1, max_pages, false).export_memory("memory");
    let load_ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let store_ty = b.ty(&[ValType::I32, ValType::I32], &[]);
    let store64_ty = b.ty(&[ValType::I32, ValType::I64], &[]);
    let size_ty = b.ty(&[], &[ValType::I32]);
    let triple = b.ty(&[ValType::I32, ValType::I32, ValType::I32], &[]);

    let load = b.func(load_ty, &[], &[I::LocalGet(0), I::I32Load(mem(0, 2))]);
    let load8 = b.func(load_ty, &[], &[I::LocalGet(0), I::I32Load8S(mem(4, 0))]);
    let store = b.func(store_ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32Store(mem(0, 2))]);
    let store64 = b.func(store64_ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I64Store(mem(0, 3))]);
    let grow = b.func(load_ty, &[], &[I::LocalGet(0), I::MemoryGrow(0)]);
    let size = b.func(size_ty, &[], &[I::MemorySize(0)]);
    let fill = b.func(triple, &[], &[I::LocalGet(0), I::LocalGet(1), I::LocalGet(2), I::MemoryFill(0)]);
    let copy = b.func(
        triple,
        &[],
        &[I::LocalGet(0), I::LocalGet(1), I::LocalGet(2), I::MemoryCopy { src_mem: 0, dst_mem: 0 }],
    );
    let init = b.func(
        triple,
        &[],
        &[I::LocalGet(0), I::LocalGet(1), I::LocalGet(2), I::MemoryInit { mem: 0, data_index: 1 }],
    );
    let drop_ty = b.ty(&[], &[]);
    let drop = b.func(drop_ty, &[], &[I::DataDrop(1)]);

    b.export("load", load)
        .export("load8", load8)
        .export("store", store)
        .export("store64", store64)
        .export("grow", grow)
        .export("size", size)
        .export("fill", fill)
        .export("copy", copy)
        .export("init", init)
        .export("drop", drop);
    b.data(16, b"wari").passive_data(b"passive!");
    b.finish()
}

#[test]
fn loads_and_stores() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), memory_module(None));
        call(&mut store, &instance, "store", &[Value::I32(8), Value::I32(0x1234_5678)]).unwrap();
        assert_eq!(call(&mut store, &instance, "load", &[Value::I32(8)]).unwrap(), vec![Value::I32(0x1234_5678)]);
        // load8_s at 4 + 4 reads the low byte, sign-extended.
        call(&mut store, &instance, "store", &[Value::I32(8), Value::I32(0xff)]).unwrap();
        assert_eq!(call(&mut store, &instance, "load8", &[Value::I32(4)]).unwrap(), vec![Value::I32(-1)]);

        let memory = instance.export_memory(&store, "memory").unwrap();
        let mut buf = [0u8; 4];
        memory.read(&store, 16, &mut buf).unwrap();
        assert_eq!(&buf, b"wari");
        memory.write(&mut store, 100, &7i32.to_le_bytes()).unwrap();
        assert_eq!(call(&mut store, &instance, "load", &[Value::I32(100)]).unwrap(), vec![Value::I32(7)]);
    }
}

#[test]
fn out_of_bounds_store_writes_nothing() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), memory_module(None));
        let memory = instance.export_memory(&store, "memory").unwrap();
        let edge = PAGE_SIZE as u64 - 4;
        memory.write(&mut store, edge, &[0xaa; 4]).unwrap();

        let r = call(&mut store, &instance, "store64", &[Value::I32(edge as i32), Value::I64(0)]);
        assert_eq!(trap_reason(r), TrapReason::MemoryOutOfBounds);
        let mut tail = [0u8; 4];
        memory.read(&store, edge, &mut tail).unwrap();
        assert_eq!(tail, [0xaa; 4]);

        let r = call(&mut store, &instance, "load", &[Value::I32(-1)]);
        assert_eq!(trap_reason(r), TrapReason::MemoryOutOfBounds);
    }
}

#[test]
fn grow_and_size() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), memory_module(Some(3)));
        assert_eq!(call(&mut store, &instance, "grow", &[Value::I32(1)]).unwrap(), vec![Value::I32(1)]);
        assert_eq!(call(&mut store, &instance, "size", &[]).unwrap(), vec![Value::I32(2)]);
        assert_eq!(call(&mut store, &instance, "grow", &[Value::I32(2)]).unwrap(), vec![Value::I32(-1)]);
        assert_eq!(call(&mut store, &instance, "grow", &[Value::I32(0)]).unwrap(), vec![Value::I32(2)]);
        // The new page is addressable and zeroed.
        let last = (3 * PAGE_SIZE - 4) as i32;
        assert_eq!(trap_reason(call(&mut store, &instance, "load", &[Value::I32(last)])), TrapReason::MemoryOutOfBounds);
        let in_new_page = (2 * PAGE_SIZE - 4) as i32;
        assert_eq!(call(&mut store, &instance, "load", &[Value::I32(in_new_page)]).unwrap(), vec![Value::I32(0)]);
    }
}

#[test]
fn bulk_fill_copy_init_and_drop() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), memory_module(None));
        let memory = instance.export_memory(&store, "memory").unwrap();
        let read = |store: &Store, at: u64, len: usize| {
            let mut buf = vec![0u8; len];
            memory.read(store, at, &mut buf).unwrap();
            buf
        };

        call(&mut store, &instance, "fill", &[Value::I32(200), Value::I32(0x5a), Value::I32(3)]).unwrap();
        assert_eq!(read(&store, 199, 5), vec![0, 0x5a, 0x5a, 0x5a, 0]);

        // Overlapping copy behaves like memmove.
        call(&mut store, &instance, "copy", &[Value::I32(18), Value::I32(16), Value::I32(4)]).unwrap();
        assert_eq!(read(&store, 16, 6), b"wawari".to_vec());

        call(&mut store, &instance, "init", &[Value::I32(300), Value::I32(0), Value::I32(8)]).unwrap();
        assert_eq!(read(&store, 300, 8), b"passive!".to_vec());
        let r = call(&mut store, &instance, "init", &[Value::I32(300), Value::I32(4), Value::I32(5)]);
        assert_eq!(trap_reason(r), TrapReason::MemoryOutOfBounds);

        call(&mut store, &instance, "drop", &[]).unwrap();
        let r = call(&mut store, &instance, "init", &[Value::I32(300), Value::I32(0), Value::I32(1)]);
        assert_eq!(trap_reason(r), TrapReason::MemoryOutOfBounds);
        // A zero-length init of a dropped segment is allowed.
        call(&mut store, &instance, "init", &[Value::I32(300), Value::I32(0), Value::I32(0)]).unwrap();

        let r = call(&mut store, &instance, "fill", &[Value::I32(PAGE_SIZE as i32 - 1), Value::I32(1), Value::I32(2)]);
        assert_eq!(trap_reason(r), TrapReason::MemoryOutOfBounds);
        assert_eq!(read(&store, PAGE_SIZE as u64 - 1, 1), vec![0]);
    }
}

#[test]
fn active_segment_out_of_range_fails_instantiation() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None, false).data(PAGE_SIZE as i32 - 2, b"wari");
    let mut store = Store::new(&engine(wari::ThreadingModel::Token));
    let err = Instance::instantiate(&mut store, common::parse(b.finish()), &wari::Imports::new()).unwrap_err();
    assert!(matches!(err.as_trap().map(|t| t.reason()), Some(TrapReason::MemoryOutOfBounds)));
}

struct PageBudget {
    max_bytes: usize,
    asked: Arc<AtomicUsize>,
}

impl ResourceLimiter for PageBudget {
    fn limit_memory_growth(&mut self, desired: usize) -> Result<bool, Trap> {
        self.asked.fetch_add(1, Ordering::SeqCst);
        Ok(desired <= self.max_bytes)
    }
}

struct Refuse;

impl ResourceLimiter for Refuse {
    fn limit_memory_growth(&mut self, desired: usize) -> Result<bool, Trap> {
        Err(Trap::message(format!("refusing {desired} bytes")))
    }
}

#[test]
fn limiter_can_deny_growth() {
    for model in MODELS {
        let asked = Arc::new(AtomicUsize::new(0));
        let mut store = Store::new(&engine(model));
        store.set_limiter(PageBudget { max_bytes: 2 * PAGE_SIZE, asked: asked.clone() });
        let instance = Instance::instantiate(&mut store, common::parse(memory_module(None)), &wari::Imports::new()).unwrap();
        let after_instantiation = asked.load(Ordering::SeqCst);

        assert_eq!(call(&mut store, &instance, "grow", &[Value::I32(1)]).unwrap(), vec![Value::I32(1)]);
        assert_eq!(call(&mut store, &instance, "grow", &[Value::I32(1)]).unwrap(), vec![Value::I32(-1)]);
        assert_eq!(asked.load(Ordering::SeqCst), after_instantiation + 2);
        assert_eq!(call(&mut store, &instance, "size", &[]).unwrap(), vec![Value::I32(2)]);
    }
}

#[test]
fn limiter_error_becomes_a_trap() {
    let (mut store, instance) = instantiate(&engine(wari::ThreadingModel::Token), memory_module(None));
    store.set_limiter(Refuse);
    let r = call(&mut store, &instance, "grow", &[Value::I32(1)]);
    assert_eq!(trap_reason(r), TrapReason::Message(format!("refusing {} bytes", 2 * PAGE_SIZE)));
}

#[test]
fn dispatch_models_leave_identical_memory() {
    let mut b = ModuleBuilder::new();
    b.memory(1, None, false).export_memory("memory");
    let ty = b.ty(&[ValType::I32], &[]);
    // Writes i * i at 4 * i for i in 0..n.
    let squares = b.func(
        ty,
        &[ValType::I32],
        &[
            I::Block(wasm_encoder::BlockType::Empty),
            I::Loop(wasm_encoder::BlockType::Empty),
            I::LocalGet(1),
            I::LocalGet(0),
            I::I32GeU,
            I::BrIf(1),
            I::LocalGet(1),
            I::I32Const(2),
            I::I32Shl,
            I::LocalGet(1),
            I::LocalGet(1),
            I::I32Mul,
            I::I32Store(mem(0, 2)),
            I::LocalGet(1),
            I::I32Const(1),
            I::I32Add,
            I::LocalSet(1),
            I::Br(0),
            I::End,
            I::End,
        ],
    );
    b.export("squares", squares);
    let bytes = b.finish();

    let snapshots: Vec<Vec<u8>> = MODELS
        .iter()
        .map(|&model| {
            let (mut store, instance) = instantiate(&engine(model), bytes.clone());
            call(&mut store, &instance, "squares", &[Value::I32(1000)]).unwrap();
            let memory = instance.export_memory(&store, "memory").unwrap();
            let mut snapshot = vec![0u8; 4000];
            memory.read(&store, 0, &mut snapshot).unwrap();
            snapshot
        })
        .collect();
    assert_eq!(snapshots[0], snapshots[1]);
    assert_eq!(&snapshots[0][4 * 999..4 * 1000], &(999i32 * 999).to_le_bytes());
}
