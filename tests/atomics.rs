mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{engine, instantiate, mem, ModuleBuilder, MODELS};
use wari::{
    Engine, Error, Imports, Instance, Limits, Memory, MemoryType, ParkingKey, Store, ThreadingModel, TrapReason, Value,
};
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

/// Atomic helpers over memory 0, which is either defined here or imported as `env.memory`.
fn atomics_module(shared: bool, imported: bool) -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let wait_ty = b.ty(&[ValType::I32, ValType::I32, ValType::I64], &[ValType::I32]);
    let notify_ty = b.ty(&[ValType::I32, ValType::I32], &[ValType::I32]);
    let rmw_ty = b.ty(&[ValType::I32, ValType::I32], &[ValType::I32]);
    let cmpxchg_ty = b.ty(&[ValType::I32, ValType::I32, ValType::I32], &[ValType::I32]);
    let load_ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let store_ty = b.ty(&[ValType::I32, ValType::I32], &[]);
    if imported {
        b.import_memory("env", "memory", 1, Some(1), shared);
    } else {
        b.memory(1, Some(1), shared);
    }

    let wait = b.func(
        wait_ty,
        &[],
        &[I::LocalGet(0), I::LocalGet(1), I::LocalGet(2), I::MemoryAtomicWait32(mem(0, 2))],
    );
    let notify = b.func(notify_ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::MemoryAtomicNotify(mem(0, 2))]);
    let add = b.func(rmw_ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32AtomicRmwAdd(mem(0, 2))]);
    let xchg8 = b.func(rmw_ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32AtomicRmw8XchgU(mem(0, 0))]);
    let cmpxchg = b.func(
        cmpxchg_ty,
        &[],
        &[I::LocalGet(0), I::LocalGet(1), I::LocalGet(2), I::I32AtomicRmwCmpxchg(mem(0, 2))],
    );
    let load = b.func(load_ty, &[], &[I::AtomicFence, I::LocalGet(0), I::I32AtomicLoad(mem(0, 2))]);
    let store = b.func(store_ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32AtomicStore(mem(0, 2))]);
    b.export("wait", wait)
        .export("notify", notify)
        .export("add", add)
        .export("xchg8", xchg8)
        .export("cmpxchg", cmpxchg)
        .export("load", load)
        .export("store", store);
    b.finish()
}

#[test]
fn read_modify_write_returns_old_value() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), atomics_module(false, false));
        call(&mut store, &instance, "store", &[Value::I32(8), Value::I32(40)]).unwrap();
        assert_eq!(call(&mut store, &instance, "add", &[Value::I32(8), Value::I32(2)]).unwrap(), vec![Value::I32(40)]);
        assert_eq!(call(&mut store, &instance, "load", &[Value::I32(8)]).unwrap(), vec![Value::I32(42)]);

        let swap = |store: &mut Store, expected, replacement| {
            call(store, &instance, "cmpxchg", &[Value::I32(8), Value::I32(expected), Value::I32(replacement)]).unwrap()
        };
        assert_eq!(swap(&mut store, 0, 7), vec![Value::I32(42)]);
        assert_eq!(call(&mut store, &instance, "load", &[Value::I32(8)]).unwrap(), vec![Value::I32(42)]);
        assert_eq!(swap(&mut store, 42, 7), vec![Value::I32(42)]);
        assert_eq!(call(&mut store, &instance, "load", &[Value::I32(8)]).unwrap(), vec![Value::I32(7)]);

        // The narrow exchange only touches the low byte.
        call(&mut store, &instance, "store", &[Value::I32(12), Value::I32(0x1122_3344)]).unwrap();
        let old = call(&mut store, &instance, "xchg8", &[Value::I32(12), Value::I32(0x1ff)]).unwrap();
        assert_eq!(old, vec![Value::I32(0x44)]);
        assert_eq!(call(&mut store, &instance, "load", &[Value::I32(12)]).unwrap(), vec![Value::I32(0x1122_33ff)]);
    }
}

#[test]
fn misaligned_atomics_trap() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), atomics_module(false, false));
        let r = call(&mut store, &instance, "add", &[Value::I32(2), Value::I32(1)]);
        assert_eq!(trap_reason(r), TrapReason::UnalignedAtomic);
        let r = call(&mut store, &instance, "load", &[Value::I32(65536)]);
        assert_eq!(trap_reason(r), TrapReason::MemoryOutOfBounds);
    }
}

#[test]
fn wait_requires_shared_memory() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), atomics_module(false, false));
        let r = call(&mut store, &instance, "wait", &[Value::I32(0), Value::I32(0), Value::I64(0)]);
        assert_eq!(trap_reason(r), TrapReason::ExpectedSharedMemory);
        // Nobody can be waiting on unshared memory.
        assert_eq!(call(&mut store, &instance, "notify", &[Value::I32(0), Value::I32(1)]).unwrap(), vec![Value::I32(0)]);
    }
}

#[test]
fn wait_mismatch_and_timeout() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), atomics_module(true, false));
        call(&mut store, &instance, "store", &[Value::I32(0), Value::I32(5)]).unwrap();
        let mismatch = call(&mut store, &instance, "wait", &[Value::I32(0), Value::I32(4), Value::I64(-1)]).unwrap();
        assert_eq!(mismatch, vec![Value::I32(1)]);

        let start = Instant::now();
        let timed_out = call(&mut store, &instance, "wait", &[Value::I32(0), Value::I32(5), Value::I64(1_000_000)]).unwrap();
        assert_eq!(timed_out, vec![Value::I32(2)]);
        assert!(start.elapsed() >= Duration::from_millis(1));
        assert_eq!(call(&mut store, &instance, "notify", &[Value::I32(0), Value::I32(1)]).unwrap(), vec![Value::I32(0)]);
    }
}

fn shared_memory_store(engine: &Engine, shared: &Memory, owner: &Store) -> (Store, Instance) {
    let mut store = Store::new(engine);
    let memory = Memory::from_shared(&mut store, shared.shared(owner).unwrap());
    let mut imports = Imports::new();
    imports.define("env", "memory", memory).unwrap();
    let bytes = atomics_module(true, true);
    let instance = Instance::instantiate(&mut store, common::parse(bytes), &imports).unwrap();
    (store, instance)
}

#[test]
fn notify_wakes_a_waiter_in_another_store() {
    for model in MODELS {
        let engine = engine(model);
        let mut owner = Store::new(&engine);
        let memory = Memory::new(&mut owner, MemoryType { limits: Limits { min: 1, max: Some(1) }, shared: true }).unwrap();

        let waiter = {
            let (mut store, instance) = shared_memory_store(&engine, &memory, &owner);
            thread::spawn(move || call(&mut store, &instance, "wait", &[Value::I32(64), Value::I32(0), Value::I64(10_000_000_000)]))
        };

        let (mut store, instance) = shared_memory_store(&engine, &memory, &owner);
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut woken = 0;
        while woken == 0 && Instant::now() < deadline {
            let r = call(&mut store, &instance, "notify", &[Value::I32(64), Value::I32(1)]).unwrap();
            woken = r[0].i32().unwrap();
            if woken == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(woken, 1, "{model:?}");
        assert_eq!(waiter.join().unwrap().unwrap(), vec![Value::I32(0)]);
    }
}

/// Picks a wait address on one memory whose flat `memory + address` sum equals the other
/// memory at address 0, when the two allocations are close enough for that to exist.
fn aliasing_address(waited: &ParkingKey, other: &ParkingKey) -> Option<u64> {
    let delta = other.memory.checked_sub(waited.memory)? as u64;
    (delta % 4 == 0 && delta + 4 <= 65536).then_some(delta)
}

#[test]
fn notify_only_wakes_waiters_on_the_same_location() {
    for model in MODELS {
        let engine = engine(model);
        let mut owner = Store::new(&engine);
        let ty = MemoryType { limits: Limits { min: 1, max: Some(1) }, shared: true };
        let a = Memory::new(&mut owner, ty).unwrap();
        let b = Memory::new(&mut owner, ty).unwrap();
        let (shared_a, shared_b) = (a.shared(&owner).unwrap(), b.shared(&owner).unwrap());

        let (mut waited, mut other) = ((a, &shared_a), (b, &shared_b));
        if ParkingKey::new(&shared_a, 0).memory > ParkingKey::new(&shared_b, 0).memory {
            std::mem::swap(&mut waited, &mut other);
        }
        let address = aliasing_address(&ParkingKey::new(waited.1, 0), &ParkingKey::new(other.1, 0)).unwrap_or(64);
        let key = ParkingKey::new(waited.1, address);

        let waiter = {
            let (mut store, instance) = shared_memory_store(&engine, &waited.0, &owner);
            let args = [Value::I32(address as i32), Value::I32(0), Value::I64(10_000_000_000)];
            thread::spawn(move || call(&mut store, &instance, "wait", &args))
        };
        let deadline = Instant::now() + Duration::from_secs(10);
        while engine.parking_lot().waiter_count(key) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(engine.parking_lot().waiter_count(key), 1, "{model:?}");

        let (mut store_other, other_instance) = shared_memory_store(&engine, &other.0, &owner);
        for at in [0, address] {
            let r = call(&mut store_other, &other_instance, "notify", &[Value::I32(at as i32), Value::I32(1)]).unwrap();
            assert_eq!(r, vec![Value::I32(0)], "{model:?}: other memory at {at}");
        }
        let (mut store, instance) = shared_memory_store(&engine, &waited.0, &owner);
        let next = Value::I32(address as i32 + 4);
        assert_eq!(call(&mut store, &instance, "notify", &[next, Value::I32(1)]).unwrap(), vec![Value::I32(0)]);
        assert_eq!(engine.parking_lot().waiter_count(key), 1);

        let r = call(&mut store, &instance, "notify", &[Value::I32(address as i32), Value::I32(1)]).unwrap();
        assert_eq!(r, vec![Value::I32(1)], "{model:?}");
        assert_eq!(waiter.join().unwrap().unwrap(), vec![Value::I32(0)]);
    }
}

#[test]
fn rmw_is_visible_across_stores() {
    let engine = engine(ThreadingModel::Direct);
    let mut owner = Store::new(&engine);
    let memory = Memory::new(&mut owner, MemoryType { limits: Limits { min: 1, max: Some(1) }, shared: true }).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let (mut store, instance) = shared_memory_store(&engine, &memory, &owner);
            thread::spawn(move || {
                for _ in 0..1000 {
                    call(&mut store, &instance, "add", &[Value::I32(128), Value::I32(1)]).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    let mut counter = [0u8; 4];
    memory.read(&owner, 128, &mut counter).unwrap();
    assert_eq!(i32::from_le_bytes(counter), 4000);
}

#[test]
fn shared_flag_must_match_on_import() {
    let engine = engine(ThreadingModel::Token);
    let mut store = Store::new(&engine);
    let unshared = Memory::new(&mut store, MemoryType { limits: Limits { min: 1, max: Some(1) }, shared: false }).unwrap();
    let mut imports = Imports::new();
    imports.define("env", "memory", unshared).unwrap();
    let err = Instance::instantiate(&mut store, common::parse(atomics_module(true, true)), &imports).unwrap_err();
    assert!(matches!(err, Error::Import(_)));
}
