mod common;

use common::{engine, instantiate, ModuleBuilder, MODELS};
use wari::{TrapReason, Value};
use wasm_encoder::{BlockType, Instruction as I, ValType};

#[test]
fn add_returns_sum() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32, ValType::I32], &[ValType::I32]);
    let add = b.func(ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32Add]);
    b.export("add", add);
    let bytes = b.finish();

    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        let add = instance.export_func(&store, "add").unwrap();
        let results = add.call(&mut store, &[Value::I32(3), Value::I32(4)]).unwrap();
        assert_eq!(results, vec![Value::I32(7)], "{model:?}");
    }
}

#[test]
fn local_set_does_not_disturb_pending_reads() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    // local.get 0 stays on the stack across a block that overwrites local 0.
    let across_block = b.func(
        ty,
        &[],
        &[
            I::LocalGet(0),
            I::Block(BlockType::Result(ValType::I32)),
            I::I32Const(5),
            I::LocalSet(0),
            I::LocalGet(0),
            I::End,
            I::I32Add,
        ],
    );
    let with_tee = b.func(
        ty,
        &[],
        &[I::LocalGet(0), I::I32Const(10), I::LocalTee(0), I::LocalGet(0), I::I32Mul, I::I32Sub],
    );
    b.export("across_block", across_block);
    b.export("with_tee", with_tee);
    let bytes = b.finish();

    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        let f = instance.export_func(&store, "across_block").unwrap();
        assert_eq!(f.call(&mut store, &[Value::I32(3)]).unwrap(), vec![Value::I32(8)]);
        let f = instance.export_func(&store, "with_tee").unwrap();
        assert_eq!(f.call(&mut store, &[Value::I32(3)]).unwrap(), vec![Value::I32(3 - 100)]);
    }
}

#[test]
fn unreachable_traps_with_backtrace() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], &[]);
    let boom = b.func(ty, &[], &[I::Unreachable]);
    let outer = b.func(ty, &[], &[I::Call(boom)]);
    b.export("boom", boom).export("outer", outer);
    b.name(boom, "boom").name(outer, "outer");
    let bytes = b.finish();

    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());

        let err = instance.export_func(&store, "boom").unwrap().call(&mut store, &[]).unwrap_err();
        let trap = err.as_trap().expect("trap");
        assert_eq!(trap.reason(), &TrapReason::Unreachable);
        assert_eq!(trap.to_string(), "unreachable");
        let frames = &trap.backtrace().expect("backtrace").frames;
        assert_eq!(frames[0].function.as_deref(), Some("boom"));

        let err = instance.export_func(&store, "outer").unwrap().call(&mut store, &[]).unwrap_err();
        let frames = &err.as_trap().unwrap().backtrace().unwrap().frames;
        let names: Vec<_> = frames.iter().map(|f| f.function.as_deref()).collect();
        assert_eq!(names, vec![Some("boom"), Some("outer")]);
        assert_eq!(frames[1].func_index, Some(outer));
    }
}

#[test]
fn table_grow_past_maximum_returns_minus_one() {
    let mut b = ModuleBuilder::new();
    b.table(1, Some(2));
    let ty = b.ty(&[ValType::FUNCREF, ValType::I32], &[ValType::I32]);
    let grow = b.func(ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::TableGrow(0)]);
    let size_ty = b.ty(&[], &[ValType::I32]);
    let size = b.func(size_ty, &[], &[I::TableSize(0)]);
    b.export("grow", grow).export("size", size);
    let bytes = b.finish();

    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        let grow = instance.export_func(&store, "grow").unwrap();
        let size = instance.export_func(&store, "size").unwrap();

        let past_max = grow.call(&mut store, &[Value::FuncRef(None), Value::I32(5)]).unwrap();
        assert_eq!(past_max, vec![Value::I32(-1)]);
        assert_eq!(size.call(&mut store, &[]).unwrap(), vec![Value::I32(1)]);

        let grown = grow.call(&mut store, &[Value::FuncRef(None), Value::I32(1)]).unwrap();
        assert_eq!(grown, vec![Value::I32(1)]);
        let again = grow.call(&mut store, &[Value::FuncRef(None), Value::I32(1)]).unwrap();
        assert_eq!(again, vec![Value::I32(-1)]);
        assert_eq!(size.call(&mut store, &[]).unwrap(), vec![Value::I32(2)]);
    }
}
