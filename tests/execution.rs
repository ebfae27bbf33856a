mod common;

use common::{config, engine, instantiate, instantiate_with, ModuleBuilder, MODELS};
use wari::{Engine, Error, Func, FuncType, Imports, Trap, TrapReason, Value};
use wasm_encoder::{BlockType, Instruction as I, ValType};

fn fib_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let fib = b.func(
        ty,
        &[],
        &[
            I::LocalGet(0),
            I::I32Const(2),
            I::I32LtS,
            I::If(BlockType::Result(ValType::I32)),
            I::LocalGet(0),
            I::Else,
            I::LocalGet(0),
            I::I32Const(1),
            I::I32Sub,
            I::Call(0),
            I::LocalGet(0),
            I::I32Const(2),
            I::I32Sub,
            I::Call(0),
            I::I32Add,
            I::End,
        ],
    );
    b.export("fib", fib).name(fib, "fib");
    b.finish()
}

fn call(store: &mut wari::Store, instance: &wari::Instance, name: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
    instance.export_func(store, name).unwrap().call(store, args)
}

fn trap_reason(result: Result<Vec<Value>, Error>) -> TrapReason {
    match result {
        Err(Error::Trap(trap)) => trap.reason().clone(),
        other => panic!("expected a trap, got {other:?}"),
    }
}

#[test]
fn recursive_fibonacci() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), fib_module());
        assert_eq!(call(&mut store, &instance, "fib", &[Value::I32(20)]).unwrap(), vec![Value::I32(6765)]);
    }
}

#[test]
fn loop_with_conditional_branch() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    // Sums 1..=n with the accumulator in local 1.
    let sum = b.func(
        ty,
        &[ValType::I32],
        &[
            I::Loop(BlockType::Empty),
            I::LocalGet(1),
            I::LocalGet(0),
            I::I32Add,
            I::LocalSet(1),
            I::LocalGet(0),
            I::I32Const(1),
            I::I32Sub,
            I::LocalTee(0),
            I::BrIf(0),
            I::End,
            I::LocalGet(1),
        ],
    );
    b.export("sum", sum);
    let bytes = b.finish();
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        assert_eq!(call(&mut store, &instance, "sum", &[Value::I32(100)]).unwrap(), vec![Value::I32(5050)]);
    }
}

#[test]
fn br_table_selects_target_and_clamps_default() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let switch = b.func(
        ty,
        &[],
        &[
            I::Block(BlockType::Empty),
            I::Block(BlockType::Empty),
            I::Block(BlockType::Empty),
            I::LocalGet(0),
            I::BrTable((&[0u32, 1][..]).into(), 2),
            I::End,
            I::I32Const(10),
            I::Return,
            I::End,
            I::I32Const(20),
            I::Return,
            I::End,
            I::I32Const(30),
        ],
    );
    b.export("switch", switch);
    let bytes = b.finish();
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        for (input, expected) in [(0, 10), (1, 20), (2, 30), (99, 30), (-1, 30)] {
            let results = call(&mut store, &instance, "switch", &[Value::I32(input)]).unwrap();
            assert_eq!(results, vec![Value::I32(expected)], "{model:?} input {input}");
        }
    }
}

#[test]
fn branch_carries_values_out_of_block() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let f = b.func(
        ty,
        &[],
        &[
            I::Block(BlockType::Result(ValType::I32)),
            I::I32Const(7),
            I::LocalGet(0),
            I::BrIf(0),
            I::Drop,
            I::I32Const(9),
            I::End,
        ],
    );
    b.export("pick", f);
    let bytes = b.finish();
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        assert_eq!(call(&mut store, &instance, "pick", &[Value::I32(1)]).unwrap(), vec![Value::I32(7)]);
        assert_eq!(call(&mut store, &instance, "pick", &[Value::I32(0)]).unwrap(), vec![Value::I32(9)]);
    }
}

#[test]
fn multi_value_calls() {
    let mut b = ModuleBuilder::new();
    let swap_ty = b.ty(&[ValType::I32, ValType::I32], &[ValType::I32, ValType::I32]);
    let swap = b.func(swap_ty, &[], &[I::LocalGet(1), I::LocalGet(0)]);
    let diff_ty = b.ty(&[ValType::I32, ValType::I32], &[ValType::I32]);
    let diff = b.func(diff_ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::Call(swap), I::I32Sub]);
    b.export("swap", swap).export("diff", diff);
    let bytes = b.finish();
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        let swapped = call(&mut store, &instance, "swap", &[Value::I32(1), Value::I32(2)]).unwrap();
        assert_eq!(swapped, vec![Value::I32(2), Value::I32(1)]);
        let diff = call(&mut store, &instance, "diff", &[Value::I32(10), Value::I32(3)]).unwrap();
        assert_eq!(diff, vec![Value::I32(3 - 10)]);
    }
}

#[test]
fn select_and_i64_arithmetic() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I64, ValType::I64, ValType::I32], &[ValType::I64]);
    let f = b.func(
        ty,
        &[],
        &[I::LocalGet(0), I::LocalGet(1), I::I64Mul, I::LocalGet(1), I::LocalGet(2), I::Select],
    );
    b.export("f", f);
    let bytes = b.finish();
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        let args = [Value::I64(1 << 40), Value::I64(3), Value::I32(1)];
        assert_eq!(call(&mut store, &instance, "f", &args).unwrap(), vec![Value::I64(3 << 40)]);
        let args = [Value::I64(1 << 40), Value::I64(3), Value::I32(0)];
        assert_eq!(call(&mut store, &instance, "f", &args).unwrap(), vec![Value::I64(3)]);
    }
}

#[test]
fn integer_traps() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32, ValType::I32], &[ValType::I32]);
    let div = b.func(ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32DivS]);
    let rem = b.func(ty, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32RemS]);
    let nan_ty = b.ty(&[], &[ValType::I32]);
    let nan = b.func(
        nan_ty,
        &[],
        &[I::I32Const(0), I::F64ConvertI32S, I::I32Const(0), I::F64ConvertI32S, I::F64Div, I::I32TruncF64S],
    );
    let sat = b.func(
        nan_ty,
        &[],
        &[I::I32Const(0), I::F64ConvertI32S, I::I32Const(0), I::F64ConvertI32S, I::F64Div, I::I32TruncSatF64S],
    );
    b.export("div", div).export("rem", rem).export("nan", nan).export("sat", sat);
    let bytes = b.finish();

    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        let r = call(&mut store, &instance, "div", &[Value::I32(1), Value::I32(0)]);
        assert_eq!(trap_reason(r), TrapReason::IntegerDividedByZero);
        let r = call(&mut store, &instance, "div", &[Value::I32(i32::MIN), Value::I32(-1)]);
        assert_eq!(trap_reason(r), TrapReason::IntegerOverflow);
        let r = call(&mut store, &instance, "rem", &[Value::I32(i32::MIN), Value::I32(-1)]);
        assert_eq!(r.unwrap(), vec![Value::I32(0)]);
        assert_eq!(trap_reason(call(&mut store, &instance, "nan", &[])), TrapReason::InvalidConversionToInteger);
        assert_eq!(call(&mut store, &instance, "sat", &[]).unwrap(), vec![Value::I32(0)]);
        // The store stays usable after a trap.
        let ok = call(&mut store, &instance, "div", &[Value::I32(9), Value::I32(3)]).unwrap();
        assert_eq!(ok, vec![Value::I32(3)]);
    }
}

#[test]
fn unbounded_recursion_exhausts_the_stack() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let f = b.func(ty, &[], &[I::LocalGet(0), I::I32Const(1), I::I32Add, I::Call(0)]);
    b.export("down", f);
    let bytes = b.finish();
    for model in MODELS {
        let engine = Engine::new(config(model).stack_size(64 * 1024));
        let (mut store, instance) = instantiate(&engine, bytes.clone());
        let r = call(&mut store, &instance, "down", &[Value::I32(0)]);
        assert_eq!(trap_reason(r), TrapReason::CallStackExhausted);
    }
}

fn indirect_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let binary = b.ty(&[ValType::I32, ValType::I32], &[ValType::I32]);
    let unary = b.ty(&[ValType::I32], &[ValType::I32]);
    let add = b.func(binary, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32Add]);
    let sub = b.func(binary, &[], &[I::LocalGet(0), I::LocalGet(1), I::I32Sub]);
    let neg = b.func(unary, &[], &[I::I32Const(0), I::LocalGet(0), I::I32Sub]);
    let dispatch_ty = b.ty(&[ValType::I32, ValType::I32, ValType::I32], &[ValType::I32]);
    let dispatch = b.func(
        dispatch_ty,
        &[],
        &[I::LocalGet(1), I::LocalGet(2), I::LocalGet(0), I::CallIndirect { type_index: binary, table_index: 0 }],
    );
    // Tail-calls through the table with the argument order reversed.
    let tail = b.func(
        dispatch_ty,
        &[],
        &[I::LocalGet(2), I::LocalGet(1), I::LocalGet(0), I::ReturnCallIndirect { type_index: binary, table_index: 0 }],
    );
    b.table(4, None).elements(0, &[add, sub, neg]);
    b.export("dispatch", dispatch).export("tail", tail);
    b.finish()
}

#[test]
fn call_indirect_dispatches_and_traps() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), indirect_module());
        let args = |i| [Value::I32(i), Value::I32(10), Value::I32(4)];
        assert_eq!(call(&mut store, &instance, "dispatch", &args(0)).unwrap(), vec![Value::I32(14)]);
        assert_eq!(call(&mut store, &instance, "dispatch", &args(1)).unwrap(), vec![Value::I32(6)]);
        assert_eq!(call(&mut store, &instance, "tail", &args(1)).unwrap(), vec![Value::I32(-6)]);

        match trap_reason(call(&mut store, &instance, "dispatch", &args(2))) {
            TrapReason::TypeMismatchCall { expected, actual } => {
                assert_eq!(expected.params.len(), 2);
                assert_eq!(actual.params.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(trap_reason(call(&mut store, &instance, "dispatch", &args(3))), TrapReason::IndirectCallToNull(3));
        assert_eq!(trap_reason(call(&mut store, &instance, "tail", &args(3))), TrapReason::IndirectCallToNull(3));
        assert_eq!(trap_reason(call(&mut store, &instance, "dispatch", &args(4))), TrapReason::TableOutOfBounds(4));
    }
}

#[test]
fn tail_calls_run_in_constant_stack() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I64, ValType::I64], &[ValType::I64]);
    // count(n, acc) = n == 0 ? acc : count(n - 1, acc + n)
    let count = b.func(
        ty,
        &[],
        &[
            I::LocalGet(0),
            I::I64Eqz,
            I::If(BlockType::Empty),
            I::LocalGet(1),
            I::Return,
            I::End,
            I::LocalGet(0),
            I::I64Const(1),
            I::I64Sub,
            I::LocalGet(1),
            I::LocalGet(0),
            I::I64Add,
            I::ReturnCall(0),
        ],
    );
    b.export("count", count);
    let bytes = b.finish();
    for model in MODELS {
        let engine = Engine::new(config(model).stack_size(16 * 1024));
        let (mut store, instance) = instantiate(&engine, bytes.clone());
        let n = 200_000i64;
        let results = call(&mut store, &instance, "count", &[Value::I64(n), Value::I64(0)]).unwrap();
        assert_eq!(results, vec![Value::I64(n * (n + 1) / 2)]);
    }
}

#[test]
fn tail_call_into_smaller_frame() {
    let mut b = ModuleBuilder::new();
    let one = b.ty(&[ValType::I32], &[ValType::I32]);
    let many = b.ty(&[ValType::I32, ValType::I32, ValType::I32, ValType::I32], &[ValType::I32]);
    let double = b.func(one, &[], &[I::LocalGet(0), I::LocalGet(0), I::I32Add]);
    let wide = b.func(
        many,
        &[ValType::I32],
        &[
            I::LocalGet(0),
            I::LocalGet(1),
            I::I32Add,
            I::LocalGet(2),
            I::I32Add,
            I::LocalGet(3),
            I::I32Add,
            I::ReturnCall(double),
        ],
    );
    let outer = b.func(
        one,
        &[],
        &[I::LocalGet(0), I::I32Const(1), I::I32Const(2), I::I32Const(3), I::Call(wide), I::I32Const(1), I::I32Add],
    );
    b.export("outer", outer);
    let bytes = b.finish();
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        let results = call(&mut store, &instance, "outer", &[Value::I32(4)]).unwrap();
        assert_eq!(results, vec![Value::I32((4 + 1 + 2 + 3) * 2 + 1)]);
    }
}

#[test]
fn host_functions_are_called_with_arguments() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let double = b.import_func("env", "double", ty);
    let fail_ty = b.ty(&[], &[]);
    let fail = b.import_func("env", "fail", fail_ty);
    let quad = b.func(ty, &[], &[I::LocalGet(0), I::Call(double), I::Call(double)]);
    let calls_fail = b.func(fail_ty, &[], &[I::Call(fail)]);
    b.export("quad", quad).export("fail", calls_fail).name(calls_fail, "calls_fail");
    let bytes = b.finish();

    for model in MODELS {
        let engine = engine(model);
        let mut store = wari::Store::new(&engine);
        let double = Func::wrap(&mut store, FuncType::new([wari::ValType::I32], [wari::ValType::I32]), |_, args| {
            Ok(vec![Value::I32(args[0].i32().unwrap_or_default() * 2)])
        });
        let fail = Func::wrap(&mut store, FuncType::new([], []), |_, _| Err(Trap::message("host refused")));
        let mut imports = Imports::new();
        imports.define("env", "double", double).unwrap().define("env", "fail", fail).unwrap();
        let instance = wari::Instance::instantiate(&mut store, common::parse(bytes.clone()), &imports).unwrap();

        assert_eq!(call(&mut store, &instance, "quad", &[Value::I32(5)]).unwrap(), vec![Value::I32(20)]);
        let err = call(&mut store, &instance, "fail", &[]).unwrap_err();
        let trap = err.as_trap().unwrap();
        assert_eq!(trap.to_string(), "host refused");
        assert_eq!(trap.backtrace().unwrap().frames[0].function.as_deref(), Some("calls_fail"));
    }
}

#[test]
fn host_results_are_type_checked() {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[], &[ValType::I32]);
    let bad = b.import_func("env", "bad", ty);
    let f = b.func(ty, &[], &[I::Call(bad)]);
    b.export("f", f);
    let bytes = b.finish();

    let engine = engine(wari::ThreadingModel::Token);
    let mut store = wari::Store::new(&engine);
    let host = Func::wrap(&mut store, FuncType::new([], [wari::ValType::I32]), |_, _| Ok(vec![Value::I64(1)]));
    let mut imports = Imports::new();
    imports.define("env", "bad", host).unwrap();
    let instance = wari::Instance::instantiate(&mut store, common::parse(bytes), &imports).unwrap();
    assert!(matches!(trap_reason(call(&mut store, &instance, "f", &[])), TrapReason::Message(_)));
}

#[test]
fn arguments_are_checked_before_running() {
    let (mut store, instance) = instantiate(&engine(wari::ThreadingModel::Token), fib_module());
    assert!(call(&mut store, &instance, "fib", &[]).is_err());
    assert!(call(&mut store, &instance, "fib", &[Value::I64(1)]).is_err());
}

#[test]
fn globals_keep_state_between_calls() {
    let mut b = ModuleBuilder::new();
    b.global_i32(true, 100);
    let ty = b.ty(&[], &[ValType::I32]);
    let bump = b.func(
        ty,
        &[],
        &[I::GlobalGet(0), I::I32Const(1), I::I32Add, I::GlobalSet(0), I::GlobalGet(0)],
    );
    b.export("bump", bump);
    let bytes = b.finish();
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), bytes.clone());
        call(&mut store, &instance, "bump", &[]).unwrap();
        assert_eq!(call(&mut store, &instance, "bump", &[]).unwrap(), vec![Value::I32(102)]);
    }
}

#[test]
fn start_function_runs_during_instantiation() {
    let mut b = ModuleBuilder::new();
    b.global_i32(true, 0);
    let init_ty = b.ty(&[], &[]);
    let init = b.func(init_ty, &[], &[I::I32Const(42), I::GlobalSet(0)]);
    let get_ty = b.ty(&[], &[ValType::I32]);
    let get = b.func(get_ty, &[], &[I::GlobalGet(0)]);
    b.start(init).export("get", get);
    let (mut store, instance) = instantiate_with(&engine(wari::ThreadingModel::Direct), b.finish(), &Imports::new());
    assert_eq!(call(&mut store, &instance, "get", &[]).unwrap(), vec![Value::I32(42)]);
}
