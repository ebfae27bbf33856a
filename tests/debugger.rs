#![cfg(feature = "debugger")]

mod common;

use common::{engine, instantiate, ModuleBuilder, MODELS};
use wari::{DebugOutcome, Debugger, Value};
use wasm_encoder::{BlockType, Instruction as I, ValType};

fn countdown_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let ty = b.ty(&[ValType::I32], &[ValType::I32]);
    let down = b.func(
        ty,
        &[],
        &[
            I::LocalGet(0),
            I::I32Eqz,
            I::If(BlockType::Result(ValType::I32)),
            I::I32Const(100),
            I::Else,
            I::LocalGet(0),
            I::I32Const(1),
            I::I32Sub,
            I::Call(0),
            I::End,
        ],
    );
    b.export("down", down).name(down, "down");
    b.finish()
}

#[test]
fn stops_at_every_entry_until_cleared() {
    for model in MODELS {
        let (mut store, instance) = instantiate(&engine(model), countdown_module());
        let down = instance.export_func(&store, "down").unwrap();
        store.set_breakpoint(down, 0).unwrap();

        let mut debugger = Debugger::new(&mut store, down, &[Value::I32(2)]).unwrap();
        for depth in 1..=3 {
            assert_eq!(debugger.resume().unwrap(), DebugOutcome::Breakpoint { func: down, pc: 0 }, "{model:?}");
            assert_eq!(debugger.position(), Some((Some(down), 0)));
            let frames = debugger.backtrace().unwrap().frames;
            assert_eq!(frames.len(), depth);
            assert!(frames.iter().all(|f| f.function.as_deref() == Some("down")));
        }
        assert_eq!(debugger.resume().unwrap(), DebugOutcome::Returned(vec![Value::I32(100)]));
        assert!(debugger.is_finished());
        assert!(debugger.resume().is_err());

        assert!(store.clear_breakpoint(down, 0));
        assert!(!store.clear_breakpoint(down, 0));
        assert_eq!(down.call(&mut store, &[Value::I32(2)]).unwrap(), vec![Value::I32(100)]);
    }
}

#[test]
fn breakpoint_by_wasm_offset() {
    let (mut store, instance) = instantiate(&engine(wari::ThreadingModel::Token), countdown_module());
    let down = instance.export_func(&store, "down").unwrap();
    let body = instance.module(&store).functions[0].body.clone();

    let pc = store.set_breakpoint_at_wasm_offset(down, body.start as u32).unwrap();
    let iseq = down.instruction_sequence(&mut store).unwrap().unwrap();
    assert!(iseq.instruction_offsets().contains(&pc));

    let mut debugger = Debugger::new(&mut store, down, &[Value::I32(0)]).unwrap();
    assert_eq!(debugger.resume().unwrap(), DebugOutcome::Breakpoint { func: down, pc });
    assert_eq!(debugger.resume().unwrap(), DebugOutcome::Returned(vec![Value::I32(100)]));

    assert!(store.set_breakpoint_at_wasm_offset(down, body.end as u32 + 100).is_err());
}

#[test]
fn rejects_offsets_inside_an_instruction() {
    let (mut store, instance) = instantiate(&engine(wari::ThreadingModel::Direct), countdown_module());
    let down = instance.export_func(&store, "down").unwrap();
    let iseq = down.instruction_sequence(&mut store).unwrap().unwrap();
    let offsets = iseq.instruction_offsets();
    let inside = (0..iseq.code().len()).find(|pc| !offsets.contains(pc)).unwrap();
    assert!(store.set_breakpoint(down, inside).is_err());
    assert!(store.set_breakpoint(down, iseq.code().len() + 1).is_err());
}

#[test]
fn host_entry_returns_immediately() {
    let (mut store, _) = instantiate(&engine(wari::ThreadingModel::Token), countdown_module());
    let ty = wari::FuncType::new([wari::ValType::I32], [wari::ValType::I32]);
    let host = wari::Func::wrap(&mut store, ty, |_, args| Ok(args.to_vec()));
    let mut debugger = Debugger::new(&mut store, host, &[Value::I32(9)]).unwrap();
    assert_eq!(debugger.resume().unwrap(), DebugOutcome::Returned(vec![Value::I32(9)]));
    assert!(store.set_breakpoint(host, 0).is_err());
}
