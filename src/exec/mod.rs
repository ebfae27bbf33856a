//! Execution of translated instruction sequences.
//!
//! All frames of one invocation share a single value stack. A frame is addressed through its
//! base pointer `sp`; see [`crate::layout`] for what lives where. Calls never recurse on the
//! native stack: a call writes the saved slots of the callee's header and switches `code`,
//! `pc` and `sp`, and `Return` reads them back.

mod dispatch;
mod handlers;
mod numeric;

use std::sync::Arc;

use log::debug;

pub(crate) use dispatch::run;
#[cfg(feature = "debugger")]
pub(crate) use dispatch::step;

use crate::alloc::Handle;
use crate::error::{Backtrace, BacktraceFrame, Error, TranslationError, Trap, TrapReason};
use crate::externs::{MemoryHandle, TableHandle};
use crate::func::{Caller, Func, FuncHandle, FunctionKind, HostFn, IseqHandle};
use crate::instance::InstanceHandle;
use crate::isa::{high32, low32, InstructionSequence};
use crate::layout::{FrameHeaderLayout, VReg};
use crate::memory::MemoryEntity;
use crate::store::Store;
use crate::types::{FuncType, ValType};
use crate::value::{UntypedValue, Value};

/// Why the dispatch loop stopped.
#[derive(Debug)]
pub(crate) enum Signal {
    /// The outermost frame returned.
    End,
    Trap(TrapReason),
    /// A breakpoint was hit; `pc` still points at it.
    Breakpoint,
    /// A failure that is not a trap, e.g. a function that fails to translate lazily.
    Fault(Box<Error>),
}

impl From<TrapReason> for Signal {
    fn from(reason: TrapReason) -> Self { Signal::Trap(reason) }
}

impl From<Trap> for Signal {
    fn from(trap: Trap) -> Self { Signal::Trap(trap.reason().clone()) }
}

impl From<Error> for Signal {
    fn from(error: Error) -> Self {
        match error {
            Error::Trap(trap) => trap.into(),
            other => Signal::Fault(Box::new(other)),
        }
    }
}

/// Saved `sp` of the outermost frame.
const ROOT_SP: u64 = u64::MAX;
/// Saved instance slot when the caller is the embedder.
const NO_INSTANCE: u64 = u64::MAX;
/// Stack slots allocated up front; the stack grows on demand up to the configured limit.
const INITIAL_STACK_SLOTS: usize = 4096;

fn encode_instance(instance: Option<InstanceHandle>) -> u64 {
    instance.map_or(NO_INSTANCE, |h| h.index() as u64)
}

fn decode_instance(raw: u64) -> Option<InstanceHandle> {
    (raw != NO_INSTANCE).then(|| Handle::from_index(raw as u32))
}

pub(crate) struct ExecState {
    pub(crate) stack: Vec<UntypedValue>,
    pub(crate) sp: usize,
    pub(crate) pc: usize,
    pub(crate) code: Arc<InstructionSequence>,
    pub(crate) iseq: IseqHandle,
    pub(crate) instance: Option<InstanceHandle>,
    /// Memory 0 of `instance`, cached for loads and stores.
    pub(crate) memory: Option<MemoryHandle>,
    /// Maximum stack length in slots.
    pub(crate) limit: usize,
}

pub(crate) struct Execution<'a> {
    pub(crate) store: &'a mut Store,
    pub(crate) st: ExecState,
    /// The function the embedder invoked.
    pub(crate) root: FuncHandle,
}

pub(crate) enum Entry {
    /// The callee was a host function and has already run.
    Finished(Vec<Value>),
    Ready(ExecState),
}

fn check_values(types: &[ValType], values: &[Value], what: &str) -> Result<(), TrapReason> {
    if types.len() != values.len() {
        return Err(TrapReason::Message(format!("expected {} {what}, got {}", types.len(), values.len())));
    }
    for (ty, value) in types.iter().zip(values) {
        if *ty != value.ty() {
            return Err(TrapReason::Message(format!("{what} type mismatch: expected {ty}, got {}", value.ty())));
        }
    }
    Ok(())
}

/// Builds the outermost frame for `func`, or runs it directly if it is a host function.
pub(crate) fn enter(store: &mut Store, func: FuncHandle, args: &[Value]) -> Result<Entry, Error> {
    let ty = store.func_type(func).clone();
    check_values(&ty.params, args, "arguments")?;

    let (instance, host) = match &store.alloc.functions.get(func).kind {
        FunctionKind::Host(host) => (None, Some(host.clone())),
        FunctionKind::Wasm(wasm) => (Some(wasm.instance), None),
    };
    if let Some(host) = host {
        let results = host(Caller { store: &mut *store, instance: None }, args)?;
        check_values(&ty.results, &results, "results")?;
        return Ok(Entry::Finished(results));
    }

    let Some(iseq) = store.ensure_compiled(func)? else {
        return Err(TranslationError::Other("function has no code".into()).into());
    };
    let code = store.iseq(iseq).clone();
    let header = FrameHeaderLayout::new(&ty).size();
    let sp = header;
    let limit = store.engine.config().stack_slots();
    let end = sp + code.frame_size;
    if end > limit {
        return Err(TrapReason::CallStackExhausted.into());
    }

    let mut stack = vec![UntypedValue::default(); end.max(INITIAL_STACK_SLOTS.min(limit))];
    for (slot, arg) in stack.iter_mut().zip(args) {
        *slot = arg.to_untyped();
    }
    stack[sp - 3] = UntypedValue(NO_INSTANCE);
    stack[sp - 2] = UntypedValue((store.root_iseq().index() as u64) << 32);
    stack[sp - 1] = UntypedValue(ROOT_SP);
    stack[sp..sp + code.frame_init.len()].copy_from_slice(&code.frame_init);

    let memory = instance.and_then(|i| store.alloc.instances.get(i).memories.first().copied());
    if let Some(interceptor) = store.engine.interceptor() {
        interceptor.on_enter_function(Func(func));
    }
    debug!("invoking function {} with {} arguments", func.index(), args.len());
    Ok(Entry::Ready(ExecState { stack, sp, pc: 0, code, iseq, instance, memory, limit }))
}

/// Calls `func` to completion.
pub(crate) fn invoke(store: &mut Store, func: FuncHandle, args: &[Value]) -> Result<Vec<Value>, Error> {
    let st = match enter(store, func, args)? {
        Entry::Finished(results) => return Ok(results),
        Entry::Ready(st) => st,
    };
    let mut ex = Execution { store, st, root: func };
    match run(&mut ex) {
        Ok(()) => Ok(ex.results()),
        Err(Signal::Breakpoint) => Err(ex.trap(TrapReason::Message("breakpoint reached outside a debug session".into()))),
        Err(signal) => Err(ex.into_error(signal)),
    }
}

impl<'a> Execution<'a> {
    /// Immediate word `i` of the current instruction; word 0 is the opcode.
    #[inline(always)]
    pub(crate) fn imm(&self, i: usize) -> u64 {
        self.st.code.code[self.st.pc + i]
    }

    #[inline(always)]
    fn slot(&self, r: VReg) -> usize {
        (self.st.sp as isize + r as isize) as usize
    }

    #[inline(always)]
    pub(crate) fn get(&self, r: VReg) -> UntypedValue {
        self.st.stack[self.slot(r)]
    }

    #[inline(always)]
    pub(crate) fn set(&mut self, r: VReg, value: UntypedValue) {
        let slot = self.slot(r);
        self.st.stack[slot] = value;
    }

    #[inline(always)]
    pub(crate) fn advance(&mut self, words: usize) {
        self.st.pc += words;
    }

    #[inline(always)]
    pub(crate) fn jump(&mut self, offset: i64) {
        self.st.pc = (self.st.pc as i64 + offset) as usize;
    }

    pub(crate) fn memory(&self) -> Result<&MemoryEntity, Signal> {
        match self.st.memory {
            Some(handle) => Ok(self.store.alloc.memories.get(handle)),
            None => Err(TrapReason::Message("instance has no memory".into()).into()),
        }
    }

    pub(crate) fn memory_mut(&mut self) -> Result<&mut MemoryEntity, Signal> {
        match self.st.memory {
            Some(handle) => Ok(self.store.alloc.memories.get_mut(handle)),
            None => Err(TrapReason::Message("instance has no memory".into()).into()),
        }
    }

    fn set_instance(&mut self, instance: Option<InstanceHandle>) {
        if instance != self.st.instance {
            self.st.instance = instance;
            self.st.memory = instance.and_then(|i| self.store.alloc.instances.get(i).memories.first().copied());
        }
    }

    fn compiled(&mut self, func: FuncHandle) -> Result<IseqHandle, Signal> {
        match self.store.ensure_compiled(func)? {
            Some(iseq) => Ok(iseq),
            None => Err(Error::from(TranslationError::Other("function has no code".into())).into()),
        }
    }

    fn host_of(&self, func: FuncHandle) -> Option<Arc<HostFn>> {
        match &self.store.alloc.functions.get(func).kind {
            FunctionKind::Host(host) => Some(host.clone()),
            FunctionKind::Wasm(_) => None,
        }
    }

    fn reserve(&mut self, end: usize) -> Result<(), Signal> {
        if end > self.st.limit {
            return Err(TrapReason::CallStackExhausted.into());
        }
        if end > self.st.stack.len() {
            let len = end.saturating_mul(2).min(self.st.limit).max(end);
            self.st.stack.resize(len, UntypedValue::default());
        }
        Ok(())
    }

    /// Calls `func` with its header ending at `new_sp`; execution continues at `return_pc`.
    pub(crate) fn call(&mut self, func: FuncHandle, new_sp: usize, return_pc: usize) -> Result<(), Signal> {
        if let Some(host) = self.host_of(func) {
            self.call_host(&host, func, new_sp)?;
            self.st.pc = return_pc;
            return Ok(());
        }
        let iseq = self.compiled(func)?;
        let code = self.store.iseq(iseq).clone();
        self.reserve(new_sp + code.frame_size)?;
        self.st.stack[new_sp - 3] = UntypedValue(encode_instance(self.st.instance));
        self.st.stack[new_sp - 2] = UntypedValue((self.st.iseq.index() as u64) << 32 | return_pc as u64);
        self.st.stack[new_sp - 1] = UntypedValue(self.st.sp as u64);
        self.enter_code(func, iseq, code, new_sp);
        Ok(())
    }

    fn call_host(&mut self, host: &Arc<HostFn>, func: FuncHandle, new_sp: usize) -> Result<(), Signal> {
        let ty: FuncType = self.store.func_type(func).clone();
        let base = new_sp - self.store.alloc.functions.get(func).header_size;
        let args: Vec<Value> = ty
            .params
            .iter()
            .enumerate()
            .map(|(i, t)| Value::from_untyped(self.st.stack[base + i], *t))
            .collect();
        let results = host(Caller { store: &mut *self.store, instance: self.st.instance }, &args)?;
        check_values(&ty.results, &results, "results")?;
        for (i, value) in results.iter().enumerate() {
            self.st.stack[base + i] = value.to_untyped();
        }
        Ok(())
    }

    /// Initializes locals and constants of a frame whose saved slots are written.
    fn enter_code(&mut self, func: FuncHandle, iseq: IseqHandle, code: Arc<InstructionSequence>, sp: usize) {
        self.st.stack[sp..sp + code.frame_init.len()].copy_from_slice(&code.frame_init);
        let instance = match &self.store.alloc.functions.get(func).kind {
            FunctionKind::Wasm(wasm) => Some(wasm.instance),
            FunctionKind::Host(_) => None,
        };
        self.set_instance(instance);
        self.st.sp = sp;
        self.st.pc = 0;
        self.st.code = code;
        self.st.iseq = iseq;
        if let Some(interceptor) = self.store.engine.interceptor() {
            interceptor.on_enter_function(Func(func));
        }
    }

    pub(crate) fn return_from_frame(&mut self) -> Result<(), Signal> {
        let sp = self.st.sp;
        let saved_instance = self.st.stack[sp - 3].0;
        let return_pc = self.st.stack[sp - 2].0;
        let saved_sp = self.st.stack[sp - 1].0;
        if let (Some(func), Some(interceptor)) = (self.st.code.function, self.store.engine.interceptor()) {
            interceptor.on_exit_function(Func(func));
        }
        let iseq = IseqHandle::from_index(high32(return_pc));
        self.st.code = self.store.iseq(iseq).clone();
        self.st.iseq = iseq;
        self.st.pc = low32(return_pc) as usize;
        if saved_sp != ROOT_SP {
            self.st.sp = saved_sp as usize;
        }
        self.set_instance(decode_instance(saved_instance));
        Ok(())
    }

    /// Replaces the current frame with a call to `func`. Arguments start at `sp + arg_base`.
    pub(crate) fn tail_call(&mut self, func: FuncHandle, arg_base: usize, caller_header: usize) -> Result<(), Signal> {
        let sp = self.st.sp;
        let callee_header = self.store.alloc.functions.get(func).header_size;
        if let Some(host) = self.host_of(func) {
            self.call_host(&host, func, sp + arg_base + callee_header)?;
            let results = self.store.func_type(func).results.len();
            let dst = sp - caller_header;
            self.st.stack.copy_within(sp + arg_base..sp + arg_base + results, dst);
            return self.return_from_frame();
        }

        let iseq = self.compiled(func)?;
        let code = self.store.iseq(iseq).clone();
        let params = self.store.func_type(func).params.len();
        let saved = [self.st.stack[sp - 3], self.st.stack[sp - 2], self.st.stack[sp - 1]];
        let header_start = sp - caller_header;
        // Arguments only move down, so an ascending copy never reads a clobbered slot.
        self.st.stack.copy_within(sp + arg_base..sp + arg_base + params, header_start);
        let new_sp = header_start + callee_header;
        self.reserve(new_sp + code.frame_size)?;
        self.st.stack[new_sp - 3..new_sp].copy_from_slice(&saved);
        if let (Some(caller), Some(interceptor)) = (self.st.code.function, self.store.engine.interceptor()) {
            interceptor.on_exit_function(Func(caller));
        }
        self.enter_code(func, iseq, code, new_sp);
        Ok(())
    }

    /// Looks up a callee through `table` and checks its signature against `type_id`.
    pub(crate) fn resolve_indirect(&self, table: u32, type_id: u32, index: u32) -> Result<FuncHandle, Signal> {
        let table = self.store.alloc.tables.get(TableHandle::from_index(table));
        let Some(raw) = table.get(index as u64)?.as_ref() else {
            return Err(TrapReason::IndirectCallToNull(index as u64).into());
        };
        let func = FuncHandle::from_index(raw);
        let actual = self.store.alloc.functions.get(func).type_id;
        if actual != type_id {
            let types = &self.store.alloc.types;
            return Err(TrapReason::TypeMismatchCall {
                expected: types.resolve(type_id).clone(),
                actual: types.resolve(actual).clone(),
            }
            .into());
        }
        Ok(func)
    }

    /// Functions on the call stack, innermost first.
    pub(crate) fn backtrace(&self) -> Backtrace {
        let mut frames = Vec::new();
        let mut function = self.st.code.function;
        let mut sp = self.st.sp;
        loop {
            if let Some(func) = function {
                frames.push(BacktraceFrame {
                    function: self.store.function_name(func),
                    func_index: self.store.function_index(func),
                });
            }
            if sp < FrameHeaderLayout::NUMBER_OF_SAVING_SLOTS {
                break;
            }
            let saved_sp = self.st.stack[sp - 1].0;
            if saved_sp == ROOT_SP {
                break;
            }
            let return_pc = self.st.stack[sp - 2].0;
            function = self.store.iseq(IseqHandle::from_index(high32(return_pc))).function;
            sp = saved_sp as usize;
        }
        Backtrace { frames }
    }

    pub(crate) fn trap(&self, reason: TrapReason) -> Error {
        Error::Trap(Trap::new(reason).with_backtrace(self.backtrace()))
    }

    pub(crate) fn into_error(&self, signal: Signal) -> Error {
        match signal {
            Signal::Trap(reason) => self.trap(reason),
            Signal::Fault(error) => *error,
            Signal::End => Error::from(TranslationError::Other("execution already finished".into())),
            Signal::Breakpoint => self.trap(TrapReason::Message("breakpoint".into())),
        }
    }

    /// Results of the outermost frame, which sit at the bottom of the stack.
    pub(crate) fn results(&self) -> Vec<Value> {
        let ty = self.store.func_type(self.root);
        ty.results.iter().enumerate().map(|(i, t)| Value::from_untyped(self.st.stack[i], *t)).collect()
    }
}
