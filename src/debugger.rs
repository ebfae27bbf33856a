//! Breakpoints over translated code.
//!
//! A breakpoint overwrites one opcode word with [`Opcode::Breakpoint`]. The dispatch loop
//! stops there without advancing, [`Debugger::resume`] puts the original word back long
//! enough to execute that one instruction, and then re-arms the breakpoint.

use log::trace;

use crate::error::{Backtrace, Error, TranslationError, Trap};
use crate::exec::{self, Entry, Execution, Signal};
use crate::func::{Func, IseqHandle};
use crate::isa::Opcode;
use crate::store::Store;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum DebugOutcome {
    /// Stopped before executing the instruction at `pc` of `func`.
    Breakpoint { func: Func, pc: usize },
    Returned(Vec<Value>),
}

impl Store {
    fn compiled_iseq(&mut self, func: Func) -> Result<IseqHandle, Error> {
        self.ensure_compiled(func.0)?
            .ok_or_else(|| TranslationError::Other("host functions have no instructions".into()).into())
    }

    /// Sets a breakpoint before the instruction at offset `pc` of `func`'s translated code.
    pub fn set_breakpoint(&mut self, func: Func, pc: usize) -> Result<(), Error> {
        let iseq = self.compiled_iseq(func)?;
        if !self.iseq(iseq).instruction_offsets().contains(&pc) {
            return Err(TranslationError::Other(format!("no instruction starts at offset {pc}")).into());
        }
        let key = (iseq.index(), pc);
        if self.breakpoints.contains_key(&key) {
            return Ok(());
        }
        let code = &mut self.iseq_mut(iseq).code;
        let original = std::mem::replace(&mut code[pc], Opcode::Breakpoint.word());
        self.breakpoints.insert(key, original);
        Ok(())
    }

    /// Sets a breakpoint on the first instruction translated from `wasm_offset` or later,
    /// where the offset is relative to the start of the module binary. Returns the
    /// instruction offset that was used.
    pub fn set_breakpoint_at_wasm_offset(&mut self, func: Func, wasm_offset: u32) -> Result<usize, Error> {
        let iseq = self.compiled_iseq(func)?;
        let Some(pc) = self.iseq(iseq).offset_for_wasm(wasm_offset) else {
            return Err(TranslationError::Other(format!("no code at wasm offset {wasm_offset:#x}")).into());
        };
        self.set_breakpoint(func, pc as usize)?;
        Ok(pc as usize)
    }

    /// Returns whether a breakpoint was removed.
    pub fn clear_breakpoint(&mut self, func: Func, pc: usize) -> bool {
        let Ok(Some(iseq)) = self.ensure_compiled(func.0) else { return false };
        let Some(original) = self.breakpoints.remove(&(iseq.index(), pc)) else { return false };
        self.iseq_mut(iseq).code[pc] = original;
        true
    }
}

enum State<'s> {
    Running(Execution<'s>),
    /// A host function ran to completion on entry.
    Returned(Vec<Value>),
    Done,
}

/// One invocation run under breakpoint control.
pub struct Debugger<'s> {
    state: State<'s>,
    /// Stopped on a breakpoint that must be stepped over before running on.
    parked: bool,
}

impl<'s> Debugger<'s> {
    /// Prepares a call of `func`. Nothing executes until [`Debugger::resume`].
    pub fn new(store: &'s mut Store, func: Func, args: &[Value]) -> Result<Self, Error> {
        let state = match exec::enter(store, func.0, args)? {
            Entry::Finished(results) => State::Returned(results),
            Entry::Ready(st) => State::Running(Execution { store, st, root: func.0 }),
        };
        Ok(Self { state, parked: false })
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Function and instruction offset execution is stopped at.
    pub fn position(&self) -> Option<(Option<Func>, usize)> {
        match &self.state {
            State::Running(ex) => Some((ex.st.code.function.map(Func), ex.st.pc)),
            _ => None,
        }
    }

    pub fn backtrace(&self) -> Option<Backtrace> {
        match &self.state {
            State::Running(ex) => Some(ex.backtrace()),
            _ => None,
        }
    }

    /// Runs until the next breakpoint or until the invocation finishes.
    pub fn resume(&mut self) -> Result<DebugOutcome, Error> {
        let mut ex = match std::mem::replace(&mut self.state, State::Done) {
            State::Running(ex) => ex,
            State::Returned(results) => return Ok(DebugOutcome::Returned(results)),
            State::Done => return Err(Trap::message("the debugged invocation already finished").into()),
        };

        let stepped = if std::mem::take(&mut self.parked) { step_over_breakpoint(&mut ex) } else { Ok(()) };
        let outcome = match stepped {
            Ok(()) => exec::run(&mut ex),
            Err(Signal::End) => Ok(()),
            Err(signal) => Err(signal),
        };
        match outcome {
            Ok(()) => Ok(DebugOutcome::Returned(ex.results())),
            Err(Signal::Breakpoint) => {
                let (function, pc) = (ex.st.code.function, ex.st.pc);
                self.state = State::Running(ex);
                self.parked = true;
                let Some(func) = function else {
                    return Err(Trap::message("breakpoint outside of a function").into());
                };
                trace!("breakpoint hit in function {} at {pc}", func.index());
                Ok(DebugOutcome::Breakpoint { func: Func(func), pc })
            }
            Err(signal) => Err(ex.into_error(signal)),
        }
    }
}

/// Executes the instruction displaced by the breakpoint execution is parked on.
fn step_over_breakpoint(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let (iseq, pc) = (ex.st.iseq, ex.st.pc);
    let Some(original) = ex.store.breakpoints.get(&(iseq.index(), pc)).copied() else {
        return Ok(());
    };
    trace!("stepping over breakpoint at {pc}");
    ex.store.iseq_mut(iseq).code[pc] = original;
    ex.st.code = ex.store.iseq(iseq).clone();
    let stepped = exec::step(ex);
    ex.store.iseq_mut(iseq).code[pc] = Opcode::Breakpoint.word();
    if ex.st.iseq == iseq {
        ex.st.code = ex.store.iseq(iseq).clone();
    }
    stepped
}
