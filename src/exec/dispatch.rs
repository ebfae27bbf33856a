//! The two dispatch loops.
//!
//! Token threading decodes the opcode word of every instruction and matches on it. Direct
//! threading looks the next handler up in a table of function pointers as soon as the
//! current one finishes and hands it back to a trampoline, so the loop itself never matches
//! on an opcode.

use paste::paste;

use super::{handlers, Execution, Signal};
use crate::engine::ThreadingModel;
use crate::error::{Error, TranslationError};
use crate::isa::{for_each_instruction, Opcode};

fn invalid_opcode(ex: &Execution<'_>) -> Signal {
    let word = ex.st.code.code.get(ex.st.pc).copied().unwrap_or_default();
    Error::from(TranslationError::Other(format!("invalid opcode word {word:#x} at {}", ex.st.pc))).into()
}

#[inline(always)]
fn fetch(ex: &Execution<'_>) -> Result<Opcode, Signal> {
    ex.st.code.code.get(ex.st.pc).and_then(|word| Opcode::from_word(*word)).ok_or_else(|| invalid_opcode(ex))
}

macro_rules! define_execute {
    ($($name:ident),* $(,)?) => { paste! {
        #[inline(always)]
        fn execute(ex: &mut Execution<'_>, op: Opcode) -> Result<(), Signal> {
            match op {
                $(Opcode::$name => handlers::[<op_ $name:snake>](ex),)*
            }
        }
    } };
}
for_each_instruction!(define_execute);

fn run_token(ex: &mut Execution<'_>) -> Result<(), Signal> {
    loop {
        let op = fetch(ex)?;
        execute(ex, op)?;
    }
}

/// A handler that returns its successor.
#[derive(Clone, Copy)]
struct Handler(fn(&mut Execution<'_>) -> Result<Handler, Signal>);

#[inline(always)]
fn next_handler(ex: &Execution<'_>) -> Result<Handler, Signal> {
    let op = fetch(ex)?;
    Ok(HANDLERS[op as usize])
}

macro_rules! define_direct {
    ($($name:ident),* $(,)?) => { paste! {
        $(
            fn [<direct_ $name:snake>](ex: &mut Execution<'_>) -> Result<Handler, Signal> {
                handlers::[<op_ $name:snake>](ex)?;
                next_handler(ex)
            }
        )*

        static HANDLERS: [Handler; Opcode::COUNT] = [$(Handler([<direct_ $name:snake>])),*];
    } };
}
for_each_instruction!(define_direct);

fn run_direct(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let mut handler = next_handler(ex)?;
    loop {
        handler = (handler.0)(ex)?;
    }
}

/// Runs until the outermost frame returns, a trap, or a breakpoint.
pub(crate) fn run(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let outcome = match ex.store.engine.config().threading_model {
        ThreadingModel::Token => run_token(ex),
        ThreadingModel::Direct => run_direct(ex),
    };
    match outcome {
        Err(Signal::End) => Ok(()),
        other => other,
    }
}

/// Executes exactly one instruction.
#[cfg(feature = "debugger")]
pub(crate) fn step(ex: &mut Execution<'_>) -> Result<(), Signal> {
    let op = fetch(ex)?;
    execute(ex, op)
}
