//! wari: a WebAssembly interpreter that translates each function body into a register-based
//! instruction sequence before running it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use wari::{Engine, Imports, Instance, Module, Store, Value};
//!
//! # fn main() -> Result<(), wari::Error> {
//! let bytes = std::fs::read("add.wasm").map_err(|_| wari::Error::Malformed("unreadable"))?;
//! let module = Arc::new(Module::parse(bytes)?);
//! let mut store = Store::new(&Engine::default());
//! let instance = Instance::instantiate(&mut store, module, &Imports::new())?;
//! let add = instance.export_func(&store, "add").ok_or(wari::Error::Malformed("no export"))?;
//! let results = add.call(&mut store, &[Value::I32(1), Value::I32(2)])?;
//! assert_eq!(results, vec![Value::I32(3)]);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

mod alloc;
mod byte_iter;
mod engine;
mod error;
mod exec;
mod externs;
mod func;
mod instance;
mod isa;
mod layout;
mod leb128;
mod memory;
pub mod module;
mod parking_lot;
mod store;
mod table;
mod translator;
mod types;
mod value;

#[cfg(feature = "debugger")]
mod debugger;

pub use alloc::{BumpAllocator, Handle};
pub use engine::{
    CompilationMode, Engine, EngineConfig, EngineInterceptor, MultiplexingInterceptor, ResourceLimiter,
    ThreadingModel, WasmFeatures,
};
pub use error::{Backtrace, BacktraceFrame, Error, ImportError, TranslationError, Trap, TrapReason, ValidationError};
pub use externs::{Extern, Global, Memory, Table};
pub use func::{Caller, Func, HostFn};
pub use instance::{Imports, Instance};
pub use isa::{InstructionSequence, Opcode};
pub use layout::{const_slot_size, frame_header_size, FrameHeaderLayout, StackLayout, VReg};
pub use memory::{SharedMemory, MAX_PAGES, PAGE_SIZE};
pub use module::Module;
pub use parking_lot::{AtomicParkingLot, ParkingKey, WaitOutcome};
pub use store::Store;
pub use types::{BlockType, FuncType, GlobalType, Limits, MemoryType, RefType, TableType, ValType};
pub use value::{UntypedValue, Value};

#[cfg(feature = "debugger")]
pub use debugger::{DebugOutcome, Debugger};
