use std::fmt::{self, Display, Formatter};

use thiserror::Error;

use crate::types::FuncType;

/// Every failure an embedder can observe from this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// The binary could not be decoded at all.
    #[error("{0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error(transparent)]
    Trap(#[from] Trap),
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl Error {
    pub fn as_trap(&self) -> Option<&Trap> {
        match self {
            Error::Trap(trap) => Some(trap),
            _ => None,
        }
    }
}

impl From<TrapReason> for Error {
    fn from(reason: TrapReason) -> Self {
        Error::Trap(Trap::new(reason))
    }
}

fn at_offset(offset: &Option<usize>) -> String {
    match offset {
        Some(offset) => format!(" (at offset {offset:#x})"),
        None => String::new(),
    }
}

/// A module or function body breaks a static WebAssembly rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", at_offset(.offset))]
pub struct ValidationError {
    pub message: String,
    /// Byte offset into the module binary.
    pub offset: Option<usize>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, offset: Option<usize>) -> Self {
        Self { message: message.into(), offset }
    }
}

/// Internal consistency failure while building an instruction sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslationError {
    #[error("register index overflow: frame needs {0} slots")]
    RegisterOverflow(usize),
    #[error("label {0} left unpinned with {1} pending users")]
    DanglingLabel(usize, usize),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrapReason {
    #[error("unreachable")]
    Unreachable,
    #[error("call stack exhausted")]
    CallStackExhausted,
    #[error("out of bounds table access at {0} (undefined element)")]
    TableOutOfBounds(u64),
    #[error("out of bounds memory access")]
    MemoryOutOfBounds,
    #[error("indirect call to null element (uninitialized element {0})")]
    IndirectCallToNull(u64),
    #[error("indirect call type mismatch, expected {expected}, got {actual}")]
    TypeMismatchCall { expected: FuncType, actual: FuncType },
    #[error("integer divide by zero")]
    IntegerDividedByZero,
    #[error("integer overflow")]
    IntegerOverflow,
    #[error("invalid conversion to integer")]
    InvalidConversionToInteger,
    #[error("unaligned atomic")]
    UnalignedAtomic,
    #[error("expected shared memory")]
    ExpectedSharedMemory,
    #[error("{0}")]
    Message(String),
}

/// One frame of a trap backtrace, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BacktraceFrame {
    /// Name from the module's name section, when present.
    pub function: Option<String>,
    /// Index in the defining module's function space.
    pub func_index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Backtrace {
    pub frames: Vec<BacktraceFrame>,
}

impl Display for Backtrace {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            match (&frame.function, frame.func_index) {
                (Some(name), _) => writeln!(f, "{i}: {name}")?,
                (None, Some(index)) => writeln!(f, "{i}: <func {index}>")?,
                (None, None) => writeln!(f, "{i}: <unknown>")?,
            }
        }
        Ok(())
    }
}

/// A runtime fault that aborted execution.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct Trap {
    reason: TrapReason,
    backtrace: Option<Backtrace>,
}

impl Trap {
    pub fn new(reason: TrapReason) -> Self {
        Self { reason, backtrace: None }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self::new(TrapReason::Message(text.into()))
    }

    pub fn reason(&self) -> &TrapReason {
        &self.reason
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }

    pub(crate) fn with_backtrace(mut self, backtrace: Backtrace) -> Self {
        self.backtrace = Some(backtrace);
        self
    }
}

impl From<TrapReason> for Trap {
    fn from(reason: TrapReason) -> Self {
        Trap::new(reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImportError {
    #[error("unknown import {module}.{name}")]
    Missing { module: String, name: String },
    #[error("incompatible import type for {module}.{name}, expected {expected}, got {actual}")]
    IncompatibleType { module: String, name: String, expected: String, actual: String },
    #[error("{module}.{name} is already registered")]
    AlreadyRegistered { module: String, name: String },
}

#[inline(always)]
pub(crate) fn malformed<T>(msg: &'static str) -> Result<T, Error> {
    Err(Error::Malformed(msg))
}

#[inline(always)]
pub(crate) fn invalid<T>(msg: impl Into<String>, offset: usize) -> Result<T, Error> {
    Err(Error::Validation(ValidationError::new(msg, Some(offset))))
}

// Decoder messages
pub const FUNC_CODE_INCONSISTENT: &str = "function and code section have inconsistent lengths";
pub const DATA_COUNT_MISMATCH: &str = "data count and data section have inconsistent lengths";
pub const INT_TOO_LARGE: &str = "integer too large";
pub const INT_TOO_LONG: &str = "integer representation too long";
pub const INVALID_MUTABILITY: &str = "malformed mutability";
pub const INVALID_SECTION_ID: &str = "malformed section id";
pub const INVALID_UTF8: &str = "malformed UTF-8 encoding";
pub const INVALID_VALUE_TYPE: &str = "malformed value type";
pub const INVALID_FUNC_TYPE: &str = "malformed function type";
pub const INVALID_LIMITS: &str = "malformed limits flags";
pub const JUNK_AFTER_LAST: &str = "junk after last section";
pub const NO_MAGIC_HEADER: &str = "magic header not detected";
pub const MALFORMED_IMPORT_KIND: &str = "malformed import kind";
pub const MALFORMED_EXPORT_KIND: &str = "malformed export kind";
pub const MALFORMED_REF_TYPE: &str = "malformed reference type";
pub const MALFORMED_ELEM_KIND: &str = "malformed element kind";
pub const MALFORMED_SEGMENT_FLAGS: &str = "malformed segment flags";
pub const SECTION_SIZE_MISMATCH: &str = "section size mismatch";
pub const SECTION_OUT_OF_ORDER: &str = "unexpected content after last section";
pub const TOO_MANY_LOCALS: &str = "too many locals";
pub const UNEXPECTED_END: &str = "unexpected end of section or function";
pub const UNEXPECTED_END_SHORT: &str = "unexpected end";
pub const UNKNOWN_BINARY_VERSION: &str = "unknown binary version";
pub const ZERO_BYTE_EXPECTED: &str = "zero byte expected";
pub const CONST_EXP_REQUIRED: &str = "constant expression required";
pub const DUP_EXPORT_NAME: &str = "duplicate export name";
pub const MEMORY_SIZE_LIMIT: &str = "memory size must be at most 65536 pages (4GiB)";
pub const MIN_GREATER_THAN_MAX: &str = "size minimum must not be greater than maximum";
pub const SHARED_MEMORY_NEEDS_MAX: &str = "shared memory must have maximum";
pub const MULTIPLE_MEMORIES: &str = "multiple memories";
pub const UNKNOWN_FUNC: &str = "unknown function";
pub const UNDECLARED_FUNC_REF: &str = "undeclared function reference";
pub const UNKNOWN_GLOBAL: &str = "unknown global";
pub const UNKNOWN_MEMORY: &str = "unknown memory";
pub const UNKNOWN_TABLE: &str = "unknown table";
pub const UNKNOWN_TYPE: &str = "unknown type";
pub const START_FUNC: &str = "start function";
