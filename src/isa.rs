//! Internal instruction set.
//!
//! An instruction is one opcode word followed by immediate words. Register operands are
//! packed four to a word as 16-bit lanes; branch offsets are relative to the opcode word of
//! the branching instruction.
//!
//! | shape                | words after opcode                                          |
//! |----------------------|-------------------------------------------------------------|
//! | unary / copy         | `[dst, src]`                                                |
//! | binary               | `[dst, lhs, rhs]`                                           |
//! | `Const32`            | `dst | value << 32`                                         |
//! | `Const64`            | `[dst]`, value                                              |
//! | `Br`                 | offset (i64)                                                |
//! | `BrIf`/`BrIfNot`     | `cond | offset << 32`                                       |
//! | `BrTable`            | `index | count << 32`, then `count` offsets                  |
//! | `Call`               | `func | sp_addend << 32`                                     |
//! | `CallIndirect`       | `table | type << 32`, `[index] | sp_addend << 32`            |
//! | `ReturnCall`         | `func | arg_base << 32 | caller_header << 48`               |
//! | `ReturnCallIndirect` | `table | type << 32`, `[index, arg_base] | header << 32`     |
//! | load / store         | `[dst, addr]` or `[addr, value]`, offset                    |
//! | atomics              | registers (+ rmw op << 48), `offset | width << 32`          |

use std::fmt::Write as _;

use crate::func::FuncHandle;
use crate::layout::VReg;
use crate::value::UntypedValue;

macro_rules! for_each_instruction {
    ($m:ident) => {
        $m! {
            Unreachable, EndOfExecution, Breakpoint, Copy, Const32, Const64,
            Br, BrIf, BrIfNot, BrTable, Return,
            Call, CallIndirect, ReturnCall, ReturnCallIndirect,
            Select, RefIsNull, RefFunc, GlobalGet, GlobalSet,
            I32Load, I64Load, F32Load, F64Load,
            I32Load8S, I32Load8U, I32Load16S, I32Load16U,
            I64Load8S, I64Load8U, I64Load16S, I64Load16U, I64Load32S, I64Load32U,
            I32Store, I64Store, F32Store, F64Store,
            I32Store8, I32Store16, I64Store8, I64Store16, I64Store32,
            MemorySize, MemoryGrow, MemoryInit, DataDrop, MemoryCopy, MemoryFill,
            TableGet, TableSet, TableSize, TableGrow, TableFill, TableCopy, TableInit, ElemDrop,
            AtomicNotify, AtomicWait32, AtomicWait64, AtomicLoad, AtomicStore, AtomicRmw, AtomicCmpxchg,
            I32Eqz, I32Eq, I32Ne, I32LtS, I32LtU, I32GtS, I32GtU, I32LeS, I32LeU, I32GeS, I32GeU,
            I64Eqz, I64Eq, I64Ne, I64LtS, I64LtU, I64GtS, I64GtU, I64LeS, I64LeU, I64GeS, I64GeU,
            F32Eq, F32Ne, F32Lt, F32Gt, F32Le, F32Ge,
            F64Eq, F64Ne, F64Lt, F64Gt, F64Le, F64Ge,
            I32Clz, I32Ctz, I32Popcnt,
            I32Add, I32Sub, I32Mul, I32DivS, I32DivU, I32RemS, I32RemU,
            I32And, I32Or, I32Xor, I32Shl, I32ShrS, I32ShrU, I32Rotl, I32Rotr,
            I64Clz, I64Ctz, I64Popcnt,
            I64Add, I64Sub, I64Mul, I64DivS, I64DivU, I64RemS, I64RemU,
            I64And, I64Or, I64Xor, I64Shl, I64ShrS, I64ShrU, I64Rotl, I64Rotr,
            F32Abs, F32Neg, F32Ceil, F32Floor, F32Trunc, F32Nearest, F32Sqrt,
            F32Add, F32Sub, F32Mul, F32Div, F32Min, F32Max, F32Copysign,
            F64Abs, F64Neg, F64Ceil, F64Floor, F64Trunc, F64Nearest, F64Sqrt,
            F64Add, F64Sub, F64Mul, F64Div, F64Min, F64Max, F64Copysign,
            I32WrapI64, I32TruncF32S, I32TruncF32U, I32TruncF64S, I32TruncF64U,
            I64ExtendI32S, I64ExtendI32U, I64TruncF32S, I64TruncF32U, I64TruncF64S, I64TruncF64U,
            F32ConvertI32S, F32ConvertI32U, F32ConvertI64S, F32ConvertI64U, F32DemoteF64,
            F64ConvertI32S, F64ConvertI32U, F64ConvertI64S, F64ConvertI64U, F64PromoteF32,
            I32Extend8S, I32Extend16S, I64Extend8S, I64Extend16S, I64Extend32S,
            I32TruncSatF32S, I32TruncSatF32U, I32TruncSatF64S, I32TruncSatF64U,
            I64TruncSatF32S, I64TruncSatF32U, I64TruncSatF64S, I64TruncSatF64U,
        }
    };
}
pub(crate) use for_each_instruction;

macro_rules! define_opcodes {
    ($($name:ident),* $(,)?) => {
        #[repr(u16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Opcode {
            $($name),*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name),*];
            pub const COUNT: usize = Self::ALL.len();

            #[inline(always)]
            pub fn from_word(word: u64) -> Option<Opcode> {
                Self::ALL.get(word as usize).copied()
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name)),*
                }
            }
        }
    };
}
for_each_instruction!(define_opcodes);

impl Opcode {
    #[inline(always)]
    pub fn word(self) -> u64 { self as u16 as u64 }

    /// Number of immediate words that follow the opcode word.
    pub fn immediate_words(self, first_immediate: u64) -> usize {
        use Opcode::*;
        match self {
            Unreachable | EndOfExecution | Breakpoint | Return => 0,
            Const64 | CallIndirect | ReturnCallIndirect | MemoryInit | TableGrow | TableFill
            | TableCopy | TableInit | AtomicNotify | AtomicWait32 | AtomicWait64 | AtomicLoad
            | AtomicStore | AtomicRmw | AtomicCmpxchg => 2,
            I32Load | I64Load | F32Load | F64Load | I32Load8S | I32Load8U | I32Load16S
            | I32Load16U | I64Load8S | I64Load8U | I64Load16S | I64Load16U | I64Load32S
            | I64Load32U | I32Store | I64Store | F32Store | F64Store | I32Store8 | I32Store16
            | I64Store8 | I64Store16 | I64Store32 => 2,
            BrTable => 1 + high32(first_immediate) as usize,
            _ => 1,
        }
    }
}

#[inline(always)]
pub(crate) fn pack(regs: &[VReg]) -> u64 {
    regs.iter().enumerate().fold(0u64, |word, (i, r)| word | ((*r as u16 as u64) << (16 * i)))
}

#[inline(always)]
pub(crate) fn reg(word: u64, lane: u32) -> VReg {
    (word >> (16 * lane)) as u16 as i16
}

#[inline(always)]
pub(crate) fn with_high32(low: u64, high: u32) -> u64 {
    (low & 0xffff_ffff) | ((high as u64) << 32)
}

#[inline(always)]
pub(crate) fn high32(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline(always)]
pub(crate) fn low32(word: u64) -> u32 {
    word as u32
}

/// Read-modify-write operations carried in lane 3 of an `AtomicRmw` word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

impl RmwOp {
    pub(crate) fn from_u8(v: u8) -> Option<Self> {
        [RmwOp::Add, RmwOp::Sub, RmwOp::And, RmwOp::Or, RmwOp::Xor, RmwOp::Xchg].get(v as usize).copied()
    }

    #[inline]
    pub(crate) fn apply(self, old: u64, operand: u64) -> u64 {
        match self {
            RmwOp::Add => old.wrapping_add(operand),
            RmwOp::Sub => old.wrapping_sub(operand),
            RmwOp::And => old & operand,
            RmwOp::Or => old | operand,
            RmwOp::Xor => old ^ operand,
            RmwOp::Xchg => operand,
        }
    }
}

/// Compiled body of one function. Immutable once built.
#[derive(Debug, Clone)]
pub struct InstructionSequence {
    pub(crate) code: Box<[u64]>,
    /// Initial contents of the slots at the frame base: local defaults, then the constant pool.
    pub(crate) frame_init: Box<[UntypedValue]>,
    pub(crate) num_locals: usize,
    pub(crate) max_stack_height: usize,
    /// Slots the frame needs above its base pointer.
    pub(crate) frame_size: usize,
    pub(crate) header_size: usize,
    pub(crate) function: Option<FuncHandle>,
    /// `(wasm byte offset, instruction offset)` pairs in ascending order.
    pub(crate) wasm_map: Box<[(u32, u32)]>,
}

impl InstructionSequence {
    /// The sequence every root frame returns into.
    pub(crate) fn end_of_execution() -> Self {
        Self {
            code: vec![Opcode::EndOfExecution.word()].into_boxed_slice(),
            frame_init: Box::new([]),
            num_locals: 0,
            max_stack_height: 0,
            frame_size: 0,
            header_size: 0,
            function: None,
            wasm_map: Box::new([]),
        }
    }

    pub fn code(&self) -> &[u64] { &self.code }

    pub fn constants(&self) -> &[UntypedValue] { &self.frame_init[self.num_locals..] }

    pub fn max_stack_height(&self) -> usize { self.max_stack_height }

    /// Instruction offset for the first instruction emitted at or after `wasm_offset`.
    pub fn offset_for_wasm(&self, wasm_offset: u32) -> Option<u32> {
        let i = self.wasm_map.partition_point(|(w, _)| *w < wasm_offset);
        self.wasm_map.get(i).map(|(_, pc)| *pc)
    }

    /// Offsets of every opcode word, in order.
    pub fn instruction_offsets(&self) -> Vec<usize> {
        let mut offsets = Vec::new();
        let mut pc = 0;
        while pc < self.code.len() {
            offsets.push(pc);
            let Some(op) = Opcode::from_word(self.code[pc]) else { break };
            let first = self.code.get(pc + 1).copied().unwrap_or(0);
            pc += 1 + op.immediate_words(first);
        }
        offsets
    }

    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        for pc in self.instruction_offsets() {
            let word = self.code[pc];
            let Some(op) = Opcode::from_word(word) else {
                let _ = writeln!(out, "{pc:5}: <invalid {word:#x}>");
                continue;
            };
            let first = self.code.get(pc + 1).copied().unwrap_or(0);
            let n = op.immediate_words(first);
            let _ = write!(out, "{pc:5}: {}", op.name());
            for imm in &self.code[pc + 1..(pc + 1 + n).min(self.code.len())] {
                let _ = write!(out, " {imm:#x}");
            }
            out.push('\n');
        }
        out
    }
}
