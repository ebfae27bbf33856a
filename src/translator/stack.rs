use crate::error::TranslationError;
use crate::layout::{StackLayout, VReg};
use crate::types::ValType;

use super::builder::LabelId;

/// Where a value on the shadow stack currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueSource {
    /// Still in the local's register; nothing has been copied yet.
    Local(u32),
    /// In a constant-pool slot.
    Const(u16),
    /// In the stack register assigned to its height.
    Stack,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StackValue {
    /// `None` for the bottom type produced in unreachable code.
    pub ty: Option<ValType>,
    pub source: ValueSource,
}

impl StackValue {
    pub fn stack(ty: Option<ValType>) -> Self { Self { ty, source: ValueSource::Stack } }
}

/// A value taken off the shadow stack, with the register it was read from.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Operand {
    pub ty: Option<ValType>,
    pub source: ValueSource,
    pub reg: VReg,
    /// Height the value occupied.
    pub index: usize,
}

/// Symbolic value stack. Every height owns one stack register; values sourced from
/// locals or constants only occupy it once they are materialized.
pub(crate) struct ValueStack {
    values: Vec<StackValue>,
    max_height: usize,
    layout: StackLayout,
}

impl ValueStack {
    pub fn new(layout: StackLayout) -> Self {
        Self { values: Vec::new(), max_height: 0, layout }
    }

    pub fn height(&self) -> usize { self.values.len() }

    pub fn max_height(&self) -> usize { self.max_height }

    /// Makes sure `height` slots fit the frame, e.g. for a callee's header.
    pub fn reserve(&mut self, height: usize) -> Result<(), TranslationError> {
        self.layout.check_height(height)?;
        self.max_height = self.max_height.max(height);
        Ok(())
    }

    pub fn push(&mut self, value: StackValue) -> Result<usize, TranslationError> {
        let index = self.values.len();
        self.reserve(index + 1)?;
        self.values.push(value);
        Ok(index)
    }

    pub fn pop(&mut self) -> Option<Operand> {
        let index = self.values.len().checked_sub(1)?;
        let reg = self.reg_of(index);
        let value = self.values.pop()?;
        Some(Operand { ty: value.ty, source: value.source, reg, index })
    }

    pub fn truncate(&mut self, height: usize) { self.values.truncate(height); }

    pub fn get(&self, index: usize) -> StackValue { self.values[index] }

    pub fn set_source(&mut self, index: usize, source: ValueSource) { self.values[index].source = source; }

    /// Register of the slot owned by `index`. Heights are range-checked when pushed or reserved.
    pub fn slot_reg(&self, index: usize) -> VReg { (self.layout.stack_base() + index) as VReg }

    /// Register the value at `index` can currently be read from.
    pub fn reg_of(&self, index: usize) -> VReg {
        match self.values[index].source {
            ValueSource::Local(local) => self.layout.local_reg(local as usize),
            ValueSource::Const(slot) => self.layout.const_reg(slot as usize),
            ValueSource::Stack => self.slot_reg(index),
        }
    }

    /// Heights whose value is still read from a local (all locals, or only `local`).
    pub fn local_sourced(&self, local: Option<u32>) -> Vec<usize> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| match (v.source, local) {
                (ValueSource::Local(_), None) => true,
                (ValueSource::Local(l), Some(want)) => l == want,
                _ => false,
            })
            .map(|(i, _)| i)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ControlKind {
    Function,
    Block,
    Loop,
    If { else_label: LabelId },
    Else,
}

#[derive(Debug, Clone)]
pub(crate) struct ControlFrame {
    pub kind: ControlKind,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// Stack height below the block's parameters.
    pub height: usize,
    /// Branch target: the loop head for loops, the end otherwise.
    pub label: LabelId,
    pub unreachable: bool,
    /// Entered from unreachable code; nothing inside is emitted.
    pub dead: bool,
}

impl ControlFrame {
    /// Types a branch to this frame carries.
    pub fn branch_types(&self) -> &[ValType] {
        match self.kind {
            ControlKind::Loop => &self.params,
            _ => &self.results,
        }
    }
}
