//! Frame layout arithmetic.
//!
//! A call frame occupies one window of the execution stack, addressed relative to its base
//! pointer `sp`:
//!
//! ```text
//!   sp - header        params / results (aliased)
//!   sp - 3             saved caller instance
//!   sp - 2             return pc
//!   sp - 1             saved caller sp
//!   sp + 0             non-parameter locals
//!   sp + locals        constant cache
//!   sp + locals+consts value stack (max_stack_height slots)
//! ```

use crate::error::TranslationError;
use crate::types::FuncType;

/// Register index relative to a frame's base pointer.
pub type VReg = i16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeaderLayout {
    params: usize,
    results: usize,
}

impl FrameHeaderLayout {
    pub const NUMBER_OF_SAVING_SLOTS: usize = 3;
    pub const SAVED_INSTANCE: VReg = -3;
    pub const RETURN_PC: VReg = -2;
    pub const SAVED_SP: VReg = -1;

    pub fn new(ty: &FuncType) -> Self {
        Self { params: ty.params.len(), results: ty.results.len() }
    }

    pub fn from_counts(params: usize, results: usize) -> Self {
        Self { params, results }
    }

    pub fn size(&self) -> usize {
        self.params.max(self.results) + Self::NUMBER_OF_SAVING_SLOTS
    }

    pub fn param_reg(&self, index: usize) -> VReg {
        (index as isize - self.size() as isize) as VReg
    }

    /// Results reuse the parameter slots; parameters are dead by the time results exist.
    pub fn return_reg(&self, index: usize) -> VReg {
        self.param_reg(index)
    }

    pub fn check(&self) -> Result<(), TranslationError> {
        if self.size() > i16::MAX as usize {
            return Err(TranslationError::RegisterOverflow(self.size()));
        }
        Ok(())
    }
}

pub fn frame_header_size(ty: &FuncType) -> usize {
    FrameHeaderLayout::new(ty).size()
}

/// Capacity of the per-function constant cache.
pub fn const_slot_size(code_size: usize) -> usize {
    (code_size / 20).clamp(4, 128)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    pub header: FrameHeaderLayout,
    pub num_params: usize,
    pub num_locals: usize,
    pub const_slots: usize,
}

impl StackLayout {
    /// `num_locals` counts only the declared locals, not the parameters.
    pub fn new(ty: &FuncType, num_locals: usize, code_size: usize) -> Result<Self, TranslationError> {
        let header = FrameHeaderLayout::new(ty);
        header.check()?;
        let layout = Self { header, num_params: ty.params.len(), num_locals, const_slots: const_slot_size(code_size) };
        layout.check_height(0)?;
        Ok(layout)
    }

    pub fn local_reg(&self, index: usize) -> VReg {
        if index < self.num_params {
            self.header.param_reg(index)
        } else {
            (index - self.num_params) as VReg
        }
    }

    pub fn const_reg(&self, index: usize) -> VReg {
        (self.num_locals + index) as VReg
    }

    pub fn stack_base(&self) -> usize {
        self.num_locals + self.const_slots
    }

    pub fn stack_reg(&self, height: usize) -> Result<VReg, TranslationError> {
        self.check_height(height + 1)?;
        Ok((self.stack_base() + height) as VReg)
    }

    /// Fails when a value stack of `height` slots no longer fits the register width.
    pub fn check_height(&self, height: usize) -> Result<(), TranslationError> {
        let total = self.stack_base() + height;
        if total > i16::MAX as usize {
            return Err(TranslationError::RegisterOverflow(total));
        }
        Ok(())
    }

    /// Slots a frame needs above its base pointer.
    pub fn frame_size(&self, max_stack_height: usize) -> usize {
        self.stack_base() + max_stack_height
    }
}
