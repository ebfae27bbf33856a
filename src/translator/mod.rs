//! Single-pass translation of function bodies into register code.
//!
//! The translator walks the bytecode once, validating as it goes, and keeps a shadow of the
//! operand stack. Reads of locals and constants are left symbolic until something forces
//! them into their stack slot, so `local.get` and `i32.const` usually cost no instruction.

mod builder;
mod stack;

use log::trace;

use crate::byte_iter::ByteIter;
use crate::engine::WasmFeatures;
use crate::error::*;
use crate::func::FuncHandle;
use crate::instance::InstanceEntity;
use crate::isa::{pack, with_high32, InstructionSequence, Opcode, RmwOp};
use crate::layout::{frame_header_size, StackLayout, VReg};
use crate::module::Module;
use crate::types::{BlockType, GlobalType, RefType, ValType};
use crate::value::UntypedValue;

use builder::InstructionBuilder;
use stack::{ControlFrame, ControlKind, Operand, StackValue, ValueSource, ValueStack};

pub(crate) struct TranslationContext<'a> {
    pub module: &'a Module,
    pub instance: &'a InstanceEntity,
    pub features: WasmFeatures,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Block,
    Loop,
    If,
}

#[derive(Clone, Copy)]
enum Arity {
    Unary,
    Binary,
}

pub(crate) struct Translator<'a> {
    module: &'a Module,
    instance: &'a InstanceEntity,
    features: WasmFeatures,
    it: ByteIter<'a>,
    layout: StackLayout,
    /// Parameters followed by declared locals.
    locals: Vec<ValType>,
    results: Vec<ValType>,
    stack: ValueStack,
    control: Vec<ControlFrame>,
    builder: InstructionBuilder,
    /// Offset of the operator being translated, for error reporting.
    offset: usize,
}

impl<'a> Translator<'a> {
    pub(crate) fn translate(
        ctx: &TranslationContext<'a>,
        func_index: u32,
        handle: FuncHandle,
    ) -> Result<InstructionSequence, Error> {
        let module = ctx.module;
        let Some(function) = module.functions.get(func_index as usize) else {
            return Err(TranslationError::Other(format!("no function {func_index}")).into());
        };
        let Some(ty) = module.types.get(function.type_index as usize) else {
            return malformed(UNKNOWN_TYPE);
        };
        let body = function.body.clone();
        if ty.params.iter().chain(&function.locals).any(|t| *t == ValType::V128) {
            return invalid("SIMD is not supported", body.start);
        }

        let layout = StackLayout::new(ty, function.locals.len(), body.len())?;
        let mut locals = ty.params.clone();
        locals.extend_from_slice(&function.locals);

        let mut t = Translator {
            module,
            instance: ctx.instance,
            features: ctx.features,
            it: ByteIter::bounded(module.bytes(), body.clone()),
            layout,
            locals,
            results: ty.results.clone(),
            stack: ValueStack::new(layout),
            control: Vec::new(),
            builder: InstructionBuilder::new(layout.const_slots),
            offset: body.start,
        };
        let label = t.builder.new_label();
        t.control.push(ControlFrame {
            kind: ControlKind::Function,
            params: Vec::new(),
            results: ty.results.clone(),
            height: 0,
            label,
            unreachable: false,
            dead: false,
        });
        t.translate_body()?;

        let max_stack_height = t.stack.max_height();
        let finished = t.builder.finalize()?;
        let mut frame_init: Vec<UntypedValue> = function
            .locals
            .iter()
            .map(|ty| if ty.is_ref() { UntypedValue::null_ref() } else { UntypedValue::default() })
            .collect();
        frame_init.extend(finished.constants);
        trace!("translated function {func_index} ({} wasm bytes)", body.len());

        Ok(InstructionSequence {
            code: finished.code,
            frame_init: frame_init.into_boxed_slice(),
            num_locals: function.locals.len(),
            max_stack_height,
            frame_size: layout.frame_size(max_stack_height),
            header_size: layout.header.size(),
            function: Some(handle),
            wasm_map: finished.wasm_map,
        })
    }

    fn translate_body(&mut self) -> Result<(), Error> {
        while !self.control.is_empty() {
            if self.it.empty() {
                return malformed(UNEXPECTED_END);
            }
            self.offset = self.it.cur();
            self.builder.suppressed = !self.live();
            self.builder.record_wasm_offset(self.offset);
            let opcode = self.it.read_u8()?;
            self.translate_op(opcode)?;
        }
        if !self.it.empty() {
            return invalid("operators remaining after end of function", self.it.cur());
        }
        Ok(())
    }

    // ---------------- Bookkeeping ----------------

    #[inline]
    fn err<T>(&self, msg: impl Into<String>) -> Result<T, Error> {
        invalid(msg, self.offset)
    }

    fn require(&self, feature: WasmFeatures, name: &str) -> Result<(), Error> {
        if self.features.contains(feature) {
            Ok(())
        } else {
            self.err(format!("{name} support is not enabled"))
        }
    }

    fn frame(&self) -> &ControlFrame {
        &self.control[self.control.len() - 1]
    }

    fn live(&self) -> bool {
        self.control.last().is_some_and(|f| !f.unreachable && !f.dead)
    }

    fn set_unreachable(&mut self) {
        let last = self.control.len() - 1;
        let frame = &mut self.control[last];
        frame.unreachable = true;
        let height = frame.height;
        self.stack.truncate(height);
        self.builder.suppressed = true;
    }

    /// Control-stack index of the frame `depth` levels out.
    fn branch_target(&self, depth: u32) -> Result<usize, Error> {
        match self.control.len().checked_sub(depth as usize + 1) {
            Some(target) => Ok(target),
            None => self.err("unknown label"),
        }
    }

    fn pop_value(&mut self, expected: Option<ValType>) -> Result<Operand, Error> {
        let frame = self.frame();
        if self.stack.height() <= frame.height {
            if frame.unreachable {
                let index = self.stack.height();
                return Ok(Operand { ty: expected, source: ValueSource::Stack, reg: self.stack.slot_reg(index), index });
            }
            return self.err("type mismatch");
        }
        let Some(value) = self.stack.pop() else { return self.err("type mismatch") };
        if let (Some(want), Some(have)) = (expected, value.ty) {
            if want != have {
                return self.err("type mismatch");
            }
        }
        Ok(Operand { ty: value.ty.or(expected), ..value })
    }

    fn pop(&mut self, expected: ValType) -> Result<VReg, Error> {
        Ok(self.pop_value(Some(expected))?.reg)
    }

    fn pop_values(&mut self, types: &[ValType]) -> Result<Vec<Operand>, Error> {
        let mut values = Vec::with_capacity(types.len());
        for ty in types.iter().rev() {
            values.push(self.pop_value(Some(*ty))?);
        }
        values.reverse();
        Ok(values)
    }

    fn push(&mut self, ty: ValType) -> Result<VReg, Error> {
        let index = self.stack.push(StackValue::stack(Some(ty)))?;
        Ok(self.stack.slot_reg(index))
    }

    fn push_results(&mut self, types: &[ValType]) -> Result<(), Error> {
        for ty in types {
            self.push(*ty)?;
        }
        Ok(())
    }

    fn push_const(&mut self, value: UntypedValue, ty: ValType) -> Result<(), Error> {
        if !self.builder.suppressed {
            if let Some(slot) = self.builder.intern_const(value.0) {
                self.stack.push(StackValue { ty: Some(ty), source: ValueSource::Const(slot) })?;
                return Ok(());
            }
        }
        let dst = self.push(ty)?;
        if value.0 >> 32 == 0 {
            self.builder.emit(Opcode::Const32, &[with_high32(pack(&[dst]), value.0 as u32)]);
        } else {
            self.builder.emit(Opcode::Const64, &[pack(&[dst]), value.0]);
        }
        Ok(())
    }

    /// Copies the value at `index` into its own slot if it still lives elsewhere.
    fn materialize(&mut self, index: usize) {
        if self.stack.get(index).source != ValueSource::Stack {
            let src = self.stack.reg_of(index);
            self.builder.emit_copy(self.stack.slot_reg(index), src);
            self.stack.set_source(index, ValueSource::Stack);
        }
    }

    fn set_local(&mut self, local: u32, src: VReg) {
        for index in self.stack.local_sourced(Some(local)) {
            self.materialize(index);
        }
        self.builder.emit_copy(self.layout.local_reg(local as usize), src);
    }

    /// Moves call arguments into consecutive slots; returns the height of the first one.
    fn pop_args(&mut self, params: &[ValType]) -> Result<usize, Error> {
        let args = self.pop_values(params)?;
        let base = self.stack.height();
        for (i, arg) in args.iter().enumerate() {
            self.builder.emit_copy(self.stack.slot_reg(base + i), arg.reg);
        }
        Ok(base)
    }

    fn emit_return(&mut self, values: &[Operand]) {
        let mut sources: Vec<VReg> = values.iter().map(|v| v.reg).collect();
        if values.len() > 1 {
            // A parameter may be overwritten by an earlier result before it is read.
            for (i, value) in values.iter().enumerate() {
                if value.reg < 0 {
                    let slot = self.stack.slot_reg(value.index);
                    self.builder.emit_copy(slot, value.reg);
                    sources[i] = slot;
                }
            }
        }
        for (i, src) in sources.iter().enumerate() {
            self.builder.emit_copy(self.layout.header.return_reg(i), *src);
        }
        self.builder.emit(Opcode::Return, &[]);
    }

    fn emit_branch_copies(&mut self, height: usize, values: &[Operand]) {
        for (i, value) in values.iter().enumerate() {
            self.builder.emit_copy(self.stack.slot_reg(height + i), value.reg);
        }
    }

    fn needs_copies(&self, height: usize, values: &[Operand]) -> bool {
        values.iter().enumerate().any(|(i, v)| v.reg != self.stack.slot_reg(height + i))
    }

    fn unary(&mut self, op: Opcode, input: ValType, output: ValType) -> Result<(), Error> {
        let src = self.pop(input)?;
        let dst = self.push(output)?;
        self.builder.emit(op, &[pack(&[dst, src])]);
        Ok(())
    }

    fn binary(&mut self, op: Opcode, input: ValType, output: ValType) -> Result<(), Error> {
        let rhs = self.pop(input)?;
        let lhs = self.pop(input)?;
        let dst = self.push(output)?;
        self.builder.emit(op, &[pack(&[dst, lhs, rhs])]);
        Ok(())
    }

    fn reinterpret(&mut self, from: ValType, to: ValType) -> Result<(), Error> {
        let value = self.pop_value(Some(from))?;
        self.stack.push(StackValue { ty: Some(to), source: value.source })?;
        Ok(())
    }

    // ---------------- Index spaces ----------------

    fn local_type(&self, index: u32) -> Result<ValType, Error> {
        match self.locals.get(index as usize) {
            Some(ty) => Ok(*ty),
            None => self.err("unknown local"),
        }
    }

    fn global(&self, index: u32) -> Result<(GlobalType, u64), Error> {
        match (self.module.globals.get(index as usize), self.instance.globals.get(index as usize)) {
            (Some(global), Some(handle)) => Ok((global.ty, handle.index() as u64)),
            _ => self.err(UNKNOWN_GLOBAL),
        }
    }

    fn table(&self, index: u32) -> Result<(RefType, u64), Error> {
        match (self.module.tables.get(index as usize), self.instance.tables.get(index as usize)) {
            (Some(table), Some(handle)) => Ok((table.ty.element, handle.index() as u64)),
            _ => self.err(UNKNOWN_TABLE),
        }
    }

    fn element(&self, index: u32) -> Result<(RefType, u64), Error> {
        match (self.module.elements.get(index as usize), self.instance.elements.get(index as usize)) {
            (Some(segment), Some(handle)) => Ok((segment.ty, handle.index() as u64)),
            _ => self.err("unknown elem segment"),
        }
    }

    fn data(&self, index: u32) -> Result<u64, Error> {
        let Some(count) = self.module.data_count else {
            return self.err("data count section required");
        };
        match self.instance.data.get(index as usize) {
            Some(handle) if index < count => Ok(handle.index() as u64),
            _ => self.err("unknown data segment"),
        }
    }

    fn check_memory(&self) -> Result<(), Error> {
        if self.module.memories.is_empty() {
            return self.err(UNKNOWN_MEMORY);
        }
        Ok(())
    }

    fn read_zero_byte(&mut self) -> Result<(), Error> {
        if self.it.read_u8()? != 0 {
            return malformed(ZERO_BYTE_EXPECTED);
        }
        Ok(())
    }

    /// Reads a memarg and returns its offset.
    fn memarg(&mut self, natural_log2: u32) -> Result<u64, Error> {
        self.check_memory()?;
        let align = self.it.read_u32()?;
        let offset = self.it.read_u32()?;
        if align > natural_log2 {
            return self.err("alignment must not be larger than natural");
        }
        Ok(offset as u64)
    }

    fn atomic_memarg(&mut self, width: u32) -> Result<u64, Error> {
        self.check_memory()?;
        let align = self.it.read_u32()?;
        let offset = self.it.read_u32()?;
        if 1u32.checked_shl(align) != Some(width) {
            return self.err("alignment must be equal to natural");
        }
        Ok(offset as u64 | (width as u64) << 32)
    }

    fn block_signature(&self, bt: BlockType) -> Result<(Vec<ValType>, Vec<ValType>), Error> {
        match bt {
            BlockType::Empty => Ok((Vec::new(), Vec::new())),
            BlockType::Value(ValType::V128) => self.err("SIMD is not supported"),
            BlockType::Value(ty) => Ok((Vec::new(), vec![ty])),
            BlockType::Func(index) => {
                let Some(ty) = self.module.types.get(index as usize) else { return self.err(UNKNOWN_TYPE) };
                if !ty.params.is_empty() || ty.results.len() > 1 {
                    self.require(WasmFeatures::MULTI_VALUE, "multi-value")?;
                }
                Ok((ty.params.clone(), ty.results.clone()))
            }
        }
    }

    // ---------------- Control flow ----------------

    fn enter_block(&mut self, kind: BlockKind) -> Result<(), Error> {
        let bt = BlockType::read(&mut self.it)?;
        let (params, results) = self.block_signature(bt)?;
        let cond = match kind {
            BlockKind::If => self.pop(ValType::I32)?,
            _ => 0,
        };
        let args = self.pop_values(&params)?;
        for (ty, arg) in params.iter().zip(&args) {
            self.stack.push(StackValue { ty: Some(*ty), source: arg.source })?;
        }
        let height = self.stack.height() - params.len();

        // Branches into the block merge with this path, so nothing may stay aliased to a
        // local that the block could overwrite.
        for index in self.stack.local_sourced(None) {
            self.materialize(index);
        }
        for index in height..self.stack.height() {
            self.materialize(index);
        }

        let dead = !self.live();
        let label = self.builder.new_label();
        let kind = match kind {
            BlockKind::Block => ControlKind::Block,
            BlockKind::Loop => {
                self.builder.pin_label(label);
                ControlKind::Loop
            }
            BlockKind::If => {
                let else_label = self.builder.new_label();
                self.builder.emit_br_cond(Opcode::BrIfNot, cond, else_label);
                ControlKind::If { else_label }
            }
        };
        self.control.push(ControlFrame { kind, params, results, height, label, unreachable: false, dead });
        self.builder.suppressed = !self.live();
        Ok(())
    }

    /// Pops the frame's results at a fallthrough point and checks nothing else remains.
    fn fallthrough(&mut self) -> Result<Vec<Operand>, Error> {
        let (results, height) = {
            let frame = self.frame();
            (frame.results.clone(), frame.height)
        };
        let values = self.pop_values(&results)?;
        if self.stack.height() != height {
            return self.err("type mismatch");
        }
        Ok(values)
    }

    fn translate_else(&mut self) -> Result<(), Error> {
        let ControlKind::If { else_label } = self.frame().kind else {
            return self.err("else without matching if");
        };
        let values = self.fallthrough()?;
        let (height, label) = (self.frame().height, self.frame().label);
        self.emit_branch_copies(height, &values);
        self.builder.emit_br(label);
        self.builder.pin_label(else_label);

        let last = self.control.len() - 1;
        let frame = &mut self.control[last];
        frame.kind = ControlKind::Else;
        frame.unreachable = false;
        let params = frame.params.clone();
        self.stack.truncate(height);
        for ty in params {
            self.stack.push(StackValue::stack(Some(ty)))?;
        }
        self.builder.suppressed = !self.live();
        Ok(())
    }

    fn translate_end(&mut self) -> Result<(), Error> {
        let values = self.fallthrough()?;
        let frame = self.frame().clone();
        if frame.kind == ControlKind::Function {
            self.emit_return(&values);
            self.control.pop();
            return Ok(());
        }
        self.emit_branch_copies(frame.height, &values);
        if let ControlKind::If { else_label } = frame.kind {
            if frame.params != frame.results {
                return self.err("type mismatch");
            }
            self.builder.pin_label(else_label);
        }
        if !self.builder.is_pinned(frame.label) {
            self.builder.pin_label(frame.label);
        }
        self.control.pop();
        self.stack.truncate(frame.height);
        for ty in &frame.results {
            self.stack.push(StackValue::stack(Some(*ty)))?;
        }
        Ok(())
    }

    fn translate_br(&mut self, depth: u32) -> Result<(), Error> {
        let target = self.branch_target(depth)?;
        let types = self.control[target].branch_types().to_vec();
        let values = self.pop_values(&types)?;
        if target == 0 {
            self.emit_return(&values);
        } else {
            let (height, label) = (self.control[target].height, self.control[target].label);
            self.emit_branch_copies(height, &values);
            self.builder.emit_br(label);
        }
        self.set_unreachable();
        Ok(())
    }

    fn translate_br_if(&mut self, depth: u32) -> Result<(), Error> {
        let cond = self.pop(ValType::I32)?;
        let target = self.branch_target(depth)?;
        let types = self.control[target].branch_types().to_vec();
        let values = self.pop_values(&types)?;
        for (ty, value) in types.iter().zip(&values) {
            self.stack.push(StackValue { ty: Some(*ty), source: value.source })?;
        }

        let (height, label) = (self.control[target].height, self.control[target].label);
        if target != 0 && !self.needs_copies(height, &values) {
            self.builder.emit_br_cond(Opcode::BrIf, cond, label);
            return Ok(());
        }
        let skip = self.builder.new_label();
        self.builder.emit_br_cond(Opcode::BrIfNot, cond, skip);
        if target == 0 {
            self.emit_return(&values);
        } else {
            self.emit_branch_copies(height, &values);
            self.builder.emit_br(label);
        }
        self.builder.pin_label(skip);
        Ok(())
    }

    fn translate_br_table(&mut self) -> Result<(), Error> {
        let index = self.pop(ValType::I32)?;
        let count = self.it.read_u32()?;
        let mut depths = Vec::with_capacity(count as usize + 1);
        for _ in 0..=count {
            depths.push(self.it.read_u32()?);
        }
        let default = self.branch_target(depths[depths.len() - 1])?;
        let arity = self.control[default].branch_types().len();
        for &depth in &depths {
            let target = self.branch_target(depth)?;
            let types = self.control[target].branch_types().to_vec();
            if types.len() != arity {
                return self.err("type mismatch");
            }
            let values = self.pop_values(&types)?;
            for value in values {
                self.stack.push(StackValue { ty: value.ty, source: value.source })?;
            }
        }

        if self.live() {
            let top = self.stack.height() - arity;
            let values: Vec<Operand> = (top..self.stack.height())
                .map(|i| {
                    let v = self.stack.get(i);
                    Operand { ty: v.ty, source: v.source, reg: self.stack.reg_of(i), index: i }
                })
                .collect();
            let mut labels = Vec::with_capacity(depths.len());
            let mut stubs: Vec<(usize, builder::LabelId)> = Vec::new();
            for &depth in &depths {
                let target = self.control.len() - 1 - depth as usize;
                let (height, direct) = (self.control[target].height, self.control[target].label);
                if target != 0 && !self.needs_copies(height, &values) {
                    labels.push(direct);
                    continue;
                }
                let existing = stubs.iter().find(|(t, _)| *t == target).map(|(_, stub)| *stub);
                let label = match existing {
                    Some(stub) => stub,
                    None => {
                        let stub = self.builder.new_label();
                        stubs.push((target, stub));
                        stub
                    }
                };
                labels.push(label);
            }
            self.builder.emit_br_table(index, &labels);
            for (target, stub) in stubs {
                self.builder.pin_label(stub);
                if target == 0 {
                    self.emit_return(&values);
                } else {
                    let (height, label) = (self.control[target].height, self.control[target].label);
                    self.emit_branch_copies(height, &values);
                    self.builder.emit_br(label);
                }
            }
        }
        self.set_unreachable();
        Ok(())
    }

    // ---------------- Calls ----------------

    fn translate_call(&mut self) -> Result<(), Error> {
        let index = self.it.read_u32()?;
        let (Some(ty), Some(callee)) =
            (self.module.func_type(index), self.instance.functions.get(index as usize))
        else {
            return self.err(UNKNOWN_FUNC);
        };
        let (ty, callee) = (ty.clone(), *callee);
        let base = self.pop_args(&ty.params)?;
        let header = frame_header_size(&ty);
        self.stack.reserve(base + header)?;
        let sp_addend = self.stack.slot_reg(base) as u32 + header as u32;
        self.builder.emit(Opcode::Call, &[with_high32(callee.index() as u64, sp_addend)]);
        self.push_results(&ty.results)
    }

    /// Reads the type and table immediates of an indirect call.
    fn indirect_target(&mut self) -> Result<(crate::types::FuncType, u64, u64), Error> {
        let type_index = self.it.read_u32()?;
        let table_index = self.it.read_u32()?;
        let (element, table) = self.table(table_index)?;
        if element != RefType::FuncRef {
            return self.err("type mismatch");
        }
        let (Some(ty), Some(type_id)) =
            (self.module.types.get(type_index as usize), self.instance.type_ids.get(type_index as usize))
        else {
            return self.err(UNKNOWN_TYPE);
        };
        Ok((ty.clone(), table, *type_id as u64))
    }

    fn translate_call_indirect(&mut self) -> Result<(), Error> {
        let (ty, table, type_id) = self.indirect_target()?;
        let index = self.pop(ValType::I32)?;
        let base = self.pop_args(&ty.params)?;
        let header = frame_header_size(&ty);
        self.stack.reserve(base + header)?;
        let sp_addend = self.stack.slot_reg(base) as u32 + header as u32;
        self.builder.emit(
            Opcode::CallIndirect,
            &[table | type_id << 32, with_high32(pack(&[index]), sp_addend)],
        );
        self.push_results(&ty.results)
    }

    fn translate_return_call(&mut self) -> Result<(), Error> {
        self.require(WasmFeatures::TAIL_CALL, "tail call")?;
        let index = self.it.read_u32()?;
        let (Some(ty), Some(callee)) =
            (self.module.func_type(index), self.instance.functions.get(index as usize))
        else {
            return self.err(UNKNOWN_FUNC);
        };
        let (ty, callee) = (ty.clone(), *callee);
        if ty.results != self.results {
            return self.err("type mismatch");
        }
        let base = self.pop_args(&ty.params)?;
        // A host callee writes its results above the arguments.
        self.stack.reserve(base + frame_header_size(&ty))?;
        let arg_base = self.stack.slot_reg(base) as u16 as u64;
        let caller_header = self.layout.header.size() as u64;
        self.builder.emit(Opcode::ReturnCall, &[callee.index() as u64 | arg_base << 32 | caller_header << 48]);
        self.set_unreachable();
        Ok(())
    }

    fn translate_return_call_indirect(&mut self) -> Result<(), Error> {
        self.require(WasmFeatures::TAIL_CALL, "tail call")?;
        let (ty, table, type_id) = self.indirect_target()?;
        if ty.results != self.results {
            return self.err("type mismatch");
        }
        let index = self.pop(ValType::I32)?;
        let base = self.pop_args(&ty.params)?;
        self.stack.reserve(base + frame_header_size(&ty))?;
        let arg_base = self.stack.slot_reg(base);
        let caller_header = self.layout.header.size() as u32;
        self.builder.emit(
            Opcode::ReturnCallIndirect,
            &[table | type_id << 32, with_high32(pack(&[index, arg_base]), caller_header)],
        );
        self.set_unreachable();
        Ok(())
    }

    // ---------------- Operators ----------------

    fn translate_op(&mut self, opcode: u8) -> Result<(), Error> {
        use ValType::*;
        match opcode {
            0x00 => {
                self.builder.emit(Opcode::Unreachable, &[]);
                self.set_unreachable();
            }
            0x01 => {}
            0x02 => self.enter_block(BlockKind::Block)?,
            0x03 => self.enter_block(BlockKind::Loop)?,
            0x04 => self.enter_block(BlockKind::If)?,
            0x05 => self.translate_else()?,
            0x0B => self.translate_end()?,
            0x0C => {
                let depth = self.it.read_u32()?;
                self.translate_br(depth)?;
            }
            0x0D => {
                let depth = self.it.read_u32()?;
                self.translate_br_if(depth)?;
            }
            0x0E => self.translate_br_table()?,
            0x0F => {
                let results = self.results.clone();
                let values = self.pop_values(&results)?;
                self.emit_return(&values);
                self.set_unreachable();
            }
            0x10 => self.translate_call()?,
            0x11 => self.translate_call_indirect()?,
            0x12 => self.translate_return_call()?,
            0x13 => self.translate_return_call_indirect()?,
            0x1A => {
                self.pop_value(None)?;
            }
            0x1B => {
                let cond = self.pop(I32)?;
                let b = self.pop_value(None)?;
                let a = self.pop_value(None)?;
                let ty = match (a.ty, b.ty) {
                    (Some(x), Some(y)) if x != y => return self.err("type mismatch"),
                    (x, y) => x.or(y),
                };
                if ty.is_some_and(|t| !t.is_num()) {
                    return self.err("type mismatch");
                }
                let index = self.stack.push(StackValue::stack(ty))?;
                let dst = self.stack.slot_reg(index);
                self.builder.emit(Opcode::Select, &[pack(&[dst, a.reg, b.reg, cond])]);
            }
            0x1C => {
                self.require(WasmFeatures::REFERENCE_TYPES, "reference types")?;
                if self.it.read_u32()? != 1 {
                    return self.err("invalid result arity");
                }
                let ty = ValType::read(&mut self.it)?;
                let cond = self.pop(I32)?;
                let b = self.pop(ty)?;
                let a = self.pop(ty)?;
                let dst = self.push(ty)?;
                self.builder.emit(Opcode::Select, &[pack(&[dst, a, b, cond])]);
            }
            0x20 => {
                let local = self.it.read_u32()?;
                let ty = self.local_type(local)?;
                self.stack.push(StackValue { ty: Some(ty), source: ValueSource::Local(local) })?;
            }
            0x21 => {
                let local = self.it.read_u32()?;
                let ty = self.local_type(local)?;
                let src = self.pop(ty)?;
                self.set_local(local, src);
            }
            0x22 => {
                let local = self.it.read_u32()?;
                let ty = self.local_type(local)?;
                let src = self.pop(ty)?;
                self.set_local(local, src);
                self.stack.push(StackValue { ty: Some(ty), source: ValueSource::Local(local) })?;
            }
            0x23 => {
                let index = self.it.read_u32()?;
                let (ty, handle) = self.global(index)?;
                let dst = self.push(ty.content)?;
                self.builder.emit(Opcode::GlobalGet, &[with_high32(pack(&[dst]), handle as u32)]);
            }
            0x24 => {
                let index = self.it.read_u32()?;
                let (ty, handle) = self.global(index)?;
                if !ty.mutable {
                    return self.err("global is immutable");
                }
                let src = self.pop(ty.content)?;
                self.builder.emit(Opcode::GlobalSet, &[with_high32(pack(&[src]), handle as u32)]);
            }
            0x25 => {
                let (element, table) = self.table_operand()?;
                let index = self.pop(I32)?;
                let dst = self.push(element.into())?;
                self.builder.emit(Opcode::TableGet, &[with_high32(pack(&[dst, index]), table as u32)]);
            }
            0x26 => {
                let (element, table) = self.table_operand()?;
                let value = self.pop(element.into())?;
                let index = self.pop(I32)?;
                self.builder.emit(Opcode::TableSet, &[with_high32(pack(&[index, value]), table as u32)]);
            }
            0x28..=0x35 => {
                let (ty, natural) = match opcode {
                    0x28 => (I32, 2),
                    0x29 => (I64, 3),
                    0x2A => (F32, 2),
                    0x2B => (F64, 3),
                    0x2C | 0x2D => (I32, 0),
                    0x2E | 0x2F => (I32, 1),
                    0x30 | 0x31 => (I64, 0),
                    0x32 | 0x33 => (I64, 1),
                    _ => (I64, 2),
                };
                let offset = self.memarg(natural)?;
                let addr = self.pop(I32)?;
                let dst = self.push(ty)?;
                let op = Opcode::ALL[Opcode::I32Load as usize + (opcode - 0x28) as usize];
                self.builder.emit(op, &[pack(&[dst, addr]), offset]);
            }
            0x36..=0x3E => {
                let (ty, natural) = match opcode {
                    0x36 => (I32, 2),
                    0x37 => (I64, 3),
                    0x38 => (F32, 2),
                    0x39 => (F64, 3),
                    0x3A => (I32, 0),
                    0x3B => (I32, 1),
                    0x3C => (I64, 0),
                    0x3D => (I64, 1),
                    _ => (I64, 2),
                };
                let offset = self.memarg(natural)?;
                let value = self.pop(ty)?;
                let addr = self.pop(I32)?;
                let op = Opcode::ALL[Opcode::I32Store as usize + (opcode - 0x36) as usize];
                self.builder.emit(op, &[pack(&[addr, value]), offset]);
            }
            0x3F => {
                self.read_zero_byte()?;
                self.check_memory()?;
                let dst = self.push(I32)?;
                self.builder.emit(Opcode::MemorySize, &[pack(&[dst])]);
            }
            0x40 => {
                self.read_zero_byte()?;
                self.check_memory()?;
                let delta = self.pop(I32)?;
                let dst = self.push(I32)?;
                self.builder.emit(Opcode::MemoryGrow, &[pack(&[dst, delta])]);
            }
            0x41 => {
                let v = self.it.read_i32()?;
                self.push_const(UntypedValue::from_i32(v), I32)?;
            }
            0x42 => {
                let v = self.it.read_i64()?;
                self.push_const(UntypedValue::from_i64(v), I64)?;
            }
            0x43 => {
                let bits = self.it.read_f32_bits()?;
                self.push_const(UntypedValue(bits as u64), F32)?;
            }
            0x44 => {
                let bits = self.it.read_f64_bits()?;
                self.push_const(UntypedValue(bits), F64)?;
            }
            0x45..=0xBB => {
                let op = Opcode::ALL[Opcode::I32Eqz as usize + (opcode - 0x45) as usize];
                self.numeric(opcode, op)?;
            }
            0xBC => self.reinterpret(F32, I32)?,
            0xBD => self.reinterpret(F64, I64)?,
            0xBE => self.reinterpret(I32, F32)?,
            0xBF => self.reinterpret(I64, F64)?,
            0xC0..=0xC4 => {
                self.require(WasmFeatures::SIGN_EXTENSION, "sign extension")?;
                let op = Opcode::ALL[Opcode::I32Extend8S as usize + (opcode - 0xC0) as usize];
                self.numeric(opcode, op)?;
            }
            0xD0 => {
                self.require(WasmFeatures::REFERENCE_TYPES, "reference types")?;
                let ty = RefType::read(&mut self.it)?;
                self.push_const(UntypedValue::null_ref(), ty.into())?;
            }
            0xD1 => {
                self.require(WasmFeatures::REFERENCE_TYPES, "reference types")?;
                let value = self.pop_value(None)?;
                if value.ty.is_some_and(|t| !t.is_ref()) {
                    return self.err("type mismatch");
                }
                let dst = self.push(I32)?;
                self.builder.emit(Opcode::RefIsNull, &[pack(&[dst, value.reg])]);
            }
            0xD2 => {
                self.require(WasmFeatures::REFERENCE_TYPES, "reference types")?;
                let index = self.it.read_u32()?;
                let Some(func) = self.instance.functions.get(index as usize).copied() else {
                    return self.err(UNKNOWN_FUNC);
                };
                if !self.module.declared_functions.contains(&index) {
                    return self.err(UNDECLARED_FUNC_REF);
                }
                let dst = self.push(FuncRef)?;
                self.builder.emit(Opcode::RefFunc, &[with_high32(pack(&[dst]), func.index())]);
            }
            0xFC => self.translate_misc()?,
            0xFD => return self.err("SIMD is not supported"),
            0xFE => {
                self.require(WasmFeatures::THREADS, "threads")?;
                self.translate_atomic()?;
            }
            _ => return self.err(format!("illegal opcode {opcode:#04x}")),
        }
        Ok(())
    }

    fn table_operand(&mut self) -> Result<(RefType, u64), Error> {
        self.require(WasmFeatures::REFERENCE_TYPES, "reference types")?;
        let index = self.it.read_u32()?;
        self.table(index)
    }

    fn numeric(&mut self, opcode: u8, op: Opcode) -> Result<(), Error> {
        use Arity::*;
        use ValType::*;
        let (arity, input, output) = match opcode {
            0x45 => (Unary, I32, I32),
            0x46..=0x4F => (Binary, I32, I32),
            0x50 => (Unary, I64, I32),
            0x51..=0x5A => (Binary, I64, I32),
            0x5B..=0x60 => (Binary, F32, I32),
            0x61..=0x66 => (Binary, F64, I32),
            0x67..=0x69 => (Unary, I32, I32),
            0x6A..=0x78 => (Binary, I32, I32),
            0x79..=0x7B => (Unary, I64, I64),
            0x7C..=0x8A => (Binary, I64, I64),
            0x8B..=0x91 => (Unary, F32, F32),
            0x92..=0x98 => (Binary, F32, F32),
            0x99..=0x9F => (Unary, F64, F64),
            0xA0..=0xA6 => (Binary, F64, F64),
            0xA7 => (Unary, I64, I32),
            0xA8 | 0xA9 => (Unary, F32, I32),
            0xAA | 0xAB => (Unary, F64, I32),
            0xAC | 0xAD => (Unary, I32, I64),
            0xAE | 0xAF => (Unary, F32, I64),
            0xB0 | 0xB1 => (Unary, F64, I64),
            0xB2 | 0xB3 => (Unary, I32, F32),
            0xB4 | 0xB5 => (Unary, I64, F32),
            0xB6 => (Unary, F64, F32),
            0xB7 | 0xB8 => (Unary, I32, F64),
            0xB9 | 0xBA => (Unary, I64, F64),
            0xBB => (Unary, F32, F64),
            0xC0 | 0xC1 => (Unary, I32, I32),
            _ => (Unary, I64, I64),
        };
        match arity {
            Unary => self.unary(op, input, output),
            Binary => self.binary(op, input, output),
        }
    }

    /// The `0xFC` prefix: saturating truncation, bulk memory and table operations.
    fn translate_misc(&mut self) -> Result<(), Error> {
        use ValType::*;
        let sub = self.it.read_u32()?;
        match sub {
            0..=7 => {
                self.require(WasmFeatures::SATURATING_FLOAT_TO_INT, "saturating float-to-int")?;
                let op = Opcode::ALL[Opcode::I32TruncSatF32S as usize + sub as usize];
                let input = if sub % 4 < 2 { F32 } else { F64 };
                let output = if sub < 4 { I32 } else { I64 };
                self.unary(op, input, output)?;
            }
            8 => {
                self.require(WasmFeatures::BULK_MEMORY, "bulk memory")?;
                let segment = self.it.read_u32()?;
                self.read_zero_byte()?;
                self.check_memory()?;
                let data = self.data(segment)?;
                let n = self.pop(I32)?;
                let s = self.pop(I32)?;
                let d = self.pop(I32)?;
                self.builder.emit(Opcode::MemoryInit, &[pack(&[d, s, n]), data]);
            }
            9 => {
                self.require(WasmFeatures::BULK_MEMORY, "bulk memory")?;
                let segment = self.it.read_u32()?;
                let data = self.data(segment)?;
                self.builder.emit(Opcode::DataDrop, &[data]);
            }
            10 => {
                self.require(WasmFeatures::BULK_MEMORY, "bulk memory")?;
                self.read_zero_byte()?;
                self.read_zero_byte()?;
                self.check_memory()?;
                let n = self.pop(I32)?;
                let s = self.pop(I32)?;
                let d = self.pop(I32)?;
                self.builder.emit(Opcode::MemoryCopy, &[pack(&[d, s, n])]);
            }
            11 => {
                self.require(WasmFeatures::BULK_MEMORY, "bulk memory")?;
                self.read_zero_byte()?;
                self.check_memory()?;
                let n = self.pop(I32)?;
                let value = self.pop(I32)?;
                let d = self.pop(I32)?;
                self.builder.emit(Opcode::MemoryFill, &[pack(&[d, value, n])]);
            }
            12 => {
                self.require(WasmFeatures::BULK_MEMORY, "bulk memory")?;
                let segment = self.it.read_u32()?;
                let table_index = self.it.read_u32()?;
                let (segment_ty, elem) = self.element(segment)?;
                let (table_ty, table) = self.table(table_index)?;
                if segment_ty != table_ty {
                    return self.err("type mismatch");
                }
                let n = self.pop(I32)?;
                let s = self.pop(I32)?;
                let d = self.pop(I32)?;
                self.builder.emit(Opcode::TableInit, &[pack(&[d, s, n]), table | elem << 32]);
            }
            13 => {
                self.require(WasmFeatures::BULK_MEMORY, "bulk memory")?;
                let segment = self.it.read_u32()?;
                let (_, elem) = self.element(segment)?;
                self.builder.emit(Opcode::ElemDrop, &[elem]);
            }
            14 => {
                self.require(WasmFeatures::BULK_MEMORY, "bulk memory")?;
                let dst_index = self.it.read_u32()?;
                let src_index = self.it.read_u32()?;
                let (dst_ty, dst) = self.table(dst_index)?;
                let (src_ty, src) = self.table(src_index)?;
                if dst_ty != src_ty {
                    return self.err("type mismatch");
                }
                let n = self.pop(I32)?;
                let s = self.pop(I32)?;
                let d = self.pop(I32)?;
                self.builder.emit(Opcode::TableCopy, &[pack(&[d, s, n]), dst | src << 32]);
            }
            15 => {
                let (element, table) = self.table_operand()?;
                let n = self.pop(I32)?;
                let init = self.pop(element.into())?;
                let dst = self.push(I32)?;
                self.builder.emit(Opcode::TableGrow, &[pack(&[dst, init, n]), table]);
            }
            16 => {
                let (_, table) = self.table_operand()?;
                let dst = self.push(I32)?;
                self.builder.emit(Opcode::TableSize, &[with_high32(pack(&[dst]), table as u32)]);
            }
            17 => {
                let (element, table) = self.table_operand()?;
                let n = self.pop(I32)?;
                let value = self.pop(element.into())?;
                let d = self.pop(I32)?;
                self.builder.emit(Opcode::TableFill, &[pack(&[d, value, n]), table]);
            }
            _ => return self.err(format!("illegal opcode 0xfc {sub}")),
        }
        Ok(())
    }

    /// The `0xFE` prefix: shared-memory atomics.
    fn translate_atomic(&mut self) -> Result<(), Error> {
        use ValType::*;
        const ACCESS: [(ValType, u32); 7] = [(I32, 4), (I64, 8), (I32, 1), (I32, 2), (I64, 1), (I64, 2), (I64, 4)];
        let sub = self.it.read_u32()?;
        match sub {
            0x00 => {
                let imm = self.atomic_memarg(4)?;
                let count = self.pop(I32)?;
                let addr = self.pop(I32)?;
                let dst = self.push(I32)?;
                self.builder.emit(Opcode::AtomicNotify, &[pack(&[dst, addr, count]), imm]);
            }
            0x01 | 0x02 => {
                let (ty, width, op) = if sub == 1 { (I32, 4, Opcode::AtomicWait32) } else { (I64, 8, Opcode::AtomicWait64) };
                let imm = self.atomic_memarg(width)?;
                let timeout = self.pop(I64)?;
                let expected = self.pop(ty)?;
                let addr = self.pop(I32)?;
                let dst = self.push(I32)?;
                self.builder.emit(op, &[pack(&[dst, addr, expected, timeout]), imm]);
            }
            0x03 => self.read_zero_byte()?,
            0x10..=0x16 => {
                let (ty, width) = ACCESS[(sub - 0x10) as usize];
                let imm = self.atomic_memarg(width)?;
                let addr = self.pop(I32)?;
                let dst = self.push(ty)?;
                self.builder.emit(Opcode::AtomicLoad, &[pack(&[dst, addr]), imm]);
            }
            0x17..=0x1D => {
                let (ty, width) = ACCESS[(sub - 0x17) as usize];
                let imm = self.atomic_memarg(width)?;
                let value = self.pop(ty)?;
                let addr = self.pop(I32)?;
                self.builder.emit(Opcode::AtomicStore, &[pack(&[addr, value]), imm]);
            }
            0x1E..=0x47 => {
                let group = (sub - 0x1E) / 7;
                let (ty, width) = ACCESS[((sub - 0x1E) % 7) as usize];
                let Some(rmw) = RmwOp::from_u8(group as u8) else {
                    return self.err(format!("illegal opcode 0xfe {sub:#x}"));
                };
                let imm = self.atomic_memarg(width)?;
                let value = self.pop(ty)?;
                let addr = self.pop(I32)?;
                let dst = self.push(ty)?;
                self.builder.emit(Opcode::AtomicRmw, &[pack(&[dst, addr, value, rmw as VReg]), imm]);
            }
            0x48..=0x4E => {
                let (ty, width) = ACCESS[(sub - 0x48) as usize];
                let imm = self.atomic_memarg(width)?;
                let replacement = self.pop(ty)?;
                let expected = self.pop(ty)?;
                let addr = self.pop(I32)?;
                let dst = self.push(ty)?;
                self.builder.emit(Opcode::AtomicCmpxchg, &[pack(&[dst, addr, expected, replacement]), imm]);
            }
            _ => return self.err(format!("illegal opcode 0xfe {sub:#x}")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_opcodes_line_up_with_the_binary_encoding() {
        let at = |base: Opcode, from: u8, opcode: u8| Opcode::ALL[base as usize + (opcode - from) as usize];
        assert_eq!(at(Opcode::I32Eqz, 0x45, 0x50), Opcode::I64Eqz);
        assert_eq!(at(Opcode::I32Eqz, 0x45, 0x6A), Opcode::I32Add);
        assert_eq!(at(Opcode::I32Eqz, 0x45, 0x7C), Opcode::I64Add);
        assert_eq!(at(Opcode::I32Eqz, 0x45, 0x98), Opcode::F32Copysign);
        assert_eq!(at(Opcode::I32Eqz, 0x45, 0xA7), Opcode::I32WrapI64);
        assert_eq!(at(Opcode::I32Eqz, 0x45, 0xBB), Opcode::F64PromoteF32);
        assert_eq!(at(Opcode::I32Extend8S, 0xC0, 0xC4), Opcode::I64Extend32S);
        assert_eq!(at(Opcode::I32Load, 0x28, 0x35), Opcode::I64Load32U);
        assert_eq!(at(Opcode::I32Store, 0x36, 0x3E), Opcode::I64Store32);
        assert_eq!(Opcode::ALL[Opcode::I32TruncSatF32S as usize + 7], Opcode::I64TruncSatF64U);
    }
}
