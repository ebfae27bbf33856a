use nohash_hasher::IntMap;

use crate::error::TranslationError;
use crate::isa::{pack, with_high32, Opcode};
use crate::layout::VReg;
use crate::value::UntypedValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct LabelId(usize);

#[derive(Debug, Clone, Copy)]
enum PatchKind {
    /// The whole word is the offset.
    Full,
    /// The offset lives in the high 32 bits; the low half holds registers.
    High32,
}

#[derive(Debug, Clone, Copy)]
struct LabelUser {
    /// Offset of the branching opcode; branch offsets are relative to it.
    source: usize,
    slot: usize,
    kind: PatchKind,
}

#[derive(Debug)]
enum LabelEntry {
    Unpinned { users: Vec<LabelUser> },
    Pinned { offset: usize },
}

/// Growable code buffer with forward-label patching and the function's constant pool.
pub(crate) struct InstructionBuilder {
    code: Vec<u64>,
    labels: Vec<LabelEntry>,
    constants: Vec<UntypedValue>,
    const_cache: IntMap<u64, u16>,
    const_capacity: usize,
    wasm_map: Vec<(u32, u32)>,
    /// Set while translating unreachable code.
    pub(crate) suppressed: bool,
}

impl InstructionBuilder {
    pub fn new(const_capacity: usize) -> Self {
        Self {
            code: Vec::new(),
            labels: Vec::new(),
            constants: Vec::new(),
            const_cache: IntMap::default(),
            const_capacity,
            wasm_map: Vec::new(),
            suppressed: false,
        }
    }

    pub fn pc(&self) -> usize { self.code.len() }

    pub fn record_wasm_offset(&mut self, offset: usize) {
        if !self.suppressed {
            let pc = self.pc() as u32;
            self.wasm_map.push((offset as u32, pc));
        }
    }

    pub fn emit(&mut self, op: Opcode, immediates: &[u64]) {
        if self.suppressed { return; }
        self.code.push(op.word());
        self.code.extend_from_slice(immediates);
    }

    pub fn emit_copy(&mut self, dst: VReg, src: VReg) {
        if dst != src {
            self.emit(Opcode::Copy, &[pack(&[dst, src])]);
        }
    }

    pub fn new_label(&mut self) -> LabelId {
        self.labels.push(LabelEntry::Unpinned { users: Vec::new() });
        LabelId(self.labels.len() - 1)
    }

    pub fn is_pinned(&self, label: LabelId) -> bool {
        matches!(self.labels[label.0], LabelEntry::Pinned { .. })
    }

    /// Binds `label` to the current position and patches every waiting branch.
    pub fn pin_label(&mut self, label: LabelId) {
        let offset = self.code.len();
        let entry = std::mem::replace(&mut self.labels[label.0], LabelEntry::Pinned { offset });
        if let LabelEntry::Unpinned { users } = entry {
            for user in users {
                self.patch(user, offset);
            }
        }
    }

    fn patch(&mut self, user: LabelUser, target: usize) {
        let relative = target as i64 - user.source as i64;
        let word = &mut self.code[user.slot];
        *word = match user.kind {
            PatchKind::Full => relative as u64,
            PatchKind::High32 => with_high32(*word, relative as i32 as u32),
        };
    }

    fn refer(&mut self, label: LabelId, source: usize, slot: usize, kind: PatchKind) {
        let user = LabelUser { source, slot, kind };
        match &mut self.labels[label.0] {
            LabelEntry::Pinned { offset } => {
                let target = *offset;
                self.patch(user, target);
            }
            LabelEntry::Unpinned { users } => users.push(user),
        }
    }

    pub fn emit_br(&mut self, label: LabelId) {
        if self.suppressed { return; }
        let source = self.code.len();
        self.code.extend_from_slice(&[Opcode::Br.word(), 0]);
        self.refer(label, source, source + 1, PatchKind::Full);
    }

    /// `BrIf` or `BrIfNot` on `cond`.
    pub fn emit_br_cond(&mut self, op: Opcode, cond: VReg, label: LabelId) {
        if self.suppressed { return; }
        let source = self.code.len();
        self.code.extend_from_slice(&[op.word(), pack(&[cond])]);
        self.refer(label, source, source + 1, PatchKind::High32);
    }

    /// The last target is the default.
    pub fn emit_br_table(&mut self, index: VReg, targets: &[LabelId]) {
        if self.suppressed { return; }
        let source = self.code.len();
        self.code.push(Opcode::BrTable.word());
        self.code.push(with_high32(pack(&[index]), targets.len() as u32));
        for target in targets {
            let slot = self.code.len();
            self.code.push(0);
            self.refer(*target, source, slot, PatchKind::Full);
        }
    }

    /// Pool slot for `bits`, or `None` once the pool is full.
    pub fn intern_const(&mut self, bits: u64) -> Option<u16> {
        if let Some(slot) = self.const_cache.get(&bits) {
            return Some(*slot);
        }
        if self.constants.len() >= self.const_capacity {
            return None;
        }
        let slot = self.constants.len() as u16;
        self.constants.push(UntypedValue(bits));
        self.const_cache.insert(bits, slot);
        Some(slot)
    }

    /// Fails if any label still has branches waiting on it.
    pub fn finalize(self) -> Result<FinishedCode, TranslationError> {
        for (id, entry) in self.labels.iter().enumerate() {
            if let LabelEntry::Unpinned { users } = entry {
                if !users.is_empty() {
                    return Err(TranslationError::DanglingLabel(id, users.len()));
                }
            }
        }
        Ok(FinishedCode {
            code: self.code.into_boxed_slice(),
            constants: self.constants,
            wasm_map: self.wasm_map.into_boxed_slice(),
        })
    }
}

pub(crate) struct FinishedCode {
    pub code: Box<[u64]>,
    pub constants: Vec<UntypedValue>,
    pub wasm_map: Box<[(u32, u32)]>,
}
