use super::code::CodeBuilder;
use smallvec::SmallVec;

/// Deferred resolution of jump-instruction operands.
///
/// A fixup is created from the offset of the instruction AFTER the jump (which
/// is what [`CodeBuilder::add_instruction`] returns); all jump opcodes carry a
/// two-byte operand, so the operand itself sits two bytes back. Several jumps
/// may be added to one fixup and resolved together, e.g. the N+1 "to end"
/// jumps of a try statement.
///
/// Relative fixups store the delta from the byte after the operand (the
/// instruction is fully fetched before the jump is taken); absolute fixups
/// store the target offset verbatim. Resolution consumes the fixup, and the
/// builder tracks every registered site, so a record can neither be resolved
/// twice nor silently left behind.
///
/// General usage:
/// ```ignore
/// let fixup = JumpFixup::at(builder, builder.add_instruction(OpCode::JumpForward, 0xFFFF, span));
/// // ... emit a pile of byte code ...
/// fixup.fixup(builder, builder.current_offset());
/// ```
#[derive(Debug, Default)]
pub struct JumpFixup {
    operand_offsets: SmallVec<[usize; 2]>,
}

impl JumpFixup {
    /// An empty fixup; sites are attached later with [`JumpFixup::add`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A fixup with one site already attached.
    pub fn at(builder: &mut CodeBuilder, end_of_instruction: usize) -> Self {
        let mut fixup = Self::new();
        fixup.add(builder, end_of_instruction);
        fixup
    }

    /// Attach another jump site; all sites resolve to the same target.
    pub fn add(&mut self, builder: &mut CodeBuilder, end_of_instruction: usize) {
        let operand_offset = end_of_instruction - 2;
        builder.note_pending(operand_offset);
        self.operand_offsets.push(operand_offset);
    }

    pub fn is_empty(&self) -> bool {
        self.operand_offsets.is_empty()
    }

    /// Resolve as a relative jump: operand = `jump_point - (site + 2)`.
    pub fn fixup(self, builder: &mut CodeBuilder, jump_point: usize) {
        for offset in self.operand_offsets {
            builder.patch_u16(offset, (jump_point - offset - 2) as u16);
        }
    }

    /// Resolve as an absolute jump: operand = `target`.
    pub fn fixup_absolute(self, builder: &mut CodeBuilder, target: usize) {
        for offset in self.operand_offsets {
            builder.patch_u16(offset, target as u16);
        }
    }
}
