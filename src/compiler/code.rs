use super::opcode::{CompareOp, OpCode};
use crate::error::{SiltError, SiltResult, Span};
use crate::vm::interner::intern;
use crate::vm::value::Value;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;

/// Identifies one lexical unit across the whole compilation, so deferred
/// actions can find their owning builder again after it has been nested into a
/// parent's constant pool.
pub type UnitId = u32;

/// A constant-pool slot while the unit is still being built. Nested units stay
/// mutable builders until the whole compilation is frozen.
#[derive(Debug, Clone)]
pub enum PoolEntry {
    Value(Value),
    Code(CodeBuilder),
}

/// Mutable counterpart of [`CodeObject`]; the emitter writes instructions and
/// tables into this and [`CodeBuilder::build`] freezes it.
#[derive(Debug, Clone)]
pub struct CodeBuilder {
    pub id: UnitId,
    pub name: String,
    pub qualname: String,
    pub file: String,

    pub code: Vec<u8>,
    /// One span per code byte, for line attribution in tracebacks.
    pub spans: Vec<Span>,

    pub constants: Vec<PoolEntry>,
    pub names: Vec<Arc<str>>,
    pub varnames: Vec<Arc<str>>,

    // Signature metadata
    pub arg_count: usize,
    pub has_varargs: bool,
    pub kwonly_count: usize,
    pub defaults: Vec<Value>,
    pub kw_defaults: FxHashMap<Arc<str>, Value>,

    pending_patches: FxHashSet<usize>,
    last_op: Option<OpCode>,
}

impl CodeBuilder {
    pub fn new(id: UnitId, name: impl Into<String>, file: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id,
            qualname: name.clone(),
            name,
            file: file.into(),
            code: Vec::new(),
            spans: Vec::new(),
            constants: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            arg_count: 0,
            has_varargs: false,
            kwonly_count: 0,
            defaults: Vec::new(),
            kw_defaults: FxHashMap::default(),
            pending_patches: FxHashSet::default(),
            last_op: None,
        }
    }

    fn write(&mut self, byte: u8, span: Span) {
        self.code.push(byte);
        self.spans.push(span);
    }

    fn write_u16(&mut self, value: u16, span: Span) {
        self.write((value >> 8) as u8, span);
        self.write((value & 0xFF) as u8, span);
    }

    /// Append an operand-less instruction. Returns the offset of the NEXT
    /// instruction, which is what jump fixups are anchored to.
    pub fn add_op(&mut self, op: OpCode, span: Span) -> usize {
        debug_assert_eq!(op.operand_width(), 0, "{op:?} takes an operand");
        self.write(op as u8, span);
        self.last_op = Some(op);
        self.code.len()
    }

    /// Append an instruction with its u16 operand. Returns the offset of the
    /// NEXT instruction.
    pub fn add_instruction(&mut self, op: OpCode, operand: u16, span: Span) -> usize {
        debug_assert_eq!(op.operand_width(), 2, "{op:?} takes no operand");
        self.write(op as u8, span);
        self.write_u16(operand, span);
        self.last_op = Some(op);
        self.code.len()
    }

    pub fn current_offset(&self) -> usize {
        self.code.len()
    }

    /// True when the most recent instruction was an explicit return; used to
    /// decide whether a function body needs the synthesized `return None`.
    pub fn ends_with_return(&self) -> bool {
        self.last_op == Some(OpCode::ReturnValue)
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | (self.code[offset + 1] as u16)
    }

    /// Register an operand offset as awaiting a jump fixup. `build` refuses to
    /// run while any of these remain.
    pub(crate) fn note_pending(&mut self, operand_offset: usize) {
        self.pending_patches.insert(operand_offset);
    }

    /// Overwrite a previously emitted operand; clears its pending mark.
    pub fn patch_u16(&mut self, operand_offset: usize, value: u16) {
        self.code[operand_offset] = (value >> 8) as u8;
        self.code[operand_offset + 1] = (value & 0xFF) as u8;
        self.pending_patches.remove(&operand_offset);
    }

    /// Add a boxed value to the constant pool, reusing an existing slot when an
    /// equal value is already pooled. Indices are first-use order and never
    /// renumbered.
    pub fn add_const(&mut self, value: Value) -> usize {
        for (i, entry) in self.constants.iter().enumerate() {
            if let PoolEntry::Value(existing) = entry {
                if *existing == value {
                    return i;
                }
            }
        }
        self.constants.push(PoolEntry::Value(value));
        self.constants.len() - 1
    }

    /// Add a nested unit to the constant pool. A same-named code constant is
    /// replaced in place, so redefining a function reuses its slot.
    pub fn add_code_const(&mut self, builder: CodeBuilder) -> usize {
        for (i, entry) in self.constants.iter_mut().enumerate() {
            if let PoolEntry::Code(existing) = entry {
                if existing.name == builder.name {
                    *existing = builder;
                    return i;
                }
            }
        }
        self.constants.push(PoolEntry::Code(builder));
        self.constants.len() - 1
    }

    /// Add a nested unit without name-based replacement. Synthesized units
    /// (comprehensions) share a display name, so each occurrence gets its own
    /// slot.
    pub fn push_code_const(&mut self, builder: CodeBuilder) -> usize {
        self.constants.push(PoolEntry::Code(builder));
        self.constants.len() - 1
    }

    pub fn add_name(&mut self, name: &str) -> usize {
        if let Some(i) = self.names.iter().position(|n| &**n == name) {
            return i;
        }
        self.names.push(intern(name));
        self.names.len() - 1
    }

    pub fn add_varname(&mut self, name: &str) -> usize {
        if let Some(i) = self.varnames.iter().position(|n| &**n == name) {
            return i;
        }
        self.varnames.push(intern(name));
        self.varnames.len() - 1
    }

    /// Locate a (possibly nested) unit by id. Deferred default actions use
    /// this to write computed values back after the builder has been nested
    /// into a parent pool.
    pub fn find_unit_mut(&mut self, id: UnitId) -> Option<&mut CodeBuilder> {
        if self.id == id {
            return Some(self);
        }
        for entry in &mut self.constants {
            if let PoolEntry::Code(child) = entry {
                if let Some(found) = child.find_unit_mut(id) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Freeze the unit and everything nested inside it. Failing here with an
    /// unresolved patch is a compiler defect, not a user error.
    pub fn build(self) -> SiltResult<Arc<CodeObject>> {
        if !self.pending_patches.is_empty() {
            let mut offsets: Vec<usize> = self.pending_patches.iter().copied().collect();
            offsets.sort_unstable();
            return Err(SiltError::internal(
                format!(
                    "unit '{}' finalized with {} unresolved jump operand(s) at {:?}",
                    self.qualname,
                    offsets.len(),
                    offsets
                ),
                Span::default(),
                &self.file,
            ));
        }

        let mut constants = Vec::with_capacity(self.constants.len());
        for entry in self.constants {
            constants.push(match entry {
                PoolEntry::Value(v) => v,
                PoolEntry::Code(builder) => Value::Code(builder.build()?),
            });
        }

        Ok(Arc::new(CodeObject {
            name: self.name,
            qualname: self.qualname,
            file: self.file,
            code: self.code.into_boxed_slice(),
            spans: self.spans.into_boxed_slice(),
            constants,
            names: self.names,
            varnames: self.varnames,
            arg_count: self.arg_count,
            has_varargs: self.has_varargs,
            kwonly_count: self.kwonly_count,
            defaults: self.defaults,
            kw_defaults: self.kw_defaults,
        }))
    }
}

/// Immutable compiled unit: instruction buffer plus constant/name/local tables
/// and the call-signature metadata the binder consumes. Nested units are
/// embedded as [`Value::Code`] constants of their defining parent.
#[derive(Debug)]
pub struct CodeObject {
    pub name: String,
    pub qualname: String,
    pub file: String,

    pub code: Box<[u8]>,
    pub spans: Box<[Span]>,

    pub constants: Vec<Value>,
    pub names: Vec<Arc<str>>,
    /// Local slots; parameters occupy the leading slots in declaration order
    /// (positional, then varargs, then keyword-only).
    pub varnames: Vec<Arc<str>>,

    pub arg_count: usize,
    pub has_varargs: bool,
    pub kwonly_count: usize,
    pub defaults: Vec<Value>,
    pub kw_defaults: FxHashMap<Arc<str>, Value>,
}

impl CodeObject {
    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | (self.code[offset + 1] as u16)
    }

    pub fn get_span(&self, offset: usize) -> Span {
        if offset < self.spans.len() {
            self.spans[offset]
        } else {
            Span::default()
        }
    }

    pub fn get_line(&self, offset: usize) -> usize {
        self.get_span(offset).start.line
    }

    /// Names of the keyword-only parameters, in declaration order.
    pub fn kwonly_names(&self) -> &[Arc<str>] {
        let start = self.arg_count + usize::from(self.has_varargs);
        &self.varnames[start..start + self.kwonly_count]
    }

    /// Render a human-readable listing, nested units included.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, 0);
        out
    }

    fn disassemble_into(&self, out: &mut String, indent: usize) {
        use std::fmt::Write;

        let prefix = "  ".repeat(indent);
        let _ = writeln!(out, "{}--- {} ---", prefix, self.qualname);
        let _ = writeln!(
            out,
            "{}{} bytes, {} constants, {} names, {} locals",
            prefix,
            self.code.len(),
            self.constants.len(),
            self.names.len(),
            self.varnames.len()
        );

        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(out, offset, &prefix);
        }

        for constant in &self.constants {
            if let Value::Code(code) = constant {
                code.disassemble_into(out, indent + 1);
            }
        }
    }

    fn format_constant(&self, idx: usize) -> String {
        match self.constants.get(idx) {
            Some(value) => value.to_string(),
            None => format!("???[{}]", idx),
        }
    }

    fn disassemble_instruction(&self, out: &mut String, offset: usize, prefix: &str) -> usize {
        use std::fmt::Write;

        let line = self.get_line(offset);
        if offset > 0 && line == self.get_line(offset - 1) {
            let _ = write!(out, "{}{:04}      ", prefix, offset);
        } else {
            let _ = write!(out, "{}{:04} {:4} ", prefix, offset, line);
        }

        let op = OpCode::from(self.code[offset]);
        let mnemonic = format!("{:?}", op).to_lowercase();
        if op.operand_width() == 0 {
            let _ = writeln!(out, "{}", mnemonic);
            return offset + 1;
        }

        let operand = self.read_u16(offset + 1);
        let detail = match op {
            OpCode::LoadConst => self.format_constant(operand as usize),
            OpCode::LoadName
            | OpCode::StoreName
            | OpCode::LoadGlobal
            | OpCode::StoreGlobal
            | OpCode::LoadAttr
            | OpCode::StoreAttr => self
                .names
                .get(operand as usize)
                .map(|n| n.to_string())
                .unwrap_or_else(|| format!("???[{}]", operand)),
            OpCode::LoadFast | OpCode::StoreFast | OpCode::LoadDeref | OpCode::StoreDeref => self
                .varnames
                .get(operand as usize)
                .map(|n| format!("[{}] {}", operand, n))
                .unwrap_or_else(|| format!("[{}]", operand)),
            OpCode::CompareOp => match CompareOp::from_operand(operand) {
                Some(cmp) => format!("{:?}", cmp).to_lowercase(),
                None => format!("???({})", operand),
            },
            _ if op.is_relative_jump() => format!("@{}", offset + 3 + operand as usize),
            OpCode::JumpAbsolute
            | OpCode::PopJumpIfFalse
            | OpCode::PopJumpIfTrue
            | OpCode::JumpIfFalseOrPop
            | OpCode::JumpIfTrueOrPop => format!("@{}", operand),
            _ => format!("({})", operand),
        };
        let _ = writeln!(out, "{:<18} {}", mnemonic, detail);
        offset + 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> CodeBuilder {
        CodeBuilder::new(0, "<module>", "test.si")
    }

    #[test]
    fn operands_are_big_endian() {
        let mut b = builder();
        b.add_instruction(OpCode::LoadConst, 0x0102, Span::default());
        assert_eq!(&b.code[..], &[OpCode::LoadConst as u8, 0x01, 0x02]);
        assert_eq!(b.read_u16(1), 0x0102);
    }

    #[test]
    fn constants_dedup_by_value_in_first_use_order() {
        let mut b = builder();
        assert_eq!(b.add_const(Value::Int(1)), 0);
        assert_eq!(b.add_const(Value::str("x")), 1);
        assert_eq!(b.add_const(Value::Int(1)), 0);
        assert_eq!(b.add_const(Value::Int(2)), 2);
    }

    #[test]
    fn name_tables_dedup() {
        let mut b = builder();
        assert_eq!(b.add_name("print"), 0);
        assert_eq!(b.add_name("len"), 1);
        assert_eq!(b.add_name("print"), 0);
        assert_eq!(b.add_varname("x"), 0);
        assert_eq!(b.add_varname("x"), 0);
    }

    #[test]
    fn same_named_code_constant_is_replaced_in_place() {
        let mut b = builder();
        let first = CodeBuilder::new(1, "f", "test.si");
        let idx = b.add_code_const(first);
        let mut second = CodeBuilder::new(2, "f", "test.si");
        second.arg_count = 3;
        assert_eq!(b.add_code_const(second), idx);
        match &b.constants[idx] {
            PoolEntry::Code(cb) => assert_eq!(cb.arg_count, 3),
            _ => panic!("expected code entry"),
        }
    }

    #[test]
    fn build_rejects_unresolved_patches() {
        let mut b = builder();
        b.add_instruction(OpCode::JumpForward, 0xFFFF, Span::default());
        b.note_pending(1);
        let err = b.build().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InternalError);
    }

    #[test]
    fn build_succeeds_once_patched() {
        let mut b = builder();
        b.add_instruction(OpCode::JumpForward, 0xFFFF, Span::default());
        b.note_pending(1);
        b.patch_u16(1, 4);
        b.add_op(OpCode::Pop, Span::default());
        let code = b.build().unwrap();
        assert_eq!(code.read_u16(1), 4);
    }

    #[test]
    fn find_unit_mut_reaches_nested_builders() {
        let mut root = builder();
        let mut f = CodeBuilder::new(1, "f", "test.si");
        let g = CodeBuilder::new(2, "g", "test.si");
        f.add_code_const(g);
        root.add_code_const(f);
        assert!(root.find_unit_mut(2).is_some());
        assert!(root.find_unit_mut(9).is_none());
    }

    #[test]
    fn ends_with_return_tracks_opcodes_not_operands() {
        let mut b = builder();
        b.add_op(OpCode::ReturnValue, Span::default());
        assert!(b.ends_with_return());
        b.add_instruction(OpCode::LoadConst, OpCode::ReturnValue as u16, Span::default());
        assert!(!b.ends_with_return());
    }
}
