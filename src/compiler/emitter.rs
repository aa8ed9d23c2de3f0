use super::code::{CodeBuilder, CodeObject, UnitId};
use super::jump::JumpFixup;
use super::opcode::{CompareOp, OpCode};
use super::scope::{
    default_key, listcomp_key, GlobalEnv, NameScope, ScopeId, ScopeScanner, ScopeTree, ScopeType,
    COMP_ARG,
};
use crate::ast::*;
use crate::error::{SiltError, SiltResult, Span};
use crate::vm::scheduler::Scheduler;
use crate::vm::value::Value;
use std::sync::Arc;

/// Operand written for a jump whose target is not yet known.
const PLACEHOLDER: u16 = 0xFFFF;

/// Loop context for `continue`: the byte offset a continue jumps back to
/// (the condition test for while loops, the iterator advance for for loops).
/// `break` compiles to an instruction the VM resolves against its own block
/// stack, so no address is tracked for it.
struct LoopBlock {
    origin: usize,
}

/// One lexical unit being emitted: module, function body, class body,
/// synthesized comprehension function, or default-value sub-expression.
struct UnitFrame {
    builder: CodeBuilder,
    kind: ScopeType,
    loop_blocks: Vec<LoopBlock>,
    /// Ordinal source for synthesized child-scope keys; advances in the same
    /// order the scanner advanced its counter.
    synth_count: usize,
}

/// A default-value sub-expression waiting for evaluation. The sub-tree is
/// compiled and scheduled when the queue drains, after the owning unit's walk
/// has finished, so the recorded scope is the one that was current when the
/// parameter was declared.
struct PendingDefault {
    unit: UnitId,
    param: String,
    kw_only: bool,
    scope: ScopeId,
    owner_qualname: String,
    expr: Expr,
    span: Span,
}

/// Tree-walking code emitter. One [`CodeObject`] is built per lexical unit;
/// opcode selection for variable access comes from the scope classification
/// computed up front by [`ScopeScanner`].
///
/// Lifecycle: `compile` walks the tree, `post_process` drains the deferred
/// default-value queue through the scheduler, `finish` freezes the root unit.
/// A compiler that errors is discarded wholesale; there is no partial output.
pub struct Compiler<'env> {
    units: Vec<UnitFrame>,
    tree: Option<ScopeTree>,
    current_scope: ScopeId,
    pending_defaults: Vec<PendingDefault>,
    env: &'env GlobalEnv,
    file: String,
    source: String,
    repl_mode: bool,
    next_unit: UnitId,
}

impl<'env> Compiler<'env> {
    pub fn new(
        file: impl Into<String>,
        source: impl Into<String>,
        env: &'env GlobalEnv,
    ) -> Self {
        let file = file.into();
        Self {
            units: vec![UnitFrame {
                builder: CodeBuilder::new(0, "<module>", &file),
                kind: ScopeType::Module,
                loop_blocks: Vec::new(),
                synth_count: 0,
            }],
            tree: None,
            current_scope: 0,
            pending_defaults: Vec::new(),
            env,
            file,
            source: source.into(),
            repl_mode: false,
            next_unit: 1,
        }
    }

    /// Like [`Compiler::new`], but expression-statement results are printed
    /// instead of popped, the way the interactive interpreter shows them.
    pub fn new_repl(
        file: impl Into<String>,
        source: impl Into<String>,
        env: &'env GlobalEnv,
    ) -> Self {
        let mut compiler = Self::new(file, source, env);
        compiler.repl_mode = true;
        compiler
    }

    pub fn compile(&mut self, module: &Module) -> SiltResult<()> {
        let tree = ScopeScanner::scan(module, self.env, &self.file, &self.source)?;
        self.current_scope = tree.root();
        self.tree = Some(tree);

        for stmt in &module.statements {
            self.compile_stmt(stmt)?;
        }

        let none = self.builder().add_const(Value::None);
        self.emit_arg(OpCode::LoadConst, none as u16, Span::default());
        self.emit(OpCode::ReturnValue, Span::default());
        Ok(())
    }

    /// Drain the deferred default-value actions, strictly in declaration
    /// order: compile each sub-tree, hand it to the scheduler, await the one
    /// produced value, and record it in the owning function's default table.
    /// Later defaults may depend on side effects of earlier ones, so the
    /// actions are never run concurrently.
    pub async fn post_process(&mut self, scheduler: &mut dyn Scheduler) -> SiltResult<()> {
        let pending = std::mem::take(&mut self.pending_defaults);
        for action in pending {
            let code = self.compile_default_unit(&action)?;
            let value = scheduler.schedule(code).await?;

            let owner = self.units[0]
                .builder
                .find_unit_mut(action.unit)
                .ok_or_else(|| {
                    SiltError::internal(
                        format!("lost track of unit for default '{}'", action.param),
                        action.span,
                        &self.file,
                    )
                })?;
            if action.kw_only {
                owner
                    .kw_defaults
                    .insert(crate::vm::interner::intern(&action.param), value);
            } else {
                owner.defaults.push(value);
            }
        }
        Ok(())
    }

    /// Freeze the compilation into its immutable artifact.
    pub fn finish(mut self) -> SiltResult<Arc<CodeObject>> {
        if !self.pending_defaults.is_empty() {
            return Err(SiltError::internal(
                format!(
                    "{} default value(s) were never evaluated; post_process did not run",
                    self.pending_defaults.len()
                ),
                Span::default(),
                &self.file,
            ));
        }
        if self.units.len() != 1 {
            return Err(SiltError::internal(
                "unbalanced unit stack at finalize",
                Span::default(),
                &self.file,
            ));
        }
        self.units.pop().expect("root unit").builder.build()
    }

    // ---- unit and scope plumbing -------------------------------------------

    fn tree(&self) -> &ScopeTree {
        self.tree.as_ref().expect("compile() establishes the scope tree")
    }

    fn unit(&mut self) -> &mut UnitFrame {
        self.units.last_mut().expect("unit stack is never empty")
    }

    fn builder(&mut self) -> &mut CodeBuilder {
        &mut self.unit().builder
    }

    fn offset(&self) -> usize {
        self.units.last().expect("unit stack").builder.current_offset()
    }

    fn push_unit(
        &mut self,
        key: &str,
        name: &str,
        qualname: String,
        kind: ScopeType,
        span: Span,
    ) -> SiltResult<()> {
        let child = self.tree().child_of(self.current_scope, key).ok_or_else(|| {
            SiltError::internal(
                format!("no scope recorded for unit '{}'", key),
                span,
                &self.file,
            )
        })?;
        self.current_scope = child;

        let id = self.next_unit;
        self.next_unit += 1;
        let mut builder = CodeBuilder::new(id, name, &self.file);
        builder.qualname = qualname;
        self.units.push(UnitFrame {
            builder,
            kind,
            loop_blocks: Vec::new(),
            synth_count: 0,
        });
        Ok(())
    }

    fn pop_unit(&mut self) -> UnitFrame {
        self.current_scope = self
            .tree()
            .node(self.current_scope)
            .parent
            .expect("popping the root unit");
        self.units.pop().expect("unit stack")
    }

    /// Qualified name for a child unit, Python style: `outer.<locals>.inner`
    /// for nesting inside functions, `Class.method` inside class bodies.
    fn child_qualname(&self, name: &str) -> String {
        let parent = self.units.last().expect("unit stack");
        match parent.kind {
            ScopeType::Module => name.to_string(),
            ScopeType::Class => format!("{}.{}", parent.builder.qualname, name),
            ScopeType::Function => format!("{}.<locals>.{}", parent.builder.qualname, name),
        }
    }

    // ---- low-level emission ------------------------------------------------

    fn emit(&mut self, op: OpCode, span: Span) -> usize {
        self.builder().add_op(op, span)
    }

    fn emit_arg(&mut self, op: OpCode, operand: u16, span: Span) -> usize {
        self.builder().add_instruction(op, operand, span)
    }

    /// Emit a jump with a placeholder operand and hand back its fixup.
    fn emit_jump(&mut self, op: OpCode, span: Span) -> JumpFixup {
        let next = self.builder().add_instruction(op, PLACEHOLDER, span);
        JumpFixup::at(self.builder(), next)
    }

    /// Append another placeholder jump to an existing multi-site fixup.
    fn add_jump(&mut self, fixup: &mut JumpFixup, op: OpCode, span: Span) {
        let next = self.builder().add_instruction(op, PLACEHOLDER, span);
        fixup.add(self.builder(), next);
    }

    fn load_const(&mut self, value: Value, span: Span) {
        let idx = self.builder().add_const(value);
        self.emit_arg(OpCode::LoadConst, idx as u16, span);
    }

    fn load_none(&mut self, span: Span) {
        self.load_const(Value::None, span);
    }

    // ---- scope-classified variable access ----------------------------------

    fn generate_load(&mut self, name: &str, span: Span) -> SiltResult<()> {
        let kind = self
            .tree()
            .read_kind(self.current_scope, name)
            .ok_or_else(|| {
                SiltError::internal(
                    format!("name '{}' has no read classification here", name),
                    span,
                    &self.file,
                )
            })?;
        match kind {
            NameScope::Enclosed => {
                let idx = self.builder().add_varname(name);
                self.emit_arg(OpCode::LoadDeref, idx as u16, span);
            }
            NameScope::Name => {
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::LoadName, idx as u16, span);
            }
            NameScope::LocalFast => {
                let idx = self.builder().add_varname(name);
                self.emit_arg(OpCode::LoadFast, idx as u16, span);
            }
            // There is no dedicated builtin load; globals lookup falls
            // through to builtins in the VM.
            NameScope::Global | NameScope::Builtin => {
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::LoadGlobal, idx as u16, span);
            }
        }
        Ok(())
    }

    fn generate_store(&mut self, name: &str, span: Span) -> SiltResult<()> {
        let kind = self
            .tree()
            .write_kind(self.current_scope, name)
            .ok_or_else(|| {
                SiltError::internal(
                    format!("name '{}' has no write classification here", name),
                    span,
                    &self.file,
                )
            })?;
        match kind {
            NameScope::Enclosed => {
                let idx = self.builder().add_varname(name);
                self.emit_arg(OpCode::StoreDeref, idx as u16, span);
            }
            NameScope::Name => {
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::StoreName, idx as u16, span);
            }
            NameScope::LocalFast => {
                let idx = self.builder().add_varname(name);
                self.emit_arg(OpCode::StoreFast, idx as u16, span);
            }
            NameScope::Global => {
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::StoreGlobal, idx as u16, span);
            }
            NameScope::Builtin => {
                return Err(SiltError::internal(
                    format!("cannot generate a store for builtin '{}'", name),
                    span,
                    &self.file,
                ));
            }
        }
        Ok(())
    }

    // ---- statements --------------------------------------------------------

    fn compile_stmts(&mut self, stmts: &[Stmt]) -> SiltResult<()> {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> SiltResult<()> {
        match stmt {
            Stmt::Expression { expr, span } => {
                self.compile_expr(expr)?;
                if self.repl_mode {
                    self.emit(OpCode::PrintExpr, *span);
                } else {
                    self.emit(OpCode::Pop, *span);
                }
            }
            Stmt::Assign {
                targets,
                value,
                span,
            } => {
                self.compile_expr(value)?;
                // Chained targets store right-to-left; every store but the
                // final one works on a duplicate of the value.
                for idx in (0..targets.len()).rev() {
                    if idx > 0 {
                        self.emit(OpCode::DupTop, *span);
                    }
                    self.compile_store_target(&targets[idx])?;
                }
            }
            Stmt::AugAssign {
                target,
                op,
                value,
                span,
            } => self.compile_aug_assign(target, *op, value, *span)?,
            Stmt::If {
                branches,
                orelse,
                span,
            } => self.compile_if(branches, orelse.as_deref(), *span)?,
            Stmt::While {
                condition,
                body,
                orelse,
                span,
            } => self.compile_while(condition, body, orelse.as_deref(), *span)?,
            Stmt::For {
                targets,
                iterable,
                body,
                orelse,
                span,
            } => self.compile_for(targets, iterable, body, orelse.as_deref(), *span)?,
            Stmt::Break { span } => {
                if self.unit().loop_blocks.is_empty() {
                    return Err(self.syntax("'break' outside of loop", *span));
                }
                self.emit(OpCode::BreakLoop, *span);
            }
            Stmt::Continue { span } => {
                let origin = match self.unit().loop_blocks.last() {
                    Some(block) => block.origin,
                    None => return Err(self.syntax("'continue' outside of loop", *span)),
                };
                self.emit_arg(OpCode::JumpAbsolute, origin as u16, *span);
            }
            Stmt::Return { value, span } => {
                if let Some(value) = value {
                    self.compile_expr(value)?;
                } else {
                    self.load_none(*span);
                }
                self.emit(OpCode::ReturnValue, *span);
            }
            Stmt::Raise { value, span } => {
                self.compile_expr(value)?;
                self.emit_arg(OpCode::RaiseVarargs, 1, *span);
            }
            Stmt::Assert {
                condition,
                message,
                span,
            } => {
                self.compile_expr(condition)?;
                let pass_jump = self.emit_jump(OpCode::PopJumpIfTrue, *span);
                let idx = self.builder().add_name("AssertionError");
                self.emit_arg(OpCode::LoadGlobal, idx as u16, *span);
                if let Some(message) = message {
                    self.compile_expr(message)?;
                    self.emit_arg(OpCode::CallFunction, 1, *span);
                }
                self.emit_arg(OpCode::RaiseVarargs, 1, *span);
                let end = self.offset();
                pass_jump.fixup_absolute(self.builder(), end);
            }
            // Declarations already shaped the scope tree; `global` only
            // reserves its names in the name table, like the original does.
            Stmt::Global { names, .. } => {
                for name in names {
                    self.builder().add_name(name);
                }
            }
            Stmt::Nonlocal { .. } => {}
            Stmt::Try {
                body,
                handlers,
                orelse,
                finally,
                span,
            } => self.compile_try(body, handlers, orelse.as_deref(), finally.as_deref(), *span)?,
            Stmt::Function { def } => self.compile_function(def)?,
            Stmt::Class { def } => self.compile_class(def)?,
            Stmt::Pass { .. } => {}
        }
        Ok(())
    }

    fn syntax(&self, message: &str, span: Span) -> SiltError {
        SiltError::syntax_error(message, span, &self.file).with_source(&self.source)
    }

    fn compile_store_target(&mut self, target: &Expr) -> SiltResult<()> {
        match target {
            Expr::Identifier { name, span } => self.generate_store(name, *span),
            Expr::Tuple { items, span } | Expr::List { items, span } => {
                self.emit_arg(OpCode::UnpackSequence, items.len() as u16, *span);
                for item in items {
                    self.compile_store_target(item)?;
                }
                Ok(())
            }
            Expr::Attribute { object, name, span } => {
                self.compile_expr(object)?;
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::StoreAttr, idx as u16, *span);
                Ok(())
            }
            Expr::Subscript {
                object,
                index,
                span,
            } => {
                self.compile_expr(object)?;
                self.compile_subscript_index(index, *span)?;
                self.emit(OpCode::StoreSubscr, *span);
                Ok(())
            }
            other => Err(self.syntax("invalid assignment target", other.span())),
        }
    }

    fn compile_aug_assign(
        &mut self,
        target: &Expr,
        op: BinaryOp,
        value: &Expr,
        span: Span,
    ) -> SiltResult<()> {
        // Read the target, apply in place, store back. Attribute and
        // subscript targets evaluate their object (and index) twice, once for
        // each direction.
        match target {
            Expr::Identifier { name, .. } => {
                self.generate_load(name, span)?;
                self.compile_expr(value)?;
                self.emit(Self::inplace_opcode(op), span);
                self.generate_store(name, span)?;
            }
            Expr::Attribute { object, name, .. } => {
                self.compile_expr(object)?;
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::LoadAttr, idx as u16, span);
                self.compile_expr(value)?;
                self.emit(Self::inplace_opcode(op), span);
                self.compile_expr(object)?;
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::StoreAttr, idx as u16, span);
            }
            Expr::Subscript { object, index, .. } => {
                self.compile_expr(object)?;
                self.compile_subscript_index(index, span)?;
                self.emit(OpCode::BinarySubscr, span);
                self.compile_expr(value)?;
                self.emit(Self::inplace_opcode(op), span);
                self.compile_expr(object)?;
                self.compile_subscript_index(index, span)?;
                self.emit(OpCode::StoreSubscr, span);
            }
            other => return Err(self.syntax("invalid assignment target", other.span())),
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        branches: &[(Expr, Vec<Stmt>)],
        orelse: Option<&[Stmt]>,
        span: Span,
    ) -> SiltResult<()> {
        let mut end_jumps = JumpFixup::new();

        for (i, (condition, body)) in branches.iter().enumerate() {
            self.compile_expr(condition)?;
            let false_jump = self.emit_jump(OpCode::PopJumpIfFalse, span);
            self.compile_stmts(body)?;

            // Skip the remaining branches, unless this is the last one.
            if i < branches.len() - 1 || orelse.is_some() {
                self.add_jump(&mut end_jumps, OpCode::JumpForward, span);
            }
            let next_branch = self.offset();
            false_jump.fixup_absolute(self.builder(), next_branch);
        }

        if let Some(orelse) = orelse {
            self.compile_stmts(orelse)?;
        }

        let end = self.offset();
        end_jumps.fixup(self.builder(), end);
        Ok(())
    }

    fn compile_while(
        &mut self,
        condition: &Expr,
        body: &[Stmt],
        orelse: Option<&[Stmt]>,
        span: Span,
    ) -> SiltResult<()> {
        let next = self.emit_arg(OpCode::SetupLoop, PLACEHOLDER, span);
        let setup_fixup = JumpFixup::at(self.builder(), next);
        let loop_start = self.offset();

        self.compile_expr(condition)?;
        let exit_jump = self.emit_jump(OpCode::PopJumpIfFalse, span);

        self.unit().loop_blocks.push(LoopBlock { origin: loop_start });
        let body_result = self.compile_stmts(body);
        self.unit().loop_blocks.pop();
        body_result?;

        self.emit_arg(OpCode::JumpAbsolute, loop_start as u16, span);
        let pop_block_at = self.emit(OpCode::PopBlock, span) - 1;
        exit_jump.fixup_absolute(self.builder(), pop_block_at);

        // The else body runs only on natural exhaustion; break unwinds the
        // loop block and lands past the whole construct.
        if let Some(orelse) = orelse {
            self.compile_stmts(orelse)?;
        }

        let end = self.offset();
        setup_fixup.fixup(self.builder(), end);
        Ok(())
    }

    fn compile_for(
        &mut self,
        targets: &[String],
        iterable: &Expr,
        body: &[Stmt],
        orelse: Option<&[Stmt]>,
        span: Span,
    ) -> SiltResult<()> {
        let next = self.emit_arg(OpCode::SetupLoop, PLACEHOLDER, span);
        let setup_fixup = JumpFixup::at(self.builder(), next);

        self.compile_expr(iterable)?;
        let for_iter_at = self.emit(OpCode::GetIter, span);
        let next = self.emit_arg(OpCode::ForIter, PLACEHOLDER, span);
        let iter_fixup = JumpFixup::at(self.builder(), next);

        self.unit().loop_blocks.push(LoopBlock { origin: for_iter_at });
        let body_result = (|| -> SiltResult<()> {
            if targets.len() > 1 {
                self.emit_arg(OpCode::UnpackSequence, targets.len() as u16, span);
            }
            for target in targets {
                self.generate_store(target, span)?;
            }
            self.compile_stmts(body)
        })();
        self.unit().loop_blocks.pop();
        body_result?;

        self.emit_arg(OpCode::JumpAbsolute, for_iter_at as u16, span);
        let pop_block_at = self.emit(OpCode::PopBlock, span) - 1;
        iter_fixup.fixup(self.builder(), pop_block_at);

        if let Some(orelse) = orelse {
            self.compile_stmts(orelse)?;
        }

        let end = self.offset();
        setup_fixup.fixup(self.builder(), end);
        Ok(())
    }

    fn compile_try(
        &mut self,
        body: &[Stmt],
        handlers: &[ExceptHandler],
        orelse: Option<&[Stmt]>,
        finally: Option<&[Stmt]>,
        span: Span,
    ) -> SiltResult<()> {
        for (i, handler) in handlers.iter().enumerate() {
            if handler.type_expr.is_none() && i != handlers.len() - 1 {
                return Err(self.syntax("default 'except:' must be last", handler.span));
            }
        }

        let mut finally_fixup = JumpFixup::new();
        if finally.is_some() {
            let next = self.emit_arg(OpCode::SetupFinally, PLACEHOLDER, span);
            finally_fixup.add(self.builder(), next);
        }
        let mut except_fixup = JumpFixup::new();
        if !handlers.is_empty() {
            let next = self.emit_arg(OpCode::SetupExcept, PLACEHOLDER, span);
            except_fixup.add(self.builder(), next);
        }

        self.compile_stmts(body)?;
        self.emit(OpCode::PopBlock, span);

        // All the "jump to end" sites converge on one patched address: the
        // fall-through after the try body plus one per handler body.
        let mut end_jumps = JumpFixup::new();
        self.add_jump(&mut end_jumps, OpCode::JumpForward, span);

        let mut handler_starts = Vec::with_capacity(handlers.len());
        let mut match_fixups: Vec<JumpFixup> = Vec::new();

        for handler in handlers {
            handler_starts.push(self.offset());
            if let Some(type_expr) = &handler.type_expr {
                // Keep a copy of the exception around until we know this
                // handler takes it, so the alias can capture it.
                if handler.alias.is_some() {
                    self.emit(OpCode::DupTop, handler.span);
                }
                self.compile_expr(type_expr)?;
                self.emit_arg(
                    OpCode::CompareOp,
                    CompareOp::ExceptionMatch as u16,
                    handler.span,
                );
                match_fixups.push(self.emit_jump(OpCode::PopJumpIfFalse, handler.span));
                if let Some(alias) = &handler.alias {
                    self.generate_store(alias, handler.span)?;
                }
            }
            self.compile_stmts(&handler.body)?;
            self.add_jump(&mut end_jumps, OpCode::JumpForward, handler.span);
        }

        let else_start = self.offset();
        if let Some(orelse) = orelse {
            self.compile_stmts(orelse)?;
        }

        let finally_start = self.offset();
        if let Some(finally_body) = finally {
            self.compile_stmts(finally_body)?;
            finally_fixup.fixup(self.builder(), finally_start);
            self.emit(OpCode::EndFinally, span);
        }

        let mut end_position = if finally.is_some() {
            finally_start
        } else {
            self.offset()
        };
        if orelse.is_some() {
            end_position = else_start;
        }

        end_jumps.fixup(self.builder(), end_position);

        if !handlers.is_empty() {
            except_fixup.fixup(self.builder(), handler_starts[0]);
        }
        let handler_count = match_fixups.len();
        for (i, fixup) in match_fixups.into_iter().enumerate() {
            // A failed type test falls through to the next handler; the last
            // one re-raises by leaving the exception to the block machinery.
            if i < handler_count - 1 {
                fixup.fixup_absolute(self.builder(), handler_starts[i + 1]);
            } else {
                fixup.fixup_absolute(self.builder(), end_position);
            }
        }

        Ok(())
    }

    fn compile_function(&mut self, def: &FunctionDef) -> SiltResult<()> {
        let span = def.span;
        if let Some(kwarg) = &def.kwarg {
            return Err(SiltError::not_supported(
                format!("keyword argument packs (**{}) are not supported yet", kwarg),
                span,
                &self.file,
            ));
        }
        if !def.kwonly.is_empty() && def.vararg.is_none() {
            return Err(SiltError::not_supported(
                "keyword-only parameters require a preceding *args parameter",
                span,
                &self.file,
            ));
        }
        let mut saw_default = false;
        for param in &def.params {
            match (&param.default, saw_default) {
                (Some(_), _) => saw_default = true,
                (None, true) => {
                    return Err(self.syntax(
                        "parameter without a default follows a defaulted parameter",
                        param.span,
                    ));
                }
                (None, false) => {}
            }
        }

        let qualname = self.child_qualname(&def.name);
        self.push_unit(&def.name, &def.name, qualname.clone(), ScopeType::Function, span)?;

        // Parameters claim the leading local slots in declaration order:
        // positional, varargs, keyword-only.
        self.builder().arg_count = def.params.len();
        self.builder().has_varargs = def.vararg.is_some();
        self.builder().kwonly_count = def.kwonly.len();
        for param in &def.params {
            self.builder().add_varname(&param.name);
        }
        if let Some(vararg) = &def.vararg {
            self.builder().add_varname(vararg);
        }
        for param in &def.kwonly {
            self.builder().add_varname(&param.name);
        }

        // Defaults are not evaluated now: they may suspend in host machinery,
        // so each becomes a deferred action drained by post_process.
        let unit_id = self.units.last().expect("unit stack").builder.id;
        for param in &def.params {
            if let Some(default) = &param.default {
                self.pending_defaults.push(PendingDefault {
                    unit: unit_id,
                    param: param.name.clone(),
                    kw_only: false,
                    scope: self.current_scope,
                    owner_qualname: qualname.clone(),
                    expr: default.clone(),
                    span: param.span,
                });
            }
        }
        for param in &def.kwonly {
            if let Some(default) = &param.default {
                self.pending_defaults.push(PendingDefault {
                    unit: unit_id,
                    param: param.name.clone(),
                    kw_only: true,
                    scope: self.current_scope,
                    owner_qualname: qualname.clone(),
                    expr: default.clone(),
                    span: param.span,
                });
            }
        }

        self.compile_stmts(&def.body)?;

        if !self.builder().ends_with_return() {
            self.load_none(span);
            self.emit(OpCode::ReturnValue, span);
        }

        let func_builder = self.pop_unit().builder;
        let const_idx = self.builder().add_code_const(func_builder);
        let name_idx = self.builder().add_const(Value::str(&qualname));

        self.emit_arg(OpCode::LoadConst, const_idx as u16, span);
        self.emit_arg(OpCode::LoadConst, name_idx as u16, span);
        self.emit_arg(OpCode::MakeFunction, 0, span);

        // The name binds where the function is defined, not inside itself.
        self.generate_store(&def.name, span)
    }

    fn compile_class(&mut self, def: &ClassDef) -> SiltResult<()> {
        let span = def.span;
        if def.bases.len() > 1 {
            return Err(SiltError::not_supported(
                "multiple inheritance is not supported yet",
                span,
                &self.file,
            ));
        }

        let qualname = self.child_qualname(&def.name);
        self.push_unit(&def.name, &def.name, qualname.clone(), ScopeType::Class, span)?;

        // The class body opens by identifying itself to the host: module and
        // qualified name land in the class namespace before any user code.
        let name_name = self.builder().add_name("__name__");
        let module_name = self.builder().add_name("__module__");
        let qualname_name = self.builder().add_name("__qualname__");
        let qual_const = self.builder().add_const(Value::str(&qualname));
        self.emit_arg(OpCode::LoadName, name_name as u16, span);
        self.emit_arg(OpCode::StoreName, module_name as u16, span);
        self.emit_arg(OpCode::LoadConst, qual_const as u16, span);
        self.emit_arg(OpCode::StoreName, qualname_name as u16, span);

        self.compile_stmts(&def.body)?;

        self.load_none(span);
        self.emit(OpCode::ReturnValue, span);

        let class_builder = self.pop_unit().builder;
        let const_idx = self.builder().add_code_const(class_builder);
        let name_idx = self.builder().add_const(Value::str(&def.name));

        self.emit(OpCode::BuildClass, span);
        self.emit_arg(OpCode::LoadConst, const_idx as u16, span);
        self.emit_arg(OpCode::LoadConst, name_idx as u16, span);
        self.emit_arg(OpCode::MakeFunction, 0, span);
        self.emit_arg(OpCode::LoadConst, name_idx as u16, span);

        for base in &def.bases {
            self.compile_expr(base)?;
        }
        self.emit_arg(
            OpCode::CallFunction,
            (2 + def.bases.len()) as u16,
            span,
        );

        self.generate_store(&def.name, span)
    }

    // ---- expressions -------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) -> SiltResult<()> {
        match expr {
            Expr::Literal { value, span } => {
                let constant = match value {
                    Literal::Int(n) => Value::Int(*n),
                    Literal::Float(n) => Value::Float(*n),
                    Literal::String(s) => Value::str(s),
                    Literal::Boolean(b) => Value::Bool(*b),
                    Literal::None => Value::None,
                };
                self.load_const(constant, *span);
            }
            Expr::Identifier { name, span } => self.generate_load(name, *span)?,
            Expr::Binary {
                left,
                op,
                right,
                span,
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(Self::binary_opcode(*op), *span);
            }
            Expr::Compare {
                left,
                op,
                right,
                span,
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit_arg(OpCode::CompareOp, Self::compare_operand(*op) as u16, *span);
            }
            Expr::BoolChain { op, operands, span } => {
                let jump_op = match op {
                    BoolOp::And => OpCode::JumpIfFalseOrPop,
                    BoolOp::Or => OpCode::JumpIfTrueOrPop,
                };
                let mut short_circuit = JumpFixup::new();
                for (i, operand) in operands.iter().enumerate() {
                    self.compile_expr(operand)?;
                    // The last operand keeps its value unconditionally; every
                    // earlier one either decides the chain (jump, keep raw
                    // value) or is popped.
                    if i < operands.len() - 1 {
                        self.add_jump(&mut short_circuit, jump_op, *span);
                    }
                }
                let end = self.offset();
                short_circuit.fixup_absolute(self.builder(), end);
            }
            Expr::Unary { op, operand, span } => {
                self.compile_expr(operand)?;
                let opcode = match op {
                    UnaryOp::Negate => OpCode::UnaryNegative,
                    UnaryOp::Not => OpCode::UnaryNot,
                    UnaryOp::BitNot => OpCode::UnaryInvert,
                };
                self.emit(opcode, *span);
            }
            Expr::Conditional {
                condition,
                then,
                orelse,
                span,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(OpCode::PopJumpIfFalse, *span);
                self.compile_expr(then)?;
                let end_jump = self.emit_jump(OpCode::JumpForward, *span);
                let else_start = self.offset();
                else_jump.fixup_absolute(self.builder(), else_start);
                self.compile_expr(orelse)?;
                let end = self.offset();
                end_jump.fixup(self.builder(), end);
            }
            Expr::Call {
                callee,
                args,
                keywords,
                span,
            } => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                if keywords.is_empty() {
                    self.emit_arg(OpCode::CallFunction, args.len() as u16, *span);
                } else {
                    let mut names = Vec::with_capacity(keywords.len());
                    for (name, value) in keywords {
                        names.push(Value::str(name));
                        self.compile_expr(value)?;
                    }
                    self.load_const(Value::tuple(names), *span);
                    self.emit_arg(
                        OpCode::CallFunctionKw,
                        (args.len() + keywords.len()) as u16,
                        *span,
                    );
                }
            }
            Expr::Attribute { object, name, span } => {
                self.compile_expr(object)?;
                let idx = self.builder().add_name(name);
                self.emit_arg(OpCode::LoadAttr, idx as u16, *span);
            }
            Expr::Subscript {
                object,
                index,
                span,
            } => {
                self.compile_expr(object)?;
                self.compile_subscript_index(index, *span)?;
                self.emit(OpCode::BinarySubscr, *span);
            }
            Expr::Tuple { items, span } => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit_arg(OpCode::BuildTuple, items.len() as u16, *span);
            }
            Expr::List { items, span } => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit_arg(OpCode::BuildList, items.len() as u16, *span);
            }
            Expr::Set { items, span } => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit_arg(OpCode::BuildSet, items.len() as u16, *span);
            }
            Expr::Dict { pairs, span } => {
                for (key, value) in pairs {
                    self.compile_expr(key)?;
                    self.compile_expr(value)?;
                }
                self.emit_arg(OpCode::BuildMap, pairs.len() as u16, *span);
            }
            Expr::ListComp {
                element,
                clauses,
                span,
            } => self.compile_listcomp(element, clauses, *span)?,
        }
        Ok(())
    }

    /// Emit the index part of a subscript. Slices load explicit `None` for
    /// every omitted component; one colon builds a two-operand slice, two
    /// colons a three-operand one.
    fn compile_subscript_index(&mut self, index: &Subscript, span: Span) -> SiltResult<()> {
        match index {
            Subscript::Index(expr) => self.compile_expr(expr),
            Subscript::Slice { start, stop, step } => {
                match start {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.load_none(span),
                }
                match stop {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.load_none(span),
                }
                let count = match step {
                    None => 2,
                    Some(step_expr) => {
                        match step_expr {
                            Some(expr) => self.compile_expr(expr)?,
                            None => self.load_none(span),
                        }
                        3
                    }
                };
                self.emit_arg(OpCode::BuildSlice, count, span);
                Ok(())
            }
        }
    }

    fn compile_listcomp(
        &mut self,
        element: &Expr,
        clauses: &[CompClause],
        span: Span,
    ) -> SiltResult<()> {
        let Some(CompClause::For { .. }) = clauses.first() else {
            return Err(self.syntax("comprehension without a for clause", span));
        };

        let ordinal = self.unit().synth_count;
        self.unit().synth_count += 1;
        let key = listcomp_key(ordinal);
        let qualname = self.child_qualname("<listcomp>");

        self.push_unit(&key, "<listcomp>", qualname.clone(), ScopeType::Function, span)?;
        self.builder().arg_count = 1;
        let arg_slot = self.builder().add_varname(COMP_ARG);

        self.emit_arg(OpCode::BuildList, 0, span);
        self.emit_arg(OpCode::LoadFast, arg_slot as u16, span);
        self.compile_comp_clause(clauses, 0, element, 0)?;
        self.emit(OpCode::ReturnValue, span);

        let comp_builder = self.pop_unit().builder;
        let const_idx = self.builder().push_code_const(comp_builder);
        let name_idx = self.builder().add_const(Value::str(&qualname));

        self.emit_arg(OpCode::LoadConst, const_idx as u16, span);
        self.emit_arg(OpCode::LoadConst, name_idx as u16, span);
        self.emit_arg(OpCode::MakeFunction, 0, span);

        // The synthesized function is called with the iterator of the first
        // clause's source, built in the enclosing scope.
        let CompClause::For { iterable, .. } = &clauses[0] else {
            unreachable!("checked above");
        };
        self.compile_expr(iterable)?;
        self.emit(OpCode::GetIter, span);
        self.emit_arg(OpCode::CallFunction, 1, span);
        Ok(())
    }

    /// Emit the loop for `clauses[clause_idx]` (which must be a for clause)
    /// and recurse through the remaining clauses; the innermost position
    /// appends the element at a stack depth determined by how many iterators
    /// sit between it and the result list.
    fn compile_comp_clause(
        &mut self,
        clauses: &[CompClause],
        clause_idx: usize,
        element: &Expr,
        list_depth: usize,
    ) -> SiltResult<()> {
        let CompClause::For { targets, span, .. } = &clauses[clause_idx] else {
            return Err(self.syntax("comprehension clause out of order", element.span()));
        };
        let span = *span;

        let for_iter_at = self.offset();
        let next = self.emit_arg(OpCode::ForIter, PLACEHOLDER, span);
        let iter_fixup = JumpFixup::at(self.builder(), next);

        if targets.len() > 1 {
            self.emit_arg(OpCode::UnpackSequence, targets.len() as u16, span);
        }
        for target in targets {
            self.generate_store(target, span)?;
        }

        self.compile_comp_tail(clauses, clause_idx + 1, element, list_depth, for_iter_at)?;

        self.emit_arg(OpCode::JumpAbsolute, for_iter_at as u16, span);
        let loop_end = self.offset();
        iter_fixup.fixup(self.builder(), loop_end);
        Ok(())
    }

    fn compile_comp_tail(
        &mut self,
        clauses: &[CompClause],
        clause_idx: usize,
        element: &Expr,
        list_depth: usize,
        governing_for_iter: usize,
    ) -> SiltResult<()> {
        match clauses.get(clause_idx) {
            None => {
                // Innermost position: produce the element and append it to
                // the list sitting below the live iterators.
                self.compile_expr(element)?;
                self.emit_arg(
                    OpCode::ListAppend,
                    (2 + list_depth) as u16,
                    element.span(),
                );
                Ok(())
            }
            Some(CompClause::For { iterable, span, .. }) => {
                self.compile_expr(iterable)?;
                self.emit(OpCode::GetIter, *span);
                self.compile_comp_clause(clauses, clause_idx, element, list_depth + 1)
            }
            Some(CompClause::If { condition, span }) => {
                // A failed filter skips the append by jumping straight back
                // to the governing iterator advance.
                self.compile_expr(condition)?;
                self.emit_arg(
                    OpCode::PopJumpIfFalse,
                    governing_for_iter as u16,
                    *span,
                );
                self.compile_comp_tail(
                    clauses,
                    clause_idx + 1,
                    element,
                    list_depth,
                    governing_for_iter,
                )
            }
        }
    }

    // ---- default-value drain ----------------------------------------------

    fn compile_default_unit(&mut self, action: &PendingDefault) -> SiltResult<Arc<CodeObject>> {
        let saved_scope = self.current_scope;
        self.current_scope = action.scope;

        let key = default_key(&action.param);
        let name = format!("{}.<default:{}>", action.owner_qualname, action.param);
        self.push_unit(&key, &name, name.clone(), ScopeType::Function, action.span)?;

        let result = (|| -> SiltResult<()> {
            self.compile_expr(&action.expr)?;
            self.emit(OpCode::ReturnValue, action.span);
            Ok(())
        })();

        let frame = self.pop_unit();
        self.current_scope = saved_scope;
        result?;

        frame.builder.build()
    }

    // ---- opcode tables -----------------------------------------------------

    fn binary_opcode(op: BinaryOp) -> OpCode {
        match op {
            BinaryOp::Add => OpCode::BinaryAdd,
            BinaryOp::Sub => OpCode::BinarySubtract,
            BinaryOp::Mul => OpCode::BinaryMultiply,
            BinaryOp::Div => OpCode::BinaryTrueDivide,
            BinaryOp::FloorDiv => OpCode::BinaryFloorDivide,
            BinaryOp::Mod => OpCode::BinaryModulo,
            BinaryOp::Power => OpCode::BinaryPower,
            BinaryOp::BitAnd => OpCode::BinaryAnd,
            BinaryOp::BitOr => OpCode::BinaryOr,
            BinaryOp::BitXor => OpCode::BinaryXor,
            BinaryOp::LeftShift => OpCode::BinaryLshift,
            BinaryOp::RightShift => OpCode::BinaryRshift,
        }
    }

    fn inplace_opcode(op: BinaryOp) -> OpCode {
        match op {
            BinaryOp::Add => OpCode::InplaceAdd,
            BinaryOp::Sub => OpCode::InplaceSubtract,
            BinaryOp::Mul => OpCode::InplaceMultiply,
            BinaryOp::Div => OpCode::InplaceTrueDivide,
            BinaryOp::FloorDiv => OpCode::InplaceFloorDivide,
            BinaryOp::Mod => OpCode::InplaceModulo,
            BinaryOp::Power => OpCode::InplacePower,
            BinaryOp::BitAnd => OpCode::InplaceAnd,
            BinaryOp::BitOr => OpCode::InplaceOr,
            BinaryOp::BitXor => OpCode::InplaceXor,
            BinaryOp::LeftShift => OpCode::InplaceLshift,
            BinaryOp::RightShift => OpCode::InplaceRshift,
        }
    }

    fn compare_operand(op: CmpOp) -> CompareOp {
        match op {
            CmpOp::Equal => CompareOp::Eq,
            CmpOp::NotEqual => CompareOp::Ne,
            CmpOp::Less => CompareOp::Lt,
            CmpOp::Greater => CompareOp::Gt,
            CmpOp::LessEqual => CompareOp::Le,
            CmpOp::GreaterEqual => CompareOp::Ge,
            CmpOp::In => CompareOp::In,
            CmpOp::NotIn => CompareOp::NotIn,
            CmpOp::Is => CompareOp::Is,
            CmpOp::IsNot => CompareOp::IsNot,
        }
    }
}
