//! neutron-compiler — Frontend Neutron : source → bytecode.
//!
//! Contenu du crate :
//!  - `token` / `scanner` : lexèmes et lexeur
//!  - `ast` / `parser` : arbre syntaxique, descente récursive
//!  - ici : le **compilateur une passe** AST → [`FunctionProto`]
//!
//! Le compilateur fait une seule traversée de l'arbre : résolution des
//! locales par pile de scopes (recherche de l'intérieur vers l'extérieur),
//! backpatch des sauts, listes break/continue par boucle, opérandes de
//! `Try` patchés en fin de construction. Pas d'optimisation, pas de
//! deuxième passe.
//!
//! API publique : [`compile_source`] / [`compile`].

pub mod ast;
pub mod error;
pub mod parser;
pub mod scanner;
pub mod token;

use std::collections::HashMap;
use std::rc::Rc;

use log::debug;

use neutron_core::{ClassProto, Constant, FunctionProto, OpCode, TypeTag, TRY_NONE};

use ast::*;
pub use error::{CompileError, CompileErrorKind};
use parser::Parser;
use scanner::Scanner;

/// Compile une source complète (scan + parse + codegen).
pub fn compile_source(source: &str, file: &str) -> Result<Rc<FunctionProto>, CompileError> {
    compile_source_with(source, file, false)
}

/// Variante REPL : la dernière instruction-expression est affichée
/// (équivalent d'un `say` implicite).
pub fn compile_source_with(
    source: &str,
    file: &str,
    repl: bool,
) -> Result<Rc<FunctionProto>, CompileError> {
    let tokens = Scanner::new(source, file).scan_tokens()?;
    let mut statements = Parser::new(tokens, file).parse()?;
    if repl {
        if let Some(Stmt::Expression { expr }) = statements.last() {
            let line = expr.line();
            let expr = expr.clone();
            *statements.last_mut().unwrap() = Stmt::Say { expr, line };
        }
    }
    compile(&statements, file)
}

/// Compile un programme déjà parsé en fonction de tête (`<script>`).
pub fn compile(statements: &[Stmt], file: &str) -> Result<Rc<FunctionProto>, CompileError> {
    let mut compiler = Compiler::new(file);
    compiler.push_ctx("<script>", FnKind::Script);
    for stmt in statements {
        compiler.statement(stmt)?;
    }
    compiler.emit_op(OpCode::Nil, 0);
    compiler.emit_op(OpCode::Return, 0);
    let proto = compiler.pop_ctx();
    debug!("compiled {} ({} bytes of bytecode)", file, proto.chunk.len());
    Ok(Rc::new(proto))
}

// ----------------------------------------------------------------------
// Contexte de compilation
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FnKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    depth: usize,
    ty: Option<TypeTag>,
}

struct LoopCtx {
    /// Offset de la tête de boucle (cible de `Loop`).
    start: usize,
    /// Sauts `break` à patcher sur la sortie.
    breaks: Vec<usize>,
    /// Sauts `continue` à patcher (boucles `for` : cible = incrément).
    continues: Vec<usize>,
    /// `continue` saute-t-il en avant (for) ou en arrière (while/do) ?
    forward_continue: bool,
    /// Profondeur de scope à l'entrée (pour dépiler les locales).
    depth: usize,
}

struct TryCtx {
    /// Offset de l'instruction `Try` (cible de `retry`).
    try_op: usize,
    /// Offset du premier opérande (les trois u16 à patcher).
    operands_at: usize,
    /// Profondeur de scope à l'entrée du `try`.
    depth: usize,
    in_catch: bool,
}

struct FnCtx {
    proto: FunctionProto,
    kind: FnKind,
    locals: Vec<Local>,
    scope_depth: usize,
    loops: Vec<LoopCtx>,
    tries: Vec<TryCtx>,
}

pub(crate) type CResult<T> = Result<T, CompileError>;

struct Compiler {
    file: String,
    ctxs: Vec<FnCtx>,
    /// Types déclarés des globales du module (pour choisir Set*Typed).
    global_types: HashMap<String, TypeTag>,
}

impl Compiler {
    fn new(file: &str) -> Self {
        Self { file: file.to_string(), ctxs: Vec::new(), global_types: HashMap::new() }
    }

    fn push_ctx(&mut self, name: &str, kind: FnKind) {
        let mut ctx = FnCtx {
            proto: FunctionProto::new(name, self.file.clone()),
            kind,
            locals: Vec::new(),
            scope_depth: if kind == FnKind::Script { 0 } else { 1 },
            loops: Vec::new(),
            tries: Vec::new(),
        };
        if matches!(kind, FnKind::Method | FnKind::Initializer) {
            // Slot 0 : le receveur.
            ctx.locals.push(Local { name: "this".into(), depth: 0, ty: None });
        }
        self.ctxs.push(ctx);
    }

    fn pop_ctx(&mut self) -> FunctionProto {
        self.ctxs.pop().expect("compiler context underflow").proto
    }

    #[inline]
    fn ctx(&mut self) -> &mut FnCtx {
        self.ctxs.last_mut().expect("no compiler context")
    }

    #[inline]
    fn ctx_ref(&self) -> &FnCtx {
        self.ctxs.last().expect("no compiler context")
    }

    // ---- émission ----

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.ctx().proto.chunk.write_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8, line: u32) {
        self.ctx().proto.chunk.write_byte(byte, line);
    }

    fn here(&self) -> usize {
        self.ctx_ref().proto.chunk.len()
    }

    fn constant(&mut self, value: Constant, line: u32) -> CResult<u8> {
        self.ctx().proto.chunk.add_constant(value).ok_or_else(|| {
            self.error(line, CompileErrorKind::Syntax, "Too many constants in one chunk.")
        })
    }

    fn emit_constant(&mut self, value: Constant, line: u32) -> CResult<()> {
        let idx = self.constant(value, line)?;
        self.emit_op(OpCode::Constant, line);
        self.emit_byte(idx, line);
        Ok(())
    }

    fn string_constant(&mut self, s: &str, line: u32) -> CResult<u8> {
        self.constant(Constant::Str(s.to_string()), line)
    }

    /// Émet un saut avant avec opérande provisoire ; retourne l'offset de
    /// l'opérande, à patcher via [`patch_jump`].
    fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.emit_op(op, line);
        let at = self.here();
        self.emit_byte(0xFF, line);
        self.emit_byte(0xFF, line);
        at
    }

    fn patch_jump(&mut self, operand_at: usize, line: u32) -> CResult<()> {
        let target = self.here();
        let offset = target - (operand_at + 2);
        if offset > u16::MAX as usize {
            return Err(self.error(line, CompileErrorKind::Syntax, "Too much code to jump over."));
        }
        self.ctx().proto.chunk.patch_u16(operand_at, offset as u16);
        Ok(())
    }

    fn emit_loop(&mut self, start: usize, line: u32) -> CResult<()> {
        let offset = self.here() + 3 - start;
        if offset > u16::MAX as usize {
            return Err(self.error(line, CompileErrorKind::Syntax, "Loop body too large."));
        }
        self.emit_op(OpCode::Loop, line);
        let off = offset as u16;
        self.emit_byte((off >> 8) as u8, line);
        self.emit_byte((off & 0xFF) as u8, line);
        Ok(())
    }

    // ---- scopes & locales ----

    fn begin_scope(&mut self) {
        self.ctx().scope_depth += 1;
    }

    fn end_scope(&mut self, line: u32) {
        let ctx = self.ctx();
        ctx.scope_depth -= 1;
        let depth = ctx.scope_depth;
        let mut pops = 0;
        while let Some(local) = ctx.locals.last() {
            if local.depth > depth {
                ctx.locals.pop();
                pops += 1;
            } else {
                break;
            }
        }
        for _ in 0..pops {
            self.emit_op(OpCode::Pop, line);
        }
    }

    fn is_global_scope(&self) -> bool {
        let ctx = self.ctx_ref();
        ctx.kind == FnKind::Script && ctx.scope_depth == 0
    }

    fn add_local(&mut self, name: &str, ty: Option<TypeTag>, line: u32) -> CResult<u8> {
        let ctx = self.ctx();
        if ctx.locals.len() >= u8::MAX as usize {
            return Err(self.error(
                line,
                CompileErrorKind::Syntax,
                "Too many local variables in function.",
            ));
        }
        let depth = ctx.scope_depth;
        if ctx
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name)
        {
            return Err(self.error(
                line,
                CompileErrorKind::Syntax,
                format!("Variable '{name}' is already declared in this scope."),
            ));
        }
        let slot = ctx.locals.len() as u8;
        ctx.locals.push(Local { name: name.to_string(), depth, ty });
        Ok(slot)
    }

    fn resolve_local(&self, name: &str) -> Option<(u8, Option<TypeTag>)> {
        let ctx = self.ctx_ref();
        ctx.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, l)| (i as u8, l.ty))
    }

    fn error(
        &self,
        line: u32,
        kind: CompileErrorKind,
        message: impl Into<String>,
    ) -> CompileError {
        CompileError::new(kind, message, self.file.clone(), line, 0)
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    fn statement(&mut self, stmt: &Stmt) -> CResult<()> {
        match stmt {
            Stmt::Expression { expr } => {
                let line = expr.line();
                self.expression(expr)?;
                self.emit_op(OpCode::Pop, line);
            }
            Stmt::Say { expr, line } => {
                self.expression(expr)?;
                self.emit_op(OpCode::Say, *line);
            }
            Stmt::Var { name, ty, init, line } => self.var_statement(name, *ty, init, *line)?,
            Stmt::Block { statements } => {
                self.begin_scope();
                for s in statements {
                    self.statement(s)?;
                }
                self.end_scope(last_line(statements));
            }
            Stmt::If { cond, then, otherwise, line } => {
                self.expression(cond)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse, *line);
                self.statement(then)?;
                if let Some(otherwise) = otherwise {
                    let end_jump = self.emit_jump(OpCode::Jump, *line);
                    self.patch_jump(else_jump, *line)?;
                    self.statement(otherwise)?;
                    self.patch_jump(end_jump, *line)?;
                } else {
                    self.patch_jump(else_jump, *line)?;
                }
            }
            Stmt::While { cond, body, line } => {
                let start = self.here();
                self.expression(cond)?;
                let exit = self.emit_jump(OpCode::JumpIfFalse, *line);
                self.push_loop(start, false);
                self.statement(body)?;
                self.emit_loop(start, *line)?;
                self.patch_jump(exit, *line)?;
                self.finish_loop(*line)?;
            }
            Stmt::DoWhile { body, cond, line } => {
                let start = self.here();
                self.push_loop(start, false);
                self.statement(body)?;
                self.expression(cond)?;
                let exit = self.emit_jump(OpCode::JumpIfFalse, *line);
                self.emit_loop(start, *line)?;
                self.patch_jump(exit, *line)?;
                self.finish_loop(*line)?;
            }
            Stmt::For { init, cond, incr, body, line } => {
                self.begin_scope();
                if let Some(init) = init {
                    self.statement(init)?;
                }
                let start = self.here();
                let exit = match cond {
                    Some(cond) => {
                        self.expression(cond)?;
                        Some(self.emit_jump(OpCode::JumpIfFalse, *line))
                    }
                    None => None,
                };
                self.push_loop(start, true);
                self.statement(body)?;
                // Les `continue` atterrissent sur l'incrément.
                let continues = std::mem::take(&mut self.current_loop().continues);
                for c in continues {
                    self.patch_jump(c, *line)?;
                }
                if let Some(incr) = incr {
                    self.expression(incr)?;
                    self.emit_op(OpCode::Pop, *line);
                }
                self.emit_loop(start, *line)?;
                if let Some(exit) = exit {
                    self.patch_jump(exit, *line)?;
                }
                self.finish_loop(*line)?;
                self.end_scope(*line);
            }
            Stmt::Use { module, line } => {
                let idx = self.string_constant(module, *line)?;
                self.emit_op(OpCode::UseModule, *line);
                self.emit_byte(idx, *line);
            }
            Stmt::UsingFile { path, line } => {
                let idx = self.string_constant(path, *line)?;
                self.emit_op(OpCode::UsingFile, *line);
                self.emit_byte(idx, *line);
            }
            Stmt::Fun { name, params, return_ty, body, line } => {
                let proto = self.function(name, params, *return_ty, body, FnKind::Function)?;
                let idx = self.constant(Constant::Function(proto), *line)?;
                self.emit_op(OpCode::Closure, *line);
                self.emit_byte(idx, *line);
                self.define_named(name, None, *line)?;
            }
            Stmt::Return { value, line } => {
                match value {
                    Some(expr) => self.expression(expr)?,
                    None => self.emit_op(OpCode::Nil, *line),
                }
                self.emit_op(OpCode::Return, *line);
            }
            Stmt::Class { name, methods, line } => {
                let mut compiled = Vec::with_capacity(methods.len());
                for m in methods {
                    let kind = if m.name == "init" || m.name == "initialize" {
                        FnKind::Initializer
                    } else {
                        FnKind::Method
                    };
                    let proto = self.function(&m.name, &m.params, m.return_ty, &m.body, kind)?;
                    compiled.push((m.name.clone(), proto));
                }
                let class = Rc::new(ClassProto { name: name.clone(), methods: compiled });
                self.emit_constant(Constant::Class(class), *line)?;
                self.define_named(name, None, *line)?;
            }
            Stmt::Break { line } => {
                let depth = self.innermost_loop_depth(*line, "break")?;
                self.pop_scoped_locals(depth, *line);
                self.close_tries_from(depth, *line);
                let jump = self.emit_jump(OpCode::Jump, *line);
                self.current_loop().breaks.push(jump);
            }
            Stmt::Continue { line } => {
                let depth = self.innermost_loop_depth(*line, "continue")?;
                self.pop_scoped_locals(depth, *line);
                self.close_tries_from(depth, *line);
                if self.current_loop().forward_continue {
                    let jump = self.emit_jump(OpCode::Jump, *line);
                    self.current_loop().continues.push(jump);
                } else {
                    let start = self.current_loop().start;
                    self.emit_loop(start, *line)?;
                }
            }
            Stmt::Match { scrutinee, cases, default, line } => {
                self.match_statement(scrutinee, cases, default.as_deref(), *line)?;
            }
            Stmt::Try { body, catch, finally, line } => {
                self.try_statement(body, catch.as_ref(), finally.as_deref(), *line)?;
            }
            Stmt::Throw { value, line } => {
                self.expression(value)?;
                self.emit_op(OpCode::Throw, *line);
            }
            Stmt::Retry { line } => self.retry_statement(*line)?,
            Stmt::Safe { body, line } => {
                // Les annotations obligatoires sont vérifiées par le parser ;
                // à l'émission un bloc safe est un bloc ordinaire.
                self.begin_scope();
                for s in body {
                    self.statement(s)?;
                }
                self.end_scope(*line);
            }
        }
        Ok(())
    }

    fn var_statement(
        &mut self,
        name: &str,
        ty: Option<TypeTag>,
        init: &Option<Expr>,
        line: u32,
    ) -> CResult<()> {
        match init {
            Some(expr) => self.expression(expr)?,
            None => self.emit_op(OpCode::Nil, line),
        }
        if self.is_global_scope() {
            let idx = self.string_constant(name, line)?;
            match ty {
                Some(tag) => {
                    self.emit_op(OpCode::DefineTypedGlobal, line);
                    self.emit_byte(idx, line);
                    self.emit_byte(tag as u8, line);
                    self.global_types.insert(name.to_string(), tag);
                }
                None => {
                    self.emit_op(OpCode::DefineGlobal, line);
                    self.emit_byte(idx, line);
                }
            }
        } else {
            let slot = self.add_local(name, ty, line)?;
            if let Some(tag) = ty {
                // Auto-affectation : déclenche la vérification de type sur
                // la valeur initiale.
                self.emit_op(OpCode::SetLocalTyped, line);
                self.emit_byte(slot, line);
                self.emit_byte(tag as u8, line);
            }
        }
        Ok(())
    }

    /// Lie la valeur au sommet de pile sous `name` : globale au niveau
    /// module, locale sinon.
    fn define_named(&mut self, name: &str, ty: Option<TypeTag>, line: u32) -> CResult<()> {
        if self.is_global_scope() {
            let idx = self.string_constant(name, line)?;
            self.emit_op(OpCode::DefineGlobal, line);
            self.emit_byte(idx, line);
        } else {
            self.add_local(name, ty, line)?;
        }
        Ok(())
    }

    fn function(
        &mut self,
        name: &str,
        params: &[Param],
        return_ty: Option<TypeTag>,
        body: &[Stmt],
        kind: FnKind,
    ) -> CResult<Rc<FunctionProto>> {
        self.push_ctx(name, kind);
        {
            let ctx = self.ctx();
            ctx.proto.arity = params.len() as u8;
            ctx.proto.return_type = return_ty;
            ctx.proto.param_types = params.iter().map(|p| p.ty).collect();
        }
        for p in params {
            let depth = self.ctx_ref().scope_depth;
            let ctx = self.ctx();
            ctx.locals.push(Local { name: p.name.clone(), depth, ty: p.ty });
        }
        for stmt in body {
            self.statement(stmt)?;
        }
        // Retour implicite.
        let line = last_line(body);
        self.emit_op(OpCode::Nil, line);
        self.emit_op(OpCode::Return, line);
        Ok(Rc::new(self.pop_ctx()))
    }

    fn match_statement(
        &mut self,
        scrutinee: &Expr,
        cases: &[MatchCase],
        default: Option<&[Stmt]>,
        line: u32,
    ) -> CResult<()> {
        self.expression(scrutinee)?;
        self.begin_scope();
        let slot = self.add_local("<match>", None, line)?;
        let mut end_jumps = Vec::new();
        for case in cases {
            self.emit_op(OpCode::GetLocal, case.line);
            self.emit_byte(slot, case.line);
            self.expression(&case.value)?;
            self.emit_op(OpCode::Equal, case.line);
            let next = self.emit_jump(OpCode::JumpIfFalse, case.line);
            self.begin_scope();
            for s in &case.body {
                self.statement(s)?;
            }
            self.end_scope(case.line);
            end_jumps.push(self.emit_jump(OpCode::Jump, case.line));
            self.patch_jump(next, case.line)?;
        }
        if let Some(default) = default {
            self.begin_scope();
            for s in default {
                self.statement(s)?;
            }
            self.end_scope(line);
        }
        for j in end_jumps {
            self.patch_jump(j, line)?;
        }
        self.end_scope(line);
        Ok(())
    }

    fn try_statement(
        &mut self,
        body: &[Stmt],
        catch: Option<&(String, Vec<Stmt>)>,
        finally: Option<&[Stmt]>,
        line: u32,
    ) -> CResult<()> {
        let try_op = self.here();
        self.emit_op(OpCode::Try, line);
        let operands_at = self.here();
        for _ in 0..6 {
            self.emit_byte(0xFF, line);
        }
        let depth = self.ctx_ref().scope_depth;
        self.ctx().tries.push(TryCtx { try_op, operands_at, depth, in_catch: false });

        self.begin_scope();
        for s in body {
            self.statement(s)?;
        }
        self.end_scope(line);
        let normal_jump = self.emit_jump(OpCode::Jump, line);
        let try_end = self.here();

        let catch_start = match catch {
            Some((param, handler)) => {
                let at = self.here();
                if let Some(t) = self.ctx().tries.last_mut() {
                    t.in_catch = true;
                }
                self.begin_scope();
                // La VM pousse l'exception : elle occupe ce slot.
                self.add_local(param, None, line)?;
                for s in handler {
                    self.statement(s)?;
                }
                self.end_scope(line);
                if let Some(t) = self.ctx().tries.last_mut() {
                    t.in_catch = false;
                }
                Some(at)
            }
            None => None,
        };

        // Chemin normal : on saute le catch et on tombe sur le finally
        // (ou directement sur EndTry).
        self.patch_jump(normal_jump, line)?;

        let finally_start = match finally {
            Some(stmts) => {
                let at = self.here();
                self.begin_scope();
                for s in stmts {
                    self.statement(s)?;
                }
                self.end_scope(line);
                Some(at)
            }
            None => None,
        };

        self.emit_op(OpCode::EndTry, line);

        let chunk = &mut self.ctx().proto.chunk;
        chunk.patch_u16(operands_at, try_end as u16);
        chunk.patch_u16(operands_at + 2, catch_start.map_or(TRY_NONE, |o| o as u16));
        chunk.patch_u16(operands_at + 4, finally_start.map_or(TRY_NONE, |o| o as u16));
        self.ctx().tries.pop();
        Ok(())
    }

    fn retry_statement(&mut self, line: u32) -> CResult<()> {
        let Some(pos) = self.ctx_ref().tries.iter().rposition(|t| t.in_catch) else {
            return Err(self.error(
                line,
                CompileErrorKind::Syntax,
                "'retry' is only allowed inside a catch block.",
            ));
        };
        let t = &self.ctx_ref().tries[pos];
        let (try_op, depth) = (t.try_op, t.depth);
        let open = self.ctx_ref().tries.len() - pos;
        self.pop_scoped_locals(depth, line);
        // Les frames d'exception vivent jusqu'à `EndTry` : on retire
        // celles du try re-entré et de tout try ouvert plus profond,
        // sinon chaque itération en empilerait davantage.
        for _ in 0..open {
            self.emit_op(OpCode::EndTry, line);
        }
        self.emit_loop(try_op, line)
    }

    // ---- helpers boucles ----

    fn push_loop(&mut self, start: usize, forward_continue: bool) {
        let depth = self.ctx_ref().scope_depth;
        self.ctx().loops.push(LoopCtx {
            start,
            breaks: Vec::new(),
            continues: Vec::new(),
            forward_continue,
            depth,
        });
    }

    fn current_loop(&mut self) -> &mut LoopCtx {
        self.ctx().loops.last_mut().expect("no enclosing loop")
    }

    fn innermost_loop_depth(&mut self, line: u32, what: &str) -> CResult<usize> {
        match self.ctx_ref().loops.last() {
            Some(l) => Ok(l.depth),
            None => Err(self.error(
                line,
                CompileErrorKind::Syntax,
                format!("'{what}' outside of a loop."),
            )),
        }
    }

    /// Dépile (à l'exécution) les locales plus profondes que `depth`, sans
    /// toucher au suivi du compilateur — le flot qui suit reste dans la
    /// même structure lexicale.
    fn pop_scoped_locals(&mut self, depth: usize, line: u32) {
        let pops = self
            .ctx_ref()
            .locals
            .iter()
            .filter(|l| l.depth > depth)
            .count();
        for _ in 0..pops {
            self.emit_op(OpCode::Pop, line);
        }
    }

    /// Retire (à l'exécution) les frames d'exception des `try` ouverts à
    /// `depth` ou plus profond — un saut qui quitte la construction ne
    /// doit pas laisser de frame orpheline derrière lui.
    fn close_tries_from(&mut self, depth: usize, line: u32) {
        let count = self
            .ctx_ref()
            .tries
            .iter()
            .filter(|t| t.depth >= depth)
            .count();
        for _ in 0..count {
            self.emit_op(OpCode::EndTry, line);
        }
    }

    fn finish_loop(&mut self, line: u32) -> CResult<()> {
        let ctx = self.ctx();
        let lp = ctx.loops.pop().expect("loop underflow");
        debug_assert!(lp.continues.is_empty() || !lp.forward_continue, "continues non patchés");
        for b in lp.breaks {
            self.patch_jump(b, line)?;
        }
        for c in lp.continues {
            // while/do-while : `continue` a déjà émis son Loop ; il ne
            // reste rien. (Liste toujours vide dans ce cas.)
            self.patch_jump(c, line)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self, expr: &Expr) -> CResult<()> {
        match expr {
            Expr::Literal { value, line } => match value {
                Lit::Nil => self.emit_op(OpCode::Nil, *line),
                Lit::Bool(true) => self.emit_op(OpCode::True, *line),
                Lit::Bool(false) => self.emit_op(OpCode::False, *line),
                Lit::Number(n) => self.emit_constant(Constant::Number(*n), *line)?,
                Lit::Str(s) => self.emit_constant(Constant::Str(s.clone()), *line)?,
            },
            Expr::Variable { name, line } => match self.resolve_local(name) {
                Some((slot, _)) => {
                    self.emit_op(OpCode::GetLocal, *line);
                    self.emit_byte(slot, *line);
                }
                None => {
                    let idx = self.string_constant(name, *line)?;
                    self.emit_op(OpCode::GetGlobal, *line);
                    self.emit_byte(idx, *line);
                }
            },
            Expr::Assign { name, value, line } => {
                self.expression(value)?;
                match self.resolve_local(name) {
                    Some((slot, Some(tag))) => {
                        self.emit_op(OpCode::SetLocalTyped, *line);
                        self.emit_byte(slot, *line);
                        self.emit_byte(tag as u8, *line);
                    }
                    Some((slot, None)) => {
                        self.emit_op(OpCode::SetLocal, *line);
                        self.emit_byte(slot, *line);
                    }
                    None => {
                        let idx = self.string_constant(name, *line)?;
                        let op = if self.global_types.contains_key(name) {
                            OpCode::SetGlobalTyped
                        } else {
                            OpCode::SetGlobal
                        };
                        self.emit_op(op, *line);
                        self.emit_byte(idx, *line);
                    }
                }
            }
            Expr::Binary { left, op, right, line } => {
                self.expression(left)?;
                self.expression(right)?;
                let code = match op {
                    BinOp::Add => OpCode::Add,
                    BinOp::Sub => OpCode::Subtract,
                    BinOp::Mul => OpCode::Multiply,
                    BinOp::Div => OpCode::Divide,
                    BinOp::Mod => OpCode::Modulo,
                    BinOp::Equal => OpCode::Equal,
                    BinOp::NotEqual => OpCode::NotEqual,
                    BinOp::Greater => OpCode::Greater,
                    BinOp::Less => OpCode::Less,
                    BinOp::BitAnd => OpCode::BitAnd,
                    BinOp::BitOr => OpCode::BitOr,
                    BinOp::BitXor => OpCode::BitXor,
                    BinOp::Shl => OpCode::ShiftLeft,
                    BinOp::Shr => OpCode::ShiftRight,
                    // >= / <= : composés sur les comparateurs stricts.
                    BinOp::GreaterEqual => {
                        self.emit_op(OpCode::Less, *line);
                        self.emit_op(OpCode::Not, *line);
                        return Ok(());
                    }
                    BinOp::LessEqual => {
                        self.emit_op(OpCode::Greater, *line);
                        self.emit_op(OpCode::Not, *line);
                        return Ok(());
                    }
                };
                self.emit_op(code, *line);
            }
            Expr::Logical { left, op, right, line } => {
                self.expression(left)?;
                self.emit_op(OpCode::Dup, *line);
                match op {
                    LogicOp::And => {
                        // gauche falsy → on la garde ; sinon droite.
                        let short = self.emit_jump(OpCode::JumpIfFalse, *line);
                        self.emit_op(OpCode::Pop, *line);
                        self.expression(right)?;
                        self.patch_jump(short, *line)?;
                    }
                    LogicOp::Or => {
                        // gauche falsy → droite ; sinon on la garde.
                        let rhs = self.emit_jump(OpCode::JumpIfFalse, *line);
                        let end = self.emit_jump(OpCode::Jump, *line);
                        self.patch_jump(rhs, *line)?;
                        self.emit_op(OpCode::Pop, *line);
                        self.expression(right)?;
                        self.patch_jump(end, *line)?;
                    }
                }
            }
            Expr::Unary { op, expr, line } => {
                self.expression(expr)?;
                let code = match op {
                    UnaryOp::Neg => OpCode::Negate,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::BitNot => OpCode::BitNot,
                };
                self.emit_op(code, *line);
            }
            Expr::Grouping { expr } => self.expression(expr)?,
            Expr::Call { callee, args, line } => {
                self.expression(callee)?;
                for a in args {
                    self.expression(a)?;
                }
                self.emit_op(OpCode::Call, *line);
                self.emit_byte(args.len() as u8, *line);
            }
            Expr::Member { object, name, line } => {
                self.expression(object)?;
                let idx = self.string_constant(name, *line)?;
                self.emit_op(OpCode::GetProperty, *line);
                self.emit_byte(idx, *line);
            }
            Expr::MemberSet { object, name, value, line } => {
                self.expression(object)?;
                self.expression(value)?;
                let idx = self.string_constant(name, *line)?;
                self.emit_op(OpCode::SetProperty, *line);
                self.emit_byte(idx, *line);
            }
            Expr::IndexGet { object, index, line } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit_op(OpCode::IndexGet, *line);
            }
            Expr::IndexSet { object, index, value, line } => {
                self.expression(object)?;
                self.expression(index)?;
                self.expression(value)?;
                self.emit_op(OpCode::IndexSet, *line);
            }
            Expr::ArrayLit { elements, line } => {
                for e in elements {
                    self.expression(e)?;
                }
                self.emit_op(OpCode::Array, *line);
                self.emit_byte(elements.len() as u8, *line);
            }
            Expr::ObjectLit { props, line } => {
                for (key, value) in props {
                    self.emit_constant(Constant::Str(key.clone()), *line)?;
                    self.expression(value)?;
                }
                self.emit_op(OpCode::Object, *line);
                self.emit_byte(props.len() as u8, *line);
            }
            Expr::Lambda { params, return_ty, body, line } => {
                let proto =
                    self.function("<lambda>", params, *return_ty, body, FnKind::Function)?;
                let idx = self.constant(Constant::Function(proto), *line)?;
                self.emit_op(OpCode::Closure, *line);
                self.emit_byte(idx, *line);
            }
            Expr::This { line } => {
                if !matches!(self.ctx_ref().kind, FnKind::Method | FnKind::Initializer) {
                    return Err(self.error(
                        *line,
                        CompileErrorKind::Syntax,
                        "'this' is only allowed inside class methods.",
                    ));
                }
                self.emit_op(OpCode::This, *line);
            }
            Expr::Ternary { cond, then, otherwise, line } => {
                self.expression(cond)?;
                let else_jump = self.emit_jump(OpCode::JumpIfFalse, *line);
                self.expression(then)?;
                let end_jump = self.emit_jump(OpCode::Jump, *line);
                self.patch_jump(else_jump, *line)?;
                self.expression(otherwise)?;
                self.patch_jump(end_jump, *line)?;
            }
        }
        Ok(())
    }
}

fn last_line(statements: &[Stmt]) -> u32 {
    fn stmt_line(s: &Stmt) -> u32 {
        match s {
            Stmt::Expression { expr } => expr.line(),
            Stmt::Say { line, .. }
            | Stmt::Var { line, .. }
            | Stmt::If { line, .. }
            | Stmt::While { line, .. }
            | Stmt::DoWhile { line, .. }
            | Stmt::For { line, .. }
            | Stmt::Use { line, .. }
            | Stmt::UsingFile { line, .. }
            | Stmt::Fun { line, .. }
            | Stmt::Return { line, .. }
            | Stmt::Class { line, .. }
            | Stmt::Break { line }
            | Stmt::Continue { line }
            | Stmt::Match { line, .. }
            | Stmt::Try { line, .. }
            | Stmt::Throw { line, .. }
            | Stmt::Retry { line }
            | Stmt::Safe { line, .. } => *line,
            Stmt::Block { statements } => last_line(statements),
        }
    }
    statements.last().map(stmt_line).unwrap_or(0)
}

/* ------------------------------- Tests ------------------------------- */
