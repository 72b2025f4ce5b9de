//! parser.rs — Descente récursive : tokens → AST.
//!
//! Précédences, de la plus faible à la plus forte :
//!   assignment → ternaire → or → and → bit-or → bit-xor → bit-and →
//!   égalité → comparaison → décalages → terme → facteur → unaire →
//!   appel / membre / index → primaire
//!
//! La première erreur de syntaxe est fatale ; `synchronize` ne sert qu'à
//! produire un message propre sur la frontière d'instruction.

use neutron_core::TypeTag;

use crate::ast::*;
use crate::error::{CompileError, CompileErrorKind};
use crate::token::{Token, TokenKind};

pub struct Parser {
    tokens: Vec<Token>,
    current: usize,
    file: String,
    /// Profondeur de blocs `safe` ouverts (annotations obligatoires).
    safe_depth: usize,
}

type PResult<T> = Result<T, CompileError>;

impl Parser {
    pub fn new(tokens: Vec<Token>, file: impl Into<String>) -> Self {
        Self { tokens, current: 0, file: file.into(), safe_depth: 0 }
    }

    /// Parse un programme complet.
    pub fn parse(mut self) -> PResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::Eof) {
            statements.push(self.declaration()?);
        }
        Ok(statements)
    }

    // ------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------

    fn declaration(&mut self) -> PResult<Stmt> {
        if self.matches(&TokenKind::Var) {
            return self.var_declaration();
        }
        if self.check(&TokenKind::Fun) && self.check_next_identifier() {
            self.advance(); // fun
            return self.fun_declaration();
        }
        if self.matches(&TokenKind::Class) {
            return self.class_declaration();
        }
        self.statement()
    }

    fn var_declaration(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        let name = self.consume_identifier("Expected variable name after 'var'.")?;
        let ty = if self.matches(&TokenKind::Colon) {
            Some(self.consume_type("Expected type annotation after ':'.")?)
        } else {
            None
        };
        if self.safe_depth > 0 && ty.is_none() {
            return Err(self.error_at_previous(
                CompileErrorKind::Type,
                format!("Variable '{name}' inside a safe block requires a type annotation."),
            ));
        }
        let init = if self.matches(&TokenKind::Equal) {
            Some(self.expression()?)
        } else {
            None
        };
        self.consume(&TokenKind::Semicolon, "Expected ';' after variable declaration.")?;
        Ok(Stmt::Var { name, ty, init, line })
    }

    fn fun_declaration(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        let name = self.consume_identifier("Expected function name after 'fun'.")?;
        let (params, return_ty, body) = self.function_rest("function")?;
        Ok(Stmt::Fun { name, params, return_ty, body, line })
    }

    /// `(params) [: type] { body }` — partagé entre fonctions, lambdas et
    /// méthodes.
    fn function_rest(
        &mut self,
        what: &str,
    ) -> PResult<(Vec<Param>, Option<TypeTag>, Vec<Stmt>)> {
        self.consume(&TokenKind::LeftParen, format!("Expected '(' after {what} name."))?;
        let mut params = Vec::new();
        if !self.check(&TokenKind::RightParen) {
            loop {
                if params.len() >= 255 {
                    return Err(self.error_at_current(
                        CompileErrorKind::Syntax,
                        "Cannot have more than 255 parameters.",
                    ));
                }
                let pname = self.consume_identifier("Expected parameter name.")?;
                let pty = if self.matches(&TokenKind::Colon) {
                    Some(self.consume_type("Expected type annotation after ':'.")?)
                } else {
                    None
                };
                params.push(Param { name: pname, ty: pty });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RightParen, "Expected ')' after parameters.")?;
        let return_ty = if self.matches(&TokenKind::Colon) {
            Some(self.consume_type("Expected return type after ':'.")?)
        } else {
            None
        };
        self.consume(&TokenKind::LeftBrace, format!("Expected '{{' before {what} body."))?;
        let body = self.block_statements()?;
        Ok((params, return_ty, body))
    }

    fn class_declaration(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        let name = self.consume_identifier("Expected class name after 'class'.")?;
        self.consume(&TokenKind::LeftBrace, "Expected '{' before class body.")?;
        let mut methods = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            // `static` est accepté et ignoré : les méthodes vivent toutes
            // dans la table de la classe.
            self.matches(&TokenKind::Static);
            let mline = self.current_line();
            let mname = self.consume_identifier("Expected method name in class body.")?;
            let (params, return_ty, body) = self.function_rest("method")?;
            methods.push(MethodDecl { name: mname, params, return_ty, body, line: mline });
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after class body.")?;
        Ok(Stmt::Class { name, methods, line })
    }

    fn statement(&mut self) -> PResult<Stmt> {
        if self.matches(&TokenKind::Say) {
            let line = self.previous_line();
            let expr = self.expression()?;
            self.consume(&TokenKind::Semicolon, "Expected ';' after 'say' value.")?;
            return Ok(Stmt::Say { expr, line });
        }
        if self.matches(&TokenKind::LeftBrace) {
            return Ok(Stmt::Block { statements: self.block_statements()? });
        }
        if self.matches(&TokenKind::If) {
            return self.if_statement();
        }
        if self.matches(&TokenKind::While) {
            return self.while_statement();
        }
        if self.matches(&TokenKind::Do) {
            return self.do_while_statement();
        }
        if self.matches(&TokenKind::For) {
            return self.for_statement();
        }
        if self.matches(&TokenKind::Use) {
            let line = self.previous_line();
            let module = self.consume_identifier("Expected module name after 'use'.")?;
            self.consume(&TokenKind::Semicolon, "Expected ';' after module name.")?;
            return Ok(Stmt::Use { module, line });
        }
        if self.matches(&TokenKind::Using) {
            let line = self.previous_line();
            let path = self.consume_string("Expected file path string after 'using'.")?;
            self.consume(&TokenKind::Semicolon, "Expected ';' after file path.")?;
            return Ok(Stmt::UsingFile { path, line });
        }
        if self.matches(&TokenKind::Return) {
            let line = self.previous_line();
            let value = if self.check(&TokenKind::Semicolon) {
                None
            } else {
                Some(self.expression()?)
            };
            self.consume(&TokenKind::Semicolon, "Expected ';' after return value.")?;
            return Ok(Stmt::Return { value, line });
        }
        if self.matches(&TokenKind::Break) {
            let line = self.previous_line();
            self.consume(&TokenKind::Semicolon, "Expected ';' after 'break'.")?;
            return Ok(Stmt::Break { line });
        }
        if self.matches(&TokenKind::Continue) {
            let line = self.previous_line();
            self.consume(&TokenKind::Semicolon, "Expected ';' after 'continue'.")?;
            return Ok(Stmt::Continue { line });
        }
        if self.matches(&TokenKind::Match) {
            return self.match_statement();
        }
        if self.matches(&TokenKind::Try) {
            return self.try_statement();
        }
        if self.matches(&TokenKind::Throw) {
            let line = self.previous_line();
            let value = self.expression()?;
            self.consume(&TokenKind::Semicolon, "Expected ';' after 'throw' value.")?;
            return Ok(Stmt::Throw { value, line });
        }
        if self.matches(&TokenKind::Retry) {
            let line = self.previous_line();
            self.consume(&TokenKind::Semicolon, "Expected ';' after 'retry'.")?;
            return Ok(Stmt::Retry { line });
        }
        if self.matches(&TokenKind::Safe) {
            let line = self.previous_line();
            self.consume(&TokenKind::LeftBrace, "Expected '{' after 'safe'.")?;
            self.safe_depth += 1;
            let body = self.block_statements();
            self.safe_depth -= 1;
            return Ok(Stmt::Safe { body: body?, line });
        }
        self.expression_statement()
    }

    fn block_statements(&mut self) -> PResult<Vec<Stmt>> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            statements.push(self.declaration()?);
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after block.")?;
        Ok(statements)
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'if'.")?;
        let cond = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition.")?;
        let then = Box::new(self.statement()?);
        let otherwise = if self.matches(&TokenKind::Elif) {
            // `elif` se replie sur un `if` imbriqué.
            Some(Box::new(self.if_statement()?))
        } else if self.matches(&TokenKind::Else) {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Stmt::If { cond, then, otherwise, line })
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'.")?;
        let cond = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition.")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::While { cond, body, line })
    }

    fn do_while_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        let body = Box::new(self.statement()?);
        self.consume(&TokenKind::While, "Expected 'while' after 'do' body.")?;
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'while'.")?;
        let cond = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after condition.")?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after do-while.")?;
        Ok(Stmt::DoWhile { body, cond, line })
    }

    fn for_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'for'.")?;
        let init = if self.matches(&TokenKind::Semicolon) {
            None
        } else if self.matches(&TokenKind::Var) {
            Some(Box::new(self.var_declaration()?))
        } else {
            Some(Box::new(self.expression_statement()?))
        };
        let cond = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(&TokenKind::Semicolon, "Expected ';' after loop condition.")?;
        let incr = if self.check(&TokenKind::RightParen) {
            None
        } else {
            Some(self.expression()?)
        };
        self.consume(&TokenKind::RightParen, "Expected ')' after for clauses.")?;
        let body = Box::new(self.statement()?);
        Ok(Stmt::For { init, cond, incr, body, line })
    }

    fn match_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        self.consume(&TokenKind::LeftParen, "Expected '(' after 'match'.")?;
        let scrutinee = self.expression()?;
        self.consume(&TokenKind::RightParen, "Expected ')' after match value.")?;
        self.consume(&TokenKind::LeftBrace, "Expected '{' before match cases.")?;
        let mut cases = Vec::new();
        let mut default = None;
        while !self.check(&TokenKind::RightBrace) && !self.check(&TokenKind::Eof) {
            if self.matches(&TokenKind::Case) {
                let cline = self.previous_line();
                let value = self.expression()?;
                self.consume(&TokenKind::Arrow, "Expected '=>' after case value.")?;
                let body = self.arm_body()?;
                cases.push(MatchCase { value, body, line: cline });
            } else if self.matches(&TokenKind::Default) {
                if default.is_some() {
                    return Err(self.error_at_previous(
                        CompileErrorKind::Syntax,
                        "Duplicate 'default' arm in match.",
                    ));
                }
                self.consume(&TokenKind::Arrow, "Expected '=>' after 'default'.")?;
                default = Some(self.arm_body()?);
            } else {
                return Err(self.error_at_current(
                    CompileErrorKind::Syntax,
                    "Expected 'case' or 'default' in match body.",
                ));
            }
        }
        self.consume(&TokenKind::RightBrace, "Expected '}' after match cases.")?;
        Ok(Stmt::Match { scrutinee, cases, default, line })
    }

    /// Corps d'un bras : un bloc, ou une instruction simple.
    fn arm_body(&mut self) -> PResult<Vec<Stmt>> {
        if self.matches(&TokenKind::LeftBrace) {
            self.block_statements()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn try_statement(&mut self) -> PResult<Stmt> {
        let line = self.previous_line();
        self.consume(&TokenKind::LeftBrace, "Expected '{' after 'try'.")?;
        let body = self.block_statements()?;
        let catch = if self.matches(&TokenKind::Catch) {
            self.consume(&TokenKind::LeftParen, "Expected '(' after 'catch'.")?;
            let param = self.consume_identifier("Expected exception variable name.")?;
            self.consume(&TokenKind::RightParen, "Expected ')' after exception variable.")?;
            self.consume(&TokenKind::LeftBrace, "Expected '{' before catch body.")?;
            Some((param, self.block_statements()?))
        } else {
            None
        };
        let finally = if self.matches(&TokenKind::Finally) {
            self.consume(&TokenKind::LeftBrace, "Expected '{' before finally body.")?;
            Some(self.block_statements()?)
        } else {
            None
        };
        if catch.is_none() && finally.is_none() {
            return Err(self.error_at_previous(
                CompileErrorKind::Syntax,
                "A 'try' block requires at least a 'catch' or a 'finally' clause.",
            ));
        }
        Ok(Stmt::Try { body, catch, finally, line })
    }

    fn expression_statement(&mut self) -> PResult<Stmt> {
        let expr = self.expression()?;
        self.consume(&TokenKind::Semicolon, "Expected ';' after expression.")?;
        Ok(Stmt::Expression { expr })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub fn expression(&mut self) -> PResult<Expr> {
        self.assignment()
    }

    fn assignment(&mut self) -> PResult<Expr> {
        let expr = self.ternary()?;
        if self.matches(&TokenKind::Equal) {
            let line = self.previous_line();
            let value = Box::new(self.assignment()?);
            return match expr {
                Expr::Variable { name, .. } => Ok(Expr::Assign { name, value, line }),
                Expr::Member { object, name, .. } => {
                    Ok(Expr::MemberSet { object, name, value, line })
                }
                Expr::IndexGet { object, index, .. } => {
                    Ok(Expr::IndexSet { object, index, value, line })
                }
                _ => Err(self.error_at_previous(
                    CompileErrorKind::Syntax,
                    "Invalid assignment target.",
                )),
            };
        }
        Ok(expr)
    }

    fn ternary(&mut self) -> PResult<Expr> {
        let cond = self.logic_or()?;
        if self.matches(&TokenKind::Question) {
            let line = self.previous_line();
            let then = Box::new(self.expression()?);
            self.consume(&TokenKind::Colon, "Expected ':' in ternary expression.")?;
            let otherwise = Box::new(self.ternary()?);
            return Ok(Expr::Ternary { cond: Box::new(cond), then, otherwise, line });
        }
        Ok(cond)
    }

    fn logic_or(&mut self) -> PResult<Expr> {
        let mut expr = self.logic_and()?;
        while self.matches(&TokenKind::Or) || self.matches(&TokenKind::PipePipe) {
            let line = self.previous_line();
            let right = self.logic_and()?;
            expr = Expr::Logical {
                left: Box::new(expr),
                op: LogicOp::Or,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn logic_and(&mut self) -> PResult<Expr> {
        let mut expr = self.bit_or()?;
        while self.matches(&TokenKind::And) || self.matches(&TokenKind::AmpAmp) {
            let line = self.previous_line();
            let right = self.bit_or()?;
            expr = Expr::Logical {
                left: Box::new(expr),
                op: LogicOp::And,
                right: Box::new(right),
                line,
            };
        }
        Ok(expr)
    }

    fn bit_or(&mut self) -> PResult<Expr> {
        let mut expr = self.bit_xor()?;
        while self.matches(&TokenKind::Pipe) {
            let line = self.previous_line();
            let right = self.bit_xor()?;
            expr = self.binary(expr, BinOp::BitOr, right, line);
        }
        Ok(expr)
    }

    fn bit_xor(&mut self) -> PResult<Expr> {
        let mut expr = self.bit_and()?;
        while self.matches(&TokenKind::Caret) {
            let line = self.previous_line();
            let right = self.bit_and()?;
            expr = self.binary(expr, BinOp::BitXor, right, line);
        }
        Ok(expr)
    }

    fn bit_and(&mut self) -> PResult<Expr> {
        let mut expr = self.equality()?;
        while self.matches(&TokenKind::Ampersand) {
            let line = self.previous_line();
            let right = self.equality()?;
            expr = self.binary(expr, BinOp::BitAnd, right, line);
        }
        Ok(expr)
    }

    fn equality(&mut self) -> PResult<Expr> {
        let mut expr = self.comparison()?;
        loop {
            let op = if self.matches(&TokenKind::EqualEqual) {
                BinOp::Equal
            } else if self.matches(&TokenKind::BangEqual) {
                BinOp::NotEqual
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.comparison()?;
            expr = self.binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let mut expr = self.shift()?;
        loop {
            let op = if self.matches(&TokenKind::Greater) {
                BinOp::Greater
            } else if self.matches(&TokenKind::GreaterEqual) {
                BinOp::GreaterEqual
            } else if self.matches(&TokenKind::Less) {
                BinOp::Less
            } else if self.matches(&TokenKind::LessEqual) {
                BinOp::LessEqual
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.shift()?;
            expr = self.binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn shift(&mut self) -> PResult<Expr> {
        let mut expr = self.term()?;
        loop {
            let op = if self.matches(&TokenKind::LessLess) {
                BinOp::Shl
            } else if self.matches(&TokenKind::GreaterGreater) {
                BinOp::Shr
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.term()?;
            expr = self.binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn term(&mut self) -> PResult<Expr> {
        let mut expr = self.factor()?;
        loop {
            let op = if self.matches(&TokenKind::Plus) {
                BinOp::Add
            } else if self.matches(&TokenKind::Minus) {
                BinOp::Sub
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.factor()?;
            expr = self.binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn factor(&mut self) -> PResult<Expr> {
        let mut expr = self.unary()?;
        loop {
            let op = if self.matches(&TokenKind::Star) {
                BinOp::Mul
            } else if self.matches(&TokenKind::Slash) {
                BinOp::Div
            } else if self.matches(&TokenKind::Percent) {
                BinOp::Mod
            } else {
                break;
            };
            let line = self.previous_line();
            let right = self.unary()?;
            expr = self.binary(expr, op, right, line);
        }
        Ok(expr)
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = if self.matches(&TokenKind::Bang) {
            Some(UnaryOp::Not)
        } else if self.matches(&TokenKind::Minus) {
            Some(UnaryOp::Neg)
        } else if self.matches(&TokenKind::Tilde) {
            Some(UnaryOp::BitNot)
        } else {
            None
        };
        if let Some(op) = op {
            let line = self.previous_line();
            let expr = Box::new(self.unary()?);
            return Ok(Expr::Unary { op, expr, line });
        }
        self.call()
    }

    fn call(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;
        loop {
            if self.matches(&TokenKind::LeftParen) {
                let line = self.previous_line();
                let mut args = Vec::new();
                if !self.check(&TokenKind::RightParen) {
                    loop {
                        if args.len() >= 255 {
                            return Err(self.error_at_current(
                                CompileErrorKind::Syntax,
                                "Cannot have more than 255 arguments.",
                            ));
                        }
                        args.push(self.expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.consume(&TokenKind::RightParen, "Expected ')' after arguments.")?;
                expr = Expr::Call { callee: Box::new(expr), args, line };
            } else if self.matches(&TokenKind::Dot) {
                let line = self.previous_line();
                let name = self.consume_identifier("Expected property name after '.'.")?;
                expr = Expr::Member { object: Box::new(expr), name, line };
            } else if self.matches(&TokenKind::LeftBracket) {
                let line = self.previous_line();
                let index = Box::new(self.expression()?);
                self.consume(&TokenKind::RightBracket, "Expected ']' after index.")?;
                expr = Expr::IndexGet { object: Box::new(expr), index, line };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> PResult<Expr> {
        let line = self.current_line();
        if self.matches(&TokenKind::False) {
            return Ok(Expr::Literal { value: Lit::Bool(false), line });
        }
        if self.matches(&TokenKind::True) {
            return Ok(Expr::Literal { value: Lit::Bool(true), line });
        }
        if self.matches(&TokenKind::Nil) {
            return Ok(Expr::Literal { value: Lit::Nil, line });
        }
        if self.matches(&TokenKind::This) {
            return Ok(Expr::This { line });
        }
        if self.matches(&TokenKind::Fun) {
            // Lambda : `fun (a, b) { ... }`
            let (params, return_ty, body) = self.function_rest("lambda")?;
            return Ok(Expr::Lambda { params, return_ty, body, line });
        }
        if self.matches(&TokenKind::LeftParen) {
            let expr = Box::new(self.expression()?);
            self.consume(&TokenKind::RightParen, "Expected ')' after expression.")?;
            return Ok(Expr::Grouping { expr });
        }
        if self.matches(&TokenKind::LeftBracket) {
            let mut elements = Vec::new();
            if !self.check(&TokenKind::RightBracket) {
                loop {
                    elements.push(self.expression()?);
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::RightBracket, "Expected ']' after array elements.")?;
            return Ok(Expr::ArrayLit { elements, line });
        }
        if self.matches(&TokenKind::LeftBrace) {
            // Littéral objet : { "clé": valeur, ident: valeur, ... }
            let mut props = Vec::new();
            if !self.check(&TokenKind::RightBrace) {
                loop {
                    let key = match self.peek_kind().clone() {
                        TokenKind::Str(s) => {
                            self.advance();
                            s
                        }
                        TokenKind::Identifier(s) => {
                            self.advance();
                            s
                        }
                        _ => {
                            return Err(self.error_at_current(
                                CompileErrorKind::Syntax,
                                "Expected string or identifier as object key.",
                            ));
                        }
                    };
                    self.consume(&TokenKind::Colon, "Expected ':' after object key.")?;
                    props.push((key, self.expression()?));
                    if !self.matches(&TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(&TokenKind::RightBrace, "Expected '}' after object literal.")?;
            return Ok(Expr::ObjectLit { props, line });
        }
        match self.peek_kind().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Literal { value: Lit::Number(n), line })
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Literal { value: Lit::Str(s), line })
            }
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(Expr::Variable { name, line })
            }
            _ => Err(self.error_at_current(CompileErrorKind::Syntax, "Expected expression.")),
        }
    }

    #[inline]
    fn binary(&self, left: Expr, op: BinOp, right: Expr, line: u32) -> Expr {
        Expr::Binary { left: Box::new(left), op, right: Box::new(right), line }
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.current.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn previous(&self) -> &Token {
        &self.tokens[self.current.saturating_sub(1)]
    }

    fn current_line(&self) -> u32 {
        self.peek().line
    }

    fn previous_line(&self) -> u32 {
        self.previous().line
    }

    fn advance(&mut self) -> &Token {
        if !self.check(&TokenKind::Eof) {
            self.current += 1;
        }
        self.previous()
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn check_next_identifier(&self) -> bool {
        matches!(
            self.tokens.get(self.current + 1).map(|t| &t.kind),
            Some(TokenKind::Identifier(_))
        )
    }

    fn matches(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: impl Into<String>) -> PResult<()> {
        if self.check(kind) {
            self.advance();
            Ok(())
        } else {
            Err(self.error_at_current(CompileErrorKind::Syntax, message))
        }
    }

    fn consume_identifier(&mut self, message: &str) -> PResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            _ => Err(self.error_at_current(CompileErrorKind::Syntax, message)),
        }
    }

    fn consume_string(&mut self, message: &str) -> PResult<String> {
        match self.peek_kind().clone() {
            TokenKind::Str(s) => {
                self.advance();
                Ok(s)
            }
            _ => Err(self.error_at_current(CompileErrorKind::Syntax, message)),
        }
    }

    fn consume_type(&mut self, message: &str) -> PResult<TypeTag> {
        match self.peek_kind() {
            TokenKind::Type(tag) => {
                let tag = *tag;
                self.advance();
                Ok(tag)
            }
            _ => Err(self.error_at_current(CompileErrorKind::Syntax, message)),
        }
    }

    fn error_at_current(
        &self,
        kind: CompileErrorKind,
        message: impl Into<String>,
    ) -> CompileError {
        let t = self.peek();
        CompileError::new(
            kind,
            format!("{} Found {t}.", message.into()),
            self.file.clone(),
            t.line,
            t.column,
        )
    }

    fn error_at_previous(
        &self,
        kind: CompileErrorKind,
        message: impl Into<String>,
    ) -> CompileError {
        let t = self.previous();
        CompileError::new(kind, message, self.file.clone(), t.line, t.column)
    }
}
