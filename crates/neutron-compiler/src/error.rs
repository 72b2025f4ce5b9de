//! error.rs — Erreurs de compilation (scanner, parser, codegen).
//!
//! La première erreur est fatale : le frontend ne tente pas de réparer
//! au-delà d'une resynchronisation sur la frontière d'instruction.

use std::fmt;

use thiserror::Error;

/// Famille d'erreur de compilation, alignée sur la taxonomie du runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    Lexical,
    Syntax,
    Type,
}

impl fmt::Display for CompileErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompileErrorKind::Lexical => "LexicalError",
            CompileErrorKind::Syntax => "SyntaxError",
            CompileErrorKind::Type => "TypeError",
        })
    }
}

/// Erreur de compilation avec position source.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message} ({file}:{line}:{column})")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl CompileError {
    pub fn new(
        kind: CompileErrorKind,
        message: impl Into<String>,
        file: impl Into<String>,
        line: u32,
        column: u32,
    ) -> Self {
        Self { kind, message: message.into(), file: file.into(), line, column }
    }
}
