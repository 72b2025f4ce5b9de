//! error.rs — Taxonomie des erreurs d'exécution.
//!
//! Une erreur levée par la VM elle-même (type, division, référence…)
//! est d'abord confrontée à la pile de frames d'exception : couverte,
//! elle devient une valeur lançable (chaîne portant le message) ; sinon
//! elle remonte en [`FatalError`] avec sa trace de pile.

use std::fmt;

use thiserror::Error;

/// Famille d'erreur observable par le code utilisateur et le rapporteur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    Lexical,
    Type,
    Reference,
    Range,
    Argument,
    Division,
    Stack,
    Module,
    Io,
    Runtime,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Syntax => "SyntaxError",
            ErrorKind::Lexical => "LexicalError",
            ErrorKind::Type => "TypeError",
            ErrorKind::Reference => "ReferenceError",
            ErrorKind::Range => "RangeError",
            ErrorKind::Argument => "ArgumentError",
            ErrorKind::Division => "DivisionError",
            ErrorKind::Stack => "StackError",
            ErrorKind::Module => "ModuleError",
            ErrorKind::Io => "IOError",
            ErrorKind::Runtime => "RuntimeError",
        })
    }
}

/// Erreur d'exécution « brute », avant résolution de handler.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

/// Raccourcis pour les familles les plus fréquentes.
macro_rules! ctor {
    ($name:ident, $kind:ident) => {
        pub fn $name(message: impl Into<String>) -> RuntimeError {
            RuntimeError::new(ErrorKind::$kind, message)
        }
    };
}

impl RuntimeError {
    ctor!(type_error, Type);
    ctor!(reference, Reference);
    ctor!(range, Range);
    ctor!(argument, Argument);
    ctor!(division, Division);
    ctor!(stack, Stack);
    ctor!(module, Module);
    ctor!(io, Io);
    ctor!(runtime, Runtime);
}

/// Une entrée de trace : une frame vivante au moment de l'erreur.
#[derive(Debug, Clone)]
pub struct TraceFrame {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// Erreur fatale : aucune frame d'exception ne couvrait l'IP courant.
#[derive(Debug, Clone, Error)]
#[error("{error} at {file}:{line}")]
pub struct FatalError {
    pub error: RuntimeError,
    pub file: String,
    pub line: u32,
    /// Une entrée par frame vivante, la plus récente d'abord.
    pub trace: Vec<TraceFrame>,
}

/// Erreur interne du dispatch : soit une erreur d'exécution encore
/// rattrapable, soit une fatale déjà tracée qui remonte telle quelle.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}
