//! report.rs — Rapporteur d'erreurs.
//!
//! Sortie colorée (ANSI si stderr est un TTY), extrait de la ligne source
//! avec caret, trace de pile (une entrée par frame vivante), et une
//! suggestion choisie par heuristiques sur la famille d'erreur et le
//! message.

use colored::Colorize;

use neutron_compiler::CompileError;

use crate::error::{ErrorKind, FatalError};
use crate::modules;
use crate::Vm;

/// L'activation des couleurs passe par l'override global de `colored` ;
/// le rapporteur lui-même est sans état.
pub struct Reporter;

impl Default for Reporter {
    fn default() -> Self {
        Self::auto()
    }
}

impl Reporter {
    /// Couleur si stderr est un terminal.
    pub fn auto() -> Self {
        if !atty::is(atty::Stream::Stderr) {
            colored::control::set_override(false);
        }
        Reporter
    }

    pub fn plain() -> Self {
        colored::control::set_override(false);
        Reporter
    }

    /// Erreur de compilation : position + extrait + caret.
    pub fn report_compile_error(&self, error: &CompileError, source: Option<&str>) {
        eprintln!(
            "{}: {}",
            error.kind.to_string().red().bold(),
            error.message
        );
        eprintln!("  {} {}:{}:{}", "-->".blue(), error.file, error.line, error.column);
        if let Some(source) = source {
            let lines: Vec<&str> = source.lines().collect();
            self.excerpt_from(&lines, error.line, error.column);
        }
    }

    /// Erreur fatale d'exécution : message, extrait, trace, suggestion.
    pub fn report_fatal(&self, vm: &Vm, fatal: &FatalError) {
        eprintln!(
            "{}: {}",
            fatal.error.kind.to_string().red().bold(),
            fatal.error.message
        );
        eprintln!("  {} {}:{}", "-->".blue(), fatal.file, fatal.line);
        if let Some(lines) = vm.sources.get(&fatal.file) {
            let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
            self.excerpt_from(&refs, fatal.line, 0);
        }
        if !fatal.trace.is_empty() {
            eprintln!("{}", "Stack trace:".bold());
            for frame in &fatal.trace {
                eprintln!(
                    "  at {} ({}:{})",
                    frame.function.cyan(),
                    frame.file,
                    frame.line
                );
            }
        }
        if let Some(hint) = suggestion_for(fatal.error.kind, &fatal.error.message) {
            eprintln!("  {} {}", "= help:".green(), hint);
        }
    }

    /// Ligne incriminée avec un caret sous la colonne.
    fn excerpt_from(&self, lines: &[&str], line: u32, column: u32) {
        if line == 0 {
            return;
        }
        let Some(text) = lines.get(line as usize - 1) else {
            return;
        };
        let gutter = format!("{line:>4} ");
        eprintln!("{}{} {}", gutter.blue(), "|".blue(), text);
        let pad = " ".repeat(gutter.len() + 2 + column.saturating_sub(1) as usize);
        eprintln!("{pad}{}", "^".red().bold());
    }
}

/// Heuristiques de suggestion par famille et sous-chaîne du message.
fn suggestion_for(kind: ErrorKind, message: &str) -> Option<String> {
    match kind {
        ErrorKind::Reference => {
            if message.contains("Did you forget to import") {
                return None; // le message porte déjà la marche à suivre
            }
            if let Some(name) = quoted_name(message) {
                if modules::is_known_module_name(&name) {
                    return Some(format!("add 'use {name};' at the top of the file"));
                }
            }
            Some("check the spelling, or declare the variable with 'var' first".to_string())
        }
        ErrorKind::Division => {
            Some("guard the divisor with an 'if' before dividing".to_string())
        }
        ErrorKind::Argument => {
            Some("check the function signature for the expected arity".to_string())
        }
        ErrorKind::Stack if message.contains("overflow") => {
            Some("look for runaway recursion without a base case".to_string())
        }
        ErrorKind::Module => {
            Some("module names resolve against ., lib/, libs/, box/ and .box/modules/"
                .to_string())
        }
        ErrorKind::Type if message.contains("Cannot assign") => {
            Some("type annotations are enforced on every assignment; change the value \
                  or the annotation"
                .to_string())
        }
        _ => None,
    }
}

/// Extrait le premier nom entre quotes simples du message.
fn quoted_name(message: &str) -> Option<String> {
    let start = message.find('\'')? + 1;
    let end = message[start..].find('\'')? + start;
    Some(message[start..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_name_extraction() {
        assert_eq!(
            quoted_name("Undefined variable 'json'.").as_deref(),
            Some("json")
        );
        assert_eq!(quoted_name("no quotes here"), None);
    }

    #[test]
    fn module_names_get_an_import_hint() {
        let hint = suggestion_for(ErrorKind::Reference, "Undefined variable 'math'.").unwrap();
        assert!(hint.contains("use math;"));
        let generic =
            suggestion_for(ErrorKind::Reference, "Undefined variable 'wibble'.").unwrap();
        assert!(generic.contains("spelling"));
    }

    #[test]
    fn division_and_type_hints() {
        assert!(suggestion_for(ErrorKind::Division, "Division by zero.").is_some());
        assert!(suggestion_for(
            ErrorKind::Type,
            "Type mismatch: Cannot assign value of type 'string' to variable of type 'number'."
        )
        .is_some());
        assert!(suggestion_for(ErrorKind::Io, "whatever").is_none());
    }
}
