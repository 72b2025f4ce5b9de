//! neutron-core — Briques partagées du langage Neutron.
//!
//! Ce crate porte ce dont le compilateur et la VM ont besoin tous les deux :
//!
//! - [`ops::OpCode`] : le jeu d'instructions (octets + opérandes immédiats)
//! - [`chunk::Chunk`] : flux d'instructions, table de lignes, pool de constantes
//! - [`chunk::FunctionProto`] : fonction compilée, partagée par `Rc`
//! - [`types::TypeTag`] : annotations de type optionnelles
//! - [`disasm`] : désassembleur lisible
//!
//! Aucun état d'exécution ici : les valeurs vivantes, le tas et le GC sont
//! dans `neutron-vm`.

pub mod chunk;
pub mod disasm;
pub mod ops;
pub mod types;

pub use chunk::{Chunk, ClassProto, Constant, FunctionProto, MAX_CONSTANTS};
pub use ops::{OpCode, TRY_NONE};
pub use types::TypeTag;

/// Version du runtime, affichée par `neutron --version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Profondeur maximale de la pile d'opérandes.
pub const STACK_MAX: usize = 4096;

/// Profondeur maximale de la pile d'appels.
pub const FRAMES_MAX: usize = 256;
