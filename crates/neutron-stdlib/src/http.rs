//! http.rs — Stub du module `http`.
//!
//! Le client complet vit dans l'extension native (chargée par dlopen
//! comme n'importe quel module natif). Le nom reste réservé ici pour que
//! `use http;` produise une erreur dirigée plutôt qu'une recherche de
//! fichiers qui échoue en silence.

use neutron_vm::error::RuntimeError;
use neutron_vm::Vm;

pub fn init(_vm: &mut Vm) -> Result<(), RuntimeError> {
    Err(RuntimeError::module(
        "The 'http' module ships as a native extension; install it into \
         .box/modules/http/ (or a module search path) and retry.",
    ))
}

#[cfg(test)]
mod tests {
    use crate::tests::stdlib_vm;

    #[test]
    fn use_http_points_at_the_native_extension() {
        let mut vm = stdlib_vm();
        let err = vm.execute_string("use http;", "<t>").unwrap_err();
        assert!(err.to_string().contains(".box/modules/http"));
    }
}
