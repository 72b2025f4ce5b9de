//! neutron-stdlib — Modules intégrés du runtime Neutron.
//!
//! Chaque module expose un initialiseur `fn(&mut Vm)` enregistré dans le
//! registre de la VM par [`install`] ; le chargeur le dispatche par nom
//! sans recherche de fichiers, sous le protocole d'isolation des
//! globales (les natives définies ici atterrissent dans l'environnement
//! du module, pas dans les globales de l'appelant).
//!
//! Jeu livré : `json`, `math`, `sys`, `time`, `fmt`, `arrays`, `random`,
//! `regex`, `crypto`, `path`, `async`, `process` — plus un stub `http`
//! qui renvoie vers l'extension native.

pub mod arrays;
pub mod asyncmod;
pub mod crypto;
pub mod fmtmod;
pub mod http;
pub mod json;
pub mod math;
pub mod pathmod;
pub mod processmod;
pub mod random;
pub mod regexmod;
pub mod sysmod;
pub mod time;

use neutron_vm::error::RuntimeError;
use neutron_vm::value::{display_value, Value};
use neutron_vm::Vm;

/// Enregistre tous les modules intégrés dans le registre du chargeur.
pub fn install(vm: &mut Vm) {
    vm.register_builtin("json", json::init);
    vm.register_builtin("math", math::init);
    vm.register_builtin("sys", sysmod::init);
    vm.register_builtin("time", time::init);
    vm.register_builtin("fmt", fmtmod::init);
    vm.register_builtin("arrays", arrays::init);
    vm.register_builtin("random", random::init);
    vm.register_builtin("regex", regexmod::init);
    vm.register_builtin("crypto", crypto::init);
    vm.register_builtin("path", pathmod::init);
    vm.register_builtin("async", asyncmod::init);
    vm.register_builtin("process", processmod::init);
    vm.register_builtin("http", http::init);
}

// ---- extracteurs d'arguments partagés ----

pub(crate) fn want_number(name: &str, args: &[Value], i: usize) -> Result<f64, RuntimeError> {
    match args.get(i) {
        Some(Value::Number(n)) => Ok(*n),
        Some(other) => Err(RuntimeError::type_error(format!(
            "{name} expects a number as argument {}, got {}.",
            i + 1,
            other.type_name()
        ))),
        None => Err(RuntimeError::argument(format!(
            "{name} is missing argument {}.",
            i + 1
        ))),
    }
}

pub(crate) fn want_string(
    vm: &Vm,
    name: &str,
    args: &[Value],
    i: usize,
) -> Result<String, RuntimeError> {
    match args.get(i) {
        Some(Value::Str(h)) => Ok(vm.heap.str_chars(*h).to_string()),
        Some(other) => Err(RuntimeError::type_error(format!(
            "{name} expects a string as argument {}, got {}.",
            i + 1,
            other.type_name()
        ))),
        None => Err(RuntimeError::argument(format!(
            "{name} is missing argument {}.",
            i + 1
        ))),
    }
}

pub(crate) fn want_array(
    name: &str,
    args: &[Value],
    i: usize,
) -> Result<neutron_vm::heap::Handle, RuntimeError> {
    match args.get(i) {
        Some(Value::Array(h)) => Ok(*h),
        Some(other) => Err(RuntimeError::type_error(format!(
            "{name} expects an array as argument {}, got {}.",
            i + 1,
            other.type_name()
        ))),
        None => Err(RuntimeError::argument(format!(
            "{name} is missing argument {}.",
            i + 1
        ))),
    }
}

/// Rendu `toString` d'un argument, quel que soit son type.
pub(crate) fn rendered(vm: &Vm, v: Value) -> String {
    display_value(&vm.heap, v)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// VM de test avec la stdlib installée.
    pub(crate) fn stdlib_vm() -> Vm {
        let mut vm = Vm::new();
        install(&mut vm);
        vm
    }

    pub(crate) fn eval(src: &str) -> Vm {
        let mut vm = stdlib_vm();
        vm.execute_string(src, "<test>").expect("exécution ok");
        vm
    }

    pub(crate) fn global_str(vm: &Vm, name: &str) -> String {
        display_value(&vm.heap, vm.globals[name])
    }

    #[test]
    fn install_registers_every_module() {
        let mut vm = stdlib_vm();
        for name in ["json", "math", "sys", "time", "fmt", "arrays", "random", "regex",
                     "crypto", "path", "async", "process"] {
            vm.execute_string(&format!("use {name};"), "<t>")
                .unwrap_or_else(|e| panic!("module {name}: {e}"));
        }
    }

    #[test]
    fn http_stub_raises_module_error() {
        let mut vm = stdlib_vm();
        let err = vm.execute_string("use http;", "<t>").unwrap_err();
        assert!(err.to_string().contains("http"));
    }
}
