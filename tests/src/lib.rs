//! Aides partagées de la suite end-to-end.

use std::cell::RefCell;
use std::rc::Rc;

use neutron_vm::value::{display_value, Value};
use neutron_vm::{Host, Vm};

/// Hôte qui capture la sortie de `say` au lieu de l'imprimer.
pub struct CollectingHost {
    buffer: Rc<RefCell<String>>,
}

impl CollectingHost {
    pub fn new() -> (Self, Rc<RefCell<String>>) {
        let buffer = Rc::new(RefCell::new(String::new()));
        (Self { buffer: buffer.clone() }, buffer)
    }
}

impl Host for CollectingHost {
    fn print(&mut self, text: &str) {
        self.buffer.borrow_mut().push_str(text);
    }
}

/// Exécute une source dans une VM fraîche (stdlib installée) et rend la
/// machine plus tout ce que `say` a produit.
pub fn run_capturing(source: &str) -> (Vm, String) {
    let mut vm = Vm::new();
    neutron_stdlib::install(&mut vm);
    let (host, buffer) = CollectingHost::new();
    vm.set_host(Box::new(host));
    vm.execute_string(source, "<e2e>").expect("exécution ok");
    let out = buffer.borrow().clone();
    (vm, out)
}

/// Variante qui rend l'erreur au lieu de paniquer.
pub fn try_run(source: &str) -> Result<(Vm, String), String> {
    let mut vm = Vm::new();
    neutron_stdlib::install(&mut vm);
    let (host, buffer) = CollectingHost::new();
    vm.set_host(Box::new(host));
    match vm.execute_string(source, "<e2e>") {
        Ok(_) => {
            let out = buffer.borrow().clone();
            Ok((vm, out))
        }
        Err(e) => Err(e.to_string()),
    }
}

pub fn global_rendered(vm: &Vm, name: &str) -> String {
    display_value(&vm.heap, vm.globals[name])
}

pub fn global(vm: &Vm, name: &str) -> Value {
    vm.globals[name]
}
