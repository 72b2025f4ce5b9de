//! env.rs — Chaîne d'environnements lexicaux.
//!
//! Un environnement est une map nom → valeur plus un pointeur vers
//! l'englobant. La résolution des locales de fonction passe par les slots
//! de pile ; la chaîne d'environnements ne sert qu'aux portées de module
//! (exports, symboles autour d'une classe, fermetures de module).
//!
//! Les environnements sont partagés par `Rc` (comme les autres états
//! coopératifs du runtime) ; leurs **valeurs** sont tracées par le GC.

use std::cell::RefCell;
use std::rc::Rc;

use crate::value::Value;

pub type EnvRef = Rc<RefCell<Env>>;

#[derive(Debug, Default)]
pub struct Env {
    pub enclosing: Option<EnvRef>,
    pub values: ahash::AHashMap<String, Value>,
}

impl Env {
    pub fn new() -> EnvRef {
        Rc::new(RefCell::new(Env::default()))
    }

    pub fn with_enclosing(enclosing: EnvRef) -> EnvRef {
        Rc::new(RefCell::new(Env { enclosing: Some(enclosing), values: Default::default() }))
    }

    /// Définit (ou écrase) localement.
    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Recherche en remontant la chaîne.
    pub fn get(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.values.get(name) {
            return Some(*v);
        }
        self.enclosing.as_ref().and_then(|e| e.borrow().get(name))
    }

    /// Affecte au binding le plus proche ; `false` si le nom est inconnu
    /// sur toute la chaîne.
    pub fn assign(&mut self, name: &str, value: Value) -> bool {
        if let Some(slot) = self.values.get_mut(name) {
            *slot = value;
            return true;
        }
        match &self.enclosing {
            Some(e) => e.borrow_mut().assign(name, value),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_get_assign_through_chain() {
        let outer = Env::new();
        outer.borrow_mut().define("x", Value::Number(1.0));
        let inner = Env::with_enclosing(outer.clone());
        assert_eq!(inner.borrow().get("x"), Some(Value::Number(1.0)));

        // define locale masque l'externe.
        inner.borrow_mut().define("x", Value::Number(2.0));
        assert_eq!(inner.borrow().get("x"), Some(Value::Number(2.0)));
        assert_eq!(outer.borrow().get("x"), Some(Value::Number(1.0)));

        // assign remonte jusqu'au binding le plus proche.
        let inner2 = Env::with_enclosing(outer.clone());
        assert!(inner2.borrow_mut().assign("x", Value::Number(3.0)));
        assert_eq!(outer.borrow().get("x"), Some(Value::Number(3.0)));
        assert!(!inner2.borrow_mut().assign("missing", Value::Nil));
    }
}
