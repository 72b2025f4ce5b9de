//! gc.rs — Collecteur mark-sweep précis, stop-the-world, non déplaçant.
//!
//! Déclenché à l'allocation quand le nombre d'objets vivants atteint le
//! seuil (`Heap::next_gc`). Racines :
//!
//! - la pile d'opérandes et les fonctions des frames d'appel,
//! - toutes les valeurs des `globals` (et des globals sauvegardées
//!   pendant une exécution de module),
//! - la liste des racines temporaires (objets mi-construits),
//! - la table des chaînes internées (racine **forte**, comportement
//!   documenté : une chaîne internée ne meurt jamais),
//! - l'exception pendante,
//! - les valeurs retenues par l'ordonnanceur de processus (fonctions,
//!   arguments, boîtes aux lettres).
//!
//! Marquage par worklist grise ; `blacken` suit chaque arête sortante de
//! chaque variante d'objet ; les chaînes d'environnements (Rc) sont
//! traversées pour leurs valeurs. Le sweep libère les non-marqués et fixe
//! `next_gc = vivants × 2`.

use log::debug;

use crate::env::EnvRef;
use crate::heap::{Handle, HeapObj};
use crate::value::Value;
use crate::Vm;

impl Vm {
    /// Un cycle complet : mark roots → trace → sweep.
    pub fn collect_garbage(&mut self) {
        let before = self.heap.live_count();
        self.mark_roots();
        self.trace_references();
        let freed = self.heap.sweep();
        self.heap.prune_interned();
        debug!(
            "gc: {before} objets, {freed} libérés, prochain seuil {}",
            self.heap.next_gc
        );
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.mark_value(v);
        }
        let globals: Vec<Value> = self.globals.values().copied().collect();
        for v in globals {
            self.mark_value(v);
        }
        // Globals mises de côté pendant le swap d'un module en cours de
        // chargement : toujours vivantes.
        let saved: Vec<Value> = self
            .saved_globals_stack
            .iter()
            .flat_map(|g| g.values().copied())
            .collect();
        for v in saved {
            self.mark_value(v);
        }
        for i in 0..self.frames.len() {
            let f = self.frames[i].function;
            self.mark_object(f);
        }
        let temps: Vec<Handle> = self.heap.temp_roots.clone();
        for h in temps {
            self.mark_object(h);
        }
        // La table d'internement est une racine forte.
        let interned: Vec<Handle> = self.heap.interned.values().copied().collect();
        for h in interned {
            self.mark_object(h);
        }
        let pending = self.pending_exception;
        self.mark_value(pending);
        // Valeurs détenues par l'ordonnanceur (fonctions de processus,
        // arguments, messages en attente).
        for v in crate::process::gc_roots() {
            self.mark_value(v);
        }
    }

    pub(crate) fn mark_value(&mut self, value: Value) {
        if let Some(h) = value.handle() {
            self.mark_object(h);
        }
    }

    pub(crate) fn mark_object(&mut self, handle: Handle) {
        if self.heap.is_marked(handle) {
            return;
        }
        self.heap.set_mark(handle, true);
        self.heap.gray.push(handle);
    }

    fn trace_references(&mut self) {
        while let Some(h) = self.heap.gray.pop() {
            self.blacken_object(h);
        }
    }

    /// Marque chaque arête sortante de l'objet selon sa variante.
    fn blacken_object(&mut self, handle: Handle) {
        // Arêtes collectées d'abord (l'arène est empruntée), marquées
        // ensuite.
        let mut values: Vec<Value> = Vec::new();
        let mut handles: Vec<Handle> = Vec::new();
        let mut envs: Vec<EnvRef> = Vec::new();
        match self.heap.get(handle) {
            // Feuilles.
            HeapObj::Str(_) | HeapObj::Buffer(_) | HeapObj::Native(_) => {}
            HeapObj::Array(a) => values.extend(a.elements.iter().copied()),
            HeapObj::Object(o) => values.extend(o.properties.values().copied()),
            HeapObj::Instance(i) => {
                handles.push(i.class);
                for f in i.inline.iter().flatten() {
                    handles.push(f.key);
                    values.push(f.value);
                }
                if let Some(overflow) = &i.overflow {
                    values.extend(overflow.values().copied());
                }
            }
            HeapObj::Class(c) => {
                values.extend(c.methods.values().copied());
                if let Some(init) = c.initializer {
                    values.push(init);
                }
                if let Some(env) = &c.env {
                    envs.push(env.clone());
                }
            }
            HeapObj::Function(f) => {
                if let Some(env) = &f.closure {
                    envs.push(env.clone());
                }
                // Les constantes du chunk sont des protos et des scalaires
                // partagés par Rc : rien à marquer côté tas.
            }
            HeapObj::Bound(b) => {
                values.push(b.receiver);
                handles.push(b.method);
            }
            HeapObj::BoundArray(b) => handles.push(b.array),
            HeapObj::BoundString(_) => {}
            HeapObj::Module(m) => envs.push(m.env.clone()),
        }
        for v in values {
            self.mark_value(v);
        }
        for h in handles {
            self.mark_object(h);
        }
        for env in envs {
            self.mark_env(&env);
        }
    }

    /// Traverse une chaîne d'environnements et marque toutes les valeurs
    /// liées. Idempotent sur les objets déjà marqués.
    fn mark_env(&mut self, env: &EnvRef) {
        let mut current = Some(env.clone());
        while let Some(e) = current {
            let values: Vec<Value> = e.borrow().values.values().copied().collect();
            for v in values {
                self.mark_value(v);
            }
            current = e.borrow().enclosing.clone();
        }
    }
}
