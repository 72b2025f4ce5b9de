//! lock.rs — Verrou réentrant de la VM.
//!
//! L'exécution du bytecode est monothread ; les workers de l'ordonnanceur
//! de processus ré-entrent `interpret`/`run` chacun à leur tour sous ce
//! verrou. Il suit le thread propriétaire et un compteur de récursion,
//! si bien que du code hôte rappelant du code utilisateur (un `map` de
//! tableau qui invoque un callback) ne s'interbloque pas.
//!
//! `unlock_fully`/`relock` servent aux points de suspension : `receive`
//! relâche complètement le verrou, bloque sur la condvar de la boîte aux
//! lettres, puis le reprend en restaurant le compteur. **Invariant** : le
//! thread qui a tout relâché ne touche plus à la VM avant le retour de
//! `relock`.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::{Condvar, Mutex};

use crate::Vm;

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    count: u32,
}

/// Cœur du verrou : propriétaire + compteur, attente sur condvar.
#[derive(Debug, Default)]
pub struct LockCore {
    state: Mutex<LockState>,
    cv: Condvar,
}

impl LockCore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Prend le verrou ; réentrant pour le thread propriétaire.
    pub fn lock(&self) {
        let me = std::thread::current().id();
        let mut s = self.state.lock();
        loop {
            match s.owner {
                None => {
                    s.owner = Some(me);
                    s.count = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    s.count += 1;
                    return;
                }
                Some(_) => self.cv.wait(&mut s),
            }
        }
    }

    /// Relâche un niveau ; libère à zéro.
    pub fn unlock(&self) {
        let me = std::thread::current().id();
        let mut s = self.state.lock();
        if s.owner != Some(me) {
            return;
        }
        s.count -= 1;
        if s.count == 0 {
            s.owner = None;
            self.cv.notify_one();
        }
    }

    /// Relâche **tous** les niveaux et rend le compteur (0 si le thread
    /// courant n'était pas propriétaire).
    pub fn unlock_fully(&self) -> u32 {
        let me = std::thread::current().id();
        let mut s = self.state.lock();
        if s.owner != Some(me) {
            return 0;
        }
        let count = s.count;
        s.count = 0;
        s.owner = None;
        self.cv.notify_one();
        count
    }

    /// Reprend le verrou en restaurant un compteur rendu par
    /// [`unlock_fully`].
    pub fn relock(&self, count: u32) {
        if count == 0 {
            return;
        }
        let me = std::thread::current().id();
        let mut s = self.state.lock();
        while s.owner.is_some() && s.owner != Some(me) {
            self.cv.wait(&mut s);
        }
        s.owner = Some(me);
        s.count = count;
    }

    /// Garde RAII : un niveau pris, relâché au drop.
    pub fn enter(self: Arc<Self>) -> LockGuard {
        self.lock();
        LockGuard { core: self }
    }
}

pub struct LockGuard {
    core: Arc<LockCore>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.core.unlock();
    }
}

/// Une VM partageable entre threads de l'ordonnanceur.
///
/// L'accès exclusif est garanti par [`LockCore`], pas par le système de
/// types : la cellule n'est déréférencée qu'à travers [`VmGuard`], créé
/// après prise du verrou. Un seul guard actif par thread.
pub struct SharedVm {
    core: Arc<LockCore>,
    cell: UnsafeCell<Vm>,
}

// Tout accès à la cellule passe par le verrou.
unsafe impl Send for SharedVm {}
unsafe impl Sync for SharedVm {}

impl SharedVm {
    pub fn new(mut vm: Vm) -> Arc<Self> {
        let core = LockCore::new();
        vm.lock_core = Some(core.clone());
        Arc::new(Self { core, cell: UnsafeCell::new(vm) })
    }

    pub fn core(&self) -> &Arc<LockCore> {
        &self.core
    }

    /// Prend le verrou et rend l'accès à la machine.
    pub fn lock(&self) -> VmGuard<'_> {
        self.core.lock();
        VmGuard { shared: self }
    }
}

pub struct VmGuard<'a> {
    shared: &'a SharedVm,
}

impl Deref for VmGuard<'_> {
    type Target = Vm;
    fn deref(&self) -> &Vm {
        // Sûr : verrou tenu par ce thread pour la durée du guard.
        unsafe { &*self.shared.cell.get() }
    }
}

impl DerefMut for VmGuard<'_> {
    fn deref_mut(&mut self) -> &mut Vm {
        unsafe { &mut *self.shared.cell.get() }
    }
}

impl Drop for VmGuard<'_> {
    fn drop(&mut self) {
        self.shared.core.unlock();
    }
}
