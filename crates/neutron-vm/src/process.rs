//! process.rs — Processus légers façon Erlang.
//!
//! Un ordonnanceur singleton possède la table PID → processus, une file
//! des prêts et un pool de workers (par défaut : nombre de cœurs).
//! Chaque worker dépile un PID et **ré-entre la VM sous le verrou
//! réentrant** : au plus un processus exécute du bytecode à la fois — le
//! gain est la concurrence par boîtes aux lettres et l'entrelacement
//! d'E/S, pas le parallélisme CPU du bytecode.
//!
//! Chaque boîte aux lettres a son propre mutex + condvar : poster un
//! message ne passe jamais par le verrou VM. FIFO garanti par émetteur.
//! `kill` est consultatif : le processus est marqué mort et sauté à la
//! prochaine passe d'ordonnancement.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::lock::{LockCore, SharedVm};
use crate::value::Value;

pub type Pid = u64;

/// Quota d'ordonnancement par tranche.
pub const DEFAULT_REDUCTIONS: i64 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Ready,
    Running,
    Waiting,
    Finished,
    Dead,
}

/// Un message inter-processus.
#[derive(Debug, Clone, Copy)]
pub struct Message {
    pub sender: Pid,
    pub data: Value,
}

/// Un processus léger : fonction à exécuter, boîte aux lettres, quota.
pub struct Process {
    pub pid: Pid,
    state: Mutex<ProcessState>,
    pub function: Value,
    pub args: Vec<Value>,
    pub result: Mutex<Value>,
    mailbox: Mutex<VecDeque<Message>>,
    mailbox_cv: Condvar,
    pub reductions: AtomicI64,
    /// Délai avant la première exécution (timers de `async`).
    delay_ms: u64,
}

impl Process {
    fn new(pid: Pid, function: Value, args: Vec<Value>, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            pid,
            state: Mutex::new(ProcessState::Ready),
            function,
            args,
            result: Mutex::new(Value::Nil),
            mailbox: Mutex::new(VecDeque::new()),
            mailbox_cv: Condvar::new(),
            reductions: AtomicI64::new(DEFAULT_REDUCTIONS),
            delay_ms,
        })
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock()
    }

    fn set_state(&self, s: ProcessState) {
        *self.state.lock() = s;
    }

    /// Poste un message et réveille les récepteurs en attente.
    pub fn send_message(&self, msg: Message) {
        self.mailbox.lock().push_back(msg);
        self.mailbox_cv.notify_all();
    }

    /// Attend un message ; `timeout_ms < 0` = indéfiniment.
    pub fn wait_message(&self, timeout_ms: i64) -> Option<Message> {
        let mut box_ = self.mailbox.lock();
        if timeout_ms < 0 {
            loop {
                if let Some(m) = box_.pop_front() {
                    return Some(m);
                }
                self.set_state_waiting();
                self.mailbox_cv.wait(&mut box_);
            }
        } else {
            let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms as u64);
            loop {
                if let Some(m) = box_.pop_front() {
                    return Some(m);
                }
                let now = std::time::Instant::now();
                if now >= deadline {
                    return None;
                }
                self.set_state_waiting();
                if self.mailbox_cv.wait_for(&mut box_, deadline - now).timed_out() {
                    return box_.pop_front();
                }
            }
        }
    }

    fn set_state_waiting(&self) {
        let mut s = self.state.lock();
        if *s == ProcessState::Running {
            *s = ProcessState::Waiting;
        }
    }

    pub fn mailbox_len(&self) -> usize {
        self.mailbox.lock().len()
    }
}

#[derive(Default)]
struct SchedState {
    table: HashMap<Pid, Arc<Process>>,
    ready: VecDeque<Pid>,
    workers_started: bool,
    vm: Option<Arc<SharedVm>>,
}

/// Statistiques de l'ordonnanceur.
#[derive(Debug, Default)]
pub struct Stats {
    pub spawned: AtomicU64,
    pub delivered: AtomicU64,
    pub context_switches: AtomicU64,
}

pub struct ProcessScheduler {
    state: Mutex<SchedState>,
    ready_cv: Condvar,
    next_pid: AtomicU64,
    pub stats: Stats,
}

static SCHEDULER: OnceCell<ProcessScheduler> = OnceCell::new();

/// Accès au singleton (initialisation paresseuse, sans effet de bord).
pub fn scheduler() -> &'static ProcessScheduler {
    SCHEDULER.get_or_init(|| ProcessScheduler {
        state: Mutex::new(SchedState::default()),
        ready_cv: Condvar::new(),
        next_pid: AtomicU64::new(1),
        stats: Stats::default(),
    })
}

thread_local! {
    static CURRENT_PID: std::cell::Cell<Pid> = const { std::cell::Cell::new(0) };
}

/// PID du processus courant (0 = hors processus).
pub fn current_pid() -> Pid {
    CURRENT_PID.with(|c| c.get())
}

pub fn set_current_pid(pid: Pid) {
    CURRENT_PID.with(|c| c.set(pid));
}

impl ProcessScheduler {
    /// Attache la VM partagée et démarre les workers (une seule fois).
    pub fn attach_vm(&'static self, vm: Arc<SharedVm>, workers: usize) {
        let mut st = self.state.lock();
        if st.vm.is_none() {
            st.vm = Some(vm);
        }
        if !st.workers_started {
            st.workers_started = true;
            let n = if workers == 0 { num_cpus::get() } else { workers };
            debug!("ordonnanceur : {n} workers");
            for i in 0..n {
                std::thread::Builder::new()
                    .name(format!("neutron-worker-{i}"))
                    .spawn(move || scheduler().worker_loop())
                    .expect("création du worker");
            }
        }
    }

    /// Crée un processus prêt et retourne son PID.
    pub fn spawn(&self, function: Value, args: Vec<Value>) -> Pid {
        self.spawn_delayed(function, args, 0)
    }

    /// Comme [`spawn`](Self::spawn), différé de `delay_ms` (timers).
    /// Le processus est dans la table dès maintenant : ses valeurs sont
    /// racines GC pendant tout le délai.
    pub fn spawn_delayed(&self, function: Value, args: Vec<Value>, delay_ms: u64) -> Pid {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Process::new(pid, function, args, delay_ms);
        {
            let mut st = self.state.lock();
            st.table.insert(pid, process);
            st.ready.push_back(pid);
        }
        self.stats.spawned.fetch_add(1, Ordering::Relaxed);
        self.ready_cv.notify_one();
        pid
    }

    /// Poste `value` dans la boîte de `to`. FIFO par émetteur.
    pub fn send(&self, to: Pid, from: Pid, value: Value) -> bool {
        let Some(process) = self.get(to) else {
            return false;
        };
        process.send_message(Message { sender: from, data: value });
        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Bloque sur la boîte de `pid`. Le verrou VM, s'il est fourni, est
    /// entièrement relâché pendant l'attente puis repris.
    pub fn receive(
        &self,
        pid: Pid,
        timeout_ms: i64,
        vm_lock: Option<&LockCore>,
    ) -> Option<Message> {
        let process = self.get(pid)?;
        let saved = vm_lock.map(|l| l.unlock_fully()).unwrap_or(0);
        let msg = process.wait_message(timeout_ms);
        if let Some(l) = vm_lock {
            l.relock(saved);
        }
        if process.state() == ProcessState::Waiting {
            process.set_state(ProcessState::Running);
        }
        msg
    }

    /// Consultatif : marque mort, sauté à la prochaine passe.
    pub fn kill(&self, pid: Pid) {
        if let Some(p) = self.get(pid) {
            p.set_state(ProcessState::Dead);
            p.mailbox_cv.notify_all();
        }
    }

    pub fn is_alive(&self, pid: Pid) -> bool {
        self.get(pid)
            .map(|p| !matches!(p.state(), ProcessState::Finished | ProcessState::Dead))
            .unwrap_or(false)
    }

    pub fn process_count(&self) -> usize {
        self.state.lock().table.len()
    }

    /// Une VM partagée est-elle attachée (les workers peuvent exécuter) ?
    pub fn has_vm(&self) -> bool {
        self.state.lock().vm.is_some()
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.state.lock().table.get(&pid).cloned()
    }

    fn worker_loop(&'static self) {
        loop {
            let (pid, vm) = {
                let mut st = self.state.lock();
                loop {
                    if let Some(pid) = st.ready.pop_front() {
                        let Some(vm) = st.vm.clone() else {
                            warn!("processus {pid} prêt sans VM attachée");
                            continue;
                        };
                        break (pid, vm);
                    }
                    self.ready_cv.wait(&mut st);
                }
            };
            let Some(process) = self.get(pid) else {
                continue;
            };
            if process.state() == ProcessState::Dead {
                self.state.lock().table.remove(&pid);
                continue;
            }
            process.set_state(ProcessState::Running);
            process.reductions.store(DEFAULT_REDUCTIONS, Ordering::Relaxed);
            set_current_pid(pid);
            self.stats.context_switches.fetch_add(1, Ordering::Relaxed);
            if process.delay_ms > 0 {
                // Timer : l'attente se fait hors verrou VM.
                std::thread::sleep(Duration::from_millis(process.delay_ms));
                if process.state() == ProcessState::Dead {
                    set_current_pid(0);
                    continue;
                }
            }

            // Ré-entrée dans la VM sous le verrou réentrant : une tranche
            // court jusqu'au bout (le bytecode ne se suspend pas).
            let outcome = {
                let mut guard = vm.lock();
                guard.call(process.function, &process.args)
            };
            match outcome {
                Ok(v) => {
                    *process.result.lock() = v;
                    if process.state() != ProcessState::Dead {
                        process.set_state(ProcessState::Finished);
                    }
                }
                Err(e) => {
                    warn!("processus {pid} : {e}");
                    process.set_state(ProcessState::Dead);
                }
            }
            set_current_pid(0);
        }
    }
}

/// Racines GC retenues par l'ordonnanceur : fonctions, arguments,
/// résultats et messages en attente de tous les processus vivants.
pub fn gc_roots() -> Vec<Value> {
    let Some(sched) = SCHEDULER.get() else {
        return Vec::new();
    };
    let table: Vec<Arc<Process>> = sched.state.lock().table.values().cloned().collect();
    let mut roots = Vec::new();
    for p in table {
        roots.push(p.function);
        roots.extend(p.args.iter().copied());
        roots.push(*p.result.lock());
        roots.extend(p.mailbox.lock().iter().map(|m| m.data));
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_monotonic() {
        let sched = scheduler();
        let a = sched.spawn(Value::Nil, vec![]);
        let b = sched.spawn(Value::Nil, vec![]);
        assert!(b > a);
    }

    #[test]
    fn mailbox_is_fifo_per_sender() {
        let sched = scheduler();
        let pid = sched.spawn(Value::Nil, vec![]);
        // Neutralise l'exécution : pas de VM attachée dans ce test.
        sched.get(pid).unwrap().set_state(ProcessState::Running);
        assert!(sched.send(pid, 7, Value::Number(1.0)));
        assert!(sched.send(pid, 7, Value::Number(2.0)));
        assert!(sched.send(pid, 7, Value::Number(3.0)));
        let m1 = sched.receive(pid, 100, None).unwrap();
        let m2 = sched.receive(pid, 100, None).unwrap();
        let m3 = sched.receive(pid, 100, None).unwrap();
        assert_eq!(m1.sender, 7);
        assert_eq!(
            (m1.data, m2.data, m3.data),
            (Value::Number(1.0), Value::Number(2.0), Value::Number(3.0))
        );
    }

    #[test]
    fn receive_times_out_on_empty_mailbox() {
        let sched = scheduler();
        let pid = sched.spawn(Value::Nil, vec![]);
        sched.get(pid).unwrap().set_state(ProcessState::Running);
        let start = std::time::Instant::now();
        assert!(sched.receive(pid, 30, None).is_none());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn kill_is_advisory() {
        let sched = scheduler();
        let pid = sched.spawn(Value::Nil, vec![]);
        assert!(sched.is_alive(pid));
        sched.kill(pid);
        assert!(!sched.is_alive(pid));
    }

    #[test]
    fn send_to_unknown_pid_fails() {
        let sched = scheduler();
        assert!(!sched.send(999_999, 0, Value::Nil));
    }

    #[test]
    fn gc_roots_cover_mailboxes() {
        let sched = scheduler();
        let pid = sched.spawn(Value::Number(5.0), vec![Value::Number(6.0)]);
        sched.get(pid).unwrap().set_state(ProcessState::Running);
        sched.send(pid, 0, Value::Number(7.0));
        let roots = gc_roots();
        assert!(roots.contains(&Value::Number(5.0)));
        assert!(roots.contains(&Value::Number(6.0)));
        assert!(roots.contains(&Value::Number(7.0)));
    }
}
