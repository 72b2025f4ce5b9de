//! processmod.rs — Module `process` : processus légers et messages.
//!
//! Façade script de l'ordonnanceur : `spawn` crée un processus prêt,
//! `send`/`receive` passent par la boîte aux lettres du destinataire
//! (FIFO par émetteur), `receive` relâche entièrement le verrou VM
//! pendant l'attente. `kill` est consultatif.

use neutron_vm::error::RuntimeError;
use neutron_vm::process::{current_pid, scheduler, ProcessScheduler};
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::want_number;

pub(crate) fn require_workers() -> Result<&'static ProcessScheduler, RuntimeError> {
    let sched = scheduler();
    if !sched.has_vm() {
        return Err(RuntimeError::runtime(
            "process.spawn requires a shared VM with workers attached (run through \
             the neutron CLI).",
        ));
    }
    Ok(sched)
}

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    // spawn(fn, [args...]) → pid
    vm.define_native_vm("spawn", 2, |vm, args| {
        let sched = require_workers()?;
        if !matches!(args[0], Value::Callable(_) | Value::Class(_)) {
            return Err(RuntimeError::type_error(format!(
                "process.spawn expects a function, got {}.",
                args[0].type_name()
            )));
        }
        let spawn_args: Vec<Value> = match args[1] {
            Value::Array(h) => vm.heap.array_elements(h).to_vec(),
            Value::Nil => Vec::new(),
            other => {
                return Err(RuntimeError::type_error(format!(
                    "process.spawn expects an argument array, got {}.",
                    other.type_name()
                )))
            }
        };
        let pid = sched.spawn(args[0], spawn_args);
        Ok(Value::Number(pid as f64))
    });

    vm.define_native("send", 2, |args| {
        let to = want_number("process.send", args, 0)? as u64;
        let ok = scheduler().send(to, current_pid(), args[1]);
        Ok(Value::Bool(ok))
    });

    // receive() — bloquant ; le verrou VM est entièrement relâché pendant
    // l'attente puis repris.
    vm.define_native_vm("receive", 0, |vm, _| {
        let lock = vm.lock_core();
        let msg = scheduler().receive(current_pid(), -1, lock.as_deref());
        Ok(msg.map(|m| m.data).unwrap_or(Value::Nil))
    });

    vm.define_native_vm("receive_timeout", 1, |vm, args| {
        let ms = want_number("process.receive_timeout", args, 0)? as i64;
        let lock = vm.lock_core();
        let msg = scheduler().receive(current_pid(), ms, lock.as_deref());
        Ok(msg.map(|m| m.data).unwrap_or(Value::Nil))
    });

    vm.define_native("self", 0, |_| Ok(Value::Number(current_pid() as f64)));

    vm.define_native("kill", 1, |args| {
        let pid = want_number("process.kill", args, 0)? as u64;
        scheduler().kill(pid);
        Ok(Value::Nil)
    });

    vm.define_native("alive", 1, |args| {
        let pid = want_number("process.alive", args, 0)? as u64;
        Ok(Value::Bool(scheduler().is_alive(pid)))
    });

    vm.define_native("count", 0, |_| {
        Ok(Value::Number(scheduler().process_count() as f64))
    });

    Ok(())
}
