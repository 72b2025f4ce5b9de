//! asyncmod.rs — Module `async` : futures par processus légers.
//!
//! Chaque future est un processus de l'ordonnanceur (tâche-par-future,
//! pas thread-par-future) ; `run` rend l'identifiant, `await` attend la
//! fin en relâchant le verrou VM par petites fenêtres.
//!
//! `async.sleep` garde le verrou VM pendant toute l'attente — choix
//! assumé : l'état de pile n'est pas thread-safe. Pour attendre en
//! coopérant, passer par `process.receive`.

use std::time::Duration;

use neutron_vm::error::RuntimeError;
use neutron_vm::heap::{ArrayObj, HeapObj};
use neutron_vm::process::{scheduler, ProcessState};
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::processmod::require_workers;
use crate::{want_array, want_number};

/// Attend la fin d'un processus-future et rend son résultat.
fn await_pid(vm: &mut Vm, pid: u64) -> Result<Value, RuntimeError> {
    let sched = scheduler();
    let Some(process) = sched.get(pid) else {
        return Err(RuntimeError::runtime(format!("async.await: unknown future {pid}.")));
    };
    let lock = vm.lock_core();
    loop {
        match process.state() {
            ProcessState::Finished => return Ok(*process.result.lock()),
            ProcessState::Dead => return Ok(Value::Nil),
            _ => {
                // Fenêtre sans verrou : le worker peut exécuter la future.
                let saved = lock.as_ref().map(|l| l.unlock_fully()).unwrap_or(0);
                std::thread::sleep(Duration::from_millis(1));
                if let Some(l) = lock.as_ref() {
                    l.relock(saved);
                }
            }
        }
    }
}

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    // run(fn) → future (pid)
    vm.define_native("run", 1, |args| {
        let sched = require_workers()?;
        if !matches!(args[0], Value::Callable(_) | Value::Class(_)) {
            return Err(RuntimeError::type_error(format!(
                "async.run expects a function, got {}.",
                args[0].type_name()
            )));
        }
        let pid = sched.spawn(args[0], Vec::new());
        Ok(Value::Number(pid as f64))
    });

    vm.define_native_vm("await", 1, |vm, args| {
        let pid = want_number("async.await", args, 0)? as u64;
        await_pid(vm, pid)
    });

    // all([futures...]) → tableau des résultats, dans l'ordre.
    vm.define_native_vm("all", 1, |vm, args| {
        let futures = want_array("async.all", args, 0)?;
        let pids: Vec<u64> = vm
            .heap
            .array_elements(futures)
            .iter()
            .map(|v| match v {
                Value::Number(n) => Ok(*n as u64),
                other => Err(RuntimeError::type_error(format!(
                    "async.all expects future ids, got {}.",
                    other.type_name()
                ))),
            })
            .collect::<Result<_, _>>()?;
        let roots_base = vm.heap.temp_roots.len();
        let mut results = Vec::with_capacity(pids.len());
        for pid in pids {
            let v = await_pid(vm, pid)?;
            if let Some(h) = v.handle() {
                vm.heap.temp_roots.push(h);
            }
            results.push(v);
        }
        let h = vm.allocate(HeapObj::Array(ArrayObj { elements: results }));
        vm.heap.temp_roots.truncate(roots_base);
        Ok(Value::Array(h))
    });

    // sleep(ms) — tient le verrou (voir l'en-tête du module).
    vm.define_native("sleep", 1, |args| {
        let ms = want_number("async.sleep", args, 0)?;
        if ms > 0.0 {
            std::thread::sleep(Duration::from_millis(ms as u64));
        }
        Ok(Value::Nil)
    });

    // timer(ms, fn) → future différée.
    vm.define_native("timer", 2, |args| {
        let sched = require_workers()?;
        let ms = want_number("async.timer", args, 0)? as u64;
        if !matches!(args[1], Value::Callable(_) | Value::Class(_)) {
            return Err(RuntimeError::type_error(
                "async.timer expects a function as second argument.",
            ));
        }
        let pid = sched.spawn_delayed(args[1], Vec::new(), ms);
        Ok(Value::Number(pid as f64))
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::stdlib_vm;

    #[test]
    fn run_without_workers_is_an_error() {
        let mut vm = stdlib_vm();
        let err = vm
            .execute_string("use async; async.run(fun() { return 1; });", "<t>")
            .unwrap_err();
        assert!(err.to_string().contains("shared VM"));
    }

    #[test]
    fn sleep_holds_and_returns() {
        let start = std::time::Instant::now();
        crate::tests::eval("use async; async.sleep(20);");
        assert!(start.elapsed() >= std::time::Duration::from_millis(15));
    }

    #[test]
    fn await_unknown_future_is_an_error() {
        let mut vm = stdlib_vm();
        assert!(vm
            .execute_string("use async; async.await(987654321);", "<t>")
            .is_err());
    }
}
