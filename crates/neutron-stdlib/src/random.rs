//! random.rs — Module `random`.
//!
//! Générateur process-wide, re-semable par `seed(n)` pour des parcours
//! reproductibles.

use std::sync::Mutex;

use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use neutron_vm::error::RuntimeError;
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::{want_array, want_number};

static RNG: Lazy<Mutex<StdRng>> = Lazy::new(|| Mutex::new(StdRng::from_entropy()));

fn rng() -> std::sync::MutexGuard<'static, StdRng> {
    RNG.lock().unwrap_or_else(|p| p.into_inner())
}

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native("random", 0, |_| Ok(Value::Number(rng().gen::<f64>())));

    // int(lo, hi) — bornes incluses.
    vm.define_native("int", 2, |args| {
        let lo = want_number("random.int", args, 0)? as i64;
        let hi = want_number("random.int", args, 1)? as i64;
        if lo > hi {
            return Err(RuntimeError::range(format!(
                "random.int: empty range [{lo}, {hi}]."
            )));
        }
        Ok(Value::Number(rng().gen_range(lo..=hi) as f64))
    });

    vm.define_native_vm("choice", 1, |vm, args| {
        let a = want_array("random.choice", args, 0)?;
        let elements = vm.heap.array_elements(a);
        match elements.choose(&mut *rng()) {
            Some(v) => Ok(*v),
            None => Err(RuntimeError::range("random.choice: empty array.")),
        }
    });

    vm.define_native_vm("shuffle", 1, |vm, args| {
        let a = want_array("random.shuffle", args, 0)?;
        vm.heap.array_mut(a).elements.shuffle(&mut *rng());
        Ok(Value::Nil)
    });

    vm.define_native("seed", 1, |args| {
        let n = want_number("random.seed", args, 0)?;
        *rng() = StdRng::seed_from_u64(n as u64);
        Ok(Value::Nil)
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::eval;
    use neutron_vm::value::Value;

    #[test]
    fn random_is_in_unit_interval() {
        let vm = eval("use random; var r = random.random();");
        let Value::Number(r) = vm.globals["r"] else { panic!() };
        assert!((0.0..1.0).contains(&r));
    }

    #[test]
    fn int_respects_inclusive_bounds() {
        let vm = eval(
            "use random; var ok = true; \
             for (var i = 0; i < 200; i = i + 1) { \
               var n = random.int(3, 5); \
               if (n < 3 or n > 5) { ok = false; } }",
        );
        assert_eq!(vm.globals["ok"], Value::Bool(true));
    }

    #[test]
    fn seed_makes_runs_reproducible() {
        let vm = eval(
            "use random; random.seed(42); var a = random.int(0, 1000000); \
             random.seed(42); var b = random.int(0, 1000000);",
        );
        assert_eq!(vm.globals["a"], vm.globals["b"]);
    }

    #[test]
    fn shuffle_keeps_the_multiset() {
        let vm = eval(
            "use random; var a = [1, 2, 3, 4, 5]; random.shuffle(a); \
             a.sort(); var r = a.join(\"\");",
        );
        assert_eq!(crate::tests::global_str(&vm, "r"), "12345");
    }

    #[test]
    fn choice_on_empty_array_is_an_error() {
        let mut vm = crate::tests::stdlib_vm();
        assert!(vm
            .execute_string("use random; random.choice([]);", "<t>")
            .is_err());
    }
}
