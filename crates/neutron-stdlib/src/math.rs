//! math.rs — Module `math`.

use neutron_vm::error::RuntimeError;
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::want_number;

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    macro_rules! unary {
        ($name:literal, $f:expr) => {
            vm.define_native($name, 1, move |args| {
                let x = want_number(concat!("math.", $name), args, 0)?;
                let f: fn(f64) -> f64 = $f;
                Ok(Value::Number(f(x)))
            });
        };
    }
    unary!("abs", f64::abs);
    unary!("floor", f64::floor);
    unary!("ceil", f64::ceil);
    unary!("round", f64::round);
    unary!("sqrt", f64::sqrt);
    unary!("sin", f64::sin);
    unary!("cos", f64::cos);
    unary!("tan", f64::tan);
    unary!("log", f64::ln);
    unary!("log10", f64::log10);
    unary!("exp", f64::exp);

    vm.define_native("pow", 2, |args| {
        let base = want_number("math.pow", args, 0)?;
        let exp = want_number("math.pow", args, 1)?;
        Ok(Value::Number(base.powf(exp)))
    });
    vm.define_native("min", 2, |args| {
        let a = want_number("math.min", args, 0)?;
        let b = want_number("math.min", args, 1)?;
        Ok(Value::Number(a.min(b)))
    });
    vm.define_native("max", 2, |args| {
        let a = want_number("math.max", args, 0)?;
        let b = want_number("math.max", args, 1)?;
        Ok(Value::Number(a.max(b)))
    });

    vm.define("pi", Value::Number(std::f64::consts::PI));
    vm.define("e", Value::Number(std::f64::consts::E));
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::eval;
    use neutron_vm::value::Value;

    #[test]
    fn basics() {
        let vm = eval(
            "use math; var a = math.abs(0 - 5); var b = math.floor(3.9); \
             var c = math.pow(2, 10); var d = math.max(1, 7);",
        );
        assert_eq!(vm.globals["a"], Value::Number(5.0));
        assert_eq!(vm.globals["b"], Value::Number(3.0));
        assert_eq!(vm.globals["c"], Value::Number(1024.0));
        assert_eq!(vm.globals["d"], Value::Number(7.0));
    }

    #[test]
    fn constants() {
        let vm = eval("use math; var tau = math.pi * 2;");
        let Value::Number(tau) = vm.globals["tau"] else { panic!() };
        assert!((tau - std::f64::consts::TAU).abs() < 1e-12);
    }

    #[test]
    fn sqrt_and_log() {
        let vm = eval("use math; var r = math.sqrt(81) + math.log(math.e);");
        let Value::Number(r) = vm.globals["r"] else { panic!() };
        assert!((r - 10.0).abs() < 1e-9);
    }

    #[test]
    fn type_error_on_non_number() {
        let mut vm = crate::tests::stdlib_vm();
        assert!(vm
            .execute_string("use math; math.sqrt(\"x\");", "<t>")
            .is_err());
    }
}
