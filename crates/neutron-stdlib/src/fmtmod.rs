//! fmtmod.rs — Module `fmt` : interpolation `{}` et impression.

use neutron_vm::error::RuntimeError;
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::{rendered, want_array, want_string};

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    // format("x={} y={}", [1, 2]) → "x=1 y=2"
    vm.define_native_vm("format", 2, |vm, args| {
        let template = want_string(vm, "fmt.format", args, 0)?;
        let fills = want_array("fmt.format", args, 1)?;
        let values: Vec<String> = vm
            .heap
            .array_elements(fills)
            .iter()
            .map(|v| rendered(vm, *v))
            .collect();
        let mut out = String::with_capacity(template.len());
        let mut parts = template.split("{}");
        if let Some(first) = parts.next() {
            out.push_str(first);
        }
        let mut used = 0;
        for part in parts {
            match values.get(used) {
                Some(v) => out.push_str(v),
                None => out.push_str("{}"),
            }
            used += 1;
            out.push_str(part);
        }
        Ok(vm.make_string_value(out))
    });

    vm.define_native_vm("println", 1, |vm, args| {
        let text = rendered(vm, args[0]);
        vm.host.print(&format!("{text}\n"));
        Ok(Value::Nil)
    });

    vm.define_native_vm("print", 1, |vm, args| {
        let text = rendered(vm, args[0]);
        vm.host.print(&text);
        Ok(Value::Nil)
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::{eval, global_str};

    #[test]
    fn placeholders_fill_in_order() {
        let vm = eval("use fmt; var r = fmt.format(\"{} + {} = {}\", [1, 2, 3]);");
        assert_eq!(global_str(&vm, "r"), "1 + 2 = 3");
    }

    #[test]
    fn missing_fills_keep_the_placeholder() {
        let vm = eval("use fmt; var r = fmt.format(\"a={} b={}\", [9]);");
        assert_eq!(global_str(&vm, "r"), "a=9 b={}");
    }

    #[test]
    fn values_render_like_say() {
        let vm = eval("use fmt; var r = fmt.format(\"{}\", [[1, \"x\"]]);");
        assert_eq!(global_str(&vm, "r"), "[1, \"x\"]");
    }
}
