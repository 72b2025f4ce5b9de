//! arrays.rs — Module `arrays` : constructeurs et combinateurs hors
//! méthodes liées.

use neutron_vm::error::RuntimeError;
use neutron_vm::heap::{ArrayObj, HeapObj};
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::{rendered, want_array, want_number};

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_vm("new", 0, |vm, _| {
        let h = vm.allocate(HeapObj::Array(ArrayObj { elements: Vec::new() }));
        Ok(Value::Array(h))
    });

    // of(...) — variadique.
    vm.define_native_vm("of", -1, |vm, args| {
        let h = vm.allocate(HeapObj::Array(ArrayObj { elements: args.to_vec() }));
        Ok(Value::Array(h))
    });

    vm.define_native_vm("concat", 2, |vm, args| {
        let a = want_array("arrays.concat", args, 0)?;
        let b = want_array("arrays.concat", args, 1)?;
        let mut elements = vm.heap.array_elements(a).to_vec();
        elements.extend_from_slice(vm.heap.array_elements(b));
        let h = vm.allocate(HeapObj::Array(ArrayObj { elements }));
        Ok(Value::Array(h))
    });

    vm.define_native_vm("contains", 2, |vm, args| {
        let a = want_array("arrays.contains", args, 0)?;
        let needle = rendered(vm, args[1]);
        let found = vm
            .heap
            .array_elements(a)
            .iter()
            .any(|v| rendered(vm, *v) == needle);
        Ok(Value::Bool(found))
    });

    // range(start, end) — demi-ouvert.
    vm.define_native_vm("range", 2, |vm, args| {
        let start = want_number("arrays.range", args, 0)? as i64;
        let end = want_number("arrays.range", args, 1)? as i64;
        let elements: Vec<Value> = (start..end).map(|i| Value::Number(i as f64)).collect();
        let h = vm.allocate(HeapObj::Array(ArrayObj { elements }));
        Ok(Value::Array(h))
    });

    Ok(())
}
