//! json.rs — Module `json` : stringify / parse.
//!
//! Pont direct avec `serde_json` : les objets Neutron deviennent des
//! objets JSON, les tableaux des tableaux, `nil` devient `null`. Les
//! appelables et modules ne sont pas sérialisables (TypeError).

use neutron_vm::error::RuntimeError;
use neutron_vm::heap::{ArrayObj, HeapObj, MapObj};
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::want_string;

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_vm("stringify", 1, |vm, args| {
        let j = to_json(vm, args[0], 0)?;
        Ok(vm.make_string_value(j.to_string()))
    });
    vm.define_native_vm("pretty", 1, |vm, args| {
        let j = to_json(vm, args[0], 0)?;
        let text = serde_json::to_string_pretty(&j)
            .map_err(|e| RuntimeError::runtime(format!("json.pretty: {e}")))?;
        Ok(vm.make_string_value(text))
    });
    vm.define_native_vm("parse", 1, |vm, args| {
        let text = want_string(vm, "json.parse", args, 0)?;
        let j: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| RuntimeError::runtime(format!("json.parse: {e}")))?;
        Ok(from_json(vm, &j))
    });
    Ok(())
}

const MAX_DEPTH: usize = 128;

fn to_json(vm: &Vm, value: Value, depth: usize) -> Result<serde_json::Value, RuntimeError> {
    if depth > MAX_DEPTH {
        return Err(RuntimeError::range("json.stringify: structure too deep."));
    }
    Ok(match value {
        Value::Nil => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Number(n) => {
            // Les entiers sortent sans partie décimale (1, pas 1.0).
            if n.fract() == 0.0 && n.is_finite() && n.abs() < 9e15 {
                serde_json::Value::Number(serde_json::Number::from(n as i64))
            } else {
                serde_json::Number::from_f64(n)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        Value::Str(h) => serde_json::Value::String(vm.heap.str_chars(h).to_string()),
        Value::Array(h) => serde_json::Value::Array(
            vm.heap
                .array_elements(h)
                .iter()
                .map(|v| to_json(vm, *v, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(h) => {
            let mut map = serde_json::Map::new();
            let mut entries: Vec<(&String, &Value)> =
                vm.heap.object_properties(h).iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            for (k, v) in entries {
                map.insert(k.clone(), to_json(vm, *v, depth + 1)?);
            }
            serde_json::Value::Object(map)
        }
        other => {
            return Err(RuntimeError::type_error(format!(
                "json.stringify: cannot serialize a {}.",
                other.type_name()
            )))
        }
    })
}

fn from_json(vm: &mut Vm, j: &serde_json::Value) -> Value {
    match j {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        serde_json::Value::String(s) => vm.make_string_value(s.clone()),
        serde_json::Value::Array(items) => {
            let roots_base = vm.heap.temp_roots.len();
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                let v = from_json(vm, item);
                if let Some(h) = v.handle() {
                    vm.heap.temp_roots.push(h);
                }
                elements.push(v);
            }
            let h = vm.allocate(HeapObj::Array(ArrayObj { elements }));
            vm.heap.temp_roots.truncate(roots_base);
            Value::Array(h)
        }
        serde_json::Value::Object(map) => {
            let roots_base = vm.heap.temp_roots.len();
            let mut properties = neutron_vm::heap::PropertyMap::with_capacity(map.len());
            for (k, item) in map {
                let v = from_json(vm, item);
                if let Some(h) = v.handle() {
                    vm.heap.temp_roots.push(h);
                }
                properties.insert(k.clone(), v);
            }
            let h = vm.allocate(HeapObj::Object(MapObj { properties }));
            vm.heap.temp_roots.truncate(roots_base);
            Value::Object(h)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::{eval, global_str};

    #[test]
    fn stringify_canonical() {
        let vm = eval("use json; var r = json.stringify({\"a\": 1, \"b\": [2, 3]});");
        assert_eq!(global_str(&vm, "r"), "{\"a\":1,\"b\":[2,3]}");
    }

    #[test]
    fn parse_then_navigate() {
        let vm = eval(
            "use json; var o = json.parse(\"{\\\"xs\\\": [1, 2, 3], \\\"ok\\\": true}\"); \
             var n = o.xs[1]; var ok = o.ok; var missing = o[\"nope\"];",
        );
        assert_eq!(global_str(&vm, "n"), "2");
        assert_eq!(global_str(&vm, "ok"), "true");
        assert_eq!(global_str(&vm, "missing"), "nil");
    }

    #[test]
    fn roundtrip() {
        let vm = eval(
            "use json; var src = {\"k\": [1, \"two\", nil, {\"deep\": false}]}; \
             var r = json.stringify(json.parse(json.stringify(src)));",
        );
        assert_eq!(
            global_str(&vm, "r"),
            "{\"k\":[1,\"two\",null,{\"deep\":false}]}"
        );
    }

    #[test]
    fn stringify_rejects_callables() {
        let mut vm = crate::tests::stdlib_vm();
        let err = vm
            .execute_string("use json; fun f() { return 1; } json.stringify(f);", "<t>")
            .unwrap_err();
        assert!(err.to_string().contains("cannot serialize"));
    }
}
