//! builtins.rs — Méthodes liées de tableau et de chaîne.
//!
//! `a.push(x)`, `s.split(",")`… : la VM dispatche ces noms en interne au
//! lieu de stocker des fonctions. `map`/`filter`/`find` ré-entrent la
//! boucle (`run(base)`) pour exécuter le callback élément par élément,
//! jusqu'au bout, avant de continuer.

use crate::error::{RuntimeError, VmError};
use crate::heap::{ArrayMethod, ArrayObj, Handle, HeapObj, StrMethod};
use crate::value::{display_value, Value};
use crate::Vm;

impl Vm {
    pub(crate) fn call_array_method(
        &mut self,
        array: Handle,
        method: ArrayMethod,
        argc: u8,
    ) -> Result<(), VmError> {
        let stack_base = self.stack.len() - argc as usize - 1;
        let args: Vec<Value> = self.stack[stack_base + 1..].to_vec();

        use ArrayMethod::*;
        let result: Value = match method {
            Length => {
                expect_arity(method.name(), 0, argc)?;
                Value::Number(self.heap.array_elements(array).len() as f64)
            }
            Push => {
                expect_arity(method.name(), 1, argc)?;
                self.heap.array_mut(array).elements.push(args[0]);
                Value::Nil
            }
            Pop => {
                expect_arity(method.name(), 0, argc)?;
                match self.heap.array_mut(array).elements.pop() {
                    Some(v) => v,
                    None => {
                        return Err(VmError::Runtime(RuntimeError::range(
                            "Cannot pop from an empty array.",
                        )))
                    }
                }
            }
            Slice => {
                expect_arity(method.name(), 2, argc)?;
                let (start, end) = match (args[0], args[1]) {
                    (Value::Number(s), Value::Number(e)) => (s as i64, e as i64),
                    _ => {
                        return Err(VmError::Runtime(RuntimeError::type_error(
                            "Array.slice expects number arguments.",
                        )))
                    }
                };
                let len = self.heap.array_elements(array).len() as i64;
                let start = start.clamp(0, len);
                let end = end.clamp(start, len);
                let sliced: Vec<Value> =
                    self.heap.array_elements(array)[start as usize..end as usize].to_vec();
                let h = self.allocate(HeapObj::Array(ArrayObj { elements: sliced }));
                Value::Array(h)
            }
            IndexOf => {
                expect_arity(method.name(), 1, argc)?;
                let needle = display_value(&self.heap, args[0]);
                let mut found: i64 = -1;
                for (i, v) in self.heap.array_elements(array).iter().enumerate() {
                    if display_value(&self.heap, *v) == needle {
                        found = i as i64;
                        break;
                    }
                }
                Value::Number(found as f64)
            }
            Join => {
                expect_arity(method.name(), 1, argc)?;
                let separator = display_value(&self.heap, args[0]);
                let parts: Vec<String> = self
                    .heap
                    .array_elements(array)
                    .iter()
                    .map(|v| display_value(&self.heap, *v))
                    .collect();
                self.make_string_value(parts.join(&separator))
            }
            Reverse => {
                expect_arity(method.name(), 0, argc)?;
                self.heap.array_mut(array).elements.reverse();
                Value::Nil
            }
            Sort => {
                expect_arity(method.name(), 0, argc)?;
                // Tri en place : nombres d'abord (ordre numérique), puis
                // chaînes (ordre lexicographique).
                let mut elements = std::mem::take(&mut self.heap.array_mut(array).elements);
                elements.sort_by(|a, b| match (a, b) {
                    (Value::Number(x), Value::Number(y)) => {
                        x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal)
                    }
                    (Value::Str(x), Value::Str(y)) => {
                        self.heap.str_chars(*x).cmp(self.heap.str_chars(*y))
                    }
                    (Value::Number(_), _) => std::cmp::Ordering::Less,
                    (_, Value::Number(_)) => std::cmp::Ordering::Greater,
                    _ => std::cmp::Ordering::Equal,
                });
                self.heap.array_mut(array).elements = elements;
                Value::Nil
            }
            Map => {
                let callback = self.callback_arg(method.name(), &args, argc)?;
                let mut mapped = Vec::new();
                let len = self.heap.array_elements(array).len();
                for i in 0..len {
                    let element = self.heap.array_elements(array)[i];
                    let v = self.run_callback(callback, element)?;
                    mapped.push(v);
                    // Les résultats intermédiaires restent protégés.
                    if let Some(h) = v.handle() {
                        self.heap.temp_roots.push(h);
                    }
                }
                let roots = mapped.iter().filter_map(|v| v.handle()).count();
                let h = self.allocate(HeapObj::Array(ArrayObj { elements: mapped }));
                let keep = self.heap.temp_roots.len() - roots;
                self.heap.temp_roots.truncate(keep);
                Value::Array(h)
            }
            Filter => {
                let callback = self.callback_arg(method.name(), &args, argc)?;
                let mut kept = Vec::new();
                let len = self.heap.array_elements(array).len();
                for i in 0..len {
                    let element = self.heap.array_elements(array)[i];
                    let test = self.run_callback(callback, element)?;
                    if test.is_truthy() {
                        kept.push(element);
                    }
                }
                let h = self.allocate(HeapObj::Array(ArrayObj { elements: kept }));
                Value::Array(h)
            }
            Find => {
                let callback = self.callback_arg(method.name(), &args, argc)?;
                let mut found = Value::Nil;
                let len = self.heap.array_elements(array).len();
                for i in 0..len {
                    let element = self.heap.array_elements(array)[i];
                    let test = self.run_callback(callback, element)?;
                    if test.is_truthy() {
                        found = element;
                        break;
                    }
                }
                found
            }
        };

        self.stack.truncate(stack_base);
        self.push(result).map_err(VmError::Runtime)?;
        Ok(())
    }

    /// Valide l'argument callback des méthodes d'ordre supérieur.
    fn callback_arg(
        &self,
        name: &str,
        args: &[Value],
        argc: u8,
    ) -> Result<Value, VmError> {
        expect_arity(name, 1, argc)?;
        match args[0] {
            v @ Value::Callable(_) | v @ Value::Class(_) => Ok(v),
            other => Err(VmError::Runtime(RuntimeError::type_error(format!(
                "{name}() argument must be a function, got {}.",
                other.type_name()
            )))),
        }
    }

    /// Exécute `callback(element)` jusqu'au retour et rend le résultat.
    fn run_callback(&mut self, callback: Value, element: Value) -> Result<Value, VmError> {
        let base = self.frames.len();
        self.push(callback).map_err(VmError::Runtime)?;
        self.push(element).map_err(VmError::Runtime)?;
        self.call_value(callback, 1)?;
        if self.frames.len() > base {
            self.run(base).map_err(VmError::Fatal)?;
        }
        Ok(self.pop())
    }

    pub(crate) fn call_string_method(
        &mut self,
        string: String,
        method: StrMethod,
        argc: u8,
    ) -> Result<(), VmError> {
        let stack_base = self.stack.len() - argc as usize - 1;
        let args: Vec<Value> = self.stack[stack_base + 1..].to_vec();

        use StrMethod::*;
        let result: Value = match method {
            Length => {
                expect_arity(method.name(), 0, argc)?;
                Value::Number(string.chars().count() as f64)
            }
            Contains => {
                expect_arity(method.name(), 1, argc)?;
                let needle = display_value(&self.heap, args[0]);
                Value::Bool(string.contains(&needle))
            }
            Split => {
                expect_arity(method.name(), 1, argc)?;
                let delimiter = display_value(&self.heap, args[0]);
                let parts: Vec<String> = if delimiter.is_empty() {
                    string.chars().map(|c| c.to_string()).collect()
                } else {
                    string.split(&delimiter).map(str::to_string).collect()
                };
                let roots_base = self.heap.temp_roots.len();
                let mut elements = Vec::with_capacity(parts.len());
                for p in parts {
                    let h = self.heap.make_string(p);
                    self.heap.temp_roots.push(h);
                    elements.push(Value::Str(h));
                }
                let h = self.allocate(HeapObj::Array(ArrayObj { elements }));
                self.heap.temp_roots.truncate(roots_base);
                Value::Array(h)
            }
            Substring => {
                if argc != 1 && argc != 2 {
                    return Err(VmError::Runtime(RuntimeError::argument(
                        "substring() expects 1 or 2 arguments.",
                    )));
                }
                let chars: Vec<char> = string.chars().collect();
                let len = chars.len() as i64;
                let Value::Number(start) = args[0] else {
                    return Err(VmError::Runtime(RuntimeError::type_error(
                        "substring() expects number arguments.",
                    )));
                };
                let mut start = (start as i64).clamp(0, len);
                let mut end = len;
                if argc == 2 {
                    let Value::Number(e) = args[1] else {
                        return Err(VmError::Runtime(RuntimeError::type_error(
                            "substring() expects number arguments.",
                        )));
                    };
                    end = (e as i64).clamp(0, len);
                }
                if end < start {
                    std::mem::swap(&mut start, &mut end);
                }
                let sub: String = chars[start as usize..end as usize].iter().collect();
                self.make_string_value(sub)
            }
        };

        self.stack.truncate(stack_base);
        self.push(result).map_err(VmError::Runtime)?;
        Ok(())
    }
}

fn expect_arity(name: &str, expected: u8, got: u8) -> Result<(), VmError> {
    if expected != got {
        let plural = if expected == 1 { "argument" } else { "arguments" };
        return Err(VmError::Runtime(RuntimeError::argument(format!(
            "Expected {expected} {plural} but got {got} for {name}()."
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> Vm {
        let mut vm = Vm::new();
        vm.execute_string(src, "<test>").expect("exécution ok");
        vm
    }

    fn global_str(vm: &Vm, name: &str) -> String {
        display_value(&vm.heap, vm.globals[name])
    }

    #[test]
    fn length_push_pop() {
        let vm = eval(
            "var a = [1, 2]; a.push(3); var n = a.length(); var last = a.pop(); \
             var n2 = a.length();",
        );
        assert_eq!(vm.globals["n"], Value::Number(3.0));
        assert_eq!(vm.globals["last"], Value::Number(3.0));
        assert_eq!(vm.globals["n2"], Value::Number(2.0));
    }

    #[test]
    fn sort_then_join() {
        let vm = eval("var a = [3, 1, 2]; a.sort(); var r = a.join(\",\");");
        assert_eq!(global_str(&vm, "r"), "1,2,3");
    }

    #[test]
    fn sort_numbers_before_strings() {
        let vm = eval("var a = [\"b\", 2, \"a\", 1]; a.sort(); var r = a.join(\"-\");");
        assert_eq!(global_str(&vm, "r"), "1-2-a-b");
    }

    #[test]
    fn slice_clamps_bounds() {
        let vm = eval("var a = [1, 2, 3, 4]; var s = a.slice(1, 99); var r = s.join(\",\");");
        assert_eq!(global_str(&vm, "r"), "2,3,4");
    }

    #[test]
    fn index_of_compares_rendered_values() {
        let vm = eval("var a = [\"x\", 2, \"y\"]; var i = a.indexOf(2); var j = a.indexOf(\"zz\");");
        assert_eq!(vm.globals["i"], Value::Number(1.0));
        assert_eq!(vm.globals["j"], Value::Number(-1.0));
    }

    #[test]
    fn reverse_in_place() {
        let vm = eval("var a = [1, 2, 3]; a.reverse(); var r = a.join(\"\");");
        assert_eq!(global_str(&vm, "r"), "321");
    }

    #[test]
    fn map_reenters_the_vm() {
        let vm = eval("var a = [1, 2, 3]; var b = a.map(fun(x) { return x * 10; }); \
             var r = b.join(\",\");");
        assert_eq!(global_str(&vm, "r"), "10,20,30");
    }

    #[test]
    fn filter_and_find() {
        let vm = eval(
            "var a = [1, 2, 3, 4, 5]; \
             var evens = a.filter(fun(x) { return x % 2 == 0; }); \
             var first = a.find(fun(x) { return x > 3; }); \
             var none = a.find(fun(x) { return x > 99; }); \
             var r = evens.join(\",\");",
        );
        assert_eq!(global_str(&vm, "r"), "2,4");
        assert_eq!(vm.globals["first"], Value::Number(4.0));
        assert_eq!(vm.globals["none"], Value::Nil);
    }

    #[test]
    fn map_callback_errors_propagate() {
        let mut vm = Vm::new();
        let err = vm.execute_string("var a = [1]; a.map(fun(x) { return x / 0; });", "<t>");
        assert!(err.is_err());
    }

    #[test]
    fn string_methods() {
        let vm = eval(
            "var s = \"a,b,c\"; var parts = s.split(\",\"); var n = parts.length(); \
             var has = s.contains(\"b\"); var sub = s.substring(2, 5); \
             var len = s.length();",
        );
        assert_eq!(vm.globals["n"], Value::Number(3.0));
        assert_eq!(vm.globals["has"], Value::Bool(true));
        assert_eq!(global_str(&vm, "sub"), "b,c");
        assert_eq!(vm.globals["len"], Value::Number(5.0));
    }

    #[test]
    fn split_empty_delimiter_explodes_chars() {
        let vm = eval("var parts = \"abc\".split(\"\"); var r = parts.join(\"-\");");
        assert_eq!(global_str(&vm, "r"), "a-b-c");
    }

    #[test]
    fn substring_swaps_inverted_bounds() {
        let vm = eval("var r = \"hello\".substring(4, 1);");
        assert_eq!(global_str(&vm, "r"), "ell");
    }

    #[test]
    fn string_properties_length_and_chars() {
        let vm = eval("var n = \"abc\".length; var cs = \"ab\".chars; var r = cs.join(\".\");");
        assert_eq!(vm.globals["n"], Value::Number(3.0));
        assert_eq!(global_str(&vm, "r"), "a.b");
    }

    #[test]
    fn wrong_arity_is_argument_error() {
        let mut vm = Vm::new();
        let err = vm.execute_string("[1].push();", "<t>").unwrap_err();
        match err {
            VmError::Fatal(f) => {
                assert_eq!(f.error.kind, crate::error::ErrorKind::Argument)
            }
            other => panic!("{other:?}"),
        }
    }
}
