//! regexmod.rs — Module `regex`.
//!
//! Les motifs sont compilés à chaque appel ; un cache process-wide borné
//! absorbe les motifs répétés (boucles de validation).

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;
use regex::Regex;

use neutron_vm::error::RuntimeError;
use neutron_vm::heap::{ArrayObj, HeapObj};
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::want_string;

const CACHE_MAX: usize = 64;

static CACHE: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

fn compile(pattern: &str) -> Result<Regex, RuntimeError> {
    let mut cache = CACHE.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(re) = cache.get(pattern) {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)
        .map_err(|e| RuntimeError::runtime(format!("regex: invalid pattern: {e}")))?;
    if cache.len() >= CACHE_MAX {
        cache.clear();
    }
    cache.insert(pattern.to_string(), re.clone());
    Ok(re)
}

fn string_array(vm: &mut Vm, parts: Vec<String>) -> Value {
    let roots_base = vm.heap.temp_roots.len();
    let mut elements = Vec::with_capacity(parts.len());
    for p in parts {
        let v = vm.make_string_value(p);
        if let Some(h) = v.handle() {
            vm.heap.temp_roots.push(h);
        }
        elements.push(v);
    }
    let h = vm.allocate(HeapObj::Array(ArrayObj { elements }));
    vm.heap.temp_roots.truncate(roots_base);
    Value::Array(h)
}

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_vm("matches", 2, |vm, args| {
        let pattern = want_string(vm, "regex.matches", args, 0)?;
        let text = want_string(vm, "regex.matches", args, 1)?;
        Ok(Value::Bool(compile(&pattern)?.is_match(&text)))
    });

    vm.define_native_vm("find", 2, |vm, args| {
        let pattern = want_string(vm, "regex.find", args, 0)?;
        let text = want_string(vm, "regex.find", args, 1)?;
        match compile(&pattern)?.find(&text) {
            Some(m) => Ok(vm.make_string_value(m.as_str().to_string())),
            None => Ok(Value::Nil),
        }
    });

    vm.define_native_vm("find_all", 2, |vm, args| {
        let pattern = want_string(vm, "regex.find_all", args, 0)?;
        let text = want_string(vm, "regex.find_all", args, 1)?;
        let found: Vec<String> = compile(&pattern)?
            .find_iter(&text)
            .map(|m| m.as_str().to_string())
            .collect();
        Ok(string_array(vm, found))
    });

    vm.define_native_vm("replace", 3, |vm, args| {
        let pattern = want_string(vm, "regex.replace", args, 0)?;
        let text = want_string(vm, "regex.replace", args, 1)?;
        let rep = want_string(vm, "regex.replace", args, 2)?;
        let out = compile(&pattern)?.replace_all(&text, rep.as_str()).into_owned();
        Ok(vm.make_string_value(out))
    });

    vm.define_native_vm("split", 2, |vm, args| {
        let pattern = want_string(vm, "regex.split", args, 0)?;
        let text = want_string(vm, "regex.split", args, 1)?;
        let parts: Vec<String> = compile(&pattern)?.split(&text).map(str::to_string).collect();
        Ok(string_array(vm, parts))
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::{eval, global_str};
    use neutron_vm::value::Value;

    #[test]
    fn matches_and_find() {
        let vm = eval(
            "use regex; var m = regex.matches(\"^a+b$\", \"aaab\"); \
             var f = regex.find(\"[0-9]+\", \"abc 123 def\"); \
             var none = regex.find(\"z+\", \"abc\");",
        );
        assert_eq!(vm.globals["m"], Value::Bool(true));
        assert_eq!(global_str(&vm, "f"), "123");
        assert_eq!(vm.globals["none"], Value::Nil);
    }

    #[test]
    fn find_all_and_split() {
        let vm = eval(
            "use regex; var all = regex.find_all(\"[a-z]+\", \"un deux trois\"); \
             var parts = regex.split(\"\\\\s*,\\\\s*\", \"a , b,c\"); \
             var r = all.join(\"|\"); var p = parts.join(\"|\");",
        );
        assert_eq!(global_str(&vm, "r"), "un|deux|trois");
        assert_eq!(global_str(&vm, "p"), "a|b|c");
    }

    #[test]
    fn replace_all_occurrences() {
        let vm = eval(
            "use regex; var r = regex.replace(\"[0-9]+\", \"a1b22c333\", \"#\");",
        );
        assert_eq!(global_str(&vm, "r"), "a#b#c#");
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        let mut vm = crate::tests::stdlib_vm();
        assert!(vm
            .execute_string("use regex; regex.matches(\"(unclosed\", \"x\");", "<t>")
            .is_err());
    }
}
