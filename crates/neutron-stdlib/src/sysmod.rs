//! sysmod.rs — Module `sys` : arguments, environnement, fichiers,
//! checkpoint.

use std::io::Write as _;

use neutron_vm::checkpoint;
use neutron_vm::error::RuntimeError;
use neutron_vm::heap::{ArrayObj, BufferObj, HeapObj};
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::{want_number, want_string};

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_vm("args", 0, |vm, _| {
        let parts: Vec<String> = vm.command_line_args.clone();
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
        Ok(Value::Array(h))
    });

    vm.define_native_vm("env", 1, |vm, args| {
        let name = want_string(vm, "sys.env", args, 0)?;
        match std::env::var(&name) {
            Ok(v) => Ok(vm.make_string_value(v)),
            Err(_) => Ok(Value::Nil),
        }
    });

    vm.define_native("exit", 1, |args| {
        let code = want_number("sys.exit", args, 0)?;
        std::process::exit(code as i32);
    });

    vm.define_native_vm("platform", 0, |vm, _| {
        Ok(vm.make_string_value(std::env::consts::OS.to_string()))
    });

    vm.define_native("time_ms", 0, |_| {
        let ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as f64)
            .unwrap_or(0.0);
        Ok(Value::Number(ms))
    });

    vm.define_native_vm("input", 1, |vm, args| {
        let prompt = want_string(vm, "sys.input", args, 0)?;
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map_err(|e| RuntimeError::io(format!("sys.input: {e}")))?;
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(vm.make_string_value(line))
    });

    vm.define_native_vm("read_file", 1, |vm, args| {
        let path = want_string(vm, "sys.read_file", args, 0)?;
        let content = std::fs::read_to_string(&path)
            .map_err(|e| RuntimeError::io(format!("Cannot read '{path}': {e}")))?;
        Ok(vm.make_string_value(content))
    });

    vm.define_native_vm("write_file", 2, |vm, args| {
        let path = want_string(vm, "sys.write_file", args, 0)?;
        let content = crate::rendered(vm, args[1]);
        std::fs::write(&path, content)
            .map_err(|e| RuntimeError::io(format!("Cannot write '{path}': {e}")))?;
        Ok(Value::Nil)
    });

    vm.define_native_vm("buffer", 1, |vm, args| {
        let n = want_number("sys.buffer", args, 0)?;
        if n < 0.0 {
            return Err(RuntimeError::range("sys.buffer expects a non-negative size."));
        }
        let h = vm.allocate(HeapObj::Buffer(BufferObj { bytes: vec![0; n as usize] }));
        Ok(Value::Buffer(h))
    });

    // Sérialise assez d'état (globales de données, annotations) pour un
    // `--resume` ultérieur.
    vm.define_native_vm("checkpoint", 1, |vm, args| {
        let path = want_string(vm, "sys.checkpoint", args, 0)?;
        checkpoint::save(vm, &path)?;
        Ok(Value::Bool(true))
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::{eval, global_str};
    use neutron_vm::value::Value;

    #[test]
    fn platform_and_time() {
        let vm = eval("use sys; var p = sys.platform(); var t = sys.time_ms();");
        assert_eq!(global_str(&vm, "p"), std::env::consts::OS);
        let Value::Number(t) = vm.globals["t"] else { panic!() };
        assert!(t > 0.0);
    }

    #[test]
    fn env_returns_nil_when_absent() {
        let vm = eval("use sys; var v = sys.env(\"NEUTRON_SUREMENT_PAS_LA\");");
        assert_eq!(vm.globals["v"], Value::Nil);
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let src = format!(
            "use sys; sys.write_file(\"{0}\", \"contenu\"); var r = sys.read_file(\"{0}\");",
            path.display()
        );
        let vm = eval(&src);
        assert_eq!(global_str(&vm, "r"), "contenu");
    }

    #[test]
    fn buffers_are_indexable() {
        let vm = eval(
            "use sys; var b = sys.buffer(4); b[0] = 255; b[3] = 7; \
             var r = b[0] + b[1] + b[3];",
        );
        assert_eq!(vm.globals["r"], Value::Number(262.0));
    }

    #[test]
    fn buffer_rejects_out_of_range_bytes() {
        let mut vm = crate::tests::stdlib_vm();
        assert!(vm
            .execute_string("use sys; var b = sys.buffer(1); b[0] = 300;", "<t>")
            .is_err());
    }

    #[test]
    fn checkpoint_writes_a_loadable_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img.ntck");
        let src = format!(
            "use sys; var keep = [1, 2, 3]; sys.checkpoint(\"{}\");",
            path.display()
        );
        let _ = eval(&src);
        let mut vm2 = neutron_vm::Vm::new();
        neutron_vm::checkpoint::resume(&mut vm2, &path).unwrap();
        let Value::Array(h) = vm2.globals["keep"] else { panic!() };
        assert_eq!(vm2.heap.array_elements(h).len(), 3);
    }
}
