//! pathmod.rs — Module `path` : manipulation de chemins.

use std::path::{Path, PathBuf};

use neutron_vm::error::RuntimeError;
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::want_string;

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    // join(...) — variadique.
    vm.define_native_vm("join", -1, |vm, args| {
        let mut joined = PathBuf::new();
        for (i, _) in args.iter().enumerate() {
            joined.push(want_string(vm, "path.join", args, i)?);
        }
        Ok(vm.make_string_value(joined.to_string_lossy().into_owned()))
    });

    vm.define_native_vm("basename", 1, |vm, args| {
        let p = want_string(vm, "path.basename", args, 0)?;
        let name = Path::new(&p)
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(vm.make_string_value(name))
    });

    vm.define_native_vm("dirname", 1, |vm, args| {
        let p = want_string(vm, "path.dirname", args, 0)?;
        let dir = Path::new(&p)
            .parent()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(vm.make_string_value(dir))
    });

    vm.define_native_vm("extension", 1, |vm, args| {
        let p = want_string(vm, "path.extension", args, 0)?;
        match Path::new(&p).extension() {
            Some(ext) => Ok(vm.make_string_value(ext.to_string_lossy().into_owned())),
            None => Ok(Value::Nil),
        }
    });

    vm.define_native_vm("exists", 1, |vm, args| {
        let p = want_string(vm, "path.exists", args, 0)?;
        Ok(Value::Bool(Path::new(&p).exists()))
    });

    vm.define_native_vm("is_file", 1, |vm, args| {
        let p = want_string(vm, "path.is_file", args, 0)?;
        Ok(Value::Bool(Path::new(&p).is_file()))
    });

    vm.define_native_vm("is_dir", 1, |vm, args| {
        let p = want_string(vm, "path.is_dir", args, 0)?;
        Ok(Value::Bool(Path::new(&p).is_dir()))
    });

    vm.define_native_vm("absolute", 1, |vm, args| {
        let p = want_string(vm, "path.absolute", args, 0)?;
        let abs = std::fs::canonicalize(&p)
            .map_err(|e| RuntimeError::io(format!("path.absolute: '{p}': {e}")))?;
        Ok(vm.make_string_value(abs.to_string_lossy().into_owned()))
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::{eval, global_str};
    use neutron_vm::value::Value;

    #[test]
    fn join_and_parts() {
        let vm = eval(
            "use path; var p = path.join(\"a\", \"b\", \"c.nt\"); \
             var base = path.basename(p); var dir = path.dirname(p); \
             var ext = path.extension(p);",
        );
        assert_eq!(global_str(&vm, "p"), "a/b/c.nt");
        assert_eq!(global_str(&vm, "base"), "c.nt");
        assert_eq!(global_str(&vm, "dir"), "a/b");
        assert_eq!(global_str(&vm, "ext"), "nt");
    }

    #[test]
    fn extension_is_nil_when_absent() {
        let vm = eval("use path; var e = path.extension(\"Makefile\");");
        assert_eq!(vm.globals["e"], Value::Nil);
    }

    #[test]
    fn existence_checks() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.txt");
        std::fs::write(&file, "y").unwrap();
        let src = format!(
            "use path; var f = path.is_file(\"{0}\"); var d = path.is_dir(\"{1}\"); \
             var missing = path.exists(\"{1}/nope\");",
            file.display(),
            dir.path().display()
        );
        let vm = eval(&src);
        assert_eq!(vm.globals["f"], Value::Bool(true));
        assert_eq!(vm.globals["d"], Value::Bool(true));
        assert_eq!(vm.globals["missing"], Value::Bool(false));
    }
}
