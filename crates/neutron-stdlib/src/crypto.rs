//! crypto.rs — Module `crypto` : hachage et encodages.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use neutron_vm::error::RuntimeError;
use neutron_vm::value::Value;
use neutron_vm::Vm;

use crate::want_string;

pub fn init(vm: &mut Vm) -> Result<(), RuntimeError> {
    vm.define_native_vm("sha256", 1, |vm, args| {
        let text = want_string(vm, "crypto.sha256", args, 0)?;
        let digest = Sha256::digest(text.as_bytes());
        Ok(vm.make_string_value(hex::encode(digest)))
    });

    vm.define_native_vm("sha256_bytes", 1, |vm, args| {
        let Some(Value::Buffer(h)) = args.first() else {
            return Err(RuntimeError::type_error(
                "crypto.sha256_bytes expects a buffer.",
            ));
        };
        let digest = Sha256::digest(vm.heap.buffer_bytes(*h));
        Ok(vm.make_string_value(hex::encode(digest)))
    });

    vm.define_native_vm("hex_encode", 1, |vm, args| {
        let text = want_string(vm, "crypto.hex_encode", args, 0)?;
        Ok(vm.make_string_value(hex::encode(text.as_bytes())))
    });

    vm.define_native_vm("hex_decode", 1, |vm, args| {
        let text = want_string(vm, "crypto.hex_decode", args, 0)?;
        let bytes = hex::decode(&text)
            .map_err(|e| RuntimeError::runtime(format!("crypto.hex_decode: {e}")))?;
        let s = String::from_utf8(bytes)
            .map_err(|_| RuntimeError::runtime("crypto.hex_decode: not valid UTF-8."))?;
        Ok(vm.make_string_value(s))
    });

    vm.define_native_vm("base64_encode", 1, |vm, args| {
        let text = want_string(vm, "crypto.base64_encode", args, 0)?;
        Ok(vm.make_string_value(BASE64.encode(text.as_bytes())))
    });

    vm.define_native_vm("base64_decode", 1, |vm, args| {
        let text = want_string(vm, "crypto.base64_decode", args, 0)?;
        let bytes = BASE64
            .decode(&text)
            .map_err(|e| RuntimeError::runtime(format!("crypto.base64_decode: {e}")))?;
        let s = String::from_utf8(bytes)
            .map_err(|_| RuntimeError::runtime("crypto.base64_decode: not valid UTF-8."))?;
        Ok(vm.make_string_value(s))
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::tests::{eval, global_str};

    #[test]
    fn sha256_known_vector() {
        let vm = eval("use crypto; var r = crypto.sha256(\"abc\");");
        assert_eq!(
            global_str(&vm, "r"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn hex_roundtrip() {
        let vm = eval(
            "use crypto; var e = crypto.hex_encode(\"neutron\"); \
             var d = crypto.hex_decode(e);",
        );
        assert_eq!(global_str(&vm, "d"), "neutron");
    }

    #[test]
    fn base64_roundtrip() {
        let vm = eval(
            "use crypto; var e = crypto.base64_encode(\"hello world\"); \
             var d = crypto.base64_decode(e);",
        );
        assert_eq!(global_str(&vm, "e"), "aGVsbG8gd29ybGQ=");
        assert_eq!(global_str(&vm, "d"), "hello world");
    }

    #[test]
    fn buffer_hashing() {
        let vm = eval(
            "use crypto; use sys; var b = sys.buffer(3); \
             b[0] = 97; b[1] = 98; b[2] = 99; var r = crypto.sha256_bytes(b);",
        );
        assert_eq!(
            global_str(&vm, "r"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn bad_hex_is_an_error() {
        let mut vm = crate::tests::stdlib_vm();
        assert!(vm
            .execute_string("use crypto; crypto.hex_decode(\"zz\");", "<t>")
            .is_err());
    }
}
