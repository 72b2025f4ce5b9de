//! capi.rs — ABI C des modules natifs.
//!
//! Le contrat est volontairement étroit pour survivre aux dérives de
//! version : prédicats de type, accesseurs, constructeurs possédés par la
//! VM, et `neutron_define_native`. Une extension exporte
//! `neutron_module_init(VM*)` en linkage C et y enregistre ses fonctions.
//!
//! Discipline mémoire : les valeurs de retour des fonctions natives sont
//! produites dans un slot thread-local possédé par l'hôte, puis copiées
//! dans l'espace de valeurs de la VM au point d'appel — pas de mélange
//! d'allocateurs entre la VM et une bibliothèque chargée d'un autre
//! binaire. Les handles frais sont retenus en racine temporaire jusqu'au
//! retour de l'appel.

use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_int, CStr};

use crate::error::RuntimeError;
use crate::heap::{HeapObj, NativeImpl, NativeObj};
use crate::value::Value;
use crate::Vm;

/// Signature d'une fonction native C : `(VM*, argc, argv) → Value*`.
pub type NeutronNativeFn =
    unsafe extern "C" fn(*mut Vm, c_int, *mut *mut Value) -> *mut Value;

thread_local! {
    /// Slot de retour possédé par l'hôte.
    static RETURN_SLOT: RefCell<Value> = const { RefCell::new(Value::Nil) };
    /// VM en cours d'appel natif (pour les accesseurs sans paramètre VM).
    static CURRENT_VM: Cell<*mut Vm> = const { Cell::new(std::ptr::null_mut()) };
}

/// Invoque une fonction C depuis le dispatch. Les arguments vivent dans
/// un buffer local stable pour la durée de l'appel ; les handles alloués
/// par la fonction via les constructeurs restent racines temporaires
/// jusqu'ici.
pub(crate) fn invoke_c_native(
    vm: &mut Vm,
    f: NeutronNativeFn,
    args: &[Value],
) -> Result<Value, RuntimeError> {
    let roots_base = vm.heap.temp_roots.len();
    let vm_ptr: *mut Vm = vm;
    let mut buffer: Vec<Value> = args.to_vec();
    let mut ptrs: Vec<*mut Value> = buffer.iter_mut().map(|v| v as *mut Value).collect();
    let prior = CURRENT_VM.with(|c| c.replace(vm_ptr));
    // Sûr : le pointeur vient d'un `&mut Vm` vivant pour la durée de
    // l'appel ; la fonction respecte le contrat de l'ABI.
    let raw = unsafe { f(vm_ptr, ptrs.len() as c_int, ptrs.as_mut_ptr()) };
    CURRENT_VM.with(|c| c.set(prior));
    let result = if raw.is_null() { Value::Nil } else { unsafe { *raw } };
    vm.heap.temp_roots.truncate(roots_base);
    Ok(result)
}

fn with_value<R>(value: *mut Value, f: impl FnOnce(Value) -> R, default: R) -> R {
    if value.is_null() {
        default
    } else {
        f(unsafe { *value })
    }
}

fn return_value(v: Value) -> *mut Value {
    RETURN_SLOT.with(|slot| {
        *slot.borrow_mut() = v;
        slot.as_ptr()
    })
}

// ---- Prédicats de type ----

#[no_mangle]
pub extern "C" fn neutron_is_nil(value: *mut Value) -> bool {
    with_value(value, |v| matches!(v, Value::Nil), false)
}

#[no_mangle]
pub extern "C" fn neutron_is_boolean(value: *mut Value) -> bool {
    with_value(value, |v| matches!(v, Value::Bool(_)), false)
}

#[no_mangle]
pub extern "C" fn neutron_is_number(value: *mut Value) -> bool {
    with_value(value, |v| matches!(v, Value::Number(_)), false)
}

#[no_mangle]
pub extern "C" fn neutron_is_string(value: *mut Value) -> bool {
    with_value(value, |v| matches!(v, Value::Str(_)), false)
}

// ---- Accesseurs ----

#[no_mangle]
pub extern "C" fn neutron_get_boolean(value: *mut Value) -> bool {
    with_value(value, |v| matches!(v, Value::Bool(true)), false)
}

#[no_mangle]
pub extern "C" fn neutron_get_number(value: *mut Value) -> f64 {
    with_value(value, |v| if let Value::Number(n) = v { n } else { 0.0 }, 0.0)
}

/// Pointeur vers les octets de la chaîne + longueur. Valide pendant
/// l'appel natif courant (la VM tient l'objet).
#[no_mangle]
pub extern "C" fn neutron_get_string(value: *mut Value, length: *mut usize) -> *const c_char {
    let vm_ptr = CURRENT_VM.with(|c| c.get());
    if vm_ptr.is_null() || value.is_null() {
        return std::ptr::null();
    }
    let vm = unsafe { &*vm_ptr };
    match unsafe { *value } {
        Value::Str(h) => {
            let chars = vm.heap.str_chars(h);
            if !length.is_null() {
                unsafe { *length = chars.len() };
            }
            chars.as_ptr() as *const c_char
        }
        _ => std::ptr::null(),
    }
}

// ---- Constructeurs (possédés par la VM) ----

#[no_mangle]
pub extern "C" fn neutron_new_nil() -> *mut Value {
    return_value(Value::Nil)
}

#[no_mangle]
pub extern "C" fn neutron_new_boolean(value: bool) -> *mut Value {
    return_value(Value::Bool(value))
}

#[no_mangle]
pub extern "C" fn neutron_new_number(value: f64) -> *mut Value {
    return_value(Value::Number(value))
}

#[no_mangle]
pub extern "C" fn neutron_new_string(
    vm: *mut Vm,
    chars: *const c_char,
    length: usize,
) -> *mut Value {
    if vm.is_null() || chars.is_null() {
        return return_value(Value::Nil);
    }
    let vm = unsafe { &mut *vm };
    let bytes = unsafe { std::slice::from_raw_parts(chars as *const u8, length) };
    let s = String::from_utf8_lossy(bytes).into_owned();
    let h = vm.heap.make_string(s);
    // Retenu jusqu'à la fin de l'appel natif (copie au point d'appel).
    vm.heap.temp_roots.push(h);
    return_value(Value::Str(h))
}

// ---- Enregistrement ----

/// Déclare une fonction native sous `name` dans les globales courantes
/// (pendant `neutron_module_init`, ce sont celles du module).
#[no_mangle]
pub extern "C" fn neutron_define_native(
    vm: *mut Vm,
    name: *const c_char,
    function: NeutronNativeFn,
    arity: c_int,
) {
    if vm.is_null() || name.is_null() {
        return;
    }
    let vm = unsafe { &mut *vm };
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        return;
    };
    let h = vm.allocate(HeapObj::Native(NativeObj {
        name: name.to_string(),
        arity,
        fun: NativeImpl::CAbi(function),
    }));
    vm.globals.insert(name.to_string(), Value::Callable(h));
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn c_add(
        _vm: *mut Vm,
        argc: c_int,
        argv: *mut *mut Value,
    ) -> *mut Value {
        assert_eq!(argc, 2);
        let a = neutron_get_number(*argv);
        let b = neutron_get_number(*argv.add(1));
        neutron_new_number(a + b)
    }

    unsafe extern "C" fn c_greet(
        vm: *mut Vm,
        _argc: c_int,
        argv: *mut *mut Value,
    ) -> *mut Value {
        let mut len = 0usize;
        let p = neutron_get_string(*argv, &mut len);
        assert!(!p.is_null());
        let name =
            std::str::from_utf8_unchecked(std::slice::from_raw_parts(p as *const u8, len));
        let out = format!("hello {name}");
        neutron_new_string(vm, out.as_ptr() as *const c_char, out.len())
    }

    #[test]
    fn predicates_and_accessors() {
        let mut n = Value::Number(4.5);
        let mut b = Value::Bool(true);
        let mut nil = Value::Nil;
        assert!(neutron_is_number(&mut n));
        assert!(!neutron_is_number(&mut b));
        assert!(neutron_is_nil(&mut nil));
        assert_eq!(neutron_get_number(&mut n), 4.5);
        assert!(neutron_get_boolean(&mut b));
    }

    #[test]
    fn c_native_roundtrip_through_the_vm() {
        let mut vm = Vm::new();
        neutron_define_native(
            &mut vm,
            c"c_add".as_ptr(),
            c_add,
            2,
        );
        vm.execute_string("var r = c_add(40, 2);", "<t>").unwrap();
        assert_eq!(vm.globals["r"], Value::Number(42.0));
    }

    #[test]
    fn c_native_builds_strings_via_the_vm_allocator() {
        let mut vm = Vm::new();
        neutron_define_native(&mut vm, c"c_greet".as_ptr(), c_greet, 1);
        vm.execute_string("var r = c_greet(\"neutron\");", "<t>").unwrap();
        let Value::Str(h) = vm.globals["r"] else { panic!() };
        assert_eq!(vm.heap.str_chars(h), "hello neutron");
    }
}
