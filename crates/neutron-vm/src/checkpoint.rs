//! checkpoint.rs — Image d'état pour `sys.checkpoint` / `--resume`.
//!
//! Format **NTCKPT** (opaque, versionné) :
//!
//! ```text
//! magic[6]  = b"NTCKPT"
//! version   = u16 BE
//! body_len  = u32 BE
//! body      = bincode(Image)
//! hash      = u64 BE (FNV-1a du body, détection de corruption)
//! ```
//!
//! L'image capture les globales **de données** (nil, bool, nombre,
//! chaîne, tableau, objet, buffer — récursivement) et les annotations de
//! type. Les appelables et modules sont enregistrés comme opaques : au
//! resume, ces bindings sont re-créés par le script et la stdlib, pas
//! par l'image. Le format doit faire l'aller-retour sur sa propre
//! sortie ; rien de plus.

use std::io::{Read, Write};
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};

use neutron_core::TypeTag;

use crate::error::RuntimeError;
use crate::heap::{ArrayObj, BufferObj, HeapObj, MapObj};
use crate::value::Value;
use crate::Vm;

pub const MAGIC: &[u8; 6] = b"NTCKPT";
pub const VERSION: u16 = 1;

/// Garde-fou contre les structures cycliques.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
enum CkValue {
    Nil,
    Bool(bool),
    Number(f64),
    Str(String),
    Array(Vec<CkValue>),
    Object(Vec<(String, CkValue)>),
    Buffer(Vec<u8>),
    /// Non sérialisable (appelable, module, classe, instance) : décrit,
    /// ignoré au resume.
    Opaque(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct Image {
    globals: Vec<(String, CkValue)>,
    global_types: Vec<(String, u8)>,
    current_file: String,
}

fn encode(vm: &Vm, value: Value, depth: usize) -> CkValue {
    if depth > MAX_DEPTH {
        return CkValue::Opaque("<depth limit>".to_string());
    }
    match value {
        Value::Nil => CkValue::Nil,
        Value::Bool(b) => CkValue::Bool(b),
        Value::Number(n) => CkValue::Number(n),
        Value::Str(h) => CkValue::Str(vm.heap.str_chars(h).to_string()),
        Value::Array(h) => CkValue::Array(
            vm.heap
                .array_elements(h)
                .iter()
                .map(|v| encode(vm, *v, depth + 1))
                .collect(),
        ),
        Value::Object(h) => {
            let mut props: Vec<(String, CkValue)> = vm
                .heap
                .object_properties(h)
                .iter()
                .map(|(k, v)| (k.clone(), encode(vm, *v, depth + 1)))
                .collect();
            props.sort_by(|a, b| a.0.cmp(&b.0));
            CkValue::Object(props)
        }
        Value::Buffer(h) => CkValue::Buffer(vm.heap.buffer_bytes(h).to_vec()),
        other => CkValue::Opaque(other.type_name().to_string()),
    }
}

fn decode(vm: &mut Vm, value: CkValue) -> Option<Value> {
    Some(match value {
        CkValue::Nil => Value::Nil,
        CkValue::Bool(b) => Value::Bool(b),
        CkValue::Number(n) => Value::Number(n),
        CkValue::Str(s) => vm.make_string_value(s),
        CkValue::Array(items) => {
            let roots_base = vm.heap.temp_roots.len();
            let mut elements = Vec::with_capacity(items.len());
            for item in items {
                if let Some(v) = decode(vm, item) {
                    if let Some(h) = v.handle() {
                        vm.heap.temp_roots.push(h);
                    }
                    elements.push(v);
                }
            }
            let h = vm.allocate(HeapObj::Array(ArrayObj { elements }));
            vm.heap.temp_roots.truncate(roots_base);
            Value::Array(h)
        }
        CkValue::Object(props) => {
            let roots_base = vm.heap.temp_roots.len();
            let mut properties = ahash::AHashMap::with_capacity(props.len());
            for (k, item) in props {
                if let Some(v) = decode(vm, item) {
                    if let Some(h) = v.handle() {
                        vm.heap.temp_roots.push(h);
                    }
                    properties.insert(k, v);
                }
            }
            let h = vm.allocate(HeapObj::Object(MapObj { properties }));
            vm.heap.temp_roots.truncate(roots_base);
            Value::Object(h)
        }
        CkValue::Buffer(bytes) => Value::Buffer(vm.allocate(HeapObj::Buffer(BufferObj { bytes }))),
        CkValue::Opaque(_) => return None,
    })
}

fn fnv1a_64(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in data {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01B3);
    }
    h
}

/// Écrit l'image de la VM dans `path`.
pub fn save(vm: &Vm, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
    let mut globals: Vec<(String, CkValue)> = vm
        .globals
        .iter()
        .map(|(k, v)| (k.clone(), encode(vm, *v, 0)))
        .collect();
    globals.sort_by(|a, b| a.0.cmp(&b.0));
    let image = Image {
        globals,
        global_types: vm
            .global_types
            .iter()
            .map(|(k, t)| (k.clone(), *t as u8))
            .collect(),
        current_file: vm.current_file.clone(),
    };
    let body = bincode::serialize(&image)
        .map_err(|e| RuntimeError::io(format!("Cannot serialize checkpoint: {e}")))?;

    let mut file = std::fs::File::create(path.as_ref())
        .map_err(|e| RuntimeError::io(format!("Cannot create checkpoint file: {e}")))?;
    let write = |f: &mut std::fs::File, bytes: &[u8]| {
        f.write_all(bytes)
            .map_err(|e| RuntimeError::io(format!("Cannot write checkpoint: {e}")))
    };
    write(&mut file, MAGIC)?;
    write(&mut file, &VERSION.to_be_bytes())?;
    write(&mut file, &(body.len() as u32).to_be_bytes())?;
    write(&mut file, &body)?;
    write(&mut file, &fnv1a_64(&body).to_be_bytes())?;
    debug!("checkpoint écrit : {} globales", image.globals.len());
    Ok(())
}

/// Restaure une image dans la VM : les globales de données sont rétablies,
/// les opaques ignorées (les bindings natifs existent déjà).
pub fn resume(vm: &mut Vm, path: impl AsRef<Path>) -> Result<(), RuntimeError> {
    let mut file = std::fs::File::open(path.as_ref())
        .map_err(|e| RuntimeError::io(format!("Cannot open checkpoint: {e}")))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)
        .map_err(|e| RuntimeError::io(format!("Cannot read checkpoint: {e}")))?;

    if raw.len() < MAGIC.len() + 2 + 4 + 8 || &raw[..6] != MAGIC {
        return Err(RuntimeError::io("Not a Neutron checkpoint (bad magic)."));
    }
    let version = u16::from_be_bytes([raw[6], raw[7]]);
    if version != VERSION {
        return Err(RuntimeError::io(format!(
            "Unsupported checkpoint version {version} (expected {VERSION})."
        )));
    }
    let body_len = u32::from_be_bytes([raw[8], raw[9], raw[10], raw[11]]) as usize;
    let body_start = 12;
    if raw.len() < body_start + body_len + 8 {
        return Err(RuntimeError::io("Truncated checkpoint file."));
    }
    let body = &raw[body_start..body_start + body_len];
    let expected = u64::from_be_bytes(
        raw[body_start + body_len..body_start + body_len + 8]
            .try_into()
            .expect("longueur vérifiée"),
    );
    if fnv1a_64(body) != expected {
        return Err(RuntimeError::io("Corrupt checkpoint (hash mismatch)."));
    }

    let image: Image = bincode::deserialize(body)
        .map_err(|e| RuntimeError::io(format!("Cannot decode checkpoint: {e}")))?;
    for (name, ck) in image.globals {
        if let Some(v) = decode(vm, ck) {
            vm.globals.insert(name, v);
        }
    }
    for (name, tag) in image.global_types {
        if let Some(t) = TypeTag::from_byte(tag) {
            vm.global_types.insert(name, t);
        }
    }
    Ok(())
}
