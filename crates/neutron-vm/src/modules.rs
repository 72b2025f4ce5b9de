//! modules.rs — Chargeur de modules.
//!
//! Trois familles :
//!
//! - **intégrés** : dispatchés par nom vers un initialiseur lié
//!   statiquement (registre rempli par l'embarqueur), sans recherche FS ;
//! - **sources** : fichiers `.nt` trouvés sur les chemins de recherche,
//!   exécutés dans des globales **isolées** (protocole de swap), exports
//!   moissonnés dans un environnement ;
//! - **natifs** : bibliothèques dynamiques `{préfixe}{nom}{ext}` dont le
//!   symbole `neutron_module_init(VM*)` est invoqué sous le même swap.
//!
//! Les handles de bibliothèques ne sont **jamais** refermés pendant la
//! vie de la VM : un déchargement prématuré plante tant que des données
//! de la bibliothèque restent référencées. On fuit le handle, point.
//!
//! Le cache garantit l'idempotence : `use m; use m;` n'exécute le niveau
//! module qu'une fois.

use std::path::Path;

use log::debug;

use crate::env::{Env, EnvRef};
use crate::error::{RuntimeError, VmError};
use crate::heap::{HeapObj, ModuleObj};
use crate::value::Value;
use crate::Vm;

/// Noms reconnus comme modules (suggestion d'import dans les erreurs).
pub const KNOWN_MODULES: &[&str] = &[
    "json", "math", "sys", "http", "time", "fmt", "arrays", "async", "regex", "crypto",
    "path", "random", "process",
];

pub fn is_known_module_name(name: &str) -> bool {
    KNOWN_MODULES.contains(&name)
}

/// Extensions candidates d'une bibliothèque native, par plateforme.
fn native_extensions() -> &'static [&'static str] {
    #[cfg(target_os = "macos")]
    {
        &[".dylib", ".so"]
    }
    #[cfg(target_os = "windows")]
    {
        &[".dll"]
    }
    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        &[".so"]
    }
}

impl Vm {
    /// Charge un module par nom ; idempotent.
    pub fn load_module(&mut self, name: &str) -> Result<(), VmError> {
        if self.module_cache.contains_key(name) {
            return Ok(());
        }
        if self.globals.contains_key(name) {
            self.module_cache.insert(name.to_string(), true);
            return Ok(());
        }

        // 1. Modules intégrés, liés statiquement.
        if let Some(init) = self.builtins.get(name).copied() {
            debug!("module intégré '{name}'");
            let env = self.run_isolated(|vm| init(vm).map_err(VmError::Runtime))?;
            self.finish_module(name, env);
            return Ok(());
        }

        // 2. Modules source `.nt`.
        let source_candidates = [
            format!(".box/modules/{name}/{name}.nt"),
            format!("box/{name}/{name}.nt"),
            format!("box/{name}.nt"),
            format!("lib/{name}.nt"),
            format!("libs/{name}.nt"),
            format!("{name}.nt"),
        ];
        for candidate in &source_candidates {
            if let Some(source) = self.read_candidate(candidate) {
                debug!("module source '{name}' depuis {candidate}");
                let proto = neutron_compiler::compile_source(&source, candidate)
                    .map_err(|e| RuntimeError::module(e.to_string()))?;
                self.register_source(candidate, &source);
                // Un échec du niveau module reste une ModuleError
                // rattrapable côté appelant, pas une fatale.
                let env = self
                    .run_isolated(|vm| vm.interpret(proto).map(|_| ()).map_err(VmError::Fatal))
                    .map_err(|e| match e {
                        VmError::Fatal(f) => VmError::Runtime(RuntimeError::module(format!(
                            "Module '{name}' failed to initialize: {}",
                            f.error
                        ))),
                        other => other,
                    })?;
                self.finish_module(name, env);
                return Ok(());
            }
        }

        // 3. Extensions natives.
        if let Some(path) = self.find_native_library(name) {
            debug!("module natif '{name}' depuis {path}");
            let env = self.load_native_library(name, &path)?;
            self.finish_module(name, env);
            return Ok(());
        }

        Err(VmError::Runtime(RuntimeError::module(format!(
            "Module '{name}' not found. Make sure to use 'use {name};' before \
             accessing it."
        ))))
    }

    /// Exécute `body` avec des globales vides, moissonne le résultat dans
    /// un environnement frais, puis restaure. Les globales mises de côté
    /// restent racines GC pendant toute l'opération.
    fn run_isolated(
        &mut self,
        body: impl FnOnce(&mut Vm) -> Result<(), VmError>,
    ) -> Result<EnvRef, VmError> {
        let saved = std::mem::take(&mut self.globals);
        let saved_types = std::mem::take(&mut self.global_types);
        self.saved_globals_stack.push(saved);

        let outcome = body(self);

        let module_globals = std::mem::take(&mut self.globals);
        self.globals = self
            .saved_globals_stack
            .pop()
            .expect("pile de globales sauvegardées vide");
        self.global_types = saved_types;

        outcome?;

        let env = Env::new();
        {
            let mut e = env.borrow_mut();
            for (k, v) in module_globals {
                e.define(k, v);
            }
        }
        // Les fonctions et classes moissonnées gagnent l'environnement du
        // module : leurs corps voient les symboles voisins même une fois
        // les globales restaurées.
        self.bind_env_to_exports(&env);
        Ok(env)
    }

    fn bind_env_to_exports(&mut self, env: &EnvRef) {
        let values: Vec<Value> = env.borrow().values.values().copied().collect();
        for v in values {
            match v {
                Value::Callable(h) => {
                    if let HeapObj::Function(f) = self.heap.get_mut(h) {
                        if f.closure.is_none() {
                            f.closure = Some(env.clone());
                        }
                    }
                }
                Value::Class(h) => {
                    // La classe et chacune de ses méthodes voient les
                    // symboles du module.
                    let methods: Vec<Value> = {
                        let HeapObj::Class(c) = self.heap.get_mut(h) else {
                            continue;
                        };
                        if c.env.is_none() {
                            c.env = Some(env.clone());
                        }
                        c.methods.values().copied().collect()
                    };
                    for m in methods {
                        if let Value::Callable(mh) = m {
                            if let HeapObj::Function(f) = self.heap.get_mut(mh) {
                                if f.closure.is_none() {
                                    f.closure = Some(env.clone());
                                }
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    fn finish_module(&mut self, name: &str, env: EnvRef) {
        let h = self.allocate(HeapObj::Module(ModuleObj { name: name.to_string(), env }));
        self.define_module(name, h);
    }

    /// Fichier embarqué d'abord, système de fichiers ensuite.
    fn read_candidate(&self, path: &str) -> Option<String> {
        if let Some(content) = self.embedded_files.get(path) {
            return Some(content.clone());
        }
        std::fs::read_to_string(path).ok()
    }

    fn find_native_library(&self, name: &str) -> Option<String> {
        let mut paths = self.module_search_paths.clone();
        paths.push(format!(".box/modules/{name}/"));
        for dir in &paths {
            for prefix in ["", "lib"] {
                for ext in native_extensions() {
                    let mut candidate = dir.clone();
                    if !candidate.is_empty() && !candidate.ends_with('/') {
                        candidate.push('/');
                    }
                    candidate.push_str(prefix);
                    candidate.push_str(name);
                    candidate.push_str(ext);
                    if Path::new(&candidate).is_file() {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }

    /// dlopen + `neutron_module_init` sous le protocole de swap. Le
    /// handle est fuité volontairement (jamais déchargé).
    fn load_native_library(&mut self, name: &str, path: &str) -> Result<EnvRef, VmError> {
        type InitFn = unsafe extern "C" fn(*mut Vm);
        let library = unsafe { libloading::Library::new(path) }.map_err(|e| {
            RuntimeError::module(format!("Cannot load module '{name}' from {path}: {e}"))
        })?;
        let init: libloading::Symbol<'_, InitFn> =
            unsafe { library.get(b"neutron_module_init\0") }.map_err(|_| {
                RuntimeError::module(format!(
                    "Module '{name}' is not a valid Neutron module: missing \
                     neutron_module_init function."
                ))
            })?;
        let init: InitFn = *init;
        let env = self.run_isolated(|vm| {
            unsafe { init(vm as *mut Vm) };
            Ok(())
        })?;
        // Jamais déchargée : des valeurs créées par la bibliothèque
        // peuvent survivre à ce point.
        std::mem::forget(library);
        Ok(env)
    }

    /// `using "fichier.nt";` — exécute dans le scope global **courant**.
    pub fn load_file(&mut self, filepath: &str) -> Result<(), VmError> {
        let source = self.resolve_file(filepath)?;
        let proto = neutron_compiler::compile_source(&source, filepath)
            .map_err(|e| RuntimeError::module(e.to_string()))?;
        self.register_source(filepath, &source);
        self.interpret(proto).map(|_| ()).map_err(VmError::Fatal)
    }

    /// Charge un fichier comme module isolé (clé de cache = chemin).
    pub fn load_file_as_module(&mut self, filepath: &str) -> Result<Value, VmError> {
        let source = self.resolve_file(filepath)?;
        let proto = neutron_compiler::compile_source(&source, filepath)
            .map_err(|e| RuntimeError::module(e.to_string()))?;
        self.register_source(filepath, &source);
        let env =
            self.run_isolated(|vm| vm.interpret(proto).map(|_| ()).map_err(VmError::Fatal))?;
        let h = self.allocate(HeapObj::Module(ModuleObj {
            name: filepath.to_string(),
            env,
        }));
        Ok(Value::Module(h))
    }

    fn resolve_file(&self, filepath: &str) -> Result<String, VmError> {
        if let Some(content) = self.embedded_files.get(filepath) {
            return Ok(content.clone());
        }
        if let Ok(content) = std::fs::read_to_string(filepath) {
            return Ok(content);
        }
        for dir in &self.module_search_paths {
            let candidate = format!(
                "{}{}{}",
                dir,
                if dir.ends_with('/') { "" } else { "/" },
                filepath
            );
            if let Some(content) = self.embedded_files.get(&candidate) {
                return Ok(content.clone());
            }
            if let Ok(content) = std::fs::read_to_string(&candidate) {
                return Ok(content);
            }
        }
        Err(VmError::Runtime(RuntimeError::io(format!(
            "File '{filepath}' not found."
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn unknown_module_is_module_error() {
        let mut vm = Vm::new();
        let err = vm.load_module("definitely_not_there").unwrap_err();
        match err {
            VmError::Runtime(e) => assert_eq!(e.kind, ErrorKind::Module),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn builtin_module_runs_under_swap_and_caches() {
        let mut vm = Vm::new();
        vm.register_builtin("demo", |vm| {
            vm.define_native("answer", 0, |_| Ok(Value::Number(42.0)));
            Ok(())
        });
        vm.execute_string("use demo; var r = demo.answer();", "<t>").unwrap();
        assert_eq!(vm.globals["r"], Value::Number(42.0));
        // Le module est une globale ; le cache rend le second use inerte.
        assert!(matches!(vm.globals["demo"], Value::Module(_)));
        vm.execute_string("use demo;", "<t>").unwrap();
    }

    thread_local! {
        static RUNS: std::cell::Cell<f64> = const { std::cell::Cell::new(0.0) };
    }

    fn hooks_init(vm: &mut Vm) -> Result<(), RuntimeError> {
        vm.define_native("bump", 0, |_| {
            RUNS.with(|c| {
                c.set(c.get() + 1.0);
                Ok(Value::Number(c.get()))
            })
        });
        Ok(())
    }

    #[test]
    fn module_cache_runs_top_level_once() {
        // Le niveau module incrémente un compteur : deux `use` ne doivent
        // produire qu'une exécution.
        let mut vm = Vm::new();
        vm.register_builtin("hooks", hooks_init);
        vm.add_embedded_file(
            "counted.nt",
            "use hooks; var runs = hooks.bump(); fun ping() { return runs; }",
        );
        vm.execute_string("use counted; use counted; var r = counted.ping();", "<t>")
            .unwrap();
        assert_eq!(vm.globals["r"], Value::Number(1.0));
        RUNS.with(|c| assert_eq!(c.get(), 1.0));
    }

    #[test]
    fn source_module_exports_are_isolated() {
        let mut vm = Vm::new();
        vm.add_embedded_file("iso.nt", "var secret = 5; fun reveal() { return secret; }");
        vm.execute_string("use iso; var r = iso.reveal();", "<t>").unwrap();
        assert_eq!(vm.globals["r"], Value::Number(5.0));
        // Le binding du module ne fuit pas dans les globales.
        assert!(!vm.globals.contains_key("secret"));
        assert!(!vm.globals.contains_key("reveal"));
    }

    #[test]
    fn using_file_executes_in_current_scope() {
        let mut vm = Vm::new();
        vm.add_embedded_file("helpers.nt", "var shared = 11; fun helper() { return shared; }");
        vm.execute_string("using \"helpers.nt\"; var r = helper() + shared;", "<t>")
            .unwrap();
        assert_eq!(vm.globals["r"], Value::Number(22.0));
        assert!(vm.globals.contains_key("shared"));
    }

    #[test]
    fn module_functions_see_module_siblings_after_restore() {
        // reveal() référence une globale du module : après restauration
        // des globales de l'appelant, la chaîne d'environnement du module
        // doit continuer à la résoudre.
        let mut vm = Vm::new();
        vm.add_embedded_file(
            "sib.nt",
            "var base = 100; fun bump(n) { return base + n; }",
        );
        vm.execute_string("use sib; var r = sib.bump(5);", "<t>").unwrap();
        assert_eq!(vm.globals["r"], Value::Number(105.0));
    }

    #[test]
    fn load_file_as_module_keeps_caller_globals() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("standalone.nt");
        std::fs::write(&path, "var x = 1;").unwrap();
        let mut vm = Vm::new();
        vm.define("keep", Value::Number(9.0));
        let m = vm
            .load_file_as_module(path.to_str().unwrap())
            .expect("chargement ok");
        assert!(matches!(m, Value::Module(_)));
        assert_eq!(vm.globals["keep"], Value::Number(9.0));
        assert!(!vm.globals.contains_key("x"));
    }

    #[test]
    fn known_module_names() {
        assert!(is_known_module_name("json"));
        assert!(is_known_module_name("process"));
        assert!(!is_known_module_name("nonsense"));
    }
}
