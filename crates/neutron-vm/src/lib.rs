//! neutron-vm — Machine virtuelle d'exécution du langage Neutron.
//!
//! Ce crate porte tout l'état vivant du runtime :
//!
//! - la **boucle de dispatch** (pile d'opérandes, frames d'appel, ~45
//!   opcodes) et la discipline d'appel/retour,
//! - le **GC** mark-sweep précis sur l'arène du tas ([`gc`]),
//! - la machinerie **try/catch/finally** avec déroulement de pile,
//! - le **chargeur de modules** (sources `.nt`, modules intégrés,
//!   extensions natives dlopen) ([`modules`]),
//! - l'**ABI C** des modules natifs ([`capi`]),
//! - l'ordonnanceur de **processus légers** façon Erlang ([`process`]),
//! - le **checkpoint** d'état ([`checkpoint`]) et le rapporteur d'erreurs
//!   ([`report`]).
//!
//! La VM est un unique struct possédé ; tout ce qui mute prend `&mut Vm`.
//! L'exécution du bytecode est monothread — les workers de l'ordonnanceur
//! ré-entrent la VM sous le verrou réentrant de [`lock::SharedVm`].
//!
//! Chemin d'erreur : chaque handler d'opcode rend `Continue`/`Done` ou
//! lève une [`error::RuntimeError`] ; la boucle la confronte aux frames
//! d'exception (conversion en valeur lançable) ou la promeut en
//! [`error::FatalError`] avec trace.

pub mod builtins;
pub mod capi;
pub mod checkpoint;
pub mod env;
pub mod error;
pub mod gc;
pub mod heap;
pub mod lock;
pub mod modules;
pub mod process;
pub mod report;
pub mod value;

use std::rc::Rc;
use std::sync::Arc;

use log::{debug, trace};

use neutron_core::{Constant, FunctionProto, OpCode, TypeTag, FRAMES_MAX, STACK_MAX, TRY_NONE};

use env::EnvRef;
use error::{ErrorKind, FatalError, RuntimeError, TraceFrame, VmError};
use heap::{
    ArrayMethod, ArrayObj, BoundArrayObj, BoundMethodObj, BoundStringObj, ClassObj, FunctionObj,
    Handle, Heap, HeapObj, InstanceObj, MapObj, NativeImpl, NativeObj, StrMethod,
};
use value::{display_value, values_equal, Value};

/// Une frame d'appel vivante.
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// Objet fonction possédant le chunk.
    pub function: Handle,
    /// Proto partagée (évite un aller-retour tas par instruction).
    pub proto: Rc<FunctionProto>,
    /// Prochain octet à lire dans le chunk.
    pub ip: usize,
    /// Base de la fenêtre de locales dans la pile d'opérandes.
    pub slot_offset: usize,
    /// Fichier source courant (rapport d'erreurs).
    pub file: String,
    /// Dernière ligne source exécutée.
    pub line: u32,
    /// Le slot 0 est le receveur (appel de méthode liée).
    pub is_bound_method: bool,
    /// Frame d'initialiseur : `return` rend le receveur.
    pub is_initializer: bool,
}

/// Une frame d'exception (un `try` entré, pas encore `EndTry`).
///
/// La frame vit du `Try` jusqu'à l'`EndTry` correspondant — y compris
/// pendant l'exécution du catch : c'est ce qui permet à un rethrow depuis
/// le catch de passer d'abord par le finally, et aux `try` imbriqués de
/// dépiler chacun la leur.
#[derive(Debug, Clone)]
pub struct ExceptionFrame {
    pub try_start: usize,
    pub try_end: usize,
    pub catch_start: Option<usize>,
    pub finally_start: Option<usize>,
    /// Profondeur de pile d'opérandes à l'entrée du `try`.
    pub frame_base: usize,
    /// Index de la frame d'appel propriétaire.
    pub frame_index: usize,
    /// Le catch a été entré : un nouveau throw ne doit plus y retourner,
    /// il route vers le finally puis se propage à `EndTry`.
    pub caught: bool,
    pub file: String,
    pub line: u32,
}

/// Issue d'un pas de dispatch.
enum Flow {
    Continue,
    Done,
}

/// Initialiseur de module intégré, lié statiquement.
pub type BuiltinInit = fn(&mut Vm) -> Result<(), RuntimeError>;

/// Environnement hôte pour la sortie utilisateur (`say`, `fmt.print`).
pub trait Host {
    /// Impression brute, sans newline ajouté.
    fn print(&mut self, text: &str);
}

/// Hôte par défaut : stdout du système.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, text: &str) {
        print!("{text}");
        use std::io::Write as _;
        let _ = std::io::stdout().flush();
    }
}

/// L'état complet de la machine.
pub struct Vm {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub globals: ahash::AHashMap<String, Value>,
    /// Annotations des globales typées (vérifiées par `SetGlobalTyped`).
    pub global_types: ahash::AHashMap<String, TypeTag>,
    pub heap: Heap,

    // Exceptions
    pub exception_frames: Vec<ExceptionFrame>,
    pub pending_exception: Value,
    pub has_exception: bool,

    // Modules
    pub module_search_paths: Vec<String>,
    pub(crate) module_cache: ahash::AHashMap<String, bool>,
    pub(crate) builtins: ahash::AHashMap<String, BuiltinInit>,
    /// Fichiers embarqués (exécutables autonomes) consultés avant le FS.
    pub(crate) embedded_files: ahash::AHashMap<String, String>,
    /// Globals sauvegardées pendant une exécution de module (racines GC).
    pub(crate) saved_globals_stack: Vec<ahash::AHashMap<String, Value>>,

    // Contexte source
    pub current_file: String,
    /// Sources enregistrées pour l'extrait avec caret du rapporteur.
    pub sources: ahash::AHashMap<String, Vec<String>>,
    pub command_line_args: Vec<String>,

    /// Cœur du verrou réentrant quand la VM est partagée (processus).
    pub(crate) lock_core: Option<Arc<lock::LockCore>>,

    /// Hôte (sortie de `say` et des impressions de la stdlib).
    pub host: Box<dyn Host>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(256),
            frames: Vec::with_capacity(16),
            globals: ahash::AHashMap::new(),
            global_types: ahash::AHashMap::new(),
            heap: Heap::new(),
            exception_frames: Vec::new(),
            pending_exception: Value::Nil,
            has_exception: false,
            module_search_paths: vec![
                ".".into(),
                "lib/".into(),
                "libs/".into(),
                "box/".into(),
            ],
            module_cache: ahash::AHashMap::new(),
            builtins: ahash::AHashMap::new(),
            embedded_files: ahash::AHashMap::new(),
            saved_globals_stack: Vec::new(),
            current_file: "<stdin>".into(),
            sources: ahash::AHashMap::new(),
            command_line_args: Vec::new(),
            lock_core: None,
            host: Box::<DefaultHost>::default(),
        };
        if let Ok(home) = std::env::var("NEUTRON_HOME") {
            vm.module_search_paths.push(format!("{home}/lib/"));
        }
        vm.install_core_natives();
        vm
    }

    /// `say` existe aussi en fonction : `say(x)` et `say x;` se valent.
    fn install_core_natives(&mut self) {
        self.define_native_vm("say", 1, |vm, args| {
            let line = display_value(&vm.heap, args[0]);
            vm.host.print(&format!("{line}\n"));
            Ok(Value::Nil)
        });
    }

    /// Remplace l'hôte (capture de sortie, embarquement).
    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = host;
    }

    // ------------------------------------------------------------------
    // Surface d'embarquement
    // ------------------------------------------------------------------

    pub fn define(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// Déclare une fonction native `(args) → value`.
    pub fn define_native(
        &mut self,
        name: &str,
        arity: i32,
        f: impl Fn(&[Value]) -> Result<Value, RuntimeError> + 'static,
    ) {
        let h = self.allocate(HeapObj::Native(NativeObj {
            name: name.to_string(),
            arity,
            fun: NativeImpl::Simple(Rc::new(f)),
        }));
        self.globals.insert(name.to_string(), Value::Callable(h));
    }

    /// Déclare une fonction native `(vm, args) → value`.
    pub fn define_native_vm(
        &mut self,
        name: &str,
        arity: i32,
        f: impl Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError> + 'static,
    ) {
        let h = self.allocate(HeapObj::Native(NativeObj {
            name: name.to_string(),
            arity,
            fun: NativeImpl::WithVm(Rc::new(f)),
        }));
        self.globals.insert(name.to_string(), Value::Callable(h));
    }

    pub fn define_module(&mut self, name: &str, module: Handle) {
        self.globals.insert(name.to_string(), Value::Module(module));
        self.module_cache.insert(name.to_string(), true);
    }

    /// Enregistre un module intégré, dispatché par nom sans recherche FS.
    pub fn register_builtin(&mut self, name: &str, init: BuiltinInit) {
        self.builtins.insert(name.to_string(), init);
    }

    pub fn add_module_search_path(&mut self, path: impl Into<String>) {
        self.module_search_paths.push(path.into());
    }

    pub fn add_embedded_file(&mut self, path: impl Into<String>, content: impl Into<String>) {
        self.embedded_files.insert(path.into(), content.into());
    }

    /// Enregistre une source pour l'extrait du rapporteur d'erreurs.
    pub fn register_source(&mut self, file: &str, source: &str) {
        self.sources
            .insert(file.to_string(), source.lines().map(str::to_string).collect());
    }

    // ------------------------------------------------------------------
    // Allocation & racines temporaires
    // ------------------------------------------------------------------

    /// Alloue via l'arène ; déclenche la collecte au franchissement du
    /// seuil, l'objet frais protégé par la liste des racines temporaires.
    pub fn allocate(&mut self, obj: HeapObj) -> Handle {
        let handle = self.heap.alloc(obj);
        if self.heap.should_collect() {
            self.heap.temp_roots.push(handle);
            self.collect_garbage();
            if self.heap.temp_roots.last() == Some(&handle) {
                self.heap.temp_roots.pop();
            }
        }
        handle
    }

    #[inline]
    pub fn intern(&mut self, s: &str) -> Handle {
        // L'internement passe par l'arène sans seuil : la table est racine,
        // l'objet est protégé par construction.
        self.heap.intern(s)
    }

    pub fn make_string_value(&mut self, s: String) -> Value {
        let h = self.heap.make_string(s);
        if self.heap.should_collect() {
            self.heap.temp_roots.push(h);
            self.collect_garbage();
            self.heap.temp_roots.pop();
        }
        Value::Str(h)
    }

    // ------------------------------------------------------------------
    // Pile
    // ------------------------------------------------------------------

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(RuntimeError::stack("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("pile d'opérandes vide (invariant VM)")
    }

    #[inline]
    pub fn peek(&self, depth: usize) -> Value {
        self.stack[self.stack.len() - 1 - depth]
    }

    // ------------------------------------------------------------------
    // Entrée / sortie d'exécution
    // ------------------------------------------------------------------

    /// Exécute une fonction de tête jusqu'au retour. Prend le verrou VM
    /// si la machine est partagée.
    pub fn interpret(&mut self, proto: Rc<FunctionProto>) -> Result<Value, FatalError> {
        let _guard = self.lock_core.clone().map(|core| core.enter());
        let frame_base = self.frames.len();
        let stack_base = self.stack.len();
        let file = proto.file.clone();
        let fh = self.allocate(HeapObj::Function(FunctionObj { proto, closure: None }));
        let prior_file = std::mem::replace(&mut self.current_file, file);
        let result = (|| {
            self.push(Value::Callable(fh)).map_err(|e| self.fatal(e))?;
            self.call_function(fh, 0, false, false).map_err(|e| self.fatal(e))?;
            self.run(frame_base)?;
            Ok(if self.stack.len() > stack_base { self.pop() } else { Value::Nil })
        })();
        self.current_file = prior_file;
        if result.is_err() {
            // Une fatale laisse pile et frames en l'état : on ramène la
            // machine à l'entrée pour que REPL et workers restent sains.
            self.unwind_to(frame_base, stack_base);
        }
        result
    }

    /// Ramène frames, pile d'opérandes et frames d'exception à un point
    /// d'entrée connu (après une erreur fatale).
    fn unwind_to(&mut self, frame_base: usize, stack_base: usize) {
        self.frames.truncate(frame_base);
        self.stack.truncate(stack_base);
        self.exception_frames.retain(|h| h.frame_index < frame_base);
        self.has_exception = false;
        self.pending_exception = Value::Nil;
    }

    /// Scan + parse + compile + exécution dans les globales courantes.
    pub fn execute_string(&mut self, source: &str, file: &str) -> Result<Value, VmError> {
        let proto = neutron_compiler::compile_source(source, file)
            .map_err(|e| RuntimeError::new(ErrorKind::Syntax, e.to_string()))?;
        self.register_source(file, source);
        self.interpret(proto).map_err(VmError::Fatal)
    }

    /// Appel hôte → script : pousse callee + args, exécute jusqu'au
    /// retour, rend la valeur. Utilisé par la stdlib et l'ordonnanceur.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Value, VmError> {
        let base_stack = self.stack.len();
        let base_frames = self.frames.len();
        let result = (|| {
            self.push(callee).map_err(VmError::Runtime)?;
            for a in args {
                self.push(*a).map_err(VmError::Runtime)?;
            }
            self.call_value(callee, args.len() as u8)?;
            if self.frames.len() > base_frames {
                self.run(base_frames).map_err(VmError::Fatal)?;
            }
            Ok(if self.stack.len() > base_stack { self.pop() } else { Value::Nil })
        })();
        match result {
            Ok(v) => {
                self.stack.truncate(base_stack);
                Ok(v)
            }
            Err(e) => {
                self.unwind_to(base_frames, base_stack);
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // La boucle
    // ------------------------------------------------------------------

    /// Tourne jusqu'à ce que la pile de frames repasse à
    /// `min_frame_depth` (0 = exécution complète).
    pub fn run(&mut self, min_frame_depth: usize) -> Result<(), FatalError> {
        loop {
            match self.step(min_frame_depth) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done) => return Ok(()),
                Err(VmError::Runtime(e)) => self.raise(e)?,
                Err(VmError::Fatal(f)) => return Err(f),
            }
        }
    }

    /// Erreur d'exécution : couverte par un handler → devient une valeur
    /// lançable ; sinon fatale avec trace.
    fn raise(&mut self, error: RuntimeError) -> Result<(), FatalError> {
        if self.covering_handler_exists() {
            let message = error.to_string();
            let v = self.make_string_value(message);
            match self.throw_value(v) {
                Ok(()) => Ok(()),
                Err(_) => Err(self.fatal(error)),
            }
        } else {
            Err(self.fatal(error))
        }
    }

    fn covering_handler_exists(&self) -> bool {
        // Miroir permissif du routage de `throw_value` : zone de try
        // non consommée, ou corps d'un catch dont le finally doit encore
        // tourner. Sur-approximer est sans danger — `raise` retombe en
        // fatale si le déroulement ne trouve finalement personne.
        self.exception_frames.iter().rev().any(|h| {
            h.frame_index < self.frames.len() && {
                let ip = self.frames[h.frame_index].ip.saturating_sub(1);
                let in_try = ip >= h.try_start && ip <= h.try_end;
                let in_catch_with_finally = h.caught
                    && ip > h.try_end
                    && h.finally_start.is_some_and(|f| ip < f);
                (in_try && !h.caught) || in_catch_with_finally
            }
        })
    }

    /// Construit la fatale : position + une entrée de trace par frame.
    pub(crate) fn fatal(&self, error: RuntimeError) -> FatalError {
        let (file, line) = self
            .frames
            .last()
            .map(|f| (f.file.clone(), f.line))
            .unwrap_or_else(|| (self.current_file.clone(), 0));
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|f| TraceFrame {
                function: f.proto.name.clone(),
                file: if f.file.is_empty() { self.current_file.clone() } else { f.file.clone() },
                line: f.line,
            })
            .collect();
        FatalError { error, file, line, trace }
    }

    /// Déroulement d'une valeur lancée. `Err(v)` = aucun handler.
    ///
    /// La frame d'exception n'est **jamais** dépilée ici quand elle prend
    /// la main : `EndTry` possède l'unique pop. On ne dépile que les
    /// frames qui ne couvrent pas le throw (orphelines, hors zone, ou
    /// déjà consommées par leur catch).
    pub(crate) fn throw_value(&mut self, exception: Value) -> Result<(), Value> {
        loop {
            let Some(handler) = self.exception_frames.last().cloned() else {
                return Err(exception);
            };
            // Handler d'une frame déjà retournée : orphelin, on le jette.
            if handler.frame_index >= self.frames.len() {
                self.exception_frames.pop();
                continue;
            }
            // Propagation : dépile les frames d'appel au-dessus du handler.
            while self.frames.len() - 1 > handler.frame_index {
                self.frames.pop();
            }
            let ip = self.frames[handler.frame_index].ip.saturating_sub(1);
            let in_try = ip >= handler.try_start && ip <= handler.try_end;
            if !in_try {
                // Rethrow depuis le corps du catch (avant le finally) :
                // le finally doit quand même tourner, puis `EndTry`
                // relance l'exception vers l'extérieur.
                let in_catch_body = handler.caught
                    && ip > handler.try_end
                    && handler.finally_start.is_some_and(|f| ip < f);
                if let (true, Some(finally)) = (in_catch_body, handler.finally_start) {
                    self.pending_exception = exception;
                    self.has_exception = true;
                    self.stack.truncate(handler.frame_base);
                    self.frames[handler.frame_index].ip = finally;
                    return Ok(());
                }
                // Hors zone (corps du finally inclus) : au suivant.
                self.exception_frames.pop();
                continue;
            }
            match (handler.catch_start, handler.finally_start) {
                (Some(catch), _) if !handler.caught => {
                    // catch : déroule la pile d'opérandes, lie l'exception.
                    // La frame reste en place, marquée consommée ; une
                    // pendante plus ancienne est supplantée (slot unique).
                    self.stack.truncate(handler.frame_base);
                    let idx = self.exception_frames.len() - 1;
                    self.exception_frames[idx].caught = true;
                    self.frames[handler.frame_index].ip = catch;
                    self.stack.push(exception);
                    self.pending_exception = Value::Nil;
                    self.has_exception = false;
                    return Ok(());
                }
                (None, Some(finally)) => {
                    // finally seul : exception pendante, consommée à EndTry.
                    self.pending_exception = exception;
                    self.has_exception = true;
                    self.stack.truncate(handler.frame_base);
                    self.frames[handler.frame_index].ip = finally;
                    return Ok(());
                }
                _ => {
                    // Catch déjà consommé sans finally, ou frame sans
                    // handler (le parser l'interdit) : au suivant.
                    self.exception_frames.pop();
                }
            }
        }
    }

    /// Un pas : une instruction décodée et exécutée.
    fn step(&mut self, min_frame_depth: usize) -> Result<Flow, VmError> {
        let frame_idx = self.frames.len() - 1;
        let proto = self.frames[frame_idx].proto.clone();
        let chunk = &proto.chunk;
        let mut ip = self.frames[frame_idx].ip;

        self.frames[frame_idx].line = chunk.line_for(ip);

        let byte = chunk.code[ip];
        ip += 1;
        let op = OpCode::from_byte(byte).ok_or_else(|| {
            RuntimeError::runtime(format!("Unknown opcode 0x{byte:02x} (corrupt chunk)."))
        })?;
        trace!("ip={:04} {}", ip - 1, op.mnemonic());

        macro_rules! read_byte {
            () => {{
                let b = chunk.code[ip];
                ip += 1;
                b
            }};
        }
        macro_rules! read_u16 {
            () => {{
                let hi = chunk.code[ip] as u16;
                let lo = chunk.code[ip + 1] as u16;
                ip += 2;
                (hi << 8) | lo
            }};
        }
        macro_rules! read_constant {
            () => {{
                let idx = read_byte!();
                chunk.constant(idx).ok_or_else(|| {
                    RuntimeError::runtime(format!(
                        "Constant index {idx} out of bounds (max {}).",
                        chunk.constants.len()
                    ))
                })?
            }};
        }
        macro_rules! read_string {
            () => {{
                match read_constant!() {
                    neutron_core::Constant::Str(s) => s.as_str(),
                    other => {
                        return Err(VmError::Runtime(RuntimeError::runtime(format!(
                            "Expected string constant, found {other}."
                        ))))
                    }
                }
            }};
        }

        use OpCode::*;
        match op {
            Return => {
                let mut result = self.pop();
                let frame = self.frames.pop().expect("frame d'appel manquante");
                if frame.is_initializer {
                    // Un initialiseur rend toujours son receveur.
                    result = self.stack[frame.slot_offset];
                }
                // Les handlers de la frame morte sont orphelins.
                while self
                    .exception_frames
                    .last()
                    .is_some_and(|h| h.frame_index >= self.frames.len())
                {
                    self.exception_frames.pop();
                }
                if frame.is_bound_method {
                    self.stack.truncate(frame.slot_offset);
                } else if frame.slot_offset > 0 {
                    self.stack.truncate(frame.slot_offset - 1);
                } else {
                    self.stack.clear();
                }
                self.push(result)?;
                if self.frames.len() <= min_frame_depth {
                    return Ok(Flow::Done);
                }
                return Ok(Flow::Continue);
            }
            Constant => {
                let konst = read_constant!().clone();
                self.frames[frame_idx].ip = ip;
                let v = self.materialize_constant(&konst)?;
                self.push(v)?;
            }
            Closure => {
                let konst = read_constant!().clone();
                self.frames[frame_idx].ip = ip;
                match konst {
                    neutron_core::Constant::Function(p) => {
                        let closure = self.current_closure();
                        let h = self.allocate(HeapObj::Function(FunctionObj {
                            proto: p,
                            closure,
                        }));
                        self.push(Value::Callable(h))?;
                    }
                    other => {
                        let v = self.materialize_constant(&other)?;
                        self.push(v)?;
                    }
                }
            }
            Nil => {
                self.frames[frame_idx].ip = ip;
                self.push(Value::Nil)?;
            }
            True => {
                self.frames[frame_idx].ip = ip;
                self.push(Value::Bool(true))?;
            }
            False => {
                self.frames[frame_idx].ip = ip;
                self.push(Value::Bool(false))?;
            }
            Pop => {
                self.frames[frame_idx].ip = ip;
                self.pop();
            }
            Dup => {
                self.frames[frame_idx].ip = ip;
                let v = self.peek(0);
                self.push(v)?;
            }
            GetLocal => {
                let slot = read_byte!() as usize;
                self.frames[frame_idx].ip = ip;
                let v = self.stack[self.frames[frame_idx].slot_offset + slot];
                self.push(v)?;
            }
            SetLocal => {
                let slot = read_byte!() as usize;
                self.frames[frame_idx].ip = ip;
                let v = self.peek(0);
                let base = self.frames[frame_idx].slot_offset;
                self.stack[base + slot] = v;
            }
            SetLocalTyped => {
                let slot = read_byte!() as usize;
                let tag_byte = read_byte!();
                self.frames[frame_idx].ip = ip;
                let tag = TypeTag::from_byte(tag_byte)
                    .ok_or_else(|| RuntimeError::runtime("Corrupt type tag in chunk."))?;
                let v = self.peek(0);
                self.check_type(tag, v)?;
                let base = self.frames[frame_idx].slot_offset;
                self.stack[base + slot] = v;
            }
            GetGlobal => {
                let name = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                let v = self.lookup_global(&name)?;
                self.push(v)?;
            }
            DefineGlobal => {
                let name = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                let v = self.pop();
                self.globals.insert(name, v);
            }
            DefineTypedGlobal => {
                let name = read_string!().to_string();
                let tag_byte = read_byte!();
                self.frames[frame_idx].ip = ip;
                let tag = TypeTag::from_byte(tag_byte)
                    .ok_or_else(|| RuntimeError::runtime("Corrupt type tag in chunk."))?;
                let v = self.pop();
                self.check_type(tag, v)?;
                self.globals.insert(name.clone(), v);
                self.global_types.insert(name, tag);
            }
            SetGlobal => {
                let name = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                if !self.globals.contains_key(&name) {
                    return Err(VmError::Runtime(RuntimeError::reference(format!(
                        "Undefined variable '{name}'."
                    ))));
                }
                let v = self.peek(0);
                self.globals.insert(name, v);
            }
            SetGlobalTyped => {
                let name = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                if !self.globals.contains_key(&name) {
                    return Err(VmError::Runtime(RuntimeError::reference(format!(
                        "Undefined variable '{name}'."
                    ))));
                }
                let v = self.peek(0);
                if let Some(tag) = self.global_types.get(&name).copied() {
                    self.check_type(tag, v)?;
                }
                self.globals.insert(name, v);
            }
            GetProperty => {
                let name = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                self.get_property(&name)?;
            }
            SetProperty => {
                let name = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                self.set_property(&name)?;
            }
            IndexGet => {
                self.frames[frame_idx].ip = ip;
                self.index_get()?;
            }
            IndexSet => {
                self.frames[frame_idx].ip = ip;
                self.index_set()?;
            }
            Equal => {
                self.frames[frame_idx].ip = ip;
                let b = self.pop();
                let a = self.pop();
                let eq = values_equal(&self.heap, a, b);
                self.push(Value::Bool(eq))?;
            }
            NotEqual => {
                self.frames[frame_idx].ip = ip;
                let b = self.pop();
                let a = self.pop();
                let eq = values_equal(&self.heap, a, b);
                self.push(Value::Bool(!eq))?;
            }
            Greater => {
                self.frames[frame_idx].ip = ip;
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Bool(a > b))?;
            }
            Less => {
                self.frames[frame_idx].ip = ip;
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Bool(a < b))?;
            }
            Add => {
                self.frames[frame_idx].ip = ip;
                let b = self.pop();
                let a = self.pop();
                match (a, b) {
                    (Value::Number(x), Value::Number(y)) => {
                        self.push(Value::Number(x + y))?;
                    }
                    _ => {
                        // Concaténation sur les rendus toString ; résultat
                        // = chaîne de données, jamais internée.
                        let s = format!(
                            "{}{}",
                            display_value(&self.heap, a),
                            display_value(&self.heap, b)
                        );
                        let v = self.make_string_value(s);
                        self.push(v)?;
                    }
                }
            }
            Subtract => {
                self.frames[frame_idx].ip = ip;
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Number(a - b))?;
            }
            Multiply => {
                self.frames[frame_idx].ip = ip;
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                self.push(Value::Number(a * b))?;
            }
            Divide => {
                self.frames[frame_idx].ip = ip;
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                if b == 0.0 {
                    return Err(VmError::Runtime(RuntimeError::division("Division by zero.")));
                }
                self.push(Value::Number(a / b))?;
            }
            Modulo => {
                self.frames[frame_idx].ip = ip;
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                if b == 0.0 {
                    return Err(VmError::Runtime(RuntimeError::division("Modulo by zero.")));
                }
                self.push(Value::Number(a % b))?;
            }
            Not => {
                self.frames[frame_idx].ip = ip;
                let v = self.pop();
                self.push(Value::Bool(!v.is_truthy()))?;
            }
            Negate => {
                self.frames[frame_idx].ip = ip;
                match self.pop() {
                    Value::Number(n) => self.push(Value::Number(-n))?,
                    other => {
                        return Err(VmError::Runtime(RuntimeError::type_error(format!(
                            "Operand must be a number, got {}.",
                            other.type_name()
                        ))))
                    }
                }
            }
            BitAnd | BitOr | BitXor | ShiftLeft | ShiftRight => {
                self.frames[frame_idx].ip = ip;
                let (a, b) = self.pop_numbers("Operands must be numbers.")?;
                let (x, y) = (a as i64, b as i64);
                let r = match op {
                    BitAnd => x & y,
                    BitOr => x | y,
                    BitXor => x ^ y,
                    ShiftLeft => x.wrapping_shl(y as u32),
                    _ => x.wrapping_shr(y as u32),
                };
                self.push(Value::Number(r as f64))?;
            }
            BitNot => {
                self.frames[frame_idx].ip = ip;
                match self.pop() {
                    Value::Number(n) => self.push(Value::Number(!(n as i64) as f64))?,
                    other => {
                        return Err(VmError::Runtime(RuntimeError::type_error(format!(
                            "Operand must be a number, got {}.",
                            other.type_name()
                        ))))
                    }
                }
            }
            Say => {
                self.frames[frame_idx].ip = ip;
                let v = self.pop();
                let line = display_value(&self.heap, v);
                self.host.print(&format!("{line}\n"));
            }
            Jump => {
                let offset = read_u16!() as usize;
                self.frames[frame_idx].ip = ip + offset;
            }
            JumpIfFalse => {
                let offset = read_u16!() as usize;
                let cond = self.pop();
                self.frames[frame_idx].ip =
                    if cond.is_truthy() { ip } else { ip + offset };
            }
            Loop => {
                let offset = read_u16!() as usize;
                self.frames[frame_idx].ip = ip - offset;
            }
            Call => {
                let argc = read_byte!();
                self.frames[frame_idx].ip = ip;
                let callee = self.peek(argc as usize);
                self.call_value(callee, argc)?;
            }
            Array => {
                let count = read_byte!() as usize;
                self.frames[frame_idx].ip = ip;
                let at = self.stack.len() - count;
                let elements = self.stack.split_off(at);
                let h = self.allocate(HeapObj::Array(ArrayObj { elements }));
                self.push(Value::Array(h))?;
            }
            Object => {
                let count = read_byte!() as usize;
                self.frames[frame_idx].ip = ip;
                let mut properties = ahash::AHashMap::with_capacity(count);
                for _ in 0..count {
                    let value = self.pop();
                    let key = self.pop();
                    let Value::Str(kh) = key else {
                        return Err(VmError::Runtime(RuntimeError::type_error(
                            "Object keys must be strings.",
                        )));
                    };
                    properties.insert(self.heap.str_chars(kh).to_string(), value);
                }
                let h = self.allocate(HeapObj::Object(MapObj { properties }));
                self.push(Value::Object(h))?;
            }
            This => {
                self.frames[frame_idx].ip = ip;
                let base = self.frames[frame_idx].slot_offset;
                let v = self.stack[base];
                self.push(v)?;
            }
            Try => {
                let try_end = read_u16!() as usize;
                let catch_start = read_u16!();
                let finally_start = read_u16!();
                self.frames[frame_idx].ip = ip;
                let frame = &self.frames[frame_idx];
                self.exception_frames.push(ExceptionFrame {
                    try_start: ip - 7, // position de l'instruction Try
                    try_end,
                    catch_start: (catch_start != TRY_NONE).then_some(catch_start as usize),
                    finally_start: (finally_start != TRY_NONE).then_some(finally_start as usize),
                    frame_base: self.stack.len(),
                    frame_index: frame_idx,
                    caught: false,
                    file: frame.file.clone(),
                    line: frame.line,
                });
            }
            EndTry => {
                self.frames[frame_idx].ip = ip;
                // Unique point de dépilement d'une frame d'exception : les
                // `try` imbriqués dépilent ainsi chacun la leur.
                let popped = self.exception_frames.pop();
                if self.has_exception {
                    let pending = std::mem::replace(&mut self.pending_exception, Value::Nil);
                    self.has_exception = false;
                    if popped.is_some_and(|f| f.caught) {
                        // Rethrow depuis le catch : le finally vient de
                        // finir, l'exception repart vers l'extérieur.
                        if let Err(unhandled) = self.throw_value(pending) {
                            let rendered = display_value(&self.heap, unhandled);
                            return Err(VmError::Runtime(RuntimeError::runtime(format!(
                                "Uncaught exception: {rendered}"
                            ))));
                        }
                    }
                    // try/finally sans catch : le finally vient de
                    // s'exécuter et l'exception est consommée, pas
                    // relancée. Comportement documenté du langage.
                }
            }
            Throw => {
                self.frames[frame_idx].ip = ip;
                let exception = self.pop();
                if let Err(unhandled) = self.throw_value(exception) {
                    let rendered = display_value(&self.heap, unhandled);
                    return Err(VmError::Runtime(RuntimeError::runtime(format!(
                        "Uncaught exception: {rendered}"
                    ))));
                }
            }
            UseModule => {
                let name = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                self.load_module(&name)?;
            }
            UsingFile => {
                let path = read_string!().to_string();
                self.frames[frame_idx].ip = ip;
                self.load_file(&path)?;
            }
        }
        Ok(Flow::Continue)
    }

    // ------------------------------------------------------------------
    // Appels
    // ------------------------------------------------------------------

    /// Dispatch d'un appel selon la nature de la cible.
    pub fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), VmError> {
        // Cible extraite d'abord : les handlers mutent pile et frames.
        enum Target {
            Function(Handle),
            Native(Handle),
            Bound(Value, Handle),
            BoundArray(Handle, ArrayMethod),
            BoundString(String, StrMethod),
            Class(Handle),
            NotCallable,
        }
        let target = match callee {
            Value::Callable(h) => match self.heap.get(h) {
                HeapObj::Function(_) => Target::Function(h),
                HeapObj::Native(_) => Target::Native(h),
                HeapObj::Bound(b) => Target::Bound(b.receiver, b.method),
                HeapObj::BoundArray(b) => Target::BoundArray(b.array, b.method),
                HeapObj::BoundString(b) => Target::BoundString(b.string.clone(), b.method),
                _ => Target::NotCallable,
            },
            Value::Class(h) => Target::Class(h),
            _ => Target::NotCallable,
        };
        match target {
            Target::Function(h) => {
                self.call_function(h, argc, false, false).map_err(VmError::Runtime)
            }
            Target::Native(h) => self.call_native(h, argc),
            Target::Bound(receiver, method) => {
                let pos = self.stack.len() - argc as usize - 1;
                self.stack[pos] = receiver;
                self.call_function(method, argc, true, false).map_err(VmError::Runtime)
            }
            Target::BoundArray(array, method) => self.call_array_method(array, method, argc),
            Target::BoundString(s, method) => self.call_string_method(s, method, argc),
            Target::Class(h) => self.call_class(h, argc),
            Target::NotCallable => Err(VmError::Runtime(RuntimeError::type_error(
                "Can only call functions and classes.",
            ))),
        }
    }

    /// Empile une frame pour une fonction script.
    fn call_function(
        &mut self,
        function: Handle,
        argc: u8,
        is_bound: bool,
        is_initializer: bool,
    ) -> Result<(), RuntimeError> {
        let Some(f) = self.heap.function(function) else {
            return Err(RuntimeError::type_error("Callee is not a function."));
        };
        let proto = f.proto.clone();
        if proto.arity != argc {
            return Err(RuntimeError::argument(format!(
                "Expected {} arguments but got {} for '{}'.",
                proto.arity, argc, proto.name
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(RuntimeError::stack("Stack overflow."));
        }
        // Vérification des annotations de paramètres, si déclarées.
        let args_base = self.stack.len() - argc as usize;
        for (i, tag) in proto.param_types.iter().enumerate() {
            if let Some(tag) = tag {
                let v = self.stack[args_base + i];
                if !type_matches(*tag, v) {
                    return Err(RuntimeError::type_error(format!(
                        "Parameter {} of '{}' expects {}, got {}.",
                        i + 1,
                        proto.name,
                        tag.display_name(),
                        v.type_name()
                    )));
                }
            }
        }
        let slot_offset = if is_bound {
            self.stack.len() - argc as usize - 1
        } else {
            self.stack.len() - argc as usize
        };
        self.frames.push(CallFrame {
            function,
            proto,
            ip: 0,
            slot_offset,
            file: self.current_file.clone(),
            line: 0,
            is_bound_method: is_bound,
            is_initializer,
        });
        Ok(())
    }

    fn call_native(&mut self, native: Handle, argc: u8) -> Result<(), VmError> {
        let HeapObj::Native(n) = self.heap.get(native) else {
            unreachable!("call_native sur un non-natif");
        };
        let name = n.name.clone();
        let arity = n.arity;
        if arity != -1 && arity != argc as i32 {
            return Err(VmError::Runtime(RuntimeError::argument(format!(
                "Expected {arity} arguments but got {argc} for native function '{name}'."
            ))));
        }
        let args_base = self.stack.len() - argc as usize;
        let args: Vec<Value> = self.stack[args_base..].to_vec();
        // Re-lecture après clonage des args : l'impl est un Rc.
        let fun = match self.heap.get(native) {
            HeapObj::Native(n) => match &n.fun {
                NativeImpl::Simple(f) => NativeCall::Simple(f.clone()),
                NativeImpl::WithVm(f) => NativeCall::WithVm(f.clone()),
                NativeImpl::CAbi(f) => NativeCall::CAbi(*f),
            },
            _ => unreachable!(),
        };
        let result = match fun {
            NativeCall::Simple(f) => f(&args),
            NativeCall::WithVm(f) => f(self, &args),
            NativeCall::CAbi(f) => capi::invoke_c_native(self, f, &args),
        }
        .map_err(VmError::Runtime)?;
        self.stack.truncate(args_base - 1);
        self.push(result).map_err(VmError::Runtime)?;
        Ok(())
    }

    /// Appel d'une classe : instanciation + initialiseur éventuel.
    fn call_class(&mut self, class: Handle, argc: u8) -> Result<(), VmError> {
        let instance = self.allocate(HeapObj::Instance(InstanceObj::new(class)));
        let instance_val = Value::Instance(instance);
        let initializer = self.heap.class(class).initializer;
        match initializer {
            Some(Value::Callable(init)) => {
                let pos = self.stack.len() - argc as usize - 1;
                self.stack[pos] = instance_val;
                self.call_function(init, argc, true, true).map_err(VmError::Runtime)
            }
            _ => {
                if argc != 0 {
                    return Err(VmError::Runtime(RuntimeError::argument(format!(
                        "Expected 0 arguments but got {argc} for constructor."
                    ))));
                }
                self.stack.truncate(self.stack.len() - argc as usize - 1);
                self.push(instance_val).map_err(VmError::Runtime)?;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Opcodes décomposés
    // ------------------------------------------------------------------

    /// Matérialise une constante de chunk en valeur vivante.
    fn materialize_constant(&mut self, konst: &Constant) -> Result<Value, RuntimeError> {
        Ok(match konst {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Number(n) => Value::Number(*n),
            // Les littéraux et identifiants s'internent.
            Constant::Str(s) => Value::Str(self.intern(s)),
            Constant::Function(p) => {
                let closure = self.current_closure();
                let h = self.allocate(HeapObj::Function(FunctionObj {
                    proto: p.clone(),
                    closure,
                }));
                Value::Callable(h)
            }
            Constant::Class(proto) => {
                let env = self.current_closure();
                let roots_base = self.heap.temp_roots.len();
                let mut methods = ahash::AHashMap::with_capacity(proto.methods.len());
                let mut initializer = None;
                for (name, mproto) in &proto.methods {
                    let mh = self.allocate(HeapObj::Function(FunctionObj {
                        proto: mproto.clone(),
                        closure: env.clone(),
                    }));
                    // Protégé tant que la classe n'est pas construite.
                    self.heap.temp_roots.push(mh);
                    let mv = Value::Callable(mh);
                    if initializer.is_none() && (name == "init" || name == "initialize") {
                        initializer = Some(mv);
                    }
                    methods.insert(name.clone(), mv);
                }
                let h = self.allocate(HeapObj::Class(ClassObj {
                    name: proto.name.clone(),
                    methods,
                    initializer,
                    env,
                }));
                self.heap.temp_roots.truncate(roots_base);
                Value::Class(h)
            }
        })
    }

    /// Environnement de fermeture de la fonction en cours d'exécution.
    fn current_closure(&self) -> Option<EnvRef> {
        self.frames
            .last()
            .and_then(|f| self.heap.function(f.function))
            .and_then(|f| f.closure.clone())
    }

    /// Recherche d'une globale : map des globales, puis chaîne de
    /// fermeture (symboles de module), puis erreur avec suggestion.
    fn lookup_global(&mut self, name: &str) -> Result<Value, RuntimeError> {
        if let Some(v) = self.globals.get(name) {
            return Ok(*v);
        }
        if let Some(env) = self.current_closure() {
            if let Some(v) = env.borrow().get(name) {
                return Ok(v);
            }
        }
        if modules::is_known_module_name(name) {
            return Err(RuntimeError::reference(format!(
                "Undefined variable '{name}'. Did you forget to import it? \
                 Use 'use {name};' at the top of your file."
            )));
        }
        Err(RuntimeError::reference(format!("Undefined variable '{name}'.")))
    }

    fn get_property(&mut self, name: &str) -> Result<(), VmError> {
        let object = self.peek(0);
        let replacement: Value = match object {
            Value::Module(h) => {
                let HeapObj::Module(m) = self.heap.get(h) else { unreachable!() };
                match m.env.borrow().get(name) {
                    Some(v) => v,
                    None => {
                        let module = m.name.clone();
                        return Err(VmError::Runtime(RuntimeError::reference(format!(
                            "Module '{module}' has no member '{name}'. Make sure the \
                             module is properly imported with a 'use' statement."
                        ))));
                    }
                }
            }
            Value::Array(h) => {
                if name == "length" {
                    Value::Number(self.heap.array_elements(h).len() as f64)
                } else if let Some(method) = ArrayMethod::from_name(name) {
                    let bh = self.allocate(HeapObj::BoundArray(BoundArrayObj {
                        array: h,
                        method,
                    }));
                    Value::Callable(bh)
                } else {
                    return Err(VmError::Runtime(RuntimeError::reference(format!(
                        "Array does not have property '{name}'."
                    ))));
                }
            }
            Value::Str(h) => {
                let chars = self.heap.str_chars(h).to_string();
                if name == "length" {
                    Value::Number(chars.chars().count() as f64)
                } else if name == "chars" {
                    // Tableau des caractères, un par chaîne de données.
                    let roots_base = self.heap.temp_roots.len();
                    let mut elements = Vec::with_capacity(chars.chars().count());
                    for c in chars.chars() {
                        let sh = self.heap.make_string(c.to_string());
                        self.heap.temp_roots.push(sh);
                        elements.push(Value::Str(sh));
                    }
                    let ah = self.allocate(HeapObj::Array(ArrayObj { elements }));
                    self.heap.temp_roots.truncate(roots_base);
                    Value::Array(ah)
                } else if let Some(method) = StrMethod::from_name(name) {
                    let bh = self.allocate(HeapObj::BoundString(BoundStringObj {
                        string: chars,
                        method,
                    }));
                    Value::Callable(bh)
                } else {
                    return Err(VmError::Runtime(RuntimeError::reference(format!(
                        "String does not have property '{name}'."
                    ))));
                }
            }
            Value::Instance(h) => {
                let name_h = self.intern(name);
                if let Some(v) = self.heap.instance_get(h, name_h, name) {
                    v
                } else {
                    let HeapObj::Instance(inst) = self.heap.get(h) else { unreachable!() };
                    let class = inst.class;
                    // Emprunt du tas relâché avant l'allocation éventuelle.
                    let method = self.heap.class(class).methods.get(name).copied();
                    match method {
                        Some(Value::Callable(mh)) if self.heap.function(mh).is_some() => {
                            let bh = self.allocate(HeapObj::Bound(BoundMethodObj {
                                receiver: object,
                                method: mh,
                            }));
                            Value::Callable(bh)
                        }
                        Some(v) => v,
                        None => {
                            return Err(VmError::Runtime(RuntimeError::reference(format!(
                                "Property '{name}' not found on instance."
                            ))));
                        }
                    }
                }
            }
            Value::Object(h) => match self.heap.object_properties(h).get(name).copied() {
                Some(v) => v,
                None => {
                    return Err(VmError::Runtime(RuntimeError::reference(format!(
                        "Property '{name}' not found on object."
                    ))));
                }
            },
            other => {
                return Err(VmError::Runtime(RuntimeError::type_error(format!(
                    "Only modules, arrays, strings, instances and objects have \
                     properties; cannot use dot notation on {}.",
                    other.type_name()
                ))));
            }
        };
        self.pop();
        self.push(replacement).map_err(VmError::Runtime)?;
        Ok(())
    }

    fn set_property(&mut self, name: &str) -> Result<(), VmError> {
        let value = self.pop();
        let object = self.pop();
        match object {
            Value::Instance(h) => {
                let name_h = self.intern(name);
                self.heap.instance_set(h, name_h, name, value);
            }
            Value::Object(h) => {
                self.heap.object_mut(h).properties.insert(name.to_string(), value);
            }
            other => {
                return Err(VmError::Runtime(RuntimeError::type_error(format!(
                    "Only instances and objects support property assignment, not {}.",
                    other.type_name()
                ))));
            }
        }
        // L'affectation est une expression : elle vaut la valeur écrite.
        self.push(value).map_err(VmError::Runtime)?;
        Ok(())
    }

    fn index_get(&mut self) -> Result<(), VmError> {
        let index = self.pop();
        let object = self.pop();
        let result = match object {
            Value::Array(h) => {
                let idx = as_index(index, "Array")?;
                let elements = self.heap.array_elements(h);
                check_bounds(idx, elements.len(), "Array")?;
                elements[idx as usize]
            }
            Value::Str(h) => {
                let idx = as_index(index, "String")?;
                let chars: Vec<char> = self.heap.str_chars(h).chars().collect();
                check_bounds(idx, chars.len(), "String")?;
                self.make_string_value(chars[idx as usize].to_string())
            }
            Value::Buffer(h) => {
                let idx = as_index(index, "Buffer")?;
                let bytes = self.heap.buffer_bytes(h);
                check_bounds(idx, bytes.len(), "Buffer")?;
                Value::Number(bytes[idx as usize] as f64)
            }
            Value::Object(h) => {
                let Value::Str(kh) = index else {
                    return Err(VmError::Runtime(RuntimeError::type_error(
                        "Object key must be a string.",
                    )));
                };
                let key = self.heap.str_chars(kh);
                // Clé absente : nil, pas d'erreur.
                self.heap
                    .object_properties(h)
                    .get(key)
                    .copied()
                    .unwrap_or(Value::Nil)
            }
            other => {
                return Err(VmError::Runtime(RuntimeError::type_error(format!(
                    "Only arrays, strings, buffers and objects support index access, \
                     not {}.",
                    other.type_name()
                ))));
            }
        };
        self.push(result).map_err(VmError::Runtime)?;
        Ok(())
    }

    fn index_set(&mut self) -> Result<(), VmError> {
        let value = self.pop();
        let index = self.pop();
        let object = self.pop();
        match object {
            Value::Array(h) => {
                let idx = as_index(index, "Array")?;
                let len = self.heap.array_elements(h).len();
                check_bounds(idx, len, "Array")?;
                self.heap.array_mut(h).elements[idx as usize] = value;
            }
            Value::Buffer(h) => {
                let idx = as_index(index, "Buffer")?;
                let Value::Number(byte) = value else {
                    return Err(VmError::Runtime(RuntimeError::type_error(
                        "Buffer value must be a number (byte).",
                    )));
                };
                let len = self.heap.buffer_bytes(h).len();
                check_bounds(idx, len, "Buffer")?;
                if !(0.0..=255.0).contains(&byte) {
                    return Err(VmError::Runtime(RuntimeError::range(
                        "Buffer value must be a byte (0-255).",
                    )));
                }
                self.heap.buffer_mut(h).bytes[idx as usize] = byte as u8;
            }
            Value::Object(h) => {
                let Value::Str(kh) = index else {
                    return Err(VmError::Runtime(RuntimeError::type_error(
                        "Object key must be a string.",
                    )));
                };
                let key = self.heap.str_chars(kh).to_string();
                self.heap.object_mut(h).properties.insert(key, value);
            }
            other => {
                return Err(VmError::Runtime(RuntimeError::type_error(format!(
                    "Only arrays, buffers and objects support index assignment, not {}.",
                    other.type_name()
                ))));
            }
        }
        self.push(value).map_err(VmError::Runtime)?;
        Ok(())
    }

    // ---- helpers ----

    fn pop_numbers(&mut self, message: &str) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok((x, y)),
            _ => Err(RuntimeError::type_error(message)),
        }
    }

    /// Vérification d'une annotation à l'affectation.
    fn check_type(&self, tag: TypeTag, value: Value) -> Result<(), RuntimeError> {
        if type_matches(tag, value) {
            Ok(())
        } else {
            Err(RuntimeError::type_error(format!(
                "Type mismatch: Cannot assign value of type '{}' to variable of type '{}'.",
                value.type_name(),
                tag.display_name()
            )))
        }
    }

    /// Ligne source courante (rapports, natives).
    pub fn current_line(&self) -> u32 {
        self.frames.last().map(|f| f.line).unwrap_or(0)
    }

    /// Cœur du verrou réentrant, si la VM est partagée — les natives
    /// bloquantes le relâchent autour de leur attente.
    pub fn lock_core(&self) -> Option<Arc<lock::LockCore>> {
        self.lock_core.clone()
    }
}

/// `any` accepte tout, y compris nil ; `int`/`float` couvrent le nombre.
fn type_matches(tag: TypeTag, value: Value) -> bool {
    match tag {
        TypeTag::Any => true,
        TypeTag::Int | TypeTag::Float => matches!(value, Value::Number(_)),
        TypeTag::Str => matches!(value, Value::Str(_)),
        TypeTag::Bool => matches!(value, Value::Bool(_)),
        TypeTag::Array => matches!(value, Value::Array(_)),
        TypeTag::Object => matches!(value, Value::Object(_)),
    }
}

fn as_index(index: Value, what: &str) -> Result<i64, VmError> {
    match index {
        Value::Number(n) => Ok(n as i64),
        _ => Err(VmError::Runtime(RuntimeError::type_error(format!(
            "{what} index must be a number."
        )))),
    }
}

fn check_bounds(idx: i64, len: usize, what: &str) -> Result<(), VmError> {
    if idx < 0 || idx >= len as i64 {
        let range = if len == 0 {
            "[]".to_string()
        } else {
            format!("[0, {}]", len - 1)
        };
        return Err(VmError::Runtime(RuntimeError::range(format!(
            "{what} index out of bounds: index {idx} is not within {range}."
        ))));
    }
    Ok(())
}

/// Snapshot clonable d'une impl native (sortie du tas avant l'appel).
enum NativeCall {
    Simple(Rc<dyn Fn(&[Value]) -> Result<Value, RuntimeError>>),
    WithVm(Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value, RuntimeError>>),
    CAbi(capi::NeutronNativeFn),
}

/// Compile puis exécute une source dans une VM fraîche — commodité pour
/// les tests et l'embarquement simple.
pub fn run_source(source: &str, file: &str) -> Result<Vm, VmError> {
    let mut vm = Vm::new();
    vm.execute_string(source, file)?;
    debug!("run_source: {} objets vivants", vm.heap.live_count());
    Ok(vm)
}

/* ------------------------------- Tests ------------------------------- */
#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str) -> (Vm, Value) {
        let mut vm = Vm::new();
        let v = vm.execute_string(src, "<test>").expect("exécution ok");
        (vm, v)
    }

    fn eval_global(src: &str, name: &str) -> (Vm, Value) {
        let (vm, _) = eval(src);
        let v = *vm.globals.get(name).expect("globale absente");
        (vm, v)
    }

    #[test]
    fn arithmetic_and_globals() {
        let (_, v) = eval_global("var x = (1 + 2) * 3 - 4 / 2;", "x");
        assert_eq!(v, Value::Number(7.0));
    }

    #[test]
    fn string_concat_makes_data_strings() {
        let (vm, v) = eval_global("var s = \"a\" + 1;", "s");
        match v {
            Value::Str(h) => {
                assert_eq!(vm.heap.str_chars(h), "a1");
                // Résultat de concaténation : non interné.
                assert!(!vm.heap.interned.contains_key("a1"));
            }
            other => panic!("attendu une chaîne, trouvé {other:?}"),
        }
    }

    #[test]
    fn division_by_zero_is_fatal_without_handler() {
        let mut vm = Vm::new();
        let err = vm.execute_string("var x = 1 / 0;", "<t>").unwrap_err();
        match err {
            VmError::Fatal(f) => assert_eq!(f.error.kind, ErrorKind::Division),
            other => panic!("attendu une fatale, trouvé {other:?}"),
        }
    }

    #[test]
    fn undefined_variable_is_reference_error() {
        let mut vm = Vm::new();
        let err = vm.execute_string("say missing;", "<t>").unwrap_err();
        match err {
            VmError::Fatal(f) => assert_eq!(f.error.kind, ErrorKind::Reference),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn typed_global_rejects_bad_assignment() {
        let mut vm = Vm::new();
        let err = vm
            .execute_string("var x: int = 1; x = \"no\";", "<t>")
            .unwrap_err();
        match err {
            VmError::Fatal(f) => {
                assert_eq!(f.error.kind, ErrorKind::Type);
                assert!(f.error.message.contains("type 'string'"));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn any_accepts_everything() {
        eval("var x: any = 1; x = \"s\"; x = nil; x = [1];");
    }

    #[test]
    fn locals_and_blocks() {
        let (_, v) = eval_global("var r = 0; { var a = 10; { var b = 4; r = a + b; } }", "r");
        assert_eq!(v, Value::Number(14.0));
    }

    #[test]
    fn functions_and_recursion() {
        let (_, v) = eval_global(
            "var fact = fun(n) { if (n <= 1) { return 1; } return n * fact(n - 1); }; \
             var r = fact(10);",
            "r",
        );
        assert_eq!(v, Value::Number(3628800.0));
    }

    #[test]
    fn stack_depth_restored_after_calls() {
        // Discipline de pile : après un script terminé, seule la valeur
        // de tête a disparu (interpret l'a dépilée).
        let (vm, _) = eval("fun f(a, b) { return a + b; } var r = f(1, f(2, 3));");
        assert!(vm.stack.is_empty());
        assert!(vm.frames.is_empty());
    }

    #[test]
    fn classes_and_instances() {
        let (_, v) = eval_global(
            "class Counter { init() { this.n = 0; } \
             inc() { this.n = this.n + 1; return this.n; } } \
             var c = Counter(); c.inc(); c.inc(); var r = c.inc();",
            "r",
        );
        assert_eq!(v, Value::Number(3.0));
    }

    #[test]
    fn constructor_arity_checked() {
        let mut vm = Vm::new();
        let err = vm
            .execute_string("class A { init(x) { this.x = x; } } var a = A();", "<t>")
            .unwrap_err();
        match err {
            VmError::Fatal(f) => assert_eq!(f.error.kind, ErrorKind::Argument),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn array_literals_and_indexing() {
        let (_, v) = eval_global("var a = [1, 2, 3]; a[1] = 20; var r = a[0] + a[1] + a[2];", "r");
        assert_eq!(v, Value::Number(24.0));
    }

    #[test]
    fn array_out_of_bounds_is_range_error() {
        let mut vm = Vm::new();
        let err = vm.execute_string("var a = [1]; say a[3];", "<t>").unwrap_err();
        match err {
            VmError::Fatal(f) => {
                assert_eq!(f.error.kind, ErrorKind::Range);
                assert!(f.error.message.contains("not within [0, 0]"));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn object_literals_and_member_access() {
        let (_, v) = eval_global(
            "var o = {\"a\": 1, \"b\": 2}; o.c = o.a + o.b; var r = o[\"c\"];",
            "r",
        );
        assert_eq!(v, Value::Number(3.0));
        // Clé absente en index : nil.
        let (_, missing) = eval_global("var o = {}; var r = o[\"zz\"];", "r");
        assert_eq!(missing, Value::Nil);
    }

    #[test]
    fn while_and_for_loops() {
        let (_, v) = eval_global(
            "var s = 0; for (var i = 1; i <= 5; i = i + 1) { s = s + i; }",
            "s",
        );
        assert_eq!(v, Value::Number(15.0));
        let (_, v) = eval_global(
            "var n = 10; var steps = 0; while (n > 1) { n = n / 2; steps = steps + 1; }",
            "steps",
        );
        assert_eq!(v, Value::Number(4.0));
    }

    #[test]
    fn do_while_runs_at_least_once() {
        let (_, v) = eval_global("var n = 0; do { n = n + 1; } while (false);", "n");
        assert_eq!(v, Value::Number(1.0));
    }

    #[test]
    fn break_and_continue() {
        let (_, v) = eval_global(
            "var s = 0; for (var i = 0; i < 10; i = i + 1) { \
               if (i % 2 == 0) { continue; } if (i > 6) { break; } s = s + i; }",
            "s",
        );
        // 1 + 3 + 5 = 9
        assert_eq!(v, Value::Number(9.0));
    }

    #[test]
    fn ternary_and_logic_values() {
        let (vm, _) = eval("var r = 3 > 2 ? \"yes\" : \"no\";");
        assert_eq!(global_str(&vm, "r"), "yes");
        let (vm2, _) = eval("var k = nil or 5; var j = 2 and 7;");
        assert_eq!(vm2.globals["k"], Value::Number(5.0));
        assert_eq!(vm2.globals["j"], Value::Number(7.0));
    }

    fn global_str(vm: &Vm, name: &str) -> String {
        display_value(&vm.heap, vm.globals[name])
    }

    #[test]
    fn match_dispatches_by_equality() {
        let (vm, _) = eval(
            "var r = \"\"; match (2) { case 1 => r = \"one\"; case 2 => r = \"two\"; \
             default => r = \"other\"; }",
        );
        assert_eq!(global_str(&vm, "r"), "two");
    }

    #[test]
    fn throw_caught_by_catch() {
        let (vm, _) = eval(
            "var r = \"\"; try { throw \"bad\"; r = \"not reached\"; } \
             catch (e) { r = \"caught:\" + e; }",
        );
        assert_eq!(global_str(&vm, "r"), "caught:bad");
    }

    #[test]
    fn finally_runs_in_order() {
        let (vm, _) = eval(
            "var log = []; try { log.push(\"A\"); throw \"e\"; } \
             catch (x) { log.push(\"B\"); } finally { log.push(\"C\"); } log.push(\"D\");",
        );
        let Value::Array(h) = vm.globals["log"] else { panic!() };
        let rendered: Vec<String> = vm
            .heap
            .array_elements(h)
            .iter()
            .map(|v| display_value(&vm.heap, *v))
            .collect();
        assert_eq!(rendered, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn finally_without_catch_consumes_exception() {
        // Quirk documenté : try/finally sans catch consomme l'exception
        // après le finally, le programme continue.
        let (_, v) = eval_global(
            "var r = 0; try { throw \"x\"; } finally { r = 1; } r = r + 1;",
            "r",
        );
        assert_eq!(v, Value::Number(2.0));
    }

    #[test]
    fn runtime_error_inside_try_becomes_catchable() {
        let (vm, _) = eval("var r = \"\"; try { var x = 1 / 0; } catch (e) { r = e; }");
        assert!(global_str(&vm, "r").contains("Division by zero"));
    }

    #[test]
    fn uncaught_throw_is_fatal() {
        let mut vm = Vm::new();
        let err = vm.execute_string("throw \"boom\";", "<t>").unwrap_err();
        match err {
            VmError::Fatal(f) => {
                assert!(f.error.message.contains("Uncaught exception: boom"));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn exception_propagates_across_call_frames() {
        let (_, v) = eval_global(
            "fun boom() { throw \"deep\"; } \
             var r = \"\"; try { boom(); } catch (e) { r = e; }",
            "r",
        );
        match v {
            Value::Str(_) => {}
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn nested_try_rethrow_reaches_outer_catch() {
        // L'EndTry du try interne ne doit dépiler que SA frame : le
        // rethrow suivant appartient au catch externe.
        let (vm, _) = eval(
            "var r = \"\"; \
             try { \
                 try { throw \"a\"; } catch (e) { r = r + \"inner:\" + e; } \
                 throw \"b\"; \
             } catch (e2) { r = r + \" outer:\" + e2; }",
        );
        assert_eq!(global_str(&vm, "r"), "inner:a outer:b");
    }

    #[test]
    fn rethrow_from_catch_runs_finally_then_propagates() {
        // throw dans le catch d'un try qui a un finally : le finally
        // tourne d'abord, puis l'exception repart vers l'extérieur.
        let (vm, _) = eval(
            "var log = []; \
             try { \
                 try { throw \"a\"; } \
                 catch (e) { log.push(\"catch:\" + e); throw \"b\"; } \
                 finally { log.push(\"cleanup\"); } \
             } catch (e2) { log.push(\"outer:\" + e2); }",
        );
        let Value::Array(h) = vm.globals["log"] else { panic!() };
        let rendered: Vec<String> = vm
            .heap
            .array_elements(h)
            .iter()
            .map(|v| display_value(&vm.heap, *v))
            .collect();
        assert_eq!(rendered, vec!["catch:a", "cleanup", "outer:b"]);
    }

    #[test]
    fn rethrow_from_catch_is_fatal_only_after_finally() {
        // Sans handler externe, « b » finit non rattrapée — mais le
        // finally a tourné avant.
        let mut vm = Vm::new();
        let err = vm
            .execute_string(
                "var log = []; \
                 try { throw \"a\"; } \
                 catch (e) { log.push(\"catch\"); throw \"b\"; } \
                 finally { log.push(\"cleanup\"); }",
                "<t>",
            )
            .unwrap_err();
        match err {
            VmError::Fatal(f) => {
                assert!(f.error.message.contains("Uncaught exception: b"));
            }
            other => panic!("{other:?}"),
        }
        let Value::Array(h) = vm.globals["log"] else { panic!() };
        let rendered: Vec<String> = vm
            .heap
            .array_elements(h)
            .iter()
            .map(|v| display_value(&vm.heap, *v))
            .collect();
        assert_eq!(rendered, vec!["catch", "cleanup"]);
    }

    #[test]
    fn break_out_of_try_leaves_no_stale_frame() {
        // Un break qui sort d'un try dans une boucle referme la frame du
        // try : le catch externe reste correctement câblé ensuite.
        let (vm, _) = eval(
            "var r = \"\"; \
             try { \
                 var i = 0; \
                 while (i < 3) { \
                     i = i + 1; \
                     try { if (i == 2) { break; } } finally { r = r + \"f\"; } \
                 } \
                 throw \"x\"; \
             } catch (e) { r = r + \":\" + e; }",
        );
        // i=1 passe par le finally ; i=2 sort par break (frame refermée,
        // finally sauté) ; le throw suivant atteint bien le catch.
        assert_eq!(global_str(&vm, "r"), "f:x");
        assert!(vm.exception_frames.is_empty());
    }

    #[test]
    fn retry_reenters_try_block() {
        let (_, v) = eval_global(
            "var attempts = 0; \
             try { attempts = attempts + 1; if (attempts < 3) { throw \"again\"; } } \
             catch (e) { retry; }",
            "attempts",
        );
        assert_eq!(v, Value::Number(3.0));
    }

    #[test]
    fn lambdas_are_values() {
        let (_, v) = eval_global(
            "var twice = fun(f, x) { return f(f(x)); }; \
             var r = twice(fun(n) { return n + 1; }, 5);",
            "r",
        );
        assert_eq!(v, Value::Number(7.0));
    }

    #[test]
    fn say_native_matches_statement() {
        // `say` est aussi une fonction ordinaire.
        eval("say(1 + 1);");
    }

    #[test]
    fn frame_overflow_is_stack_error() {
        let mut vm = Vm::new();
        let err = vm
            .execute_string("fun f() { f(); } f();", "<t>")
            .unwrap_err();
        match err {
            VmError::Fatal(f) => assert_eq!(f.error.kind, ErrorKind::Stack),
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn host_call_api() {
        let mut vm = Vm::new();
        vm.execute_string("fun add(a, b) { return a + b; }", "<t>").unwrap();
        let f = vm.globals["add"];
        let r = vm.call(f, &[Value::Number(2.0), Value::Number(40.0)]).unwrap();
        assert_eq!(r, Value::Number(42.0));
    }

    #[test]
    fn bitwise_operators() {
        let (_, v) = eval_global("var r = (6 & 3) + (6 | 3) + (6 ^ 3) + (1 << 4) + (32 >> 2);", "r");
        // 2 + 7 + 5 + 16 + 8 = 38
        assert_eq!(v, Value::Number(38.0));
    }
}
