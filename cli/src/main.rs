//! main.rs — Point d'entrée du binaire `neutron`.
//!
//! Verbes couverts par le cœur :
//!   neutron script.nt [args...]       exécute un fichier
//!   neutron                           REPL (globales persistantes)
//!   neutron --resume état.ntck s.nt   restaure une image puis exécute
//!   neutron --disasm script.nt        liste le bytecode sans exécuter
//!   neutron --version
//!
//! Le scaffolding de projet, le builder d'exécutables autonomes et le
//! gestionnaire de paquets vivent dans leurs propres outils ; le binaire
//! n'expose que ce que le cœur sait faire.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use neutron_stdlib::install;
use neutron_vm::lock::SharedVm;
use neutron_vm::process;
use neutron_vm::report::Reporter;
use neutron_vm::{checkpoint, Vm};

#[derive(Debug, Parser)]
#[command(name = "neutron", version = neutron_core::VERSION, about = "Le langage Neutron")]
struct Cli {
    /// Script à exécuter (REPL si absent).
    file: Option<PathBuf>,

    /// Arguments passés au script (visibles via sys.args()).
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Restaure une image checkpoint avant d'exécuter.
    #[arg(long, value_name = "CHECKPOINT")]
    resume: Option<PathBuf>,

    /// Affiche le bytecode désassemblé au lieu d'exécuter.
    #[arg(long)]
    disasm: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let reporter = Reporter::auto();

    // VM partagée : les workers de l'ordonnanceur de processus peuvent la
    // ré-entrer sous le verrou réentrant.
    let mut vm = Vm::new();
    install(&mut vm);
    vm.command_line_args = cli.args.clone();
    let shared = SharedVm::new(vm);
    process::scheduler().attach_vm(shared.clone(), 0);

    if let Some(image) = &cli.resume {
        let mut vm = shared.lock();
        checkpoint::resume(&mut vm, image)
            .with_context(|| format!("cannot resume from {}", image.display()))?;
        debug!("image restaurée depuis {}", image.display());
    }

    match &cli.file {
        Some(file) => run_file(&shared, &reporter, file, cli.disasm),
        None => repl(&shared, &reporter),
    }
}

fn run_file(
    shared: &Arc<SharedVm>,
    reporter: &Reporter,
    file: &PathBuf,
    disasm: bool,
) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let name = file.to_string_lossy();

    let proto = match neutron_compiler::compile_source(&source, &name) {
        Ok(p) => p,
        Err(e) => {
            reporter.report_compile_error(&e, Some(&source));
            std::process::exit(65);
        }
    };

    if disasm {
        print!("{}", neutron_core::disasm::disassemble(&proto.chunk, &name));
        return Ok(());
    }

    let mut vm = shared.lock();
    vm.register_source(&name, &source);
    if let Err(fatal) = vm.interpret(proto) {
        reporter.report_fatal(&vm, &fatal);
        drop(vm);
        std::process::exit(70);
    }
    Ok(())
}

/// REPL ligne à ligne ; les globales persistent d'une entrée à l'autre
/// et la valeur d'une instruction-expression est affichée.
fn repl(shared: &Arc<SharedVm>, reporter: &Reporter) -> Result<()> {
    println!("Neutron {} — REPL (Ctrl-D pour quitter)", neutron_core::VERSION);
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        print!("nt> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            println!();
            return Ok(());
        };
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == "quit" {
            return Ok(());
        }
        match neutron_compiler::compile_source_with(&line, "<repl>", true) {
            Ok(proto) => {
                let mut vm = shared.lock();
                vm.register_source("<repl>", &line);
                if let Err(fatal) = vm.interpret(proto) {
                    reporter.report_fatal(&vm, &fatal);
                }
            }
            Err(e) => reporter.report_compile_error(&e, Some(&line)),
        }
    }
}
