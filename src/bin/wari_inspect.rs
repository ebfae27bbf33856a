use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use wari::module::{ElementMode, ExternKind};
use wari::{Engine, Imports, Instance, Module, Store};

mod utils;
use utils::{init_logger, load_config, read_module};

#[derive(Parser, Debug)]
#[command(name = "wari-inspect")]
#[command(about = "Inspect WebAssembly modules and their translated code")]
#[command(long_about = "
wari-inspect - show the structure of a WebAssembly module

Examples:
  # Imports, exports and section summary
  wari-inspect module.wasm

  # Also print the register instruction sequence of every defined function
  wari-inspect module.wasm --disasm

  # Only the function named in the exports
  wari-inspect module.wasm --disasm --func fib
")]
struct Args {
    /// Path to the WebAssembly module file
    wasm_file: PathBuf,

    /// Print the translated instruction sequence of each defined function
    #[arg(long)]
    disasm: bool,

    /// Restrict disassembly to one exported function
    #[arg(long)]
    func: Option<String>,

    /// Engine configuration as JSON (feature flags affect translation)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Increase log output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn print_structure(module: &Module) {
    if module.imports.is_empty() {
        println!("Imports: none");
    } else {
        println!("Imports:");
        for (import, kind) in &module.imports {
            println!("  {}.{} ({})", import.module, import.name, kind.name());
        }
    }
    println!();

    if module.exports.is_empty() {
        println!("Exports: none");
    } else {
        println!("Exports:");
        for export in &module.exports {
            match export.kind {
                ExternKind::Func => {
                    let ty = module.func_type(export.index).map(|t| t.to_string()).unwrap_or_default();
                    println!("  {} : function {} {}", export.name, export.index, ty);
                }
                kind => println!("  {} : {} {}", export.name, kind.name(), export.index),
            }
        }
    }
    println!();

    let imported = module.imported_function_count();
    println!("Types: {}", module.types.len());
    println!("Functions: {} ({} imported, {} defined)", module.functions.len(), imported, module.functions.len() - imported);
    for memory in &module.memories {
        let shared = if memory.ty.shared { " shared" } else { "" };
        println!("Memory: {} pages (min), {:?} (max){shared}", memory.ty.limits.min, memory.ty.limits.max);
    }
    for table in &module.tables {
        println!("Table: {:?}, {} elements (min), {:?} (max)", table.ty.element, table.ty.limits.min, table.ty.limits.max);
    }
    if !module.globals.is_empty() {
        println!("Globals: {}", module.globals.len());
    }
    if !module.elements.is_empty() {
        let passive = module.elements.iter().filter(|e| matches!(e.mode, ElementMode::Passive)).count();
        println!("Element segments: {} ({} passive)", module.elements.len(), passive);
    }
    if !module.data_segments.is_empty() {
        println!("Data segments: {}", module.data_segments.len());
    }
    if let Some(start) = module.start {
        println!("Start function: index {start}");
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let module = read_module(&args.wasm_file)?;
    println!("Module: {}", args.wasm_file.display());
    println!("Size: {} bytes", module.bytes().len());
    println!();
    print_structure(&module);

    if !args.disasm {
        return Ok(());
    }

    // Lazy mode so that instantiating does not translate functions we do not print.
    let config = load_config(args.config.as_deref(), None, false)?;
    let mut store = Store::new(&Engine::new(config));
    let instance = Instance::instantiate(&mut store, module.clone(), &Imports::new())
        .map_err(|e| format!("Disassembly needs an instantiable module without imports: {e}"))?;

    let wanted = match args.func.as_deref() {
        Some(name) => Some(module.export(name).filter(|e| e.kind == ExternKind::Func).ok_or_else(|| format!("No exported function '{name}'"))?.index),
        None => None,
    };
    for index in module.imported_function_count()..module.functions.len() {
        let index = index as u32;
        if wanted.is_some_and(|w| w != index) {
            continue;
        }
        let Some(func) = instance.function(&store, index) else { continue };
        let name = func.name(&store).unwrap_or_else(|| format!("func[{index}]"));
        println!();
        println!("{name} {}", func.ty(&store));
        match func.instruction_sequence(&mut store)? {
            Some(iseq) => {
                println!("  max stack height {}, {} constants", iseq.max_stack_height(), iseq.constants().len());
                print!("{}", iseq.disassemble());
            }
            None => println!("  <host>"),
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
