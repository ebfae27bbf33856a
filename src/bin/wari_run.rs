use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use wari::{Engine, Error, Extern, Func, FuncType, Imports, Instance, Store, ValType, Value};

mod utils;
use utils::{init_logger, load_config, read_module, Threading};

#[derive(Parser, Debug)]
#[command(name = "wari-run")]
#[command(about = "Execute WebAssembly modules with the wari register interpreter")]
#[command(long_about = "
wari-run - run an exported function of a WebAssembly module

Examples:
  # Run the _start function (if exported)
  wari-run module.wasm

  # Invoke a function with arguments (i32, i64, f32, f64)
  wari-run module.wasm add 10:i32 20:i32

  # Use direct threading and compile everything up front
  wari-run module.wasm fib 30:i32 --threading direct --eager

  # Load an engine configuration and log translation details
  wari-run module.wasm main --config engine.json -vv
")]
struct Args {
    /// Path to the WebAssembly module file
    wasm_file: PathBuf,

    /// Function to invoke (defaults to _start)
    func: Option<String>,

    /// Arguments as value:type, e.g. 42:i32 or 3.5:f64
    #[arg(allow_hyphen_values = true)]
    args: Vec<String>,

    /// Instruction dispatch strategy
    #[arg(long, value_enum)]
    threading: Option<Threading>,

    /// Translate every function during instantiation
    #[arg(long)]
    eager: bool,

    /// Engine configuration as JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// List exported functions instead of running
    #[arg(short, long)]
    list_exports: bool,

    /// Increase log output (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_value(arg: &str) -> Result<Value, String> {
    let Some((value, ty)) = arg.rsplit_once(':') else {
        return Err(format!("Invalid argument format '{arg}'. Expected value:type (e.g. 42:i32)"));
    };
    let bad = || format!("Failed to parse '{value}' as {ty}");
    match ty {
        "i32" => value.parse::<i32>().map(Value::I32).map_err(|_| bad()),
        "i64" => value.parse::<i64>().map(Value::I64).map_err(|_| bad()),
        "f32" => value.parse::<f32>().map(Value::F32).map_err(|_| bad()),
        "f64" => value.parse::<f64>().map(Value::F64).map_err(|_| bad()),
        _ => Err(format!("Unknown type '{ty}'. Supported types: i32, i64, f32, f64")),
    }
}

fn format_value(value: &Value) -> String {
    match value {
        Value::I32(v) => format!("{v}:i32"),
        Value::I64(v) => format!("{v}:i64"),
        Value::F32(v) => format!("{v}:f32"),
        Value::F64(v) => format!("{v}:f64"),
        Value::V128(v) => format!("{v:#034x}:v128"),
        Value::FuncRef(None) | Value::ExternRef(None) => "null".to_string(),
        Value::FuncRef(Some(f)) => format!("{f:?}"),
        Value::ExternRef(Some(r)) => format!("extern {r}"),
    }
}

/// The `spectest` printing functions many test modules import.
fn spectest_imports(store: &mut Store) -> Result<Imports, Error> {
    use ValType::*;
    let mut imports = Imports::new();
    let printers: [(&str, Vec<ValType>); 7] = [
        ("print", vec![]),
        ("print_i32", vec![I32]),
        ("print_i64", vec![I64]),
        ("print_f32", vec![F32]),
        ("print_f64", vec![F64]),
        ("print_i32_f32", vec![I32, F32]),
        ("print_f64_f64", vec![F64, F64]),
    ];
    for (name, params) in printers {
        let func = Func::wrap(store, FuncType::new(params, []), |_, args| {
            let line: Vec<String> = args.iter().map(format_value).collect();
            println!("{}", line.join(" "));
            Ok(Vec::new())
        });
        imports.define("spectest", name, func)?;
    }
    Ok(imports)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.config.as_deref(), args.threading, args.eager)?;
    let module = read_module(&args.wasm_file)?;
    let engine = Engine::new(config);
    let mut store = Store::new(&engine);
    let imports = spectest_imports(&mut store)?;
    let instance = Instance::instantiate(&mut store, module.clone(), &imports)
        .map_err(|e| format!("Failed to instantiate module: {e}"))?;

    if args.list_exports {
        println!("Exported functions:");
        for export in &module.exports {
            if let Some(Extern::Func(func)) = instance.export(&store, &export.name) {
                println!("  {} {}", export.name, func.ty(&store));
            }
        }
        return Ok(());
    }

    let name = args.func.as_deref().unwrap_or("_start");
    let func = instance
        .export_func(&store, name)
        .ok_or_else(|| format!("Function '{name}' not found in exports"))?;
    let values = args.args.iter().map(|a| parse_value(a)).collect::<Result<Vec<_>, _>>()?;
    let ty = func.ty(&store);
    if values.len() != ty.params.len() {
        return Err(format!("Function '{name}' expects {} arguments, but {} provided", ty.params.len(), values.len()).into());
    }

    match func.call(&mut store, &values) {
        Ok(results) => {
            for result in &results {
                println!("{}", format_value(result));
            }
            Ok(())
        }
        Err(Error::Trap(trap)) => {
            let mut message = format!("trap: {trap}");
            if let Some(backtrace) = trap.backtrace() {
                message.push_str("\nbacktrace:\n");
                message.push_str(&backtrace.to_string());
            }
            Err(message.into())
        }
        Err(e) => Err(format!("Execution failed: {e}").into()),
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logger(args.verbose);
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e.to_string().trim_end());
            ExitCode::FAILURE
        }
    }
}
