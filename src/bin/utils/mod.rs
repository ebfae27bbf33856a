use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::ValueEnum;
use log::{Level, Log, Metadata, Record};
use wari::{CompilationMode, EngineConfig, Module, ThreadingModel};

/// Writes log records to stderr. Installed once per process.
struct StderrLogger {
    level: Level,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("[{:5} {}] {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// `-v` enables info, `-vv` debug, `-vvv` trace. Without it only warnings are shown.
pub fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => Level::Warn,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    };
    let logger = Box::leak(Box::new(StderrLogger { level }));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(level.to_level_filter());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Threading {
    Token,
    Direct,
}

impl From<Threading> for ThreadingModel {
    fn from(t: Threading) -> Self {
        match t {
            Threading::Token => ThreadingModel::Token,
            Threading::Direct => ThreadingModel::Direct,
        }
    }
}

/// Engine configuration from an optional JSON file, with command-line overrides on top.
pub fn load_config(
    path: Option<&Path>,
    threading: Option<Threading>,
    eager: bool,
) -> Result<EngineConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("Failed to read config {}: {e}", path.display()))?;
            serde_json::from_str(&text).map_err(|e| format!("Invalid config {}: {e}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(threading) = threading {
        config.threading_model = threading.into();
    }
    if eager {
        config.compilation_mode = CompilationMode::Eager;
    }
    Ok(config)
}

pub fn read_module(path: &Path) -> Result<Arc<Module>, Box<dyn std::error::Error>> {
    let bytes = fs::read(path).map_err(|e| format!("Failed to read WASM file: {e}"))?;
    let module = Module::parse(bytes).map_err(|e| format!("Failed to decode module: {e}"))?;
    Ok(Arc::new(module))
}
