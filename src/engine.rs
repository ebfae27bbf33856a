use std::sync::Arc;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::Trap;
use crate::func::Func;
use crate::parking_lot::AtomicParkingLot;

/// Instruction dispatch strategy. Both produce identical observable behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadingModel {
    /// Every handler hands back its successor; a trampoline keeps calling.
    Direct,
    /// A central loop decodes each opcode and matches on it.
    #[default]
    Token,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompilationMode {
    /// Translate every guest function during instantiation.
    Eager,
    /// Translate a guest function on its first invocation.
    #[default]
    Lazy,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct WasmFeatures: u32 {
        const SIGN_EXTENSION = 1 << 0;
        const SATURATING_FLOAT_TO_INT = 1 << 1;
        const BULK_MEMORY = 1 << 2;
        const REFERENCE_TYPES = 1 << 3;
        const MULTI_VALUE = 1 << 4;
        const TAIL_CALL = 1 << 5;
        const THREADS = 1 << 6;
        const EXTENDED_CONST = 1 << 7;
    }
}

impl Default for WasmFeatures {
    fn default() -> Self { WasmFeatures::all() }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub threading_model: ThreadingModel,
    pub compilation_mode: CompilationMode,
    /// Interpreter stack size in bytes.
    pub stack_size: usize,
    pub features: WasmFeatures,
}

impl EngineConfig {
    pub const DEFAULT_STACK_SIZE: usize = 512 * 1024;

    pub fn threading_model(mut self, model: ThreadingModel) -> Self {
        self.threading_model = model;
        self
    }

    pub fn compilation_mode(mut self, mode: CompilationMode) -> Self {
        self.compilation_mode = mode;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn features(mut self, features: WasmFeatures) -> Self {
        self.features = features;
        self
    }

    /// Stack capacity in 64-bit slots.
    pub(crate) fn stack_slots(&self) -> usize {
        self.stack_size / std::mem::size_of::<u64>()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threading_model: ThreadingModel::default(),
            compilation_mode: CompilationMode::default(),
            stack_size: Self::DEFAULT_STACK_SIZE,
            features: WasmFeatures::default(),
        }
    }
}

/// Observes guest calls. Cannot alter control flow.
pub trait EngineInterceptor: Send + Sync {
    fn on_enter_function(&self, func: Func);
    fn on_exit_function(&self, func: Func);
}

/// Fans notifications out to several interceptors in order.
pub struct MultiplexingInterceptor {
    interceptors: Vec<Arc<dyn EngineInterceptor>>,
}

impl MultiplexingInterceptor {
    pub fn new(interceptors: Vec<Arc<dyn EngineInterceptor>>) -> Self {
        Self { interceptors }
    }
}

impl EngineInterceptor for MultiplexingInterceptor {
    fn on_enter_function(&self, func: Func) {
        self.interceptors.iter().for_each(|i| i.on_enter_function(func));
    }

    fn on_exit_function(&self, func: Func) {
        self.interceptors.iter().for_each(|i| i.on_exit_function(func));
    }
}

/// Consulted before a memory or table grows, and when one is first allocated.
pub trait ResourceLimiter: Send {
    /// `desired` is the new memory size in bytes. Return `Ok(false)` to deny.
    fn limit_memory_growth(&mut self, desired: usize) -> Result<bool, Trap> {
        let _ = desired;
        Ok(true)
    }

    /// `desired` is the new table length in elements. Return `Ok(false)` to deny.
    fn limit_table_growth(&mut self, desired: usize) -> Result<bool, Trap> {
        let _ = desired;
        Ok(true)
    }
}

struct EngineInner {
    config: EngineConfig,
    interceptor: Option<Arc<dyn EngineInterceptor>>,
    parking_lot: AtomicParkingLot,
}

/// Shared configuration for stores. Cloning is cheap.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_interceptor(config, None)
    }

    pub fn with_interceptor(config: EngineConfig, interceptor: Option<Arc<dyn EngineInterceptor>>) -> Self {
        log::debug!(
            "engine: {:?} threading, {:?} compilation, {} byte stack",
            config.threading_model,
            config.compilation_mode,
            config.stack_size
        );
        Self { inner: Arc::new(EngineInner { config, interceptor, parking_lot: AtomicParkingLot::new() }) }
    }

    pub fn config(&self) -> &EngineConfig { &self.inner.config }

    pub(crate) fn interceptor(&self) -> Option<&Arc<dyn EngineInterceptor>> { self.inner.interceptor.as_ref() }

    pub fn parking_lot(&self) -> &AtomicParkingLot { &self.inner.parking_lot }
}

impl Default for Engine {
    fn default() -> Self { Self::new(EngineConfig::default()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.threading_model, ThreadingModel::Token);
        assert_eq!(config.compilation_mode, CompilationMode::Lazy);
        assert_eq!(config.stack_size, 512 * 1024);
        assert_eq!(config.features, WasmFeatures::all());
    }

    #[test]
    fn config_from_json() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "threading_model": "direct", "stack_size": 65536 }"#).unwrap();
        assert_eq!(config.threading_model, ThreadingModel::Direct);
        assert_eq!(config.compilation_mode, CompilationMode::Lazy);
        assert_eq!(config.stack_slots(), 8192);
    }
}
