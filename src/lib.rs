//! Ingot - tensor handle and operator dispatch core
//!
//! Features:
//! - Reference-counted backend handles released exactly once
//! - Tensors backed by an eager handle or a graph variable
//! - Flag-merging operator dispatch with pluggable flag handlers
//! - Scoped, per-thread suppression of flag-driven behavior

pub mod config;
pub mod dispatch;
pub mod error;
pub mod graph;
pub mod interpreter;
pub mod ops;
pub mod tensor;

use std::sync::Once;

use crate::config::IngotConfig;
use crate::error::IngotResult;

pub use dispatch::{
    ApplyContext, ApplyResult, Dispatcher, FlagHandler, Route, ScopedCompiled, ScopedDisable,
    ScopedTracing,
};
pub use error::{IngotError, WithContext};
pub use graph::{ComputingGraph, GraphBuilder, VarRef};
pub use interpreter::{ChannelInterpreter, Interpreter};
pub use ops::{GenericOp, OpDef};
pub use tensor::{Backing, DType, Device, Flags, RawHandle, Shape, SharedHandle, Tensor, TensorLayout};

static LOGGING: Once = Once::new();

/// Initialize logging from the process-wide configuration
pub fn init() -> IngotResult<()> {
    init_with(&config::get_config())
}

/// Initialize logging from an explicit configuration; later calls are no-ops
pub fn init_with(config: &IngotConfig) -> IngotResult<()> {
    config.validate()?;
    let level = config.logging.max_level()?;
    let with_thread_names = config.logging.with_thread_names;

    LOGGING.call_once(|| {
        // another subscriber may already be installed by the host application
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_names(with_thread_names)
            .try_init();
        tracing::info!("Ingot dispatch core initialized");
    });
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
