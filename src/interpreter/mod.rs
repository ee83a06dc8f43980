//! Execution backend collaborator
//!
//! The interpreter owns every backend resource. The dispatch core only ever
//! sees [`RawHandle`]s issued by it and hands them back for queries, kernel
//! execution and release.

pub mod channel;

pub use channel::{ChannelInterpreter, InterpreterStats};

use std::sync::Arc;

use crate::{
    error::IngotResult,
    ops::OpDef,
    tensor::{handle::RawHandle, DType, Device, Shape, TensorLayout},
};

pub trait Interpreter: Send + Sync {
    /// Short backend label used in error reports
    fn name(&self) -> &str;

    /// Allocate a resource for `layout` and return its handle
    fn put(&self, layout: TensorLayout) -> IngotResult<RawHandle>;

    /// Tell the backend `handle` may be reclaimed. Called at most once per
    /// handle; must not panic, and is a no-op once the backend has shut down.
    fn release(&self, handle: RawHandle);

    fn dtype(&self, handle: RawHandle) -> IngotResult<DType>;

    fn device(&self, handle: RawHandle) -> IngotResult<Device>;

    fn shape(&self, handle: RawHandle) -> IngotResult<Shape>;

    /// Execute `op` and return fresh handles in the operator's output order.
    /// Blocks until the results exist or the backend reports failure.
    fn apply_op(&self, op: &Arc<dyn OpDef>, inputs: &[RawHandle]) -> IngotResult<Vec<RawHandle>>;

    fn swap_in(&self, handle: RawHandle) -> IngotResult<()>;

    fn swap_out(&self, handle: RawHandle) -> IngotResult<()>;

    /// Evict the value; the backend regenerates it on next use
    fn drop_value(&self, handle: RawHandle) -> IngotResult<()>;

    /// Wait for every request issued so far to finish
    fn sync(&self) -> IngotResult<()>;

    fn layout(&self, handle: RawHandle) -> IngotResult<TensorLayout> {
        Ok(TensorLayout::new(self.shape(handle)?, self.dtype(handle)?, self.device(handle)?))
    }
}
