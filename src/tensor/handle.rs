//! Shared ownership of backend handles
//!
//! A [`SharedHandle`] keeps the issuing interpreter alive for as long as any
//! owner exists, so the backend is never torn down underneath a live handle.
//! The release callback runs from `Drop` of the last owner and is issued
//! exactly once for a non-null handle.

use std::fmt;
use std::sync::Arc;

use crate::interpreter::Interpreter;

/// Backend-issued identifier; zero is the null handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawHandle(pub u64);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct HandleOwner {
    raw: RawHandle,
    interpreter: Arc<dyn Interpreter>,
}

impl Drop for HandleOwner {
    fn drop(&mut self) {
        if !self.raw.is_null() {
            tracing::trace!("releasing handle {} on {}", self.raw, self.interpreter.name());
            self.interpreter.release(self.raw);
        }
    }
}

#[derive(Clone, Default)]
pub struct SharedHandle {
    owner: Option<Arc<HandleOwner>>,
}

impl SharedHandle {
    /// Take ownership of a handle issued by `interpreter`
    pub fn acquire(raw: RawHandle, interpreter: Arc<dyn Interpreter>) -> Self {
        Self {
            owner: Some(Arc::new(HandleOwner { raw, interpreter })),
        }
    }

    pub fn null() -> Self {
        Self { owner: None }
    }

    /// Raw id, valid only while some owner is alive
    pub fn get(&self) -> RawHandle {
        self.owner.as_ref().map_or(RawHandle::NULL, |owner| owner.raw)
    }

    pub fn is_null(&self) -> bool {
        self.get().is_null()
    }

    pub fn interpreter(&self) -> Option<&Arc<dyn Interpreter>> {
        self.owner.as_ref().map(|owner| &owner.interpreter)
    }

    /// Number of live owners
    pub fn use_count(&self) -> usize {
        self.owner.as_ref().map_or(0, Arc::strong_count)
    }

    /// Whether both values own the same resource
    pub fn ptr_eq(&self, other: &SharedHandle) -> bool {
        match (&self.owner, &other.owner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for SharedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedHandle")
            .field("raw", &self.get())
            .field("use_count", &self.use_count())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        error::{IngotError, IngotResult},
        ops::OpDef,
        tensor::{DType, Device, Shape, TensorLayout},
    };

    /// Interpreter double that only records what it was asked to do
    #[derive(Default)]
    pub struct RecordingInterpreter {
        pub released: Mutex<Vec<RawHandle>>,
        pub layout: Option<TensorLayout>,
    }

    impl RecordingInterpreter {
        pub fn with_layout(layout: TensorLayout) -> Self {
            Self {
                released: Mutex::new(Vec::new()),
                layout: Some(layout),
            }
        }

        pub fn released(&self) -> Vec<RawHandle> {
            self.released.lock().clone()
        }

        fn resolved(&self) -> IngotResult<&TensorLayout> {
            self.layout
                .as_ref()
                .ok_or_else(|| IngotError::backend("recording", "no layout"))
        }
    }

    impl Interpreter for RecordingInterpreter {
        fn name(&self) -> &str {
            "recording"
        }

        fn put(&self, _layout: TensorLayout) -> IngotResult<RawHandle> {
            Err(IngotError::backend("recording", "put is not supported"))
        }

        fn release(&self, handle: RawHandle) {
            self.released.lock().push(handle);
        }

        fn dtype(&self, _handle: RawHandle) -> IngotResult<DType> {
            Ok(self.resolved()?.dtype)
        }

        fn device(&self, _handle: RawHandle) -> IngotResult<Device> {
            Ok(self.resolved()?.device)
        }

        fn shape(&self, _handle: RawHandle) -> IngotResult<Shape> {
            Ok(self.resolved()?.shape.clone())
        }

        fn apply_op(&self, op: &Arc<dyn OpDef>, _inputs: &[RawHandle]) -> IngotResult<Vec<RawHandle>> {
            Err(IngotError::backend("recording", format!("cannot run {}", op.name())))
        }

        fn swap_in(&self, _handle: RawHandle) -> IngotResult<()> {
            Ok(())
        }

        fn swap_out(&self, _handle: RawHandle) -> IngotResult<()> {
            Ok(())
        }

        fn drop_value(&self, _handle: RawHandle) -> IngotResult<()> {
            Ok(())
        }

        fn sync(&self) -> IngotResult<()> {
            Ok(())
        }
    }
}
