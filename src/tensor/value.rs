//! The tensor value: flags, metadata slots and one backing representation

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::{
    error::{IngotError, IngotResult},
    graph::VarRef,
    interpreter::Interpreter,
};
use super::core::{DType, Shape, TensorLayout};
use super::devices::Device;
use super::flags::Flags;
use super::handle::{RawHandle, SharedHandle};

/// What a tensor's scalar properties resolve from
#[derive(Clone, Default)]
pub enum Backing {
    /// Placeholder; every query fails
    #[default]
    Unresolved,
    /// Live value owned by an interpreter
    Handle(SharedHandle),
    /// Node of a graph under construction
    Var(VarRef),
}

impl Backing {
    pub fn kind(&self) -> &'static str {
        match self {
            Backing::Unresolved => "unresolved",
            Backing::Handle(_) => "handle",
            Backing::Var(_) => "var",
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Unresolved => f.write_str("Unresolved"),
            Backing::Handle(handle) => write!(f, "Handle({})", handle.get()),
            Backing::Var(var) => write!(f, "Var({})", var.id()),
        }
    }
}

/// Opaque metadata owned by a collaborator (autograd, tracing). Copies share
/// the payload.
#[derive(Clone, Default)]
pub struct MetaSlot(Option<Arc<dyn Any + Send + Sync>>);

impl MetaSlot {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.as_ref()?.downcast_ref::<T>()
    }

    pub fn clear(&mut self) {
        self.0 = None;
    }
}

impl fmt::Debug for MetaSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_empty() { "MetaSlot(empty)" } else { "MetaSlot(..)" })
    }
}

#[derive(Debug, Default)]
pub struct Tensor {
    flags: Flags,
    backing: Backing,
    pub grad_info: MetaSlot,
    pub trace_info: MetaSlot,
}

impl Tensor {
    pub fn from_handle(handle: SharedHandle) -> Self {
        Self {
            backing: Backing::Handle(handle),
            ..Self::default()
        }
    }

    /// Take ownership of a raw handle issued by `interpreter`
    pub fn from_raw(raw: RawHandle, interpreter: Arc<dyn Interpreter>) -> Self {
        Self::from_handle(SharedHandle::acquire(raw, interpreter))
    }

    pub fn from_var(var: VarRef) -> Self {
        Self {
            backing: Backing::Var(var),
            ..Self::default()
        }
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    pub fn handle(&self) -> Option<&SharedHandle> {
        match &self.backing {
            Backing::Handle(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn var(&self) -> Option<&VarRef> {
        match &self.backing {
            Backing::Var(var) => Some(var),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(self.backing, Backing::Unresolved)
    }

    pub fn set_handle(&mut self, handle: SharedHandle) {
        self.backing = Backing::Handle(handle);
    }

    pub fn set_var(&mut self, var: VarRef) {
        self.backing = Backing::Var(var);
    }

    /// Forget a var backing; handle-backed tensors are left untouched
    pub fn reset_var(&mut self) {
        if let Backing::Var(_) = self.backing {
            self.backing = Backing::Unresolved;
        }
    }

    pub fn shape(&self) -> IngotResult<Shape> {
        match &self.backing {
            Backing::Var(var) => Ok(var.shape().clone()),
            Backing::Handle(handle) => self.interpreter_for(handle)?.shape(handle.get()),
            Backing::Unresolved => Err(unresolved("shape")),
        }
    }

    pub fn dtype(&self) -> IngotResult<DType> {
        match &self.backing {
            Backing::Var(var) => Ok(var.dtype()),
            Backing::Handle(handle) => self.interpreter_for(handle)?.dtype(handle.get()),
            Backing::Unresolved => Err(unresolved("dtype")),
        }
    }

    pub fn device(&self) -> IngotResult<Device> {
        match &self.backing {
            Backing::Var(var) => Ok(var.device()),
            Backing::Handle(handle) => self.interpreter_for(handle)?.device(handle.get()),
            Backing::Unresolved => Err(unresolved("device")),
        }
    }

    pub fn layout(&self) -> IngotResult<TensorLayout> {
        match &self.backing {
            Backing::Var(var) => Ok(var.layout().clone()),
            Backing::Handle(handle) => self.interpreter_for(handle)?.layout(handle.get()),
            Backing::Unresolved => Err(unresolved("layout")),
        }
    }

    fn interpreter_for<'a>(&self, handle: &'a SharedHandle) -> IngotResult<&'a Arc<dyn Interpreter>> {
        handle
            .interpreter()
            .ok_or_else(|| IngotError::UnresolvedTensor("tensor holds a null handle".to_string()))
    }

    /// New tensor sharing this one's backing, flags and metadata
    pub fn duplicate(&self) -> Tensor {
        Tensor {
            flags: self.flags,
            backing: self.backing.clone(),
            grad_info: self.grad_info.clone(),
            trace_info: self.trace_info.clone(),
        }
    }

    /// Duplicate that no longer takes part in gradient recording
    pub fn detach(&self) -> Tensor {
        let mut detached = self.duplicate();
        detached.flags.remove(Flags::GRAD);
        detached.grad_info.clear();
        detached
    }

    /// Take over `other`'s backing, flags and metadata
    pub fn reset(&mut self, other: &Tensor) {
        *self = other.duplicate();
    }

    /// Owners of the underlying handle, zero when not handle-backed
    pub fn use_count(&self) -> usize {
        self.handle().map_or(0, SharedHandle::use_count)
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.flags = flags;
    }

    pub fn insert_flags(&mut self, flags: Flags) {
        self.flags.insert(flags);
    }

    pub fn remove_flags(&mut self, flags: Flags) {
        self.flags.remove(flags);
    }

    pub fn is_scalar(&self) -> bool {
        self.flags.contains(Flags::SCALAR)
    }

    pub fn set_scalar(&mut self, scalar: bool) {
        if scalar {
            self.flags.insert(Flags::SCALAR);
        } else {
            self.flags.remove(Flags::SCALAR);
        }
    }

    pub fn requires_grad(&self) -> bool {
        self.flags.contains(Flags::GRAD)
    }

    pub fn is_traced(&self) -> bool {
        self.flags.contains(Flags::TRACE)
    }

    pub fn swap_in(&self) -> IngotResult<()> {
        let (interpreter, raw) = self.resident("swap_in")?;
        interpreter.swap_in(raw)
    }

    pub fn swap_out(&self) -> IngotResult<()> {
        let (interpreter, raw) = self.resident("swap_out")?;
        interpreter.swap_out(raw)
    }

    pub fn drop_value(&self) -> IngotResult<()> {
        let (interpreter, raw) = self.resident("drop")?;
        interpreter.drop_value(raw)
    }

    fn resident(&self, operation: &str) -> IngotResult<(&Arc<dyn Interpreter>, RawHandle)> {
        match &self.backing {
            Backing::Handle(handle) => Ok((self.interpreter_for(handle)?, handle.get())),
            other => Err(IngotError::InvalidRepresentation(format!(
                "{} needs a handle-backed tensor, got {}",
                operation,
                other.kind()
            ))),
        }
    }
}

fn unresolved(query: &str) -> IngotError {
    IngotError::UnresolvedTensor(format!("{} queried on a tensor with no handle or var", query))
}
