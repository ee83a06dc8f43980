//! Tensor values and their building blocks
//!
//! A [`Tensor`] is backed by either a [`SharedHandle`] into an interpreter or
//! a graph var, and carries a [`Flags`] word that steers dispatch.

pub mod core;
pub mod devices;
pub mod flags;
pub mod handle;
pub mod value;

// Re-export main types for convenience
pub use self::core::{DType, Shape, TensorLayout};
pub use devices::Device;
pub use flags::Flags;
pub use handle::{RawHandle, SharedHandle};
pub use value::{Backing, MetaSlot, Tensor};
