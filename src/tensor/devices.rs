//! Device a backend resource lives on

use std::fmt::{self, Display};
use std::str::FromStr;
use serde::{Serialize, Deserialize};

use crate::error::IngotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    Cpu,
    Cuda(usize),
    Metal(usize),
    Vulkan(usize),
}

impl Device {
    /// Check if device is GPU-based
    pub const fn is_gpu(&self) -> bool {
        matches!(self, Device::Cuda(_) | Device::Metal(_) | Device::Vulkan(_))
    }

    /// Whether the backend may swap values on this device out to host memory
    pub const fn supports_swap(&self) -> bool {
        self.is_gpu()
    }

    pub const fn index(&self) -> usize {
        match self {
            Device::Cpu => 0,
            Device::Cuda(id) | Device::Metal(id) | Device::Vulkan(id) => *id,
        }
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cpu
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(id) => write!(f, "cuda:{}", id),
            Device::Metal(id) => write!(f, "metal:{}", id),
            Device::Vulkan(id) => write!(f, "vulkan:{}", id),
        }
    }
}

impl FromStr for Device {
    type Err = IngotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, index) = match s.split_once(':') {
            Some((kind, index)) => {
                let index = index
                    .parse::<usize>()
                    .map_err(|_| IngotError::InvalidInput(format!("bad device index in '{}'", s)))?;
                (kind, index)
            }
            None => (s, 0),
        };

        match kind {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(index)),
            "metal" => Ok(Device::Metal(index)),
            "vulkan" => Ok(Device::Vulkan(index)),
            _ => Err(IngotError::InvalidInput(format!("unknown device '{}'", s))),
        }
    }
}
