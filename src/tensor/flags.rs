//! Per-tensor flag bitset

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Cross-cutting tensor properties. The bitmask is open: callers may
    /// define further bits with [`Flags::from_bits_retain`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Flags: u64 {
        const SCALAR = 1 << 0;
        const GRAD   = 1 << 1;
        const TRACE  = 1 << 2;

        // unnamed bits are part of the set, not noise
        const _ = !0;
    }
}

impl Default for Flags {
    fn default() -> Self {
        Flags::empty()
    }
}
