// Copyright 2024 CSL Hardware Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Kernel handle types
//!
//! The request manager hands out opaque 32-bit handles for sessions,
//! acquired devices and links. The low byte of every handle is a table
//! index; the remaining bits are a generation the kernel uses to reject
//! stale handles.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Mask extracting the table index from a kernel handle.
pub const HANDLE_INDEX_MASK: i32 = 0xFF;

/// Maximum number of handles of one kind the request manager tracks.
pub const MAX_HANDLES: usize = 256;

macro_rules! kernel_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i32);

        impl $name {
            /// Handle value the kernel never issues.
            pub const INVALID: Self = Self(0);

            /// Raw kernel value.
            pub fn raw(self) -> i32 {
                self.0
            }

            /// Whether the kernel could have issued this handle.
            pub fn is_valid(self) -> bool {
                self.0 > 0
            }

            /// Table index encoded in the handle.
            pub fn index(self) -> usize {
                (self.0 & HANDLE_INDEX_MASK) as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:x}", self.0)
            }
        }
    };
}

kernel_handle!(
    /// Handle of a kernel session.
    SessionHandle
);
kernel_handle!(
    /// Handle of a device acquired within a session.
    DeviceHandle
);
kernel_handle!(
    /// Handle of a realtime link within a session.
    LinkHandle
);

/// Handle of a command packet in kernel-mapped memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PacketHandle(pub i32);

/// Compose a handle from a generation and a table index.
pub fn compose(generation: u32, index: usize) -> i32 {
    (((generation & 0x7F_FFFF) as i32) << 8) | (index as i32 & HANDLE_INDEX_MASK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_is_low_byte() {
        let handle = DeviceHandle(compose(7, 3));
        assert_eq!(handle.index(), 3);
        assert!(handle.is_valid());
    }

    #[test]
    fn test_invalid_handles() {
        assert!(!SessionHandle::INVALID.is_valid());
        assert!(!LinkHandle(-4).is_valid());
    }

    #[test]
    fn test_display_is_hex() {
        assert_eq!(LinkHandle(0x1a02).to_string(), "0x1a02");
    }
}
