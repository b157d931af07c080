/*!
 * Core Types
 * Common types used across the server
 */

use super::errors::{IpcError, LookupError, MemError, ServerError, StatError};

/// Process ID type
pub type Pid = i32;

/// Raw file descriptor type
pub type Fd = i32;

/// Size type for memory operations
pub type Size = usize;

/// Result of memory/allocator operations
pub type MemResult<T> = Result<T, MemError>;

/// Result of inter-process primitives (mutexes, shared memory)
pub type IpcResult<T> = Result<T, IpcError>;

/// Result of statistics operations
pub type StatResult<T> = Result<T, StatError>;

/// Result of lookup-table operations
pub type LookupResult<T> = Result<T, LookupError>;

/// Result of server/supervisor operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Wire protocol a listening port speaks; accepted connections inherit
/// the tag from their listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Icap,
    Http,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Icap => write!(f, "icap"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// Termination request levels, ordered by severity. `Gracefully` lets the
/// current request finish and drops keep-alive; `Immediately` aborts at the
/// next suspension point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Terminate {
    None = 0,
    Gracefully = 1,
    Immediately = 2,
}

impl Terminate {
    /// Decode from the atomic byte stored in shared memory. Unknown values
    /// collapse to `Immediately` so a torn write can only over-terminate.
    #[inline]
    #[must_use]
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Terminate::None,
            1 => Terminate::Gracefully,
            _ => Terminate::Immediately,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_ordering() {
        assert!(Terminate::None < Terminate::Gracefully);
        assert!(Terminate::Gracefully < Terminate::Immediately);
        assert_eq!(Terminate::from_u8(7), Terminate::Immediately);
    }
}
