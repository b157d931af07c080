/*!
 * Limits
 * Fixed caps and sizes shared across subsystems
 */

/// Largest buffer the sized pools serve; bigger requests go to the OS heap.
pub const MAX_POOLED_BUFFER: usize = 32 * 1024;

/// Chunk payload granted to serial allocators by default.
pub const SERIAL_CHUNK_SIZE: usize = 4096;

/// Alignment unit of the arena allocators.
pub const ARENA_ALIGN: usize = 16;

/// Upper bound on proc-mutex name collision retries.
pub const PROC_MUTEX_NAME_RETRIES: u32 = 1024;

/// Stored-name capacity of inter-process primitives.
pub const IPC_NAME_MAX: usize = 64;

/// One command line read from the control FIFO or a child pipe.
pub const COMMANDS_BUFFER_SIZE: usize = 128;

/// Per-worker cap on requests served over one keep-alive connection.
pub const MAX_KEEPALIVE_REQUESTS: i32 = 100;

/// Requests a worker serves before its cached request object is torn down
/// so the per-request arenas drop their chained extents.
pub const MAX_REQUESTS_BEFORE_REALLOCATE_MEM: u64 = 100;

/// Seconds a child gets to wind down its workers before escalation.
pub const CHILD_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// Spin interval while the monitor collects exiting children.
pub const CHILD_REAP_SPIN_MS: u64 = 30;
