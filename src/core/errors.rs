/*!
 * Error Types
 * Centralized error handling with thiserror
 */

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("Out of arena space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: usize, available: usize },

    #[error("Request of {requested} bytes exceeds the chunk payload of {chunk} bytes")]
    OversizeForChunk { requested: usize, chunk: usize },

    #[error("Position 0x{0:x} outside the allocator block")]
    InvalidPosition(usize),

    #[error("Pointer does not carry a pool signature")]
    ForeignPointer,

    #[error("Object pool id {0} is not registered")]
    UnknownPool(usize),

    #[error("Pool exhausted: {0}")]
    PoolExhausted(String),
}

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("Failed to create {scheme} mutex {name:?}: {source}")]
    MutexCreate {
        scheme: &'static str,
        name: String,
        source: std::io::Error,
    },

    #[error("Failed to lock {0}: {1}")]
    MutexLock(String, std::io::Error),

    #[error("Failed to unlock {0}: {1}")]
    MutexUnlock(String, std::io::Error),

    #[error("Interrupted by signal")]
    Interrupted,

    #[error("Failed to create shared memory {name:?} ({size} bytes): {source}")]
    ShmCreate {
        name: String,
        size: usize,
        source: std::io::Error,
    },

    #[error("Failed to attach shared memory {0:?}: {1}")]
    ShmAttach(String, std::io::Error),

    #[error("Shared memory name {0:?} exceeds {1} bytes")]
    NameTooLong(String, usize),
}

#[derive(Error, Debug)]
pub enum StatError {
    #[error("Statistics registry is frozen; entries must be registered before the first fork")]
    RegistryFrozen,

    #[error("Entry {label:?} already registered in group {group:?} with a different type")]
    TypeMismatch { label: String, group: String },

    #[error("Unknown statistics id {0}")]
    UnknownId(usize),

    #[error("Unknown statistics group {0:?}")]
    UnknownGroup(String),

    #[error("Memory block of {have} bytes cannot hold {need} bytes of counters")]
    BlockTooSmall { have: usize, need: usize },

    #[error("Memory block signature mismatch (found 0x{0:04x})")]
    BadSignature(u16),

    #[error("Histogram area exhausted: {0}")]
    HistogramAreaFull(String),

    #[error("Blob registry is frozen or out of space: {0}")]
    BlobRegistry(String),
}

#[derive(Error, Debug)]
pub enum LookupError {
    #[error("Unknown lookup-table backend {0:?}")]
    UnknownBackend(String),

    #[error("Malformed table specification {0:?} (expected scheme:path)")]
    BadSpec(String),

    #[error("Failed to open {path:?}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },

    #[error("Parse error at {path}:{line}: {reason}")]
    Parse {
        path: String,
        line: usize,
        reason: String,
    },

    #[error("Invalid regex key {0:?}: {1}")]
    BadRegex(String, regex::Error),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind listener {0}: {1}")]
    Bind(String, std::io::Error),

    #[error("Accept failed: {0}")]
    Accept(std::io::Error),

    #[error("fork failed: {0}")]
    Fork(std::io::Error),

    #[error("Control pipe error: {0}")]
    ControlPipe(std::io::Error),

    #[error("Control FIFO {0:?}: {1}")]
    ControlFifo(String, std::io::Error),

    #[error("PID file {path:?}: {reason}")]
    PidFile { path: String, reason: String },

    #[error("Another instance is running with pid {0}")]
    AlreadyRunning(i32),

    #[error("Child registry error: {0}")]
    Registry(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Statistics error: {0}")]
    Stat(#[from] StatError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
