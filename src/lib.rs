/*!
 * icapd - Multi-Process ICAP Server Core
 *
 * A master/worker server: a monitor process forks a fixed pool of worker
 * children, each running a worker-thread pool fed by one acceptor thread.
 * The children coordinate through a shared-memory registry, an
 * inter-process accept mutex and per-child control pipes.
 *
 * # Module Organization
 *
 * - **core**: shared types, errors, limits, the command-line tokenizer
 * - **mem**: pack/serial/pool arena allocators, sized buffer + object pools
 * - **containers**: arrays, vectors (with a flat on-disk form), lists, keys
 * - **ipc**: inter-process mutexes and shared memory, scheme-polymorphic
 * - **stats**: counter registry, shared statistics blocks, histograms
 * - **queue**: the bounded acceptor-to-workers connection queue
 * - **lookup**: lookup-table core with file/hash/regex backends
 * - **server**: listeners, acceptor/worker threads, child lifecycle,
 *   registry, command bus, signals and the monitor itself
 */

pub mod config;
pub mod containers;
pub mod core;
pub mod ipc;
pub mod lookup;
pub mod mem;
pub mod queue;
pub mod server;
pub mod stats;

pub use config::{ListenerConfig, ServerConfig};
pub use crate::core::types::{Protocol, Terminate};
pub use ipc::{ProcMutex, ProcMutexScheme, SharedMem, SharedMemScheme};
pub use lookup::{LookupTable, LookupTables};
pub use mem::{BufferPools, ObjectPools, PackAllocator, PoolAllocator, SerialAllocator};
pub use queue::ConnQueue;
pub use server::monitor::run_single_process;
pub use server::{
    child_main, ChildsRegistry, Connection, HandlerOutcome, Listener, Monitor, OptionsHandler,
    Request, RequestHandler,
};
pub use stats::{StatMemblock, StatRegistry, StatType};
