/*!
 * IPC Module
 *
 * Cross-process primitives the acceptors and the child registry are built
 * on: an inter-process mutex polymorphic over three locking schemes, and a
 * shared-memory region polymorphic over three mapping schemes. The scheme
 * is chosen at configuration time and frozen before the first fork so
 * children inherit it by value.
 */

pub mod proc_mutex;
pub mod shared_mem;

pub use proc_mutex::{ProcMutex, ProcMutexScheme};
pub use shared_mem::{SharedMem, SharedMemScheme};
