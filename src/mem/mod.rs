/*!
 * Memory Module
 *
 * Arena allocators and pools that keep per-request allocation cheap and lay
 * flat data structures out in contiguous memory:
 *
 * - **pack**: dual-ended bump allocator over one contiguous block
 * - **serial**: chunk-chained linear allocator, free is a no-op
 * - **pool**: fixed-size item pool with a reusable free list
 * - **buffers**: sized buffer pool with O(1) header-routed release
 * - **objects**: object pool registry sharing the buffer header
 */

pub mod buffers;
pub mod objects;
pub mod pack;
pub mod pool;
pub mod serial;
pub mod traits;

pub use buffers::{BufferPools, PoolBuf, BUF_SIGNATURE};
pub use objects::{ObjectPools, PoolObject, OBJ_SIGNATURE};
pub use pack::PackAllocator;
pub use pool::PoolAllocator;
pub use serial::SerialAllocator;
pub use traits::{align_up, Arena, ArenaRef};
