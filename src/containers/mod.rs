/*!
 * Container Primitives
 *
 * Flat and linked containers built over the arena allocators. Simple
 * arrays and vectors pack into one contiguous block so they can be shipped
 * whole into shared memory or to disk; dynamic arrays and lists grow
 * without bound inside a serial arena.
 */

pub mod array;
pub mod list;
pub mod type_ops;
pub mod vector;

pub use array::{DynamicArray, SimpleArray};
pub use list::List;
pub use type_ops::{ip_equal, IpKey, Key};
pub use vector::{flat_array_check, flat_to_items, Vector};
