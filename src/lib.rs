//! General purpose memory allocator built on segregated best-fit free
//! lists. Memory is requested from the OS in large page-aligned mappings
//! and carved into blocks; freed blocks are kept in one sorted bucket per
//! size class and eagerly merged with their physical neighbours:
//!
//! ```text
//!               +--------------+--------------+- - - - - -+--------------+
//! size classes  |  exactly 32  |  exactly 40  |           | 2^44*8 and up|
//!               +------|-------+--------------+- - - - - -+------|-------+
//!                      |                                         |
//!                      v                                         v
//!                 +-------+    +-------+                    +-------+
//!                 | Free  | -> | Free  | -> ...             | Free  | -> ...
//!                 +-------+    +-------+                    +-------+
//!
//!               +---------------------------------+      +----------------+
//! mappings      | +-------+ +------+ +----------+ |      | +------+ +---+ |
//! (from the OS) | | Alloc | | Free | |  Alloc   | | ...  | | Free | |...| |
//!               | +-------+ +------+ +----------+ |      | +------+ +---+ |
//!               +---------------------------------+      +----------------+
//! ```
//!
//! The four public operations mirror the C allocation family: allocate
//! (malloc), deallocate (free), zeroed allocation (calloc) and reallocation
//! (realloc). All returned pointers are 8-byte aligned; stronger alignments
//! are out of scope. See [`Buckalloc`] for usage, [`PageSource`] for
//! plugging in a custom page supplier.

use std::ptr::NonNull;

mod align;
mod allocator;
mod block;
mod bucket;
mod classes;
mod header;
mod platform;
mod registry;
mod source;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case, and because every bit pattern of a freed block's memory
/// must stay a valid value of the sibling link fields (see the `block`
/// module).
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::{AllocError, Buckalloc};
pub use source::{OsPageSource, PageSource};
