//! af-shm: Shared-memory track buffers
//!
//! A track's audio travels through a fixed-capacity ring of frames plus a
//! control block of atomic cursors and flags. Both live in a
//! [`SharedRegion`] that the server allocates and the client maps. Each side
//! talks to the region only through its proxy:
//!
//! - [`ClientProxy`]: application side, may block with a timeout
//! - [`ServerProxy`]: mixing-thread side, never blocks
//!
//! Correctness relies on the monotonic cursor discipline, not on locks:
//! the producer writes only in `[rear, front + frameCount)` and the consumer
//! reads only in `[front, rear)`.

mod arena;
mod cblk;
mod flags;
mod proxy;
mod region;
mod static_loop;

pub use arena::*;
pub use cblk::*;
pub use flags::*;
pub use proxy::*;
pub use region::*;
pub use static_loop::*;
