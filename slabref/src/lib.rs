//! Slabref: reference-counted objects over a lock-free slab allocator.
//!
//! Three layers, leaf first:
//!
//! - **Latches** ([`Latch`], [`RecursiveLatch`], [`SharedLatch`],
//!   [`ExclusiveLatch`]): single-word spin locks with configurable backoff.
//! - **[`Allocator`]**: fixed-size items served from a lock-free cache, a
//!   reserved pool, and latch-protected extension pages. Pages come from a
//!   process-wide pool shared by every allocator.
//! - **[`Ref`] / [`RefT`]**: atomic reference counting for any [`Object`].
//!   Objects whose count drops to zero are destroyed by a collector, either
//!   in the background or on demand through [`Ref::gc`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use slabref::{Allocator, Object, Ref, RefT};
//!
//! struct Point {
//!     x: i32,
//!     y: i32,
//! }
//! impl Object for Point {}
//!
//! let pool = Arc::new(Allocator::new(RefT::<Point>::NODE_SIZE, 64, 64).unwrap());
//!
//! let p = RefT::new_in(Point { x: 1, y: 2 }, &pool).unwrap();
//! let any: Ref = Ref::from(&p);
//! assert_eq!(p.references(), Some(2));
//! assert!(any.target().unwrap().is::<Point>());
//!
//! drop(p);
//! drop(any);
//! Ref::gc();
//! assert_eq!(pool.stats().gets, pool.stats().puts);
//! ```

#![warn(missing_docs)]

extern crate alloc;

mod allocator;
mod backoff;
mod collector;
pub mod config;
mod error;
mod event;
mod latch;
mod latched;
mod object;
mod page;
mod page_pool;
mod reference;
mod thread_id;

pub use allocator::{Allocator, AllocatorStats, ITEM_ALIGN, ITEM_CACHE};
pub use collector::CollectorStats;
pub use config::{AllocatorConfig, CollectorConfig, Config, LatchConfig};
pub use error::{Error, Result};
pub use event::{Event, Semaphore};
pub use latch::{ExclusiveLatch, Latch, LatchGuard, RawLatch, RecursiveLatch, SharedLatch};
pub use latched::{Held, Latched};
pub use object::{AsAny, Object, compare_cast};
pub use page_pool::PagePoolStats;
pub use reference::{Ref, RefT};
pub use thread_id::ThreadToken;
