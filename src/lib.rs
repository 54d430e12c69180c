//! A concurrent buffer cache for block devices.
//!
//! This crate implements a fixed-pool buffer cache: it maps a `(device, block number)` pair to an
//! in-memory buffer holding that block's bytes, so that repeated access to hot blocks is served
//! from memory, and so that all access to a given block is serialized through one exclusively held
//! buffer.
//!
//! The cache is built around bucket-level locking. The block map is split into a fixed number of
//! buckets, each guarded by its own short spin lock, so lookups of unrelated blocks never contend.
//! Each buffer additionally carries a long-held content lock which parks the acquiring thread,
//! granting exclusive use of the block's bytes for as long as the caller needs them. Buffers are
//! never allocated after initialization; when the pool is full, an approximately least-recently
//! used idle buffer is evicted and recycled.
//!
//! The cache is not tied to any particular storage: it is generic over a [`Disk`](disk/trait.Disk.html)
//! driver doing the synchronous I/O, and over a [`Clock`](clock/trait.Clock.html) stamping release
//! times. In particular, independent cache instances can be built against in-memory disks and
//! hand-driven clocks.
//!
//! # Example
//!
//! ```rust
//! extern crate bcache;
//! extern crate slog;
//!
//! use std::sync::Arc;
//!
//! use bcache::{Cache, Memory, Ticker};
//!
//! fn main() {
//!     let disk = Memory::new();
//!     let clock = Arc::new(Ticker::new());
//!     let log = slog::Logger::root(slog::Discard, slog::o!());
//!
//!     let cache = Cache::new(disk.clone(), clock.clone(), log);
//!
//!     // Fill block 42 of device 1, modify it, and write it through to the disk.
//!     let mut buf = cache.read(1, 42).unwrap();
//!     buf[0] = 0xAB;
//!     buf.write().unwrap();
//!     clock.tick();
//!     drop(buf);
//!
//!     // The block stays warm in the cache: no second disk read happens.
//!     assert_eq!(cache.read(1, 42).unwrap()[0], 0xAB);
//!     assert_eq!(disk.reads(), 1);
//! }
//! ```

#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate slog;
extern crate parking_lot;
extern crate spin;

pub mod cache;
pub mod clock;
pub mod disk;

pub use cache::{BufferGuard, Cache, POOL_BUFFERS};
pub use clock::{Clock, Tick, Ticker, Uptime};
pub use disk::{BlockBuf, BlockNumber, Device, Disk, Memory, BLOCK_SIZE};
