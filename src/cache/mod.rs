//! The buffer cache.
//!
//! The cache holds copies of disk blocks in a fixed pool of in-memory buffers. Caching blocks
//! serves two purposes: a hot block is read from memory instead of the disk, and every use of a
//! block goes through the one buffer assigned to it, which serializes access to the block between
//! threads.
//!
//! Interface:
//!
//! * To get a buffer for a particular block, call [`read`](struct.Cache.html#method.read).
//! * After changing a buffer's bytes, call [`write`](struct.BufferGuard.html#method.write) to
//!   write them to the disk.
//! * When done with a buffer, drop the guard (or call `release`).
//! * Only one thread at a time can use a buffer, so do not keep guards longer than necessary.
//!
//! # Locking
//!
//! Two kinds of locks with different disciplines are in play.
//!
//! The block map is split into a fixed number of buckets, each guarded by its own spin lock. A
//! bucket lock protects the bucket's chain and all bookkeeping (identity, reference count,
//! release stamp) of the buffers currently chained there. These critical sections are a few
//! loads and stores; the lock never sleeps and is never held across anything that could.
//!
//! Each buffer additionally carries a content lock guarding its bytes. This one is long-held (a
//! caller keeps it from lookup until release, across disk I/O) and parks the acquiring thread
//! instead of spinning it. The two kinds are never held together: a thread lets go of the bucket lock
//! before acquiring a content lock, and releases the content lock before touching bucket
//! bookkeeping again.
//!
//! # Eviction
//!
//! Buffers are never allocated after initialization. When a lookup misses and the pool is full,
//! the cache detaches the idle buffer whose last release happened the longest ago (buffers are
//! stamped with a clock tick whenever their reference count drops to zero) and recycles it for
//! the new block. The scan for that buffer visits every bucket, so it cannot run under any one
//! bucket's lock; a dedicated eviction lock serializes evictors instead, and the detach
//! re-checks the candidate under its bucket lock, restarting the scan if the candidate was
//! referenced in the meantime.

use std::{fmt, ops};

use parking_lot::{Mutex, MutexGuard};
use slog::Logger;
use spin;

use clock::{Clock, Tick};
use disk::{self, BlockBuf, BlockNumber, Device, Disk, BLOCK_SIZE};

/// The number of buffers in the pool.
pub const POOL_BUFFERS: usize = 30;
/// The number of buckets in the block map.
///
/// A small prime, far below the pool size so that eviction scans stay cheap, yet big enough to
/// spread unrelated lookups over distinct locks.
const BUCKETS: usize = 29;

/// A buffer number.
///
/// Every buffer in the pool is enumerated; the number indexes both the pool slot holding the
/// buffer's bytes and stays with the buffer's bookkeeping entry as it moves between buckets.
type BufferNumber = usize;

/// Map a block identity to the bucket listing it.
fn bucket_of(device: Device, block: BlockNumber) -> usize {
    ((device as u64 * 67 + block as u64) % BUCKETS as u64) as usize
}

/// The bookkeeping of one pooled buffer.
///
/// An entry is owned by exactly one bucket at a time, namely the bucket its block identity
/// hashes to, and is only read or written under that bucket's lock. Detaching a buffer for
/// reuse moves the entry out of the chain, so single membership holds by construction.
struct Entry {
    /// The buffer this entry describes.
    buf: BufferNumber,
    /// The device of the assigned block.
    ///
    /// Meaningless until the buffer has been mapped for the first time.
    device: Device,
    /// The block number of the assigned block.
    block: BlockNumber,
    /// The number of outstanding references: live guards plus explicit pins.
    ///
    /// The buffer is eligible for eviction exactly when this is zero.
    refcnt: usize,
    /// The tick at which `refcnt` last dropped to zero.
    ///
    /// Only meaningful while the buffer is idle. Eviction detaches the idle buffer with the
    /// smallest stamp.
    last_released: Tick,
}

/// A bucket of the block map.
struct Bucket {
    /// The entries of the buffers mapped to this bucket, most recently installed first.
    chain: Vec<Entry>,
}

impl Bucket {
    /// Find the entry mapping a block, if this bucket holds one.
    ///
    /// The chain is walked front to back, so when transient duplicates exist, the most recently
    /// installed mapping wins.
    fn lookup(&mut self, device: Device, block: BlockNumber) -> Option<&mut Entry> {
        self.chain.iter_mut().find(|entry| entry.device == device && entry.block == block)
    }

    /// Find the entry describing a particular buffer.
    fn entry(&mut self, buf: BufferNumber) -> Option<&mut Entry> {
        self.chain.iter_mut().find(|entry| entry.buf == buf)
    }
}

/// The side of a buffer guarded by its content lock.
struct Content {
    /// Does `data` reflect the block on the disk?
    valid: bool,
    /// The block's bytes.
    data: BlockBuf,
}

/// A buffer picked by the eviction scan.
///
/// The scan cannot keep every bucket locked at once, so rather than borrowing the winning
/// entry, it records enough of it to find it again: the buffer number, and the identity which
/// determines the bucket.
struct Candidate {
    /// The buffer to detach.
    buf: BufferNumber,
    /// The device of the candidate's block.
    device: Device,
    /// The block number of the candidate's block.
    block: BlockNumber,
    /// The release stamp the candidate was picked by.
    last_released: Tick,
}

/// A concurrent buffer cache.
///
/// The cache maps `(device, block)` pairs to buffers in a fixed pool, hands out exclusive
/// guards to them, and recycles the least recently released buffers when the pool is full. It
/// is generic over the disk driver doing the actual I/O and over the tick source stamping
/// releases, so independent instances can be built against in-memory disks in tests.
pub struct Cache<D, C> {
    /// The driver of the cached disk(s).
    disk: D,
    /// The tick source stamping buffer releases.
    clock: C,
    /// The log output.
    log: Logger,
    /// The buffer pool.
    ///
    /// Every cached block's bytes live in one of these fixed slots, enumerated by buffer
    /// number. The mutex is the buffer's content lock: long-held and parking.
    pool: Box<[Mutex<Content>]>,
    /// The bucket array of the block map.
    ///
    /// The spin lock guards the chain and every field of the entries within.
    buckets: Box<[spin::Mutex<Bucket>]>,
    /// The eviction lock.
    ///
    /// It guards no data; it serializes evictors, so concurrent evictions neither chase the
    /// same candidate nor interleave their scan-then-detach sequences.
    eviction: spin::Mutex<()>,
}

impl<D: Disk, C: Clock> Cache<D, C> {
    /// Create a cache over a disk.
    ///
    /// This builds the buffer pool and the block map; every buffer starts out empty and idle,
    /// chained into bucket 0. No I/O happens.
    pub fn new(disk: D, clock: C, log: Logger) -> Cache<D, C> {
        info!(log, "initializing buffer cache";
              "buffers" => POOL_BUFFERS, "buckets" => BUCKETS, "block size" => BLOCK_SIZE);

        let mut pool = Vec::with_capacity(POOL_BUFFERS);
        for _ in 0..POOL_BUFFERS {
            pool.push(Mutex::new(Content {
                valid: false,
                data: [0; BLOCK_SIZE],
            }));
        }

        let mut buckets = Vec::with_capacity(BUCKETS);
        for _ in 0..BUCKETS {
            buckets.push(spin::Mutex::new(Bucket { chain: Vec::new() }));
        }

        // Thread every buffer into bucket 0. The zeroed identity hashes there, and the zero
        // release stamps make the fresh buffers the first eviction candidates.
        {
            let mut first = buckets[0].lock();
            for buf in 0..POOL_BUFFERS {
                first.chain.insert(0, Entry {
                    buf: buf,
                    device: 0,
                    block: 0,
                    refcnt: 0,
                    last_released: 0,
                });
            }
        }

        Cache {
            disk: disk,
            clock: clock,
            log: log,
            pool: pool.into_boxed_slice(),
            buckets: buckets.into_boxed_slice(),
            eviction: spin::Mutex::new(()),
        }
    }

    /// Get a buffer holding a block, with its bytes filled from the disk.
    ///
    /// This resolves `(device, block)` to its buffer, installing one if the block is not
    /// cached, and returns an exclusive guard to it. On the first use of the buffer for this
    /// block, the bytes are read from the disk; afterwards they are served from memory until
    /// the buffer gets evicted.
    ///
    /// The call blocks while another thread holds the block's buffer, and it drives synchronous
    /// I/O on a miss, so it can park the calling thread for a while. Driver errors are passed
    /// through; a failed fill leaves the buffer in place but unfilled, so a later read retries
    /// the I/O.
    ///
    /// # Panics
    ///
    /// Panics if every buffer in the pool is referenced. Callers must bound their outstanding
    /// holds by the pool size.
    pub fn read(&self, device: Device, block: BlockNumber) -> Result<BufferGuard<D, C>, disk::Error> {
        let mut buf = self.get(device, block);

        // First use of the buffer for this block: lazily fill it from the disk.
        if !buf.content().valid {
            trace!(self.log, "reading block from disk"; "device" => device, "block" => block);

            let content = buf.content_mut();
            self.disk.read(device, block, &mut content.data)?;
            content.valid = true;
        }

        Ok(buf)
    }

    /// Get an exclusive handle to a block's buffer, installing a buffer if the block is not
    /// cached.
    ///
    /// The returned guard holds the buffer's content lock and one reference on the buffer. The
    /// bytes are *not* filled here; `read` layers the lazy fill on top.
    fn get(&self, device: Device, block: BlockNumber) -> BufferGuard<D, C> {
        let h = bucket_of(device, block);

        // Is the block already cached?
        {
            let mut bucket = self.buckets[h].lock();

            if let Some(entry) = bucket.lookup(device, block) {
                // It is. Take our reference while the bucket lock still pins the entry down.
                entry.refcnt += 1;
                let buf = entry.buf;

                // The content lock may park us, so the bucket lock goes first.
                drop(bucket);

                trace!(self.log, "cache hit"; "device" => device, "block" => block);

                return BufferGuard {
                    cache: self,
                    buf: buf,
                    device: device,
                    block: block,
                    content: Some(self.pool[buf].lock()),
                };
            }
        }

        // Not cached. Detach the least recently used idle buffer so the block can move into
        // it. The bucket lock is not held across this: the eviction scan visits all buckets,
        // and holding one of them here would order bucket locks against the eviction lock both
        // ways around.
        let mut victim = match self.evict() {
            Some(victim) => victim,
            None => panic!("buffer cache exhausted: all buffers are referenced"),
        };

        // The victim is detached: no bucket lists it, so no other thread can reach it, and its
        // content lock is necessarily free (its refcnt was zero under the bucket lock, and
        // holders let go of the content lock before dropping their reference). Clear the valid
        // flag before the buffer becomes visible, so that whoever acquires the content lock
        // first once it is published finds an empty buffer rather than the old block's bytes.
        self.pool[victim.buf].lock().valid = false;

        let mut bucket = self.buckets[h].lock();

        // The block may have been installed while we were off evicting: a concurrent lookup
        // for the same absent block misses the first walk exactly like we did. Re-check under
        // the bucket lock, so that at most one buffer for the block is ever reachable.
        if let Some(entry) = bucket.lookup(device, block) {
            // Lost the race. Reference the mapping that won...
            entry.refcnt += 1;
            let buf = entry.buf;
            drop(bucket);

            debug!(self.log, "block cached while evicting, backing off";
                   "device" => device, "block" => block, "victim" => victim.buf);

            // ...and hand the victim back to the bucket its identity hashes to, which is the
            // one it was detached from.
            let source = bucket_of(victim.device, victim.block);
            self.buckets[source].lock().chain.insert(0, victim);

            return BufferGuard {
                cache: self,
                buf: buf,
                device: device,
                block: block,
                content: Some(self.pool[buf].lock()),
            };
        }

        // Move the victim in: it now caches this block, with us as the single reference.
        debug!(self.log, "caching block";
               "device" => device, "block" => block, "buffer" => victim.buf);

        victim.device = device;
        victim.block = block;
        victim.refcnt = 1;
        let buf = victim.buf;
        bucket.chain.insert(0, victim);
        drop(bucket);

        BufferGuard {
            cache: self,
            buf: buf,
            device: device,
            block: block,
            content: Some(self.pool[buf].lock()),
        }
    }

    /// Detach the least recently used idle buffer from the block map.
    ///
    /// The returned entry is removed from its bucket and has no outstanding references, so the
    /// caller owns the buffer outright until it splices the entry back in. Returns `None` when
    /// every buffer in the pool is referenced.
    fn evict(&self) -> Option<Entry> {
        // One evictor at a time. Serializing here keeps two concurrent misses from detaching
        // the same candidate and bounds the scan work under contention.
        let _evictors = self.eviction.lock();

        loop {
            // Walk every bucket, one lock at a time, tracking the idle buffer with the oldest
            // release stamp. Ties go to the earliest one seen.
            let mut candidate: Option<Candidate> = None;

            for bucket in self.buckets.iter() {
                let bucket = bucket.lock();

                for entry in &bucket.chain {
                    if entry.refcnt == 0
                        && candidate.as_ref().map_or(true, |c| entry.last_released < c.last_released)
                    {
                        candidate = Some(Candidate {
                            buf: entry.buf,
                            device: entry.device,
                            block: entry.block,
                            last_released: entry.last_released,
                        });
                    }
                }
            }

            // No idle buffer anywhere: the pool is exhausted.
            let candidate = match candidate {
                Some(candidate) => candidate,
                None => return None,
            };

            // The scan let go of the candidate's bucket lock, so the candidate may have been
            // referenced again in the meantime. Re-lock its bucket (the identity determines
            // which one) and detach only if it is still idle.
            let h = bucket_of(candidate.device, candidate.block);
            let mut bucket = self.buckets[h].lock();

            match bucket.chain.iter().position(|entry| entry.buf == candidate.buf) {
                Some(i) if bucket.chain[i].refcnt > 0 => {
                    // Reclaimed behind our back. Pick a new candidate from scratch.
                    drop(bucket);

                    trace!(self.log, "eviction candidate reclaimed, restarting scan";
                           "buffer" => candidate.buf);
                }
                Some(i) => {
                    let entry = bucket.chain.remove(i);
                    drop(bucket);

                    debug!(self.log, "evicting buffer";
                           "buffer" => entry.buf, "device" => entry.device,
                           "block" => entry.block, "released at" => entry.last_released);

                    return Some(entry);
                }
                // We hold the eviction lock, so nothing else detaches buffers, and an entry
                // never changes buckets while chained. The candidate has to still be here.
                None => panic!("buffer cache: eviction candidate vanished from its bucket"),
            }
        }
    }
}

/// An exclusive handle to a cached block.
///
/// Holding the guard means holding the buffer's content lock and one reference on the buffer:
/// no other thread can use the block, and the buffer cannot be evicted. The guard dereferences
/// to the block's bytes.
///
/// Dropping the guard releases the block: the content lock is let go first, then the reference
/// is returned under the bucket lock, stamping the release tick if it was the last one.
pub struct BufferGuard<'a, D: 'a, C: Clock + 'a> {
    /// The cache the buffer belongs to.
    cache: &'a Cache<D, C>,
    /// The number of the held buffer.
    buf: BufferNumber,
    /// The device of the held block.
    device: Device,
    /// The block number of the held block.
    block: BlockNumber,
    /// The held content lock.
    ///
    /// Always populated; it is only taken out in `drop`, where the content lock must be
    /// released before the bucket bookkeeping is touched.
    content: Option<MutexGuard<'a, Content>>,
}

impl<'a, D: 'a, C: Clock + 'a> BufferGuard<'a, D, C> {
    /// The device of the held block.
    pub fn device(&self) -> Device {
        self.device
    }

    /// The block number of the held block.
    pub fn block(&self) -> BlockNumber {
        self.block
    }

    /// Release the block.
    ///
    /// Dropping the guard does the same; this merely names the operation.
    pub fn release(self) {}

    /// Keep the buffer resident beyond this guard.
    ///
    /// This takes an extra reference on the buffer without involving the content lock, so the
    /// buffer stays ineligible for eviction after the guard is dropped, until a matching
    /// `unpin`. Subsystems like a write-ahead log use this to keep blocks resident across
    /// their own transaction boundaries.
    pub fn pin(&self) {
        let mut bucket = self.cache.buckets[bucket_of(self.device, self.block)].lock();

        match bucket.entry(self.buf) {
            Some(entry) => entry.refcnt += 1,
            None => panic!("buffer cache: pinned buffer is not mapped"),
        }
    }

    /// Drop a reference previously taken by `pin`.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was not pinned: the guard's own reference is not for `unpin` to
    /// return.
    pub fn unpin(&self) {
        let mut bucket = self.cache.buckets[bucket_of(self.device, self.block)].lock();

        match bucket.entry(self.buf) {
            Some(entry) => {
                assert!(entry.refcnt > 1, "buffer cache: unpinning a buffer which was not pinned");
                entry.refcnt -= 1;
            }
            None => panic!("buffer cache: unpinned buffer is not mapped"),
        }
    }

    /// The held content.
    ///
    /// The option is populated from construction until drop, so unwrapping is fine anywhere a
    /// `self` exists.
    fn content(&self) -> &Content {
        self.content.as_ref().unwrap()
    }

    /// The held content, mutably.
    fn content_mut(&mut self) -> &mut Content {
        self.content.as_mut().unwrap()
    }
}

impl<'a, D: Disk + 'a, C: Clock + 'a> BufferGuard<'a, D, C> {
    /// Write the buffer's bytes through to the disk.
    ///
    /// The cache is write-through: nothing tracks unwritten modifications, so a caller mutating
    /// the bytes decides when they reach the disk by calling this. The write is synchronous.
    pub fn write(&self) -> Result<(), disk::Error> {
        trace!(self.cache.log, "writing block to disk";
               "device" => self.device, "block" => self.block);

        self.cache.disk.write(self.device, self.block, &self.content().data)
    }
}

impl<'a, D: 'a, C: Clock + 'a> ops::Deref for BufferGuard<'a, D, C> {
    type Target = BlockBuf;

    fn deref(&self) -> &BlockBuf {
        &self.content().data
    }
}

impl<'a, D: 'a, C: Clock + 'a> ops::DerefMut for BufferGuard<'a, D, C> {
    fn deref_mut(&mut self) -> &mut BlockBuf {
        &mut self.content_mut().data
    }
}

impl<'a, D: 'a, C: Clock + 'a> fmt::Debug for BufferGuard<'a, D, C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "BufferGuard(device={}, block={})", self.device, self.block)
    }
}

impl<'a, D: 'a, C: Clock + 'a> Drop for BufferGuard<'a, D, C> {
    fn drop(&mut self) {
        // The content lock goes first: the bookkeeping below takes a bucket lock, and no
        // thread holds a bucket lock and a content lock at once.
        drop(self.content.take());

        let mut bucket = self.cache.buckets[bucket_of(self.device, self.block)].lock();

        match bucket.entry(self.buf) {
            Some(entry) => {
                entry.refcnt -= 1;

                if entry.refcnt == 0 {
                    // Nobody holds the buffer anymore. Stamp the moment, so eviction can order
                    // idle buffers by how recently they were used.
                    entry.last_released = self.cache.clock.now();
                }
            }
            // A referenced buffer can neither be evicted nor change buckets, so it has to be
            // chained where its identity hashes.
            None => panic!("buffer cache: released buffer is not mapped"),
        }
    }
}
