//! Disk I/O.
//!
//! This module defines the boundary between the buffer cache and the storage it caches: a driver
//! trait for synchronous block I/O, the identifiers addressing a block, and the error type drivers
//! report through.
//!
//! We fix the block size to 512 bytes, since it can be provided by virtually any disk in use
//! today.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicUsize};

use parking_lot::Mutex;

/// The atomic ordering used throughout the module.
const ORDERING: atomic::Ordering = atomic::Ordering::SeqCst;

/// A device number.
///
/// The cache can span multiple devices behind one driver; the device number selects which one an
/// operation goes to.
pub type Device = u32;

/// A block number on a device.
pub type BlockNumber = u32;

/// The logical block size.
pub const BLOCK_SIZE: usize = 512;

/// A block-sized buffer.
pub type BlockBuf = [u8; BLOCK_SIZE];

quick_error! {
    /// A disk I/O error.
    #[derive(Debug, PartialEq, Eq)]
    pub enum Error {
        /// The read or write exceeded the address space of the device.
        ///
        /// This is triggered when the block read or written does not exist on the device.
        OutOfBounds {
            device: Device,
            block: BlockNumber,
        } {
            display("Block {} past end of device {}.", block, device)
            description("Block past end of device.")
        }
        /// The block is determined to be corrupt per the hardware checks.
        ///
        /// Most modern disks implement some form of consistency check. If said check fails, this
        /// error shall be returned.
        Corrupt {
            device: Device,
            block: BlockNumber,
        } {
            display("Block {} on device {} is corrupt.", block, device)
            description("Corrupt block.")
        }
    }
}

/// A block device driver.
///
/// This trait acts similarly to `std::io::{Read, Write}`, but is designed specifically for disks:
/// I/O happens in whole blocks, addressed by a `(device, block)` pair, and completes synchronously
/// before the call returns.
///
/// The driver is shared between every thread using the cache, so the methods take `&self`; a
/// driver with mutable state synchronizes internally. Reading a block repeatedly without
/// intervening writes shall yield the same bytes.
pub trait Disk {
    /// Read a block.
    ///
    /// This reads block `block` of device `device` into the buffer `buf`.
    fn read(&self, device: Device, block: BlockNumber, buf: &mut BlockBuf) -> Result<(), Error>;

    /// Write a block.
    ///
    /// This writes the buffer `buf` to block `block` of device `device`, persisting it before the
    /// call returns.
    fn write(&self, device: Device, block: BlockNumber, buf: &BlockBuf) -> Result<(), Error>;
}

/// An in-memory disk.
///
/// This disk keeps its blocks in a hash map: it is sparse and unbounded, and blocks which were
/// never written read back as zeros. It exists for tests and ephemeral storage.
///
/// Cloning is cheap and clones share the underlying storage, so a caller can keep a handle to the
/// disk after moving another one into a cache. The disk additionally counts the reads and writes
/// it has served, which lets tests observe whether an access was a cache hit or went to the disk.
#[derive(Clone)]
pub struct Memory {
    /// The state shared between the clones of the disk.
    inner: Arc<Inner>,
}

/// The shared state of a `Memory` disk.
struct Inner {
    /// The blocks written so far.
    blocks: Mutex<HashMap<(Device, BlockNumber), BlockBuf>>,
    /// The number of reads served.
    reads: AtomicUsize,
    /// The number of writes served.
    writes: AtomicUsize,
}

impl Memory {
    /// Create an empty in-memory disk.
    pub fn new() -> Memory {
        Memory {
            inner: Arc::new(Inner {
                blocks: Mutex::new(HashMap::new()),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// The number of reads this disk (and its clones) has served.
    pub fn reads(&self) -> usize {
        self.inner.reads.load(ORDERING)
    }

    /// The number of writes this disk (and its clones) has served.
    pub fn writes(&self) -> usize {
        self.inner.writes.load(ORDERING)
    }
}

impl Default for Memory {
    fn default() -> Memory {
        Memory::new()
    }
}

impl Disk for Memory {
    fn read(&self, device: Device, block: BlockNumber, buf: &mut BlockBuf) -> Result<(), Error> {
        self.inner.reads.fetch_add(1, ORDERING);

        match self.inner.blocks.lock().get(&(device, block)) {
            // The block was written before; hand back its bytes.
            Some(data) => buf.copy_from_slice(data),
            // Unwritten blocks read as zeros.
            None => *buf = [0; BLOCK_SIZE],
        }

        Ok(())
    }

    fn write(&self, device: Device, block: BlockNumber, buf: &BlockBuf) -> Result<(), Error> {
        self.inner.writes.fetch_add(1, ORDERING);
        self.inner.blocks.lock().insert((device, block), *buf);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let disk = Memory::new();

        let mut data = [0; BLOCK_SIZE];
        data[0] = 1;
        data[BLOCK_SIZE - 1] = 2;
        disk.write(0, 100, &data).unwrap();

        let mut buf = [0xFF; BLOCK_SIZE];
        disk.read(0, 100, &mut buf).unwrap();
        assert_eq!(buf[0], 1);
        assert_eq!(buf[BLOCK_SIZE - 1], 2);
    }

    #[test]
    fn unwritten_blocks_are_zero() {
        let disk = Memory::new();

        let mut buf = [0xFF; BLOCK_SIZE];
        disk.read(3, 7, &mut buf).unwrap();
        assert!(buf.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn devices_are_disjoint() {
        let disk = Memory::new();

        disk.write(1, 5, &[0xAA; BLOCK_SIZE]).unwrap();

        let mut buf = [0; BLOCK_SIZE];
        disk.read(2, 5, &mut buf).unwrap();
        assert!(buf.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn counters() {
        let disk = Memory::new();
        assert_eq!(disk.reads(), 0);
        assert_eq!(disk.writes(), 0);

        let mut buf = [0; BLOCK_SIZE];
        disk.read(0, 0, &mut buf).unwrap();
        disk.write(0, 0, &buf).unwrap();
        disk.read(0, 0, &mut buf).unwrap();

        assert_eq!(disk.reads(), 2);
        assert_eq!(disk.writes(), 1);
    }

    #[test]
    fn clones_share_storage() {
        let disk = Memory::new();
        let clone = disk.clone();

        disk.write(0, 9, &[7; BLOCK_SIZE]).unwrap();

        let mut buf = [0; BLOCK_SIZE];
        clone.read(0, 9, &mut buf).unwrap();
        assert_eq!(buf[0], 7);
        assert_eq!(clone.writes(), 1);
    }
}
