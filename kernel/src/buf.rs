//! Disk block buffers and the seam to the block device driver.

use core::cell::{Cell, UnsafeCell};

use crate::fs::BSIZE;
use crate::sleeplock::Sleeplock;

/// What the buffer cache needs from a disk: move one block, synchronously.
/// The bare-metal implementation is the virtio driver; tests use `RamDisk`.
pub trait BlockDevice: Sync {
    fn rw(&self, blockno: u32, data: &mut [u8; BSIZE], write: bool);
}

/// One cache slot. Identity and LRU links live in the cache's pool (guarded
/// by the cache spinlock); the data and the valid flag belong to whoever
/// holds the per-buffer sleep lock.
pub(crate) struct Buf {
    pub(crate) lock: Sleeplock,
    pub(crate) valid: Cell<bool>, // has data been read from disk?
    pub(crate) data: UnsafeCell<[u8; BSIZE]>,
}

// `valid` and `data` are only touched by the sleep-lock holder, except for
// the valid reset in bget, which happens before any holder can exist.
unsafe impl Sync for Buf {}

impl Buf {
    pub(crate) const fn new() -> Self {
        Buf {
            lock: Sleeplock::new("buffer"),
            valid: Cell::new(false),
            data: UnsafeCell::new([0; BSIZE]),
        }
    }
}

/// In-memory block store for the hosted build: shared storage, so a "crash"
/// is simulated by dropping every in-memory kernel structure and attaching a
/// fresh cache to the same disk.
#[cfg(not(target_os = "none"))]
mod ram {
    use std::sync::{Arc, Mutex};

    use super::{BlockDevice, BSIZE};

    #[derive(Clone)]
    pub struct RamDisk {
        blocks: Arc<Mutex<Vec<[u8; BSIZE]>>>,
    }

    impl RamDisk {
        pub fn new(nblocks: usize) -> Self {
            RamDisk {
                blocks: Arc::new(Mutex::new(vec![[0; BSIZE]; nblocks])),
            }
        }

        /// Raw peek below the cache, for durability assertions.
        pub fn read_raw(&self, blockno: u32) -> [u8; BSIZE] {
            self.blocks.lock().unwrap()[blockno as usize]
        }

        /// Raw poke below the cache, for seeding disk images.
        pub fn write_raw(&self, blockno: u32, data: &[u8; BSIZE]) {
            self.blocks.lock().unwrap()[blockno as usize] = *data;
        }
    }

    impl BlockDevice for RamDisk {
        fn rw(&self, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
            let mut blocks = self.blocks.lock().unwrap();
            let block = match blocks.get_mut(blockno as usize) {
                Some(b) => b,
                None => panic!("ramdisk: block {} out of range", blockno),
            };
            if write {
                *block = *data;
            } else {
                *data = *block;
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
pub use ram::RamDisk;
