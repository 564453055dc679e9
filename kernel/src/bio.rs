//! Buffer cache.
//!
//! The buffer cache is a fixed pool of buf structures holding cached copies
//! of disk block contents. Caching disk blocks in memory reduces the number
//! of disk reads and also provides a synchronization point for disk blocks
//! used by multiple processes.
//!
//! Interface:
//! * To get a buffer for a particular disk block, call bread.
//! * After changing buffer data, call bwrite to write it to disk.
//! * A buffer is released (brelse) when its guard is dropped.
//! * Only one process at a time can use a buffer,
//!   so do not keep them longer than necessary.
//!
//! The pool is ordered by how recently each buffer was used: a doubly linked
//! list of slot indices hangs off a sentinel, head-next being the most
//! recently released buffer and head-prev the least.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::buf::{BlockDevice, Buf};
use crate::fs::BSIZE;
use crate::param::NBUF;
use crate::spinlock::Spinlock;

// slot index used for the sentinel's own links.
const HEAD: usize = usize::MAX;

struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    prev: usize, // LRU cache list
    next: usize,
}

struct Pool<const N: usize> {
    meta: [BufMeta; N],
    head_next: usize, // most recently used
    head_prev: usize, // least recently used
}

impl<const N: usize> Pool<N> {
    const fn new() -> Self {
        let mut meta = [const {
            BufMeta {
                dev: 0,
                blockno: 0,
                refcnt: 0,
                prev: 0,
                next: 0,
            }
        }; N];

        // chain every slot into the list at construction time.
        let mut i = 0;
        while i < N {
            meta[i].prev = if i == 0 { HEAD } else { i - 1 };
            meta[i].next = if i == N - 1 { HEAD } else { i + 1 };
            i += 1;
        }
        Pool {
            meta,
            head_next: 0,
            head_prev: N - 1,
        }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.meta[i].prev, self.meta[i].next);
        match prev {
            HEAD => self.head_next = next,
            p => self.meta[p].next = next,
        }
        match next {
            HEAD => self.head_prev = prev,
            n => self.meta[n].prev = prev,
        }
    }

    // insert at the MRU end.
    fn link_front(&mut self, i: usize) {
        self.meta[i].prev = HEAD;
        self.meta[i].next = self.head_next;
        match self.head_next {
            HEAD => self.head_prev = i,
            n => self.meta[n].prev = i,
        }
        self.head_next = i;
    }
}

pub struct Bcache<D: BlockDevice, const N: usize> {
    lock: Spinlock,
    disk: D,
    pool: UnsafeCell<Pool<N>>,
    bufs: [Buf; N],
}

// the pool is only touched under `lock`; buffer data is guarded by each
// buffer's sleep lock.
unsafe impl<D: BlockDevice, const N: usize> Sync for Bcache<D, N> {}

impl<D: BlockDevice, const N: usize> Bcache<D, N> {
    pub const fn new(disk: D) -> Self {
        Bcache {
            lock: Spinlock::new("bcache"),
            disk,
            pool: UnsafeCell::new(Pool::new()),
            bufs: [const { Buf::new() }; N],
        }
    }

    /// Look through the cache for block on device dev.
    /// If not found, recycle the least recently used unused buffer.
    /// In either case, return a sleep-locked guard.
    fn bget(&self, dev: u32, blockno: u32) -> BufGuard<'_, D, N> {
        self.lock.acquire();
        let pool = unsafe { &mut *self.pool.get() };

        // Is the block already cached?
        let mut i = pool.head_next;
        while i != HEAD {
            if pool.meta[i].dev == dev && pool.meta[i].blockno == blockno {
                pool.meta[i].refcnt += 1;
                self.lock.release();
                // never take the sleep lock while holding the cache lock.
                self.bufs[i].lock.acquire_sleep();
                return BufGuard {
                    cache: self,
                    idx: i,
                    dev,
                    blockno,
                };
            }
            i = pool.meta[i].next;
        }

        // Not cached.
        // Recycle the least recently used (LRU) unused buffer.
        let mut i = pool.head_prev;
        while i != HEAD {
            if pool.meta[i].refcnt == 0 {
                pool.meta[i].dev = dev;
                pool.meta[i].blockno = blockno;
                pool.meta[i].refcnt = 1;
                // the repurposed slot holds stale bytes of its old identity.
                self.bufs[i].valid.set(false);
                self.lock.release();
                self.bufs[i].lock.acquire_sleep();
                return BufGuard {
                    cache: self,
                    idx: i,
                    dev,
                    blockno,
                };
            }
            i = pool.meta[i].prev;
        }

        self.lock.release();
        panic!("bget: no buffers");
    }

    /// Return a locked guard with the contents of the indicated block.
    pub fn bread(&self, dev: u32, blockno: u32) -> BufGuard<'_, D, N> {
        let mut b = self.bget(dev, blockno);
        if !b.buf().valid.get() {
            self.disk.rw(blockno, b.data_mut(), false);
            b.buf().valid.set(true);
        }
        b
    }

    /// Pin the buffer in the cache: it will not be recycled until a
    /// matching bunpin, even after its guard is dropped. Log-only.
    pub fn bpin(&self, b: &BufGuard<'_, D, N>) {
        self.lock.acquire();
        let pool = unsafe { &mut *self.pool.get() };
        pool.meta[b.idx].refcnt += 1;
        self.lock.release();
    }

    pub fn bunpin(&self, b: &BufGuard<'_, D, N>) {
        self.lock.acquire();
        let pool = unsafe { &mut *self.pool.get() };
        pool.meta[b.idx].refcnt -= 1;
        self.lock.release();
    }

    /// How many distinct live cache entries carry this identity.
    #[cfg(test)]
    fn entries(&self, dev: u32, blockno: u32) -> usize {
        self.lock.acquire();
        let pool = unsafe { &*self.pool.get() };
        let n = pool
            .meta
            .iter()
            .filter(|m| m.refcnt > 0 && m.dev == dev && m.blockno == blockno)
            .count();
        self.lock.release();
        n
    }

    /// Whether the block is present in the cache (any refcnt).
    #[cfg(test)]
    fn cached(&self, dev: u32, blockno: u32) -> bool {
        self.lock.acquire();
        let pool = unsafe { &*self.pool.get() };
        let hit = pool
            .meta
            .iter()
            .any(|m| m.dev == dev && m.blockno == blockno);
        self.lock.release();
        hit
    }
}

/// A sleep-locked, checked-out buffer. Dropping the guard is brelse: it
/// releases the sleep lock and, once the slot's refcnt falls to zero, moves
/// the buffer to the most-recently-used end of the list.
pub struct BufGuard<'a, D: BlockDevice, const N: usize> {
    cache: &'a Bcache<D, N>,
    idx: usize,
    dev: u32,
    blockno: u32,
}

impl<'a, D: BlockDevice, const N: usize> BufGuard<'a, D, N> {
    fn buf(&self) -> &Buf {
        &self.cache.bufs[self.idx]
    }

    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    pub fn data(&self) -> &[u8; BSIZE] {
        // the guard holds the sleep lock, so the data cannot move under us.
        unsafe { &*self.buf().data.get() }
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        unsafe { &mut *self.buf().data.get() }
    }

    /// Write the buffer's contents to disk. The guard proves the caller
    /// holds the sleep lock.
    pub fn bwrite(&mut self) {
        let blockno = self.blockno;
        self.cache.disk.rw(blockno, self.data_mut(), true);
    }
}

impl<'a, D: BlockDevice, const N: usize> Deref for BufGuard<'a, D, N> {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        self.data()
    }
}

impl<'a, D: BlockDevice, const N: usize> DerefMut for BufGuard<'a, D, N> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.data_mut()
    }
}

impl<'a, D: BlockDevice, const N: usize> Drop for BufGuard<'a, D, N> {
    fn drop(&mut self) {
        self.buf().lock.release_sleep();

        self.cache.lock.acquire();
        let pool = unsafe { &mut *self.cache.pool.get() };
        pool.meta[self.idx].refcnt -= 1;
        if pool.meta[self.idx].refcnt == 0 {
            // no one is waiting for it; move to the MRU end.
            pool.unlink(self.idx);
            pool.link_front(self.idx);
        }
        self.cache.lock.release();
    }
}

/// Explicit spelling of guard drop, matching the classic interface.
pub fn brelse<D: BlockDevice, const N: usize>(b: BufGuard<'_, D, N>) {
    drop(b);
}

#[cfg(target_os = "none")]
mod global {
    use super::*;
    use crate::virtio::virtio_disk::VirtioDisk;

    pub static BCACHE: Bcache<VirtioDisk, NBUF> = Bcache::new(VirtioDisk);

    pub fn binit() {
        // the pool and its LRU links are built at construction time; the
        // call marks the spot in the boot sequence.
    }

    pub fn bread(dev: u32, blockno: u32) -> BufGuard<'static, VirtioDisk, NBUF> {
        BCACHE.bread(dev, blockno)
    }
}

#[cfg(target_os = "none")]
pub use global::{binit, bread, BCACHE};

/// The hosted kernel singleton backing the global log and fs paths.
#[cfg(not(target_os = "none"))]
mod global {
    use std::sync::OnceLock;

    use super::*;
    use crate::buf::RamDisk;
    use crate::param::FSSIZE;

    static BCACHE: OnceLock<&'static Bcache<RamDisk, NBUF>> = OnceLock::new();

    pub fn host_bcache() -> &'static Bcache<RamDisk, NBUF> {
        BCACHE.get_or_init(|| Box::leak(Box::new(Bcache::new(RamDisk::new(FSSIZE)))))
    }

    pub fn bread(dev: u32, blockno: u32) -> BufGuard<'static, RamDisk, NBUF> {
        host_bcache().bread(dev, blockno)
    }
}

#[cfg(not(target_os = "none"))]
pub use global::{bread, host_bcache};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buf::RamDisk;
    use std::sync::Arc;
    use std::thread;

    fn filled(byte: u8) -> [u8; BSIZE] {
        [byte; BSIZE]
    }

    #[test]
    fn bread_returns_disk_contents_and_caches_them() {
        let disk = RamDisk::new(16);
        disk.write_raw(3, &filled(0xab));
        let cache: Bcache<RamDisk, 4> = Bcache::new(disk.clone());

        let b = cache.bread(1, 3);
        assert_eq!(0xab, b[0]);
        assert_eq!((1, 3), (b.dev(), b.blockno()));
        drop(b);

        // a second read is served from the cache even if the disk changed
        // underneath.
        disk.write_raw(3, &filled(0xcd));
        let b = cache.bread(1, 3);
        assert_eq!(0xab, b[0]);
    }

    #[test]
    fn bwrite_reaches_the_disk() {
        let disk = RamDisk::new(16);
        let cache: Bcache<RamDisk, 4> = Bcache::new(disk.clone());

        let mut b = cache.bread(1, 5);
        b[10] = 0x77;
        b.bwrite();
        drop(b);

        assert_eq!(0x77, disk.read_raw(5)[10]);
    }

    #[test]
    fn fourth_block_evicts_the_least_recently_released() {
        let disk = RamDisk::new(32);
        let cache: Bcache<RamDisk, 3> = Bcache::new(disk);

        for bno in [10, 11, 12] {
            brelse(cache.bread(1, bno));
        }
        brelse(cache.bread(1, 13));

        // block 10 was the LRU victim; 11 and 12 survive.
        assert!(!cache.cached(1, 10));
        assert!(cache.cached(1, 11));
        assert!(cache.cached(1, 12));
        assert!(cache.cached(1, 13));
    }

    #[test]
    fn rereleasing_refreshes_lru_position() {
        let disk = RamDisk::new(32);
        let cache: Bcache<RamDisk, 3> = Bcache::new(disk);

        for bno in [10, 11, 12] {
            drop(cache.bread(1, bno));
        }
        // touch 10 again: now 11 is the oldest release.
        drop(cache.bread(1, 10));
        drop(cache.bread(1, 13));

        assert!(cache.cached(1, 10));
        assert!(!cache.cached(1, 11));
    }

    #[test]
    fn pinned_buffers_survive_eviction_pressure() {
        let disk = RamDisk::new(32);
        let cache: Bcache<RamDisk, 3> = Bcache::new(disk);

        let b = cache.bread(1, 20);
        cache.bpin(&b);
        drop(b);

        for bno in [21, 22, 23, 24] {
            drop(cache.bread(1, bno));
        }
        assert!(cache.cached(1, 20));

        let b = cache.bread(1, 20);
        cache.bunpin(&b);
        drop(b);
        for bno in [25, 26, 27] {
            drop(cache.bread(1, bno));
        }
        assert!(!cache.cached(1, 20));
    }

    #[test]
    fn racing_readers_share_one_identity() {
        let disk = RamDisk::new(16);
        let cache: Arc<Bcache<RamDisk, 8>> = Arc::new(Bcache::new(disk));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                for _ in 0..200 {
                    let b = cache.bread(1, 7);
                    assert_eq!(1, cache.entries(1, 7));
                    drop(b);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(0, cache.entries(1, 7));
    }

    #[test]
    fn writes_made_under_the_lock_are_seen_by_the_next_holder() {
        let disk = RamDisk::new(16);
        let cache: Arc<Bcache<RamDisk, 4>> = Arc::new(Bcache::new(disk));

        {
            let mut b = cache.bread(1, 2);
            b[0] = 42;
        }
        let c2 = Arc::clone(&cache);
        let seen = thread::spawn(move || c2.bread(1, 2)[0]).join().unwrap();
        assert_eq!(42, seen);
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn exhausting_the_pool_is_fatal() {
        let disk = RamDisk::new(16);
        let cache: Bcache<RamDisk, 2> = Bcache::new(disk);

        let _a = cache.bread(1, 1);
        let _b = cache.bread(1, 2);
        let _c = cache.bread(1, 3);
    }
}
