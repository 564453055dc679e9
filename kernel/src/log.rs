//! Simple logging that allows concurrent FS system calls.
//!
//! A log transaction contains the updates of multiple FS system calls. The
//! logging system only commits when there are no FS system calls active.
//! Thus there is never any reasoning required about whether a commit might
//! write an uncommitted system call's updates to disk.
//!
//! A system call should call begin_op()/end_op() to mark its start and end.
//! Usually begin_op() just increments the count of in-progress FS system
//! calls and returns. But if it thinks the log is close to running out, it
//! sleeps until the last outstanding end_op() commits.
//!
//! The log is a physical re-do log containing disk blocks. The on-disk log
//! format:
//!   header block, containing block #s for block A, B, C, ...
//!   block A
//!   block B
//!   block C
//!   ...
//! Log appends are synchronous.

use core::cell::UnsafeCell;

use crate::bio::{Bcache, BufGuard};
use crate::buf::BlockDevice;
use crate::fs::{SuperBlock, BSIZE};
use crate::param::{LOGSIZE, MAXOPBLOCKS, NBUF};
use crate::proc::{sleep, wakeup, Chan};
use crate::spinlock::Spinlock;

/// Contents of the header block, used for both the on-disk header block and
/// to keep track in memory of logged block# before commit.
struct LogHeader {
    n: u32,
    block: [u32; LOGSIZE],
}

impl LogHeader {
    /// The header block is the commit record; its byte layout is part of
    /// the on-disk format: `n` then `block[LOGSIZE]`, little-endian words.
    fn read_from(data: &[u8; BSIZE]) -> Self {
        let word = |i: usize| {
            let off = i * 4;
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        let mut lh = LogHeader {
            n: word(0),
            block: [0; LOGSIZE],
        };
        for i in 0..LOGSIZE {
            lh.block[i] = word(1 + i);
        }
        lh
    }

    fn write_to(&self, data: &mut [u8; BSIZE]) {
        data[0..4].copy_from_slice(&self.n.to_le_bytes());
        for i in 0..LOGSIZE {
            let off = 4 + i * 4;
            data[off..off + 4].copy_from_slice(&self.block[i].to_le_bytes());
        }
    }
}

struct LogInner {
    start: u32,
    size: u32,
    outstanding: u32, // how many FS sys calls are executing.
    committing: bool, // in commit(), please wait.
    dev: u32,
    lh: LogHeader,
}

pub struct Log<D: BlockDevice + 'static, const N: usize> {
    lock: Spinlock,
    cache: &'static Bcache<D, N>,
    inner: UnsafeCell<LogInner>,
}

// `inner` is guarded by `lock`, except inside commit(), which runs while
// `committing` excludes every other entrant.
unsafe impl<D: BlockDevice, const N: usize> Sync for Log<D, N> {}

impl<D: BlockDevice, const N: usize> Log<D, N> {
    pub const fn new(cache: &'static Bcache<D, N>) -> Self {
        Log {
            lock: Spinlock::new("log"),
            cache,
            inner: UnsafeCell::new(LogInner {
                start: 0,
                size: 0,
                outstanding: 0,
                committing: false,
                dev: 0,
                lh: LogHeader {
                    n: 0,
                    block: [0; LOGSIZE],
                },
            }),
        }
    }

    fn inner(&self) -> &mut LogInner {
        unsafe { &mut *self.inner.get() }
    }

    pub fn init(&self, dev: u32, sb: &SuperBlock) {
        if 4 * (LOGSIZE + 1) >= BSIZE {
            panic!("initlog: too big logheader");
        }
        let inner = self.inner();
        inner.start = sb.logstart;
        inner.size = sb.nlog;
        inner.dev = dev;
        self.recover_from_log();
    }

    /// Read the log header from disk into the in-memory log header.
    pub(crate) fn read_head(&self) {
        let inner = self.inner();
        let buf = self.cache.bread(inner.dev, inner.start);
        inner.lh = LogHeader::read_from(buf.data());
    }

    /// Write the in-memory log header to disk.
    /// This is the true point at which the current transaction commits.
    pub(crate) fn write_head(&self) {
        let inner = self.inner();
        let mut buf = self.cache.bread(inner.dev, inner.start);
        inner.lh.write_to(buf.data_mut());
        buf.bwrite();
    }

    /// Copy committed blocks from the log to their home location.
    pub(crate) fn install_trans(&self, recovering: bool) {
        let inner = self.inner();
        for tail in 0..inner.lh.n {
            let lbuf = self.cache.bread(inner.dev, inner.start + tail + 1); // read log block
            let mut dbuf = self.cache.bread(inner.dev, inner.lh.block[tail as usize]); // read dst
            dbuf.data_mut().copy_from_slice(lbuf.data());
            dbuf.bwrite(); // write dst to disk
            if !recovering {
                self.cache.bunpin(&dbuf);
            }
        }
    }

    /// Copy modified blocks from the cache to the log region.
    pub(crate) fn write_log(&self) {
        let inner = self.inner();
        for tail in 0..inner.lh.n {
            let mut to = self.cache.bread(inner.dev, inner.start + tail + 1); // log block
            let from = self.cache.bread(inner.dev, inner.lh.block[tail as usize]); // cache block
            to.data_mut().copy_from_slice(from.data());
            to.bwrite(); // write the log
        }
    }

    pub(crate) fn recover_from_log(&self) {
        self.read_head();
        self.install_trans(true); // if committed, copy from log to disk
        self.inner().lh.n = 0;
        self.write_head(); // clear the log
    }

    /// Called at the start of each FS system call.
    pub fn begin_op(&self) {
        self.lock.acquire();
        loop {
            let inner = self.inner();
            if inner.committing {
                sleep(Chan::of(self), &self.lock);
            } else if inner.lh.n as usize + (inner.outstanding as usize + 1) * MAXOPBLOCKS
                > LOGSIZE
            {
                // this op might exhaust log space; wait for commit.
                sleep(Chan::of(self), &self.lock);
            } else {
                inner.outstanding += 1;
                self.lock.release();
                break;
            }
        }
    }

    /// Called at the end of each FS system call.
    /// Commits if this was the last outstanding operation.
    pub fn end_op(&self) {
        let mut do_commit = false;

        self.lock.acquire();
        let inner = self.inner();
        inner.outstanding -= 1;
        if inner.committing {
            panic!("log committing");
        }
        if inner.outstanding == 0 {
            do_commit = true;
            inner.committing = true;
        } else {
            // begin_op() may be waiting for log space, and decrementing
            // outstanding has decreased the amount of reserved space.
            wakeup(Chan::of(self));
        }
        self.lock.release();

        if do_commit {
            // call commit without holding locks, since not allowed
            // to sleep with locks.
            self.commit();
            self.lock.acquire();
            self.inner().committing = false;
            wakeup(Chan::of(self));
            self.lock.release();
        }
    }

    fn commit(&self) {
        if self.inner().lh.n > 0 {
            self.write_log(); // write modified blocks from cache to log
            self.write_head(); // write header to disk -- the real commit
            self.install_trans(false); // now install writes to home locations
            self.inner().lh.n = 0;
            self.write_head(); // erase the transaction from the log
        }
    }

    /// The caller has modified b's data and is done with the buffer.
    /// Record the block number and pin the buffer in the cache by
    /// increasing its refcnt; commit()/write_log() will do the disk write.
    ///
    /// log_write() replaces bwrite(); a typical use is:
    ///   let mut bp = bread(...);
    ///   modify bp.data_mut()
    ///   log_write(&bp)
    ///   drop(bp)
    pub fn log_write(&self, b: &BufGuard<'_, D, N>) {
        self.lock.acquire();
        let inner = self.inner();
        if inner.lh.n as usize >= LOGSIZE || inner.lh.n >= inner.size - 1 {
            panic!("too big a transaction");
        }
        if inner.outstanding < 1 {
            panic!("log_write outside of trans");
        }

        let n = inner.lh.n as usize;
        let mut i = 0;
        while i < n {
            if inner.lh.block[i] == b.blockno() {
                // log absorption: one slot per block per transaction.
                break;
            }
            i += 1;
        }
        inner.lh.block[i] = b.blockno();
        if i == n {
            // Add new block to log
            self.cache.bpin(b);
            inner.lh.n += 1;
        }
        self.lock.release();
    }

    #[cfg(test)]
    fn logged(&self) -> (u32, &[u32]) {
        let inner = self.inner();
        (inner.lh.n, &inner.lh.block[..inner.lh.n as usize])
    }
}

#[cfg(target_os = "none")]
mod global {
    use super::*;
    use crate::bio::BCACHE;
    use crate::virtio::virtio_disk::VirtioDisk;

    pub static LOG: Log<VirtioDisk, NBUF> = Log::new(&BCACHE);

    pub fn initlog(dev: u32, sb: &SuperBlock) {
        LOG.init(dev, sb);
    }

    pub fn begin_op() {
        LOG.begin_op();
    }

    pub fn end_op() {
        LOG.end_op();
    }

    pub fn log_write(b: &BufGuard<'_, VirtioDisk, NBUF>) {
        LOG.log_write(b);
    }
}

#[cfg(target_os = "none")]
pub use global::{begin_op, end_op, initlog, log_write, LOG};

#[cfg(not(target_os = "none"))]
mod global {
    use std::sync::OnceLock;

    use super::*;
    use crate::bio::host_bcache;
    use crate::buf::RamDisk;
    use crate::param::ROOTDEV;

    fn host_log() -> &'static Log<RamDisk, NBUF> {
        static LOG: OnceLock<Log<RamDisk, NBUF>> = OnceLock::new();
        LOG.get_or_init(|| {
            let log = Log::new(host_bcache());
            let sb = SuperBlock {
                logstart: 2,
                nlog: (LOGSIZE + 1) as u32,
                ..Default::default()
            };
            log.init(ROOTDEV, &sb);
            log
        })
    }

    pub fn begin_op() {
        host_log().begin_op();
    }

    pub fn end_op() {
        host_log().end_op();
    }
}

#[cfg(not(target_os = "none"))]
pub use global::{begin_op, end_op};

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::bio::Bcache;
    use crate::buf::RamDisk;

    const LOGSTART: u32 = 2;
    const DEV: u32 = 1;

    struct Harness {
        disk: RamDisk,
        cache: &'static Bcache<RamDisk, NBUF>,
        log: &'static Log<RamDisk, NBUF>,
    }

    /// A fresh cache and log over the given disk, as after a reboot.
    fn boot(disk: RamDisk) -> Harness {
        let cache: &'static Bcache<RamDisk, NBUF> =
            Box::leak(Box::new(Bcache::new(disk.clone())));
        let log: &'static Log<RamDisk, NBUF> = Box::leak(Box::new(Log::new(cache)));
        let sb = SuperBlock {
            logstart: LOGSTART,
            nlog: (LOGSIZE + 1) as u32,
            ..Default::default()
        };
        log.init(DEV, &sb);
        Harness { disk, cache, log }
    }

    fn fresh() -> Harness {
        boot(RamDisk::new(256))
    }

    fn write_block(h: &Harness, blockno: u32, byte: u8) {
        let mut b = h.cache.bread(DEV, blockno);
        b.data_mut().fill(byte);
        h.log.log_write(&b);
    }

    #[test]
    fn repeated_writes_to_one_block_occupy_one_slot() {
        let h = fresh();
        h.log.begin_op();

        let mut b = h.cache.bread(DEV, 42);
        b.data_mut().fill(1);
        h.log.log_write(&b);
        let (n_before, _) = h.log.logged();
        b.data_mut().fill(2);
        h.log.log_write(&b);
        drop(b);

        let (n, blocks) = h.log.logged();
        assert_eq!(n_before, n);
        assert_eq!(1, blocks.iter().filter(|&&b| b == 42).count());

        h.log.end_op();
    }

    #[test]
    fn end_op_makes_writes_durable_and_clears_the_header() {
        let h = fresh();

        h.log.begin_op();
        write_block(&h, 100, 0xaa);
        write_block(&h, 200, 0xbb);
        h.log.end_op();

        assert!(h.disk.read_raw(100).iter().all(|&b| b == 0xaa));
        assert!(h.disk.read_raw(200).iter().all(|&b| b == 0xbb));

        // quiescent log: the on-disk header records no transaction.
        let head = LogHeader::read_from(&h.disk.read_raw(LOGSTART));
        assert_eq!(0, head.n);
    }

    #[test]
    fn crash_after_header_commit_replays_the_transaction() {
        let h = fresh();

        h.log.begin_op();
        write_block(&h, 100, 0xaa);
        write_block(&h, 200, 0xbb);

        // run the first half of commit by hand: bodies, then the header.
        // the machine dies before install_trans runs.
        h.log.write_log();
        h.log.write_head();

        assert!(h.disk.read_raw(100).iter().all(|&b| b == 0));
        assert!(h.disk.read_raw(200).iter().all(|&b| b == 0));

        // reboot: recovery must replay both blocks and clear the log.
        let h2 = boot(h.disk.clone());
        assert!(h2.disk.read_raw(100).iter().all(|&b| b == 0xaa));
        assert!(h2.disk.read_raw(200).iter().all(|&b| b == 0xbb));
        let head = LogHeader::read_from(&h2.disk.read_raw(LOGSTART));
        assert_eq!(0, head.n);
    }

    #[test]
    fn crash_before_header_commit_discards_the_transaction() {
        let h = fresh();
        h.disk.write_raw(100, &[0x11; BSIZE]);
        h.disk.write_raw(200, &[0x22; BSIZE]);
        // the cache must see the seeded contents.
        let h = boot(h.disk.clone());

        h.log.begin_op();
        write_block(&h, 100, 0xaa);
        write_block(&h, 200, 0xbb);

        // bodies land in the log region, but the power is cut before the
        // header write: nothing committed.
        h.log.write_log();

        let h2 = boot(h.disk.clone());
        assert!(h2.disk.read_raw(100).iter().all(|&b| b == 0x11));
        assert!(h2.disk.read_raw(200).iter().all(|&b| b == 0x22));
        let head = LogHeader::read_from(&h2.disk.read_raw(LOGSTART));
        assert_eq!(0, head.n);
    }

    #[test]
    fn recovery_is_idempotent() {
        let h = fresh();

        h.log.begin_op();
        write_block(&h, 100, 0xaa);
        h.log.write_log();
        h.log.write_head();

        let h2 = boot(h.disk.clone());
        let h3 = boot(h2.disk.clone());
        assert!(h3.disk.read_raw(100).iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn concurrent_ops_group_commit() {
        let h = Arc::new(fresh());

        let mut handles = Vec::new();
        for t in 0..4u32 {
            let h = Arc::clone(&h);
            handles.push(thread::spawn(move || {
                for round in 0..10u32 {
                    h.log.begin_op();
                    write_block(&h, 100 + t, (1 + t + round) as u8);
                    h.log.end_op();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // every op committed: each home block carries its final value.
        for t in 0..4u32 {
            assert!(h
                .disk
                .read_raw(100 + t)
                .iter()
                .all(|&b| b == (10 + t) as u8));
        }
        let head = LogHeader::read_from(&h.disk.read_raw(LOGSTART));
        assert_eq!(0, head.n);
    }

    #[test]
    #[should_panic(expected = "log_write outside of trans")]
    fn log_write_without_an_open_op_is_fatal() {
        let h = fresh();
        let b = h.cache.bread(DEV, 50);
        h.log.log_write(&b);
    }
}
