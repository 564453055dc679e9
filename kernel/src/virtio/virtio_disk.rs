//! Driver for qemu's virtio disk device.
//! Uses qemu's mmio interface to virtio.
//!
//! qemu ... -drive file=fs.img,if=none,format=raw,id=x0
//!          -device virtio-blk-device,drive=x0,bus=virtio-mmio-bus.0

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use super::*;
use crate::buf::BlockDevice;
use crate::fs::BSIZE;
use crate::kalloc;
use crate::memlayout::VIRTIO0;
use crate::proc::{sleep, wakeup, Chan};
use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;

fn read_reg(r: usize) -> u32 {
    unsafe { ((VIRTIO0 + r) as *const u32).read_volatile() }
}

fn write_reg(r: usize, v: u32) {
    unsafe { ((VIRTIO0 + r) as *mut u32).write_volatile(v) }
}

/// Track info about in-flight operations, for use when the completion
/// interrupt arrives. Indexed by the first descriptor index of the chain.
#[derive(Copy, Clone)]
struct Info {
    in_flight: bool,
    status: u8,
}

struct DiskInner {
    // a set (not a ring) of DMA descriptors, with which the driver tells
    // the device where to read and write individual disk operations.
    // there are NUM descriptors. most commands consist of a "chain" (a
    // linked list) of a couple of these descriptors.
    desc: *mut VirtqDesc,

    // a ring in which the driver writes descriptor numbers that the driver
    // would like the device to process. it only includes the head
    // descriptor of each chain. the ring has NUM elements.
    avail: *mut VirtqAvail,

    // a ring in which the device writes descriptor numbers that the device
    // has finished processing (just the head of each chain). there are NUM
    // used ring entries.
    used: *mut VirtqUsed,

    // our own book-keeping.
    free: [bool; NUM], // is a descriptor free?
    used_idx: u16,     // we've looked this far in used[2..NUM].
    info: [Info; NUM],

    // disk command headers. one-for-one with descriptors, for convenience.
    ops: [VirtioBlkReq; NUM],
}

struct Disk {
    lock: Spinlock,
    inner: UnsafeCell<DiskInner>,
}

// `inner` is only touched under `lock`.
unsafe impl Sync for Disk {}

static DISK: Disk = Disk {
    lock: Spinlock::new("virtio_disk"),
    inner: UnsafeCell::new(DiskInner {
        desc: ptr::null_mut(),
        avail: ptr::null_mut(),
        used: ptr::null_mut(),
        free: [false; NUM],
        used_idx: 0,
        info: [Info {
            in_flight: false,
            status: 0,
        }; NUM],
        ops: [VirtioBlkReq {
            typ: 0,
            reserved: 0,
            sector: 0,
        }; NUM],
    }),
};

pub fn virtio_disk_init() {
    if read_reg(VIRTIO_MMIO_MAGIC_VALUE) != 0x74726976
        || read_reg(VIRTIO_MMIO_VERSION) != 2
        || read_reg(VIRTIO_MMIO_DEVICE_ID) != 2
        || read_reg(VIRTIO_MMIO_VENDOR_ID) != 0x554d4551
    {
        panic!("could not find virtio disk");
    }

    let mut status = 0;

    // reset device
    write_reg(VIRTIO_MMIO_STATUS, status);

    // set ACKNOWLEDGE status bit
    status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // set DRIVER status bit
    status |= VIRTIO_CONFIG_S_DRIVER;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // negotiate features
    let mut features = read_reg(VIRTIO_MMIO_DEVICE_FEATURES);
    features &= !(1 << VIRTIO_BLK_F_RO);
    features &= !(1 << VIRTIO_BLK_F_SCSI);
    features &= !(1 << VIRTIO_BLK_F_CONFIG_WCE);
    features &= !(1 << VIRTIO_BLK_F_MQ);
    features &= !(1 << VIRTIO_F_ANY_LAYOUT);
    features &= !(1 << VIRTIO_RING_F_EVENT_IDX);
    features &= !(1 << VIRTIO_RING_F_INDIRECT_DESC);
    write_reg(VIRTIO_MMIO_DRIVER_FEATURES, features);

    // tell device that feature negotiation is complete.
    status |= VIRTIO_CONFIG_S_FEATURES_OK;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // re-read status to ensure FEATURES_OK is set.
    status = read_reg(VIRTIO_MMIO_STATUS);
    if status & VIRTIO_CONFIG_S_FEATURES_OK == 0 {
        panic!("virtio disk FEATURES_OK unset");
    }

    // initialize queue 0.
    write_reg(VIRTIO_MMIO_QUEUE_SEL, 0);

    // ensure queue 0 is not in use.
    if read_reg(VIRTIO_MMIO_QUEUE_READY) != 0 {
        panic!("virtio disk should not be ready");
    }

    // check maximum queue size.
    let max = read_reg(VIRTIO_MMIO_QUEUE_NUM_MAX);
    if max == 0 {
        panic!("virtio disk has no queue 0");
    }
    if (max as usize) < NUM {
        panic!("virtio disk max queue too short");
    }

    // allocate and zero queue memory.
    let inner = unsafe { &mut *DISK.inner.get() };
    inner.desc = kalloc::kalloc() as *mut VirtqDesc;
    inner.avail = kalloc::kalloc() as *mut VirtqAvail;
    inner.used = kalloc::kalloc() as *mut VirtqUsed;
    if inner.desc.is_null() || inner.avail.is_null() || inner.used.is_null() {
        panic!("virtio disk kalloc");
    }
    unsafe {
        ptr::write_bytes(inner.desc as *mut u8, 0, PGSIZE);
        ptr::write_bytes(inner.avail as *mut u8, 0, PGSIZE);
        ptr::write_bytes(inner.used as *mut u8, 0, PGSIZE);
    }

    // set queue size.
    write_reg(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);

    // write physical addresses.
    write_reg(VIRTIO_MMIO_QUEUE_DESC_LOW, inner.desc as usize as u32);
    write_reg(VIRTIO_MMIO_QUEUE_DESC_HIGH, (inner.desc as usize >> 32) as u32);
    write_reg(VIRTIO_MMIO_DRIVER_DESC_LOW, inner.avail as usize as u32);
    write_reg(VIRTIO_MMIO_DRIVER_DESC_HIGH, (inner.avail as usize >> 32) as u32);
    write_reg(VIRTIO_MMIO_DEVICE_DESC_LOW, inner.used as usize as u32);
    write_reg(VIRTIO_MMIO_DEVICE_DESC_HIGH, (inner.used as usize >> 32) as u32);

    // queue is ready.
    write_reg(VIRTIO_MMIO_QUEUE_READY, 1);

    // all NUM descriptors start out unused.
    for f in inner.free.iter_mut() {
        *f = true;
    }

    // tell device we're completely ready.
    status |= VIRTIO_CONFIG_S_DRIVER_OK;
    write_reg(VIRTIO_MMIO_STATUS, status);

    // plic.rs and trap.rs arrange for interrupts from VIRTIO0_IRQ.
}

/// Find a free descriptor, mark it non-free, return its index.
fn alloc_desc(inner: &mut DiskInner) -> Option<usize> {
    for i in 0..NUM {
        if inner.free[i] {
            inner.free[i] = false;
            return Some(i);
        }
    }
    None
}

/// Mark a descriptor as free.
fn free_desc(inner: &mut DiskInner, i: usize) {
    if i >= NUM {
        panic!("free_desc 1");
    }
    if inner.free[i] {
        panic!("free_desc 2");
    }
    unsafe {
        (*inner.desc.add(i)).addr = 0;
        (*inner.desc.add(i)).len = 0;
        (*inner.desc.add(i)).flags = 0;
        (*inner.desc.add(i)).next = 0;
    }
    inner.free[i] = true;
    wakeup(Chan::of(&inner.free[0]));
}

/// Free a chain of descriptors.
fn free_chain(inner: &mut DiskInner, mut i: usize) {
    loop {
        let desc = unsafe { *inner.desc.add(i) };
        free_desc(inner, i);
        if desc.flags & VRING_DESC_F_NEXT != 0 {
            i = desc.next as usize;
        } else {
            break;
        }
    }
}

/// Allocate three descriptors (they need not be contiguous).
/// Disk transfers always use three descriptors.
fn alloc3_desc(inner: &mut DiskInner) -> Option<[usize; 3]> {
    let mut idx = [0; 3];
    for i in 0..3 {
        match alloc_desc(inner) {
            Some(d) => idx[i] = d,
            None => {
                for &d in &idx[..i] {
                    free_desc(inner, d);
                }
                return None;
            }
        }
    }
    Some(idx)
}

pub fn virtio_disk_rw(blockno: u32, data: &mut [u8; BSIZE], write: bool) {
    let sector = blockno as u64 * (BSIZE / 512) as u64;

    DISK.lock.acquire();
    let inner = unsafe { &mut *DISK.inner.get() };

    // the spec's Section 5.2 says that legacy block operations use
    // three descriptors: one for type/reserved/sector, one for the
    // data, one for a 1-byte status result.

    // allocate the three descriptors.
    let idx = loop {
        match alloc3_desc(inner) {
            Some(idx) => break idx,
            None => sleep(Chan::of(&inner.free[0]), &DISK.lock),
        }
    };

    // format the three descriptors.

    let buf0 = &mut inner.ops[idx[0]];
    buf0.typ = if write {
        VIRTIO_BLK_T_OUT // write the disk
    } else {
        VIRTIO_BLK_T_IN // read the disk
    };
    buf0.reserved = 0;
    buf0.sector = sector;

    unsafe {
        *inner.desc.add(idx[0]) = VirtqDesc {
            addr: buf0 as *const VirtioBlkReq as u64,
            len: core::mem::size_of::<VirtioBlkReq>() as u32,
            flags: VRING_DESC_F_NEXT,
            next: idx[1] as u16,
        };

        *inner.desc.add(idx[1]) = VirtqDesc {
            addr: data.as_mut_ptr() as u64,
            len: BSIZE as u32,
            // device reads the data for a write, fills it for a read.
            flags: if write { 0 } else { VRING_DESC_F_WRITE } | VRING_DESC_F_NEXT,
            next: idx[2] as u16,
        };

        inner.info[idx[0]].status = 0xff; // device writes 0 on success
        *inner.desc.add(idx[2]) = VirtqDesc {
            addr: &inner.info[idx[0]].status as *const u8 as u64,
            len: 1,
            flags: VRING_DESC_F_WRITE, // device writes the status
            next: 0,
        };
    }

    // record the request is in flight for virtio_disk_intr().
    inner.info[idx[0]].in_flight = true;

    // tell the device the first index in our chain of descriptors.
    unsafe {
        let avail = &mut *inner.avail;
        avail.ring[avail.idx as usize % NUM] = idx[0] as u16;
        fence(Ordering::SeqCst);
        // tell the device another avail ring entry is available.
        avail.idx = avail.idx.wrapping_add(1);
    }
    fence(Ordering::SeqCst);

    write_reg(VIRTIO_MMIO_QUEUE_NOTIFY, 0); // value is queue number

    // wait for virtio_disk_intr() to say the request has finished.
    while inner.info[idx[0]].in_flight {
        sleep(Chan::of(&inner.info[idx[0]]), &DISK.lock);
    }

    if inner.info[idx[0]].status != 0 {
        panic!("virtio_disk_rw: status");
    }
    free_chain(inner, idx[0]);

    DISK.lock.release();
}

pub fn virtio_disk_intr() {
    DISK.lock.acquire();
    let inner = unsafe { &mut *DISK.inner.get() };

    // the device won't raise a second interrupt until we tell it we've
    // seen this one, which the following line does. this may race with the
    // device writing new entries to the "used" ring, in which case we may
    // process the new completion entries in this interrupt, and have
    // nothing to do in the next interrupt, which is harmless.
    write_reg(
        VIRTIO_MMIO_INTERRUPT_ACK,
        read_reg(VIRTIO_MMIO_INTERRUPT_STATUS) & 0x3,
    );

    fence(Ordering::SeqCst);

    // the device increments used->idx when it adds an entry to the used
    // ring.
    let used = unsafe { &*inner.used };
    while inner.used_idx != used.idx {
        fence(Ordering::SeqCst);
        let id = used.ring[inner.used_idx as usize % NUM].id as usize;

        if inner.info[id].status != 0 {
            panic!("virtio_disk_intr status");
        }

        // the request is done: wake up the sleeping virtio_disk_rw().
        inner.info[id].in_flight = false;
        wakeup(Chan::of(&inner.info[id]));

        inner.used_idx = inner.used_idx.wrapping_add(1);
    }

    DISK.lock.release();
}

/// The Bcache's device seam.
pub struct VirtioDisk;

impl BlockDevice for VirtioDisk {
    fn rw(&self, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
        virtio_disk_rw(blockno, data, write);
    }
}
