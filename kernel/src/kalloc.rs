//! Physical memory allocator, for user pages, kernel stacks, page-table
//! pages and pipe buffers. Allocates whole 4096-byte frames.
//!
//! Free frames are threaded through their own first word, so the free list
//! costs no memory beyond the frames themselves.

use core::cell::UnsafeCell;
use core::ptr;

use crate::riscv::PGSIZE;
use crate::spinlock::Spinlock;

#[repr(C)]
struct Run {
    next: *mut Run,
}

struct KmemInner {
    freelist: *mut Run,
    // frames handed out live in [base, top); anything else is a caller bug.
    base: usize,
    top: usize,
}

pub struct Kmem {
    lock: Spinlock,
    inner: UnsafeCell<KmemInner>,
}

// `inner` is only touched under `lock`.
unsafe impl Sync for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Kmem {
            lock: Spinlock::new("kmem"),
            inner: UnsafeCell::new(KmemInner {
                freelist: ptr::null_mut(),
                base: 0,
                top: 0,
            }),
        }
    }

    /// Seed the allocator with every whole frame in [base, top).
    pub fn init(&self, base: usize, top: usize) {
        let base = crate::riscv::pgroundup(base);
        self.lock.acquire();
        unsafe {
            let inner = &mut *self.inner.get();
            inner.base = base;
            inner.top = top;
        }
        self.lock.release();

        let mut pa = base;
        while pa + PGSIZE <= top {
            self.kfree(pa as *mut u8);
            pa += PGSIZE;
        }
    }

    /// Free the frame of physical memory pointed at by pa,
    /// which normally should have been returned by a
    /// call to kalloc(). (The exception is when
    /// initializing the allocator; see init above.)
    pub fn kfree(&self, pa: *mut u8) {
        let pa_addr = pa as usize;

        self.lock.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        if pa_addr % PGSIZE != 0 || pa_addr < inner.base || pa_addr >= inner.top {
            panic!("kfree");
        }

        // Fill with junk to catch dangling refs.
        unsafe { ptr::write_bytes(pa, 1, PGSIZE) };

        let r = pa as *mut Run;
        unsafe {
            (*r).next = inner.freelist;
        }
        inner.freelist = r;
        self.lock.release();
    }

    /// Allocate one 4096-byte frame of physical memory.
    /// Returns a pointer that the kernel can use.
    /// Returns null if the memory cannot be allocated.
    pub fn kalloc(&self) -> *mut u8 {
        self.lock.acquire();
        let inner = unsafe { &mut *self.inner.get() };
        let r = inner.freelist;
        if !r.is_null() {
            inner.freelist = unsafe { (*r).next };
        }
        self.lock.release();

        if !r.is_null() {
            unsafe { ptr::write_bytes(r as *mut u8, 5, PGSIZE) }; // fill with junk
        }
        r as *mut u8
    }
}

pub static KMEM: Kmem = Kmem::new();

#[cfg(target_os = "none")]
extern "C" {
    // first address after kernel.
    // defined by kernel.ld.
    static mut end: [u8; 0];
}

/// Called once per boot on the primary CPU: hand the allocator every frame
/// between the kernel image and PHYSTOP.
#[cfg(target_os = "none")]
pub fn kinit() {
    let base = unsafe { core::ptr::addr_of!(end) as usize };
    KMEM.init(base, crate::memlayout::PHYSTOP);
}

/// The hosted "physical memory" is a leaked arena, carved out once on first
/// use so pipe buffers and page-table pages come from the same pool as on
/// metal.
#[cfg(not(target_os = "none"))]
pub fn kinit() {
    use std::sync::Once;

    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        const ARENA_FRAMES: usize = 512;

        #[repr(align(4096))]
        struct Frame([u8; PGSIZE]);

        let arena: &'static mut [Frame] =
            Vec::leak((0..ARENA_FRAMES).map(|_| Frame([0; PGSIZE])).collect());
        let base = arena.as_ptr() as usize;
        KMEM.init(base, base + ARENA_FRAMES * PGSIZE);
    });
}

pub fn kalloc() -> *mut u8 {
    #[cfg(not(target_os = "none"))]
    kinit();
    KMEM.kalloc()
}

pub fn kfree(pa: *mut u8) {
    KMEM.kfree(pa)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4096))]
    struct Frame([u8; PGSIZE]);

    fn arena(frames: usize) -> (Vec<Frame>, usize) {
        let v: Vec<Frame> = (0..frames).map(|_| Frame([0; PGSIZE])).collect();
        let base = v.as_ptr() as usize;
        (v, base)
    }

    #[test]
    fn two_frames_then_exhaustion_then_lifo_reuse() {
        let (_hold, base) = arena(2);
        let k = Kmem::new();
        k.init(base, base + 2 * PGSIZE);

        let a = k.kalloc();
        let b = k.kalloc();
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        for p in [a, b] {
            let addr = p as usize;
            assert_eq!(0, addr % PGSIZE);
            assert!(addr >= base && addr < base + 2 * PGSIZE);
        }

        // pool is empty now.
        assert!(k.kalloc().is_null());

        // the free list is LIFO: freeing b makes it the next frame handed out.
        k.kfree(b);
        assert_eq!(b, k.kalloc());
    }

    #[test]
    fn allocated_frames_carry_the_alloc_fill_pattern() {
        let (_hold, base) = arena(1);
        let k = Kmem::new();
        k.init(base, base + PGSIZE);

        let p = k.kalloc();
        let frame = unsafe { core::slice::from_raw_parts(p, PGSIZE) };
        assert!(frame.iter().all(|&b| b == 5));
        k.kfree(p);
        // after the free, the frame is junked with a different pattern so
        // dangling readers trip over it.
        let frame = unsafe { core::slice::from_raw_parts(p, PGSIZE) };
        assert!(frame.iter().all(|&b| b == 1));
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn freeing_a_misaligned_pointer_is_fatal() {
        let (_hold, base) = arena(1);
        let k = Kmem::new();
        k.init(base, base + PGSIZE);
        k.kfree((base + 8) as *mut u8);
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn freeing_outside_the_managed_range_is_fatal() {
        let (_hold, base) = arena(1);
        let (_other_hold, other) = arena(1);
        let k = Kmem::new();
        k.init(base, base + PGSIZE);
        k.kfree(other as *mut u8);
    }

    #[test]
    fn distinct_outstanding_allocations_never_alias() {
        let (_hold, base) = arena(8);
        let k = Kmem::new();
        k.init(base, base + 8 * PGSIZE);

        let mut frames = Vec::new();
        loop {
            let p = k.kalloc();
            if p.is_null() {
                break;
            }
            frames.push(p as usize);
        }
        assert_eq!(8, frames.len());
        frames.sort_unstable();
        frames.dedup();
        assert_eq!(8, frames.len());
    }
}
