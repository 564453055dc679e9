//! Virtual memory: page tables and the user-memory copy helpers.
//!
//! The bare-metal half is the Sv39 three-level table the hardware walks.
//! The hosted half keeps the same call surface over a page-granular map, so
//! address-space code (exec in particular) runs unchanged under tests —
//! including the user bit, which is what makes stack guard pages reject
//! copyout.

#[cfg(target_os = "none")]
mod sv39 {
    use crate::kalloc;
    use crate::memlayout::{KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, UART0, VIRTIO0};
    use crate::proc::proc_mapstacks;
    use crate::riscv::{
        make_satp, pgrounddown, pgroundup, sfence_vma, w_satp, PteFlags, MAXVA, PGSHIFT, PGSIZE,
    };
    use core::ptr;

    extern "C" {
        static etext: u8; // kernel.ld sets this to end of kernel code.
        static trampoline: u8; // trampoline.S
    }

    const PTE_V: usize = PteFlags::V.bits();

    // shift a physical address to the right place for a PTE, and back.
    const fn pa2pte(pa: usize) -> usize {
        (pa >> PGSHIFT) << 10
    }

    const fn pte2pa(pte: usize) -> usize {
        (pte >> 10) << PGSHIFT
    }

    const fn pte_flags(pte: usize) -> usize {
        pte & 0x3FF
    }

    // extract the three 9-bit page table indices from a virtual address.
    const fn px(level: usize, va: usize) -> usize {
        (va >> (PGSHIFT + 9 * level)) & 0x1FF
    }

    /// An Sv39 page table: one page of 512 PTEs. Interior pages hang off
    /// valid non-leaf entries.
    #[repr(C, align(4096))]
    pub struct PageTable([usize; 512]);

    /// The kernel's page table, built once at boot.
    static mut KERNEL_PAGETABLE: *mut PageTable = ptr::null_mut();

    /// Make a direct-map page table for the kernel.
    fn kvmmake() -> &'static mut PageTable {
        let kpgtbl = match uvmcreate() {
            Some(pt) => pt,
            None => panic!("kvmmake: out of memory"),
        };

        // uart registers
        kvmmap(kpgtbl, UART0, UART0, PGSIZE, PteFlags::R | PteFlags::W);

        // virtio mmio disk interface
        kvmmap(kpgtbl, VIRTIO0, VIRTIO0, PGSIZE, PteFlags::R | PteFlags::W);

        // PLIC
        kvmmap(kpgtbl, PLIC, PLIC, 0x40_0000, PteFlags::R | PteFlags::W);

        let etext = unsafe { &etext as *const u8 as usize };

        // map kernel text executable and read-only.
        kvmmap(
            kpgtbl,
            KERNBASE,
            KERNBASE,
            etext - KERNBASE,
            PteFlags::R | PteFlags::X,
        );

        // map kernel data and the physical RAM we'll make use of.
        kvmmap(
            kpgtbl,
            etext,
            etext,
            PHYSTOP - etext,
            PteFlags::R | PteFlags::W,
        );

        // map the trampoline for trap entry/exit to
        // the highest virtual address in the kernel.
        let tramp = unsafe { &trampoline as *const u8 as usize };
        kvmmap(kpgtbl, TRAMPOLINE, tramp, PGSIZE, PteFlags::R | PteFlags::X);

        // allocate and map a kernel stack for each process.
        proc_mapstacks(kpgtbl);

        kpgtbl
    }

    /// Initialize the one kernel page table.
    pub fn kvminit() {
        unsafe { KERNEL_PAGETABLE = kvmmake() };
    }

    /// Switch the hardware page table register to the kernel's page table,
    /// and enable paging.
    pub fn kvminithart() {
        // wait for any previous writes to the page table memory to finish.
        sfence_vma();

        w_satp(make_satp(unsafe { KERNEL_PAGETABLE } as usize));

        // flush stale entries from the TLB.
        sfence_vma();
    }

    /// Return the address of the PTE in page table pagetable that
    /// corresponds to virtual address va. If alloc, create any required
    /// page-table pages.
    ///
    /// The risc-v Sv39 scheme has three levels of page-table pages. A
    /// page-table page contains 512 64-bit PTEs.
    /// A 64-bit virtual address is split into five fields:
    ///   39..63 -- must be zero.
    ///   30..38 -- 9 bits of level-2 index.
    ///   21..29 -- 9 bits of level-1 index.
    ///   12..20 -- 9 bits of level-0 index.
    ///    0..11 -- 12 bits of byte offset within the page.
    fn walk(pagetable: &mut PageTable, va: usize, alloc: bool) -> Option<&mut usize> {
        if va >= MAXVA {
            panic!("walk");
        }

        let mut pt = pagetable as *mut PageTable;
        for level in [2, 1] {
            let pte = unsafe { &mut (*pt).0[px(level, va)] };
            if *pte & PTE_V != 0 {
                pt = pte2pa(*pte) as *mut PageTable;
            } else {
                if !alloc {
                    return None;
                }
                let next = kalloc::kalloc();
                if next.is_null() {
                    return None;
                }
                unsafe { ptr::write_bytes(next, 0, PGSIZE) };
                *pte = pa2pte(next as usize) | PTE_V;
                pt = next as *mut PageTable;
            }
        }
        Some(unsafe { &mut (*pt).0[px(0, va)] })
    }

    /// Look up a virtual address, return the physical address, or None if
    /// not mapped for user access. Can only be used to look up user pages.
    pub fn walkaddr(pagetable: &mut PageTable, va: usize) -> Option<usize> {
        if va >= MAXVA {
            return None;
        }
        let pte = *walk(pagetable, va, false)?;
        if pte & PTE_V == 0 || pte & PteFlags::U.bits() == 0 {
            return None;
        }
        Some(pte2pa(pte))
    }

    /// Add a mapping to the kernel page table; only used when booting.
    /// Does not flush TLB or enable paging.
    pub fn kvmmap(kpgtbl: &mut PageTable, va: usize, pa: usize, sz: usize, perm: PteFlags) {
        if mappages(kpgtbl, va, pa, sz, perm).is_err() {
            panic!("kvmmap");
        }
    }

    /// Create PTEs for virtual addresses starting at va that refer to
    /// physical addresses starting at pa. va and size might not be
    /// page-aligned. Fails if walk() couldn't allocate a needed page-table
    /// page.
    pub fn mappages(
        pagetable: &mut PageTable,
        va: usize,
        pa: usize,
        size: usize,
        perm: PteFlags,
    ) -> Result<(), ()> {
        if size == 0 {
            panic!("mappages: size");
        }

        let mut a = pgrounddown(va);
        let last = pgrounddown(va + size - 1);
        let mut pa = pa;
        loop {
            let pte = walk(pagetable, a, true).ok_or(())?;
            if *pte & PTE_V != 0 {
                panic!("mappages: remap");
            }
            *pte = pa2pte(pa) | perm.bits() | PTE_V;
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Remove npages of mappings starting from va. va must be page-aligned.
    /// The mappings must exist. Optionally free the physical memory.
    pub fn uvmunmap(pagetable: &mut PageTable, va: usize, npages: usize, do_free: bool) {
        if va % PGSIZE != 0 {
            panic!("uvmunmap: not aligned");
        }

        for a in (va..va + npages * PGSIZE).step_by(PGSIZE) {
            let pte = match walk(pagetable, a, false) {
                Some(pte) => pte,
                None => panic!("uvmunmap: walk"),
            };
            if *pte & PTE_V == 0 {
                panic!("uvmunmap: not mapped");
            }
            if pte_flags(*pte) == PTE_V {
                panic!("uvmunmap: not a leaf");
            }
            if do_free {
                kalloc::kfree(pte2pa(*pte) as *mut u8);
            }
            *pte = 0;
        }
    }

    /// Create an empty user page table.
    /// Returns None if out of memory.
    pub fn uvmcreate() -> Option<&'static mut PageTable> {
        let page = kalloc::kalloc();
        if page.is_null() {
            return None;
        }
        unsafe {
            ptr::write_bytes(page, 0, PGSIZE);
            Some(&mut *(page as *mut PageTable))
        }
    }

    /// Load the user initcode into address 0 of pagetable, for the very
    /// first process. sz must be less than a page.
    pub fn uvmfirst(pagetable: &mut PageTable, src: *const u8, sz: usize) {
        if sz >= PGSIZE {
            panic!("uvmfirst: more than a page");
        }

        let mem = kalloc::kalloc();
        unsafe { ptr::write_bytes(mem, 0, PGSIZE) };
        if mappages(
            pagetable,
            0,
            mem as usize,
            PGSIZE,
            PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
        )
        .is_err()
        {
            panic!("uvmfirst: mappages");
        }
        unsafe { ptr::copy(src, mem, sz) };
    }

    /// Allocate PTEs and physical memory to grow process from oldsz to
    /// newsz, which need not be page aligned. Returns the new size or None
    /// on error.
    pub fn uvmalloc(
        pagetable: &mut PageTable,
        oldsz: usize,
        newsz: usize,
        xperm: PteFlags,
    ) -> Option<usize> {
        if newsz < oldsz {
            return Some(oldsz);
        }

        let oldsz = pgroundup(oldsz);
        for a in (oldsz..newsz).step_by(PGSIZE) {
            let mem = kalloc::kalloc();
            if mem.is_null() {
                uvmdealloc(pagetable, a, oldsz);
                return None;
            }
            unsafe { ptr::write_bytes(mem, 0, PGSIZE) };
            if mappages(
                pagetable,
                a,
                mem as usize,
                PGSIZE,
                PteFlags::R | PteFlags::U | xperm,
            )
            .is_err()
            {
                kalloc::kfree(mem);
                uvmdealloc(pagetable, a, oldsz);
                return None;
            }
        }
        Some(newsz)
    }

    /// Deallocate user pages to bring the process size from oldsz to newsz.
    /// Returns the new process size.
    pub fn uvmdealloc(pagetable: &mut PageTable, oldsz: usize, newsz: usize) -> usize {
        if newsz >= oldsz {
            return oldsz;
        }

        if pgroundup(newsz) < pgroundup(oldsz) {
            let npages = (pgroundup(oldsz) - pgroundup(newsz)) / PGSIZE;
            uvmunmap(pagetable, pgroundup(newsz), npages, true);
        }
        newsz
    }

    /// Recursively free page-table pages.
    /// All leaf mappings must already have been removed.
    fn freewalk(pagetable: &mut PageTable) {
        // there are 2^9 = 512 PTEs in a page table.
        for i in 0..512 {
            let pte = pagetable.0[i];
            if pte & PTE_V != 0 && pte & (PteFlags::R | PteFlags::W | PteFlags::X).bits() == 0 {
                // this PTE points to a lower-level page table.
                let child = pte2pa(pte) as *mut PageTable;
                freewalk(unsafe { &mut *child });
                pagetable.0[i] = 0;
            } else if pte & PTE_V != 0 {
                panic!("freewalk: leaf");
            }
        }
        kalloc::kfree(pagetable as *mut PageTable as *mut u8);
    }

    /// Free user memory pages, then free page-table pages.
    pub fn uvmfree(pagetable: &mut PageTable, sz: usize) {
        if sz > 0 {
            uvmunmap(pagetable, 0, pgroundup(sz) / PGSIZE, true);
        }
        freewalk(pagetable);
    }

    /// Mark a PTE invalid for user access: used by exec for the user stack
    /// guard page.
    pub fn uvmclear(pagetable: &mut PageTable, va: usize) {
        let pte = match walk(pagetable, va, false) {
            Some(pte) => pte,
            None => panic!("uvmclear"),
        };
        *pte &= !PteFlags::U.bits();
    }

    /// Copy from kernel to user. Returns Err if a destination page is
    /// missing or not user-accessible.
    pub fn copyout(
        pagetable: &mut PageTable,
        dstva: usize,
        src: *const u8,
        len: usize,
    ) -> Result<(), ()> {
        let mut len = len;
        let mut dstva = dstva;
        let mut src = src;
        while len > 0 {
            let va0 = pgrounddown(dstva);
            let pa0 = walkaddr(pagetable, va0).ok_or(())?;
            let n = core::cmp::min(PGSIZE - (dstva - va0), len);
            unsafe { ptr::copy(src, (pa0 + (dstva - va0)) as *mut u8, n) };
            len -= n;
            src = unsafe { src.add(n) };
            dstva = va0 + PGSIZE;
        }
        Ok(())
    }

    /// Copy from user to kernel.
    pub fn copyin(
        pagetable: &mut PageTable,
        dst: *mut u8,
        srcva: usize,
        len: usize,
    ) -> Result<(), ()> {
        let mut len = len;
        let mut srcva = srcva;
        let mut dst = dst;
        while len > 0 {
            let va0 = pgrounddown(srcva);
            let pa0 = walkaddr(pagetable, va0).ok_or(())?;
            let n = core::cmp::min(PGSIZE - (srcva - va0), len);
            unsafe { ptr::copy((pa0 + (srcva - va0)) as *const u8, dst, n) };
            len -= n;
            dst = unsafe { dst.add(n) };
            srcva = va0 + PGSIZE;
        }
        Ok(())
    }

    /// Copy a null-terminated string from user to kernel, at most max
    /// bytes. Returns the string length (excluding the nul) on success.
    pub fn copyinstr(
        pagetable: &mut PageTable,
        dst: &mut [u8],
        srcva: usize,
        max: usize,
    ) -> Result<usize, ()> {
        let max = core::cmp::min(max, dst.len());
        let mut srcva = srcva;
        let mut copied = 0;
        while copied < max {
            let va0 = pgrounddown(srcva);
            let pa0 = walkaddr(pagetable, va0).ok_or(())?;
            let n = core::cmp::min(PGSIZE - (srcva - va0), max - copied);
            for i in 0..n {
                let c = unsafe { *((pa0 + (srcva - va0) + i) as *const u8) };
                if c == 0 {
                    return Ok(copied + i);
                }
                dst[copied + i] = c;
            }
            copied += n;
            srcva = va0 + PGSIZE;
        }
        Err(())
    }
}

#[cfg(target_os = "none")]
pub use sv39::*;

#[cfg(not(target_os = "none"))]
mod sim {
    use std::collections::BTreeMap;

    use crate::riscv::{pgrounddown, pgroundup, PteFlags, PGSIZE};

    #[repr(align(4096))]
    struct Frame([u8; PGSIZE]);

    struct PageEntry {
        frame: Box<Frame>,
        flags: PteFlags,
    }

    /// Page-granular address space: va -> (frame, flags). The physical
    /// address of a page is its frame's host address, which keeps loadseg's
    /// "write straight to the frame" path working.
    pub struct PageTable {
        pages: BTreeMap<usize, PageEntry>,
    }

    pub fn uvmcreate() -> Option<&'static mut PageTable> {
        Some(Box::leak(Box::new(PageTable {
            pages: BTreeMap::new(),
        })))
    }

    pub fn uvmalloc(
        pagetable: &mut PageTable,
        oldsz: usize,
        newsz: usize,
        xperm: PteFlags,
    ) -> Option<usize> {
        if newsz < oldsz {
            return Some(oldsz);
        }
        for va in (pgroundup(oldsz)..newsz).step_by(PGSIZE) {
            pagetable.pages.insert(
                va,
                PageEntry {
                    frame: Box::new(Frame([0; PGSIZE])),
                    flags: PteFlags::R | PteFlags::U | xperm,
                },
            );
        }
        Some(newsz)
    }

    pub fn uvmclear(pagetable: &mut PageTable, va: usize) {
        match pagetable.pages.get_mut(&pgrounddown(va)) {
            Some(entry) => entry.flags.remove(PteFlags::U),
            None => panic!("uvmclear"),
        }
    }

    pub fn uvmfree(pagetable: &mut PageTable, _sz: usize) {
        // the table and its frames were leaked out of uvmcreate; reclaim.
        unsafe { drop(Box::from_raw(pagetable)) };
    }

    pub fn walkaddr(pagetable: &mut PageTable, va: usize) -> Option<usize> {
        let entry = pagetable.pages.get(&pgrounddown(va))?;
        if !entry.flags.contains(PteFlags::U) {
            return None;
        }
        Some(entry.frame.0.as_ptr() as usize + (va - pgrounddown(va)))
    }

    pub fn copyout(
        pagetable: &mut PageTable,
        dstva: usize,
        src: *const u8,
        len: usize,
    ) -> Result<(), ()> {
        // an empty table belongs to a plain host process: treat addresses
        // as the host addresses they are.
        if pagetable.pages.is_empty() {
            unsafe { core::ptr::copy(src, dstva as *mut u8, len) };
            return Ok(());
        }
        let mut len = len;
        let mut dstva = dstva;
        let mut src = src;
        while len > 0 {
            let va0 = pgrounddown(dstva);
            let pa = walkaddr(pagetable, dstva).ok_or(())?;
            let n = core::cmp::min(PGSIZE - (dstva - va0), len);
            unsafe { core::ptr::copy(src, pa as *mut u8, n) };
            len -= n;
            src = unsafe { src.add(n) };
            dstva = va0 + PGSIZE;
        }
        Ok(())
    }

    pub fn copyin(
        pagetable: &mut PageTable,
        dst: *mut u8,
        srcva: usize,
        len: usize,
    ) -> Result<(), ()> {
        if pagetable.pages.is_empty() {
            unsafe { core::ptr::copy(srcva as *const u8, dst, len) };
            return Ok(());
        }
        let mut len = len;
        let mut srcva = srcva;
        let mut dst = dst;
        while len > 0 {
            let va0 = pgrounddown(srcva);
            let pa = walkaddr(pagetable, srcva).ok_or(())?;
            let n = core::cmp::min(PGSIZE - (srcva - va0), len);
            unsafe { core::ptr::copy(pa as *const u8, dst, n) };
            len -= n;
            dst = unsafe { dst.add(n) };
            srcva = va0 + PGSIZE;
        }
        Ok(())
    }
}

#[cfg(not(target_os = "none"))]
pub use sim::*;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::riscv::{PteFlags, PGSIZE};

    #[test]
    fn copyout_copyin_roundtrip_through_a_mapped_page() {
        let pt = uvmcreate().unwrap();
        assert_eq!(Some(2 * PGSIZE), uvmalloc(pt, 0, 2 * PGSIZE, PteFlags::W));

        let msg = b"paged bytes";
        assert!(copyout(pt, PGSIZE + 100, msg.as_ptr(), msg.len()).is_ok());

        let mut back = [0u8; 11];
        assert!(copyin(pt, back.as_mut_ptr(), PGSIZE + 100, back.len()).is_ok());
        assert_eq!(msg, &back);
        uvmfree(pt, 2 * PGSIZE);
    }

    #[test]
    fn copies_span_page_boundaries() {
        let pt = uvmcreate().unwrap();
        uvmalloc(pt, 0, 2 * PGSIZE, PteFlags::W).unwrap();

        let data: Vec<u8> = (0..200u8).collect();
        let dst = PGSIZE - 100;
        assert!(copyout(pt, dst, data.as_ptr(), data.len()).is_ok());

        let mut back = vec![0u8; 200];
        assert!(copyin(pt, back.as_mut_ptr(), dst, 200).is_ok());
        assert_eq!(data, back);
        uvmfree(pt, 2 * PGSIZE);
    }

    #[test]
    fn guard_pages_reject_user_copies() {
        let pt = uvmcreate().unwrap();
        uvmalloc(pt, 0, 2 * PGSIZE, PteFlags::W).unwrap();
        uvmclear(pt, 0);

        let byte = 7u8;
        assert!(copyout(pt, 10, &byte, 1).is_err());
        assert!(walkaddr(pt, 10).is_none());
        // the page above the guard still works.
        assert!(copyout(pt, PGSIZE + 10, &byte, 1).is_ok());
        uvmfree(pt, 2 * PGSIZE);
    }

    #[test]
    fn unmapped_addresses_fail_once_a_table_has_mappings() {
        let pt = uvmcreate().unwrap();
        uvmalloc(pt, 0, PGSIZE, PteFlags::W).unwrap();

        let byte = 7u8;
        assert!(copyout(pt, 5 * PGSIZE, &byte, 1).is_err());
        uvmfree(pt, PGSIZE);
    }
}
