//! exec: replace a process's address space with a fresh image loaded from
//! an ELF file, plus an argv stack. All-or-nothing: every allocation lands
//! in a new page table, and the caller's old one is swapped out (and only
//! then freed) after the last point of failure.

use core::mem::size_of;
use core::ptr::NonNull;

use crate::elf::{ElfHeader, ProgFlags, ProgramHeader, ELF_MAGIC, ELF_PROG_LOAD};
use crate::fs::{namei, Inode};
use crate::log::{begin_op, end_op};
use crate::param::MAXARG;
use crate::proc::{myproc, proc_freepagetable, proc_pagetable};
use crate::riscv::{pgroundup, PteFlags, PGSIZE};
use crate::vm::{copyout, uvmalloc, uvmclear, walkaddr, PageTable};

fn flags2perm(flags: u32) -> PteFlags {
    let flags = ProgFlags::from_bits_truncate(flags);
    let mut perm = PteFlags::empty();
    if flags.contains(ProgFlags::EXEC) {
        perm |= PteFlags::X;
    }
    if flags.contains(ProgFlags::WRITE) {
        perm |= PteFlags::W;
    }
    perm
}

/// Replace the calling process's image with the program at `path`, passing
/// it `argv`. Returns argc (destined for a0) on success, -1 on failure; on
/// failure the caller's address space is untouched.
pub fn exec(path: &str, argv: &[&[u8]]) -> i32 {
    let p = myproc();

    begin_op();

    let ip = match namei(path) {
        Some(ip) => ip,
        None => {
            end_op();
            return -1;
        }
    };
    ip.ilock();

    // Check ELF header
    let mut elf = ElfHeader::zeroed();
    let elf_size = size_of::<ElfHeader>();
    if ip.readi(false, &mut elf as *mut ElfHeader as usize, 0, elf_size) != elf_size {
        return bad(None, 0, Some(ip));
    }
    if elf.magic != ELF_MAGIC {
        return bad(None, 0, Some(ip));
    }

    let pagetable = match proc_pagetable(p) {
        Some(pt) => pt,
        None => return bad(None, 0, Some(ip)),
    };

    // Load each program segment into the new address space.
    let mut sz = 0usize;
    let ph_size = size_of::<ProgramHeader>();
    for i in 0..elf.phnum as usize {
        let off = elf.phoff as usize + i * ph_size;
        let mut ph = ProgramHeader::zeroed();
        if ip.readi(false, &mut ph as *mut ProgramHeader as usize, off as u32, ph_size) != ph_size
        {
            return bad(Some(pagetable), sz, Some(ip));
        }
        if ph.typ != ELF_PROG_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return bad(Some(pagetable), sz, Some(ip));
        }
        if ph.vaddr.checked_add(ph.memsz).is_none() {
            return bad(Some(pagetable), sz, Some(ip));
        }
        if ph.vaddr % PGSIZE as u64 != 0 {
            return bad(Some(pagetable), sz, Some(ip));
        }
        sz = match uvmalloc(
            pagetable,
            sz,
            (ph.vaddr + ph.memsz) as usize,
            flags2perm(ph.flags),
        ) {
            Some(sz) => sz,
            None => return bad(Some(pagetable), sz, Some(ip)),
        };
        if loadseg(pagetable, ph.vaddr as usize, ip, ph.off as u32, ph.filesz as usize).is_err() {
            return bad(Some(pagetable), sz, Some(ip));
        }
    }
    ip.iunlockput();
    end_op();

    let oldsz = p.sz();

    // Allocate some pages at the next page boundary.
    // Make the first inaccessible as a stack guard.
    // Use the rest as the user stack.
    sz = pgroundup(sz);
    sz = match uvmalloc(pagetable, sz, sz + 2 * PGSIZE, PteFlags::W) {
        Some(sz) => sz,
        None => return bad(Some(pagetable), sz, None),
    };
    uvmclear(pagetable, sz - 2 * PGSIZE);
    let mut sp = sz;
    let stackbase = sp - PGSIZE;

    if argv.len() > MAXARG {
        return bad(Some(pagetable), sz, None);
    }

    // Push argument strings, and remember their user addresses.
    let mut ustack = [0u64; MAXARG + 1];
    for (i, arg) in argv.iter().enumerate() {
        sp -= arg.len() + 1;
        sp -= sp % 16; // riscv sp must be 16-byte aligned
        if sp < stackbase {
            return bad(Some(pagetable), sz, None);
        }
        if copyout(pagetable, sp, arg.as_ptr(), arg.len()).is_err() {
            return bad(Some(pagetable), sz, None);
        }
        let nul = 0u8;
        if copyout(pagetable, sp + arg.len(), &nul, 1).is_err() {
            return bad(Some(pagetable), sz, None);
        }
        ustack[i] = sp as u64;
    }
    let argc = argv.len();
    ustack[argc] = 0;

    // push the array of argv[] pointers.
    sp -= (argc + 1) * size_of::<u64>();
    sp -= sp % 16;
    if sp < stackbase {
        return bad(Some(pagetable), sz, None);
    }
    if copyout(
        pagetable,
        sp,
        ustack.as_ptr() as *const u8,
        (argc + 1) * size_of::<u64>(),
    )
    .is_err()
    {
        return bad(Some(pagetable), sz, None);
    }

    // arguments to user main(argc, argv).
    // argc is returned via the system call return value, which goes in a0.
    let tf = p.trapframe();
    tf.a1 = sp as u64;

    // Save program name for debugging.
    let name = path.rsplit('/').next().unwrap_or(path);
    p.set_name(name);

    // Commit to the user image.
    let oldpagetable = p.pagetable();
    p.pagetable.set(Some(NonNull::from(&mut *pagetable)));
    p.set_sz(sz);
    tf.epc = elf.entry; // initial program counter = main
    tf.sp = sp as u64; // initial stack pointer
    proc_freepagetable(oldpagetable, oldsz);

    argc as i32 // this ends up in a0, the first argument to main(argc, argv)
}

fn bad(
    pagetable: Option<&'static mut PageTable>,
    sz: usize,
    ip: Option<&'static Inode>,
) -> i32 {
    if let Some(pt) = pagetable {
        proc_freepagetable(pt, sz);
    }
    if let Some(ip) = ip {
        ip.iunlockput();
        end_op();
    }
    -1
}

/// Load a program segment into pagetable at virtual address va.
/// va must be page-aligned and the pages from va to va+sz must
/// already be mapped.
fn loadseg(
    pagetable: &mut PageTable,
    va: usize,
    ip: &Inode,
    offset: u32,
    sz: usize,
) -> Result<(), ()> {
    let mut i = 0;
    while i < sz {
        let pa = match walkaddr(pagetable, va + i) {
            Some(pa) => pa,
            None => panic!("loadseg: address should exist"),
        };
        let n = core::cmp::min(sz - i, PGSIZE);
        if ip.readi(false, pa, offset + i as u32, n) != n {
            return Err(());
        }
        i += PGSIZE;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::register_image;
    use crate::proc::myproc;
    use crate::vm::copyin;

    fn le16(v: u16) -> [u8; 2] {
        v.to_le_bytes()
    }
    fn le32(v: u32) -> [u8; 4] {
        v.to_le_bytes()
    }
    fn le64(v: u64) -> [u8; 8] {
        v.to_le_bytes()
    }

    struct Seg {
        vaddr: u64,
        filesz: u64,
        memsz: u64,
        body: Vec<u8>,
    }

    /// Serialize a minimal ELF64 image: file header, program headers, then
    /// the segment bodies.
    fn build_elf(entry: u64, segs: &[Seg]) -> Vec<u8> {
        const EHSIZE: usize = 64;
        const PHSIZE: usize = 56;

        let mut image = Vec::new();
        image.extend_from_slice(&le32(ELF_MAGIC));
        image.extend_from_slice(&[0u8; 12]); // ident padding
        image.extend_from_slice(&le16(2)); // ET_EXEC
        image.extend_from_slice(&le16(0xf3)); // EM_RISCV
        image.extend_from_slice(&le32(1)); // version
        image.extend_from_slice(&le64(entry));
        image.extend_from_slice(&le64(EHSIZE as u64)); // phoff
        image.extend_from_slice(&le64(0)); // shoff
        image.extend_from_slice(&le32(0)); // flags
        image.extend_from_slice(&le16(EHSIZE as u16));
        image.extend_from_slice(&le16(PHSIZE as u16));
        image.extend_from_slice(&le16(segs.len() as u16));
        image.extend_from_slice(&le16(0)); // shentsize
        image.extend_from_slice(&le16(0)); // shnum
        image.extend_from_slice(&le16(0)); // shstrndx
        assert_eq!(EHSIZE, image.len());

        let mut body_off = EHSIZE + segs.len() * PHSIZE;
        for seg in segs {
            image.extend_from_slice(&le32(ELF_PROG_LOAD));
            image.extend_from_slice(&le32(5)); // flags: R+X
            image.extend_from_slice(&le64(body_off as u64));
            image.extend_from_slice(&le64(seg.vaddr));
            image.extend_from_slice(&le64(seg.vaddr)); // paddr
            image.extend_from_slice(&le64(seg.filesz));
            image.extend_from_slice(&le64(seg.memsz));
            image.extend_from_slice(&le64(0x1000)); // align
            body_off += seg.body.len();
        }
        for seg in segs {
            image.extend_from_slice(&seg.body);
        }
        image
    }

    fn simple_image(code: &[u8]) -> Vec<u8> {
        build_elf(
            0,
            &[Seg {
                vaddr: 0,
                filesz: code.len() as u64,
                memsz: code.len() as u64,
                body: code.to_vec(),
            }],
        )
    }

    #[test]
    fn exec_of_a_missing_path_leaves_the_caller_untouched() {
        let p = myproc();
        let pt_before = p.pagetable() as *const PageTable;
        let sz_before = p.sz();

        assert_eq!(-1, exec("/nonexistent", &[b"nonexistent"]));

        assert_eq!(pt_before, p.pagetable() as *const PageTable);
        assert_eq!(sz_before, p.sz());
    }

    #[test]
    fn exec_rejects_a_bad_magic_number() {
        register_image("/not-an-elf", b"#!/bin/sh\necho hi\n".to_vec());
        let p = myproc();
        let pt_before = p.pagetable() as *const PageTable;

        assert_eq!(-1, exec("/not-an-elf", &[b"not-an-elf"]));
        assert_eq!(pt_before, p.pagetable() as *const PageTable);
    }

    #[test]
    fn exec_rejects_inconsistent_segment_sizes() {
        let mut segs = vec![Seg {
            vaddr: 0,
            filesz: 64,
            memsz: 32, // memsz < filesz
            body: vec![0x13; 64],
        }];
        register_image("/bad-sizes", build_elf(0, &segs));
        assert_eq!(-1, exec("/bad-sizes", &[b"bad-sizes"]));

        segs[0].memsz = 64;
        segs[0].vaddr = 0x10; // not page-aligned
        register_image("/bad-align", build_elf(0, &segs));
        assert_eq!(-1, exec("/bad-align", &[b"bad-align"]));
    }

    #[test]
    fn successful_exec_installs_image_stack_and_argv() {
        let code = [0x13u8, 0, 0, 0, 0x73, 0, 0, 0]; // nop; ecall
        register_image("/echo", simple_image(&code));

        let p = myproc();
        let pt_before = p.pagetable() as *const PageTable;

        let argc = exec("/echo", &[b"echo", b"hello", b"world"]);
        assert_eq!(3, argc);

        // the address space was swapped.
        let pt = p.pagetable();
        assert_ne!(pt_before, pt as *const PageTable);

        // one code page plus guard and stack.
        assert_eq!(3 * PGSIZE, p.sz());

        let tf = p.trapframe();
        assert_eq!(0, tf.epc);
        assert_eq!(0, tf.sp as usize % 16);
        assert!((tf.sp as usize) > 2 * PGSIZE && (tf.sp as usize) <= 3 * PGSIZE);

        // the code landed at vaddr 0.
        let mut text = [0u8; 8];
        assert!(copyin(pt, text.as_mut_ptr(), 0, text.len()).is_ok());
        assert_eq!(code, text);

        // a1 points at the argv pointer array: argc entries then a null.
        let mut raw = [0u8; 4 * 8];
        assert!(copyin(pt, raw.as_mut_ptr(), tf.a1 as usize, raw.len()).is_ok());
        let ptrs: Vec<u64> = raw
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(0, ptrs[3]);
        for (i, expect) in [&b"echo"[..], b"hello", b"world"].iter().enumerate() {
            let mut s = vec![0u8; expect.len() + 1];
            assert!(copyin(pt, s.as_mut_ptr(), ptrs[i] as usize, s.len()).is_ok());
            assert_eq!(*expect, &s[..expect.len()]);
            assert_eq!(0, s[expect.len()]);
        }
    }

    #[test]
    fn bss_tail_beyond_filesz_is_zeroed() {
        let code = [0xaau8; 16];
        register_image(
            "/bss",
            build_elf(
                0,
                &[Seg {
                    vaddr: 0,
                    filesz: 16,
                    memsz: 512,
                    body: code.to_vec(),
                }],
            ),
        );

        assert_eq!(1, exec("/bss", &[b"bss"]));
        let pt = myproc().pagetable();
        let mut data = [0xffu8; 512];
        assert!(copyin(pt, data.as_mut_ptr(), 0, data.len()).is_ok());
        assert_eq!([0xaa; 16], data[..16]);
        assert!(data[16..].iter().all(|&b| b == 0));
    }

    #[test]
    fn exec_rejects_oversized_argv() {
        register_image("/argv-limit", simple_image(&[0x13, 0, 0, 0]));
        let args: Vec<&[u8]> = (0..MAXARG + 1).map(|_| &b"x"[..]).collect();

        let p = myproc();
        let pt_before = p.pagetable() as *const PageTable;
        assert_eq!(-1, exec("/argv-limit", &args));
        assert_eq!(pt_before, p.pagetable() as *const PageTable);
    }

    #[test]
    fn exec_rejects_args_that_overflow_the_stack_page() {
        register_image("/stack-overflow", simple_image(&[0x13, 0, 0, 0]));
        let big = vec![b'a'; 300];
        let args: Vec<&[u8]> = (0..20).map(|_| &big[..]).collect();

        let p = myproc();
        let pt_before = p.pagetable() as *const PageTable;
        assert_eq!(-1, exec("/stack-overflow", &args));
        assert_eq!(pt_before, p.pagetable() as *const PageTable);
    }
}
