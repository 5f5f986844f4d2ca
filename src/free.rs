// Release path. The directory resolves the pointer to a region in O(1);
// slab cells go through the recycling bin, direct maps are unmapped on the
// spot. Pointers owned by another thread's heap cross the remote-free
// bridge: signal the owner's mode word, take its lock, mutate its bin.

use core::{ptr::null_mut, sync::atomic::Ordering};

use crate::{
    alloc, bind, bump, dir, heap, lock, os, region, slab,
    types::{
        zero_block, zero_block_pristine, Heap, Region, Rtype, Status, XRegion, NOCEL,
        REGION_INTERVAL, VM_SIZE,
    },
};

// ------------------------------------------------------
// Direct-map release
// ------------------------------------------------------

// Validate and unmap a direct-mapped block. The descriptor flips to the
// freed state first so a double free stays diagnosable.
pub unsafe fn free_mmap(owner: *mut Heap, reg: *mut XRegion, ip: usize, len: usize) -> Status {
    let base = (*reg).user as usize;
    let rlen = (*reg).len;
    let abase = (*reg).abase;

    if len != 0 && len != (*reg).ulen && crate::internal::page_align(len) != rlen {
        yerror!("free({:x},{}) of mapped block with size {}", ip, len, (*reg).ulen);
        return Status::Error;
    }
    if ip >= base + rlen {
        yerror!(
            "free({:x}) is {} bytes after mapped region {:x} of len {}",
            ip,
            ip - base - rlen,
            (*reg).dirid,
            rlen
        );
        return Status::Error;
    }
    if abase != 0 {
        if ip != abase {
            yerror!("free({:x}) inside aligned block allocated at {:x}", ip, abase);
            return Status::Error;
        }
    } else if ip != base {
        yerror!("free({:x}) is {} bytes inside block allocated at {:x}", ip, ip - base, base);
        return Status::Error;
    }

    region::del_xregion(owner, reg)
}

// ------------------------------------------------------
// Remote-free bridge
// ------------------------------------------------------

unsafe fn do_free_remote(hb: *mut Heap, xhb: *mut Heap, reg: *mut XRegion, ip: usize, len: usize) {
    match (*reg).typ {
        Rtype::Mmap => {
            if lock::lock_heap(xhb) != Status::Ok {
                (*hb).stats.oslocktimeouts += 1;
                os::set_errno_again();
                return;
            }
            let rv = free_mmap(xhb, reg, ip, len);
            if rv == Status::Error {
                (*xhb).stats.invalid_frees += 1;
            } else {
                (*xhb).stats.remote_frees += 1;
            }
            lock::unlock_heap(xhb);
        }
        Rtype::MmapFree => {
            yerror!("double free of ptr {:x} in heap {} from heap {}", ip, (*xhb).id, (*hb).id);
            (*hb).stats.invalid_frees += 1;
        }
        Rtype::Slab => {
            let creg = reg as *mut Region;
            if len != 0 && !sized_len_fits(hb, creg, len) {
                return;
            }
            // ask the owner to start locking, then free under its lock
            let _ = (*xhb)
                .lockmode
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire);
            if lock::lock_heap(xhb) != Status::Ok {
                (*hb).stats.oslocktimeouts += 1;
                os::set_errno_again();
                return;
            }
            slab::slab_bin(xhb, creg, ip);
            (*xhb).stats.remote_frees += 1;
            lock::unlock_heap(xhb);
        }
        Rtype::None => {
            yerror!("invalid free({:x}): stale region {:x}", ip, (*reg).dirid);
            (*hb).stats.invalid_frees += 1;
        }
    }
}

// Search the other heaps for the owner of ip, most recent foreign heap
// first. Returns whether the pointer was accounted for.
pub unsafe fn free_remote(hb: *mut Heap, ip: usize, len: usize) -> bool {
    let mut xhb = (*hb).prvxheap;
    let mut reg = null_mut();
    if !xhb.is_null() && xhb != hb {
        reg = dir::find_region_foreign(xhb, ip);
    }
    if reg.is_null() {
        xhb = heap::heaps_head();
        let mut iter = 64;
        while !xhb.is_null() && iter != 0 {
            if xhb != hb {
                reg = dir::find_region_foreign(xhb, ip);
                if !reg.is_null() {
                    break;
                }
            }
            xhb = (*xhb).nxt;
            iter -= 1;
        }
    }
    if reg.is_null() {
        // early blocks of other threads live in their mini-heaps; found
        // there simply means "not an error"
        return bump::mini_find_global(ip, len) != 0;
    }
    (*hb).prvxheap = xhb;
    do_free_remote(hb, xhb, reg, ip, len);
    true
}

// ------------------------------------------------------
// Local release
// ------------------------------------------------------

// A sized release must name the length the block was allocated under, up to
// class rounding.
unsafe fn sized_len_fits(hb: *mut Heap, reg: *mut Region, len: usize) -> bool {
    let ok = len <= (*reg).cellen as usize
        && len < (*hb).mmap_threshold
        && alloc::size_class(len as u32).1 == (*reg).cellen;
    if !ok {
        yerror!(
            "free of size {} in region {:x} with cell length {}",
            len,
            (*reg).id,
            (*reg).cellen
        );
        (*hb).stats.errors += 1;
    }
    ok
}

pub unsafe fn free_heap(hb: *mut Heap, p: *mut u8, len: usize) {
    let ip = p as usize;

    // start with the last region freed into
    let mut reg = (*hb).mrufrereg;
    let mut hit = false;
    if !reg.is_null() {
        let base = (*reg).user as usize;
        if ip >= base && ip < base + (*reg).len {
            hit = true;
        }
    }
    if !hit {
        reg = dir::find_region(hb, ip);
        if reg.is_null() {
            // not ours: mini block, zero block, or another thread's
            let mhb = bind::get_mini(false);
            if bump::mini_find(mhb, ip, len) != 0 {
                return;
            }
            if ip >= VM_SIZE {
                yerror!("invalid free({:x}) above the VM space", ip);
                (*hb).stats.invalid_frees += 1;
                return;
            }
            if p == zero_block() {
                if !zero_block_pristine() {
                    yerror!("written to malloc(0) block {:x}", ip);
                    (*hb).stats.errors += 1;
                }
                return;
            }
            if free_remote(hb, ip, len) {
                return;
            }
            dir::find_region_rep(hb, ip);
            (*hb).stats.invalid_frees += 1;
            yerror!(
                "ptr {:x} unallocated: not in any of {} regions of heap {}",
                ip,
                (*hb).allocregcnt - (*hb).freeregcnt,
                (*hb).id
            );
            return;
        }
        if (*reg).typ == Rtype::Slab {
            (*hb).mrufrereg = reg;
        }
    }

    match (*reg).typ {
        Rtype::Slab => {
            let creg = reg as *mut Region;
            if len != 0 && !sized_len_fits(hb, creg, len) {
                return;
            }
            let locmod = (*hb).lockmode.load(Ordering::Acquire);
            if locmod != 0 {
                if locmod == 1 {
                    (*hb).lockmode.store(2, Ordering::Release); // ack
                }
                if lock::lock_heap(hb) != Status::Ok {
                    (*hb).stats.oslocktimeouts += 1;
                    os::set_errno_again();
                    return;
                }
            }
            slab::slab_bin(hb, creg, ip);
            (*hb).stats.frees += 1;
            (*hb).free_tick = (*hb).free_tick.wrapping_add(1);
            if (*hb).free_tick & REGION_INTERVAL == 0 {
                heap::heap_trim(hb);
            }
            if locmod != 0 {
                lock::unlock_heap(hb);
            }
        }
        Rtype::Mmap => {
            let rv = free_mmap(hb, reg, ip, len);
            if rv == Status::Error {
                (*hb).stats.invalid_frees += 1;
                return;
            }
            (*hb).stats.frees += 1;
        }
        Rtype::MmapFree => {
            (*hb).stats.invalid_frees += 1;
            yerror!("double free of ptr {:x} len {} region {:x}", ip, (*reg).len, (*reg).dirid);
        }
        Rtype::None => {
            (*hb).stats.invalid_frees += 1;
            yerror!("invalid free({:x}): stale region {:x}", ip, (*reg).dirid);
        }
    }
}

// Main entry. A null pointer is a no-op; len 0 means unsized.
pub unsafe fn yfree(p: *mut u8, len: usize) {
    crate::init::process_init();
    if p.is_null() {
        return;
    }
    let hb = bind::get_heap();
    if !hb.is_null() {
        free_heap(hb, p, len);
        return;
    }

    // no heap yet: early mini block, the zero block, or a foreign pointer
    let ip = p as usize;
    let mhb = bind::get_mini(false);
    if bump::mini_find(mhb, ip, len) != 0 {
        return;
    }
    if p == zero_block() {
        if !zero_block_pristine() {
            yerror!("written to malloc(0) block {:x}", ip);
        }
        return;
    }
    let hb = bind::new_heap();
    if hb.is_null() {
        yerror!("free({:x}): no heap", ip);
        return;
    }
    free_heap(hb, p, len);
}

// ------------------------------------------------------
// Usable size
// ------------------------------------------------------

pub unsafe fn ysize(p: *mut u8) -> usize {
    crate::init::process_init();
    if p.is_null() || p == zero_block() {
        return 0;
    }
    let ip = p as usize;

    let hb = bind::get_heap();
    let mut reg: *mut XRegion = null_mut();
    if !hb.is_null() {
        reg = dir::find_region(hb, ip);
    }
    if reg.is_null() {
        let mhb = bind::get_mini(false);
        let mlen = bump::mini_find(mhb, ip, 0);
        if mlen != 0 {
            return mlen;
        }
        let mut xhb = heap::heaps_head();
        let mut iter = 64;
        while !xhb.is_null() && iter != 0 {
            if xhb != hb {
                reg = dir::find_region_foreign(xhb, ip);
                if !reg.is_null() {
                    break;
                }
            }
            xhb = (*xhb).nxt;
            iter -= 1;
        }
        if reg.is_null() {
            return bump::mini_find_global(ip, 0);
        }
    }

    match (*reg).typ {
        Rtype::Slab => {
            let creg = reg as *mut Region;
            let cel = slab::slab_cel(creg, ip);
            if cel == NOCEL || !slab::slab_is_alloc(creg, cel) {
                return 0; // released or never handed out
            }
            (*creg).cellen as usize * slab::slab_usable(creg, cel) as usize
        }
        Rtype::Mmap => {
            let base = (*reg).user as usize;
            let abase = (*reg).abase;
            if abase != 0 {
                (*reg).len - (abase - base)
            } else {
                (*reg).len
            }
        }
        _ => 0,
    }
}
