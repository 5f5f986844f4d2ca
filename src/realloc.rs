// Resize path. In-place growth first: a slab block extends its run over
// free neighbour cells, a direct map goes through the OS remap. Failing
// that, allocate with some headroom, copy, release the old block.

use core::{cmp::min, ptr::null_mut, sync::atomic::Ordering};

use crate::{
    alloc, bind, bump, dir, free, heap,
    internal::{align_up, page_align},
    lock, os, slab,
    types::{
        zero_block, zero_block_pristine, Heap, Region, Rtype, Status, XRegion, NOCEL, VM_BITS,
    },
};

const MAX_LEN: usize = 1 << (VM_BITS - 2);

unsafe fn real_copy(hb: *mut Heap, p: *mut u8, oldlen: usize, newlen: usize) -> *mut u8 {
    let np = alloc::yal_heap(hb, newlen, false);
    if np.is_null() {
        return null_mut();
    }
    core::ptr::copy_nonoverlapping(p, np, min(oldlen, newlen));
    np
}

// Move a resized mapping to its new place in the directory, bracketed by
// the version counter through set/unset.
unsafe fn real_mmap_move(
    hb: *mut Heap,
    reg: *mut XRegion,
    np: *mut u8,
    newmaplen: usize,
    newulen: usize,
) {
    let oldbase = (*reg).user;
    let oldlen = (*reg).len;
    if np != oldbase || newmaplen < oldlen {
        dir::unset_region(hb, reg);
    }
    (*reg).user = np;
    (*reg).len = newmaplen;
    (*reg).ulen = newulen;
    dir::set_region(hb, reg, np as usize, newmaplen);
}

unsafe fn real_slab(hb: *mut Heap, creg: *mut Region, p: *mut u8, newlen: usize) -> *mut u8 {
    let ip = p as usize;
    let cellen = (*creg).cellen as usize;

    let cel = slab::slab_cel(creg, ip);
    if cel == NOCEL {
        (*hb).stats.invalid_reallocs += 1;
        return null_mut();
    }
    if !slab::slab_is_alloc(creg, cel) {
        yerror!("realloc({:x}) of released block in region {:x}", ip, (*creg).id);
        (*hb).stats.invalid_reallocs += 1;
        return null_mut();
    }

    let oldlen = cellen * slab::slab_usable(creg, cel) as usize;
    if newlen <= oldlen {
        (*hb).stats.reallocles += 1;
        return p; // the cell covers it already
    }

    if (*creg).userun {
        // honour the remote-free protocol around the bitmap mutation
        let locmod = (*hb).lockmode.load(Ordering::Acquire);
        if locmod != 0 {
            if locmod == 1 {
                (*hb).lockmode.store(2, Ordering::Release);
            }
            if lock::lock_heap(hb) != Status::Ok {
                (*hb).stats.oslocktimeouts += 1;
                os::set_errno_again();
                return null_mut();
            }
        }
        let rv = slab::slab_real(hb, creg, ip, newlen);
        if locmod != 0 {
            lock::unlock_heap(hb);
        }
        match rv {
            Status::Ok => {
                (*hb).stats.reallocgts += 1;
                return p;
            }
            Status::Error => return null_mut(),
            _ => {} // no room after the block: move
        }
    }

    // anticipate some headroom for the next growth
    (*hb).stats.reallocgts += 1;
    let nlen = if newlen <= 128 {
        align_up(newlen * 2, 16)
    } else {
        newlen + (newlen >> 3)
    };
    let np = real_copy(hb, p, oldlen, nlen);
    if np.is_null() {
        return null_mut();
    }
    free::free_heap(hb, p, 0);
    np
}

unsafe fn real_mmap(hb: *mut Heap, reg: *mut XRegion, p: *mut u8, newlen: usize) -> *mut u8 {
    let ip = p as usize;
    let base = (*reg).user as usize;
    let abase = (*reg).abase;

    let expect = if abase != 0 { abase } else { base };
    if ip != expect {
        yerror!("realloc({:x}) inside mapped block allocated at {:x}", ip, expect);
        (*hb).stats.invalid_reallocs += 1;
        return null_mut();
    }

    if abase != 0 {
        // a remap would lose the alignment; move the contents
        let oldu = (*reg).len - (abase - base);
        if newlen <= oldu {
            (*hb).stats.reallocles += 1;
            (*reg).ulen = newlen;
            return p;
        }
        (*hb).stats.reallocgts += 1;
        let np = real_copy(hb, p, oldu, newlen);
        if np.is_null() {
            return null_mut();
        }
        free::free_heap(hb, p, 0);
        return np;
    }

    let oldlen = (*reg).len;
    let anew = page_align(newlen);

    if anew <= oldlen {
        (*hb).stats.reallocles += 1;
        if anew == oldlen || oldlen - anew <= 65536 {
            (*reg).ulen = newlen;
            return p; // not worth the savings
        }
        let np = os::remap(p, oldlen, anew);
        if np.is_null() {
            (*reg).ulen = newlen;
            return p;
        }
        real_mmap_move(hb, reg, np, anew, newlen);
        return np;
    }

    (*hb).stats.reallocgts += 1;
    let anew = anew + (anew >> 4);
    let np = os::remap(p, oldlen, anew);
    if np.is_null() {
        // no remap available: allocate fresh and release the old mapping
        let np = real_copy(hb, p, oldlen, newlen);
        if np.is_null() {
            return null_mut();
        }
        free::free_heap(hb, p, 0);
        return np;
    }
    real_mmap_move(hb, reg, np, anew, newlen);
    np
}

// The pointer belongs to another thread: in-place tricks are off the table,
// allocate locally, copy, release remotely.
unsafe fn real_remote(hb: *mut Heap, ip: usize, p: *mut u8, newlen: usize) -> *mut u8 {
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
        let mlen = bump::mini_find_global(ip, 0);
        if mlen != 0 {
            if newlen <= mlen {
                return p;
            }
            return real_copy(hb, p, mlen, newlen);
        }
        dir::find_region_rep(hb, ip);
        yerror!("realloc({:x},{}) was never allocated", ip, newlen);
        (*hb).stats.invalid_reallocs += 1;
        return null_mut();
    }
    (*hb).prvxheap = xhb;

    let oldlen = match (*reg).typ {
        Rtype::Slab => {
            let creg = reg as *mut Region;
            (*creg).cellen as usize
        }
        Rtype::Mmap => {
            let abase = (*reg).abase;
            if abase != 0 {
                (*reg).len - (abase - (*reg).user as usize)
            } else {
                (*reg).len
            }
        }
        _ => {
            yerror!("realloc({:x}) of released mapped block", ip);
            (*hb).stats.invalid_reallocs += 1;
            return null_mut();
        }
    };
    if newlen <= oldlen {
        return p;
    }
    let np = real_copy(hb, p, oldlen, newlen);
    if np.is_null() {
        return null_mut();
    }
    let _ = free::free_remote(hb, ip, 0); // old block released into its owner
    np
}

pub unsafe fn real_heap(hb: *mut Heap, p: *mut u8, newlen: usize) -> *mut u8 {
    let ip = p as usize;

    let reg = dir::find_region(hb, ip);
    if reg.is_null() {
        if p == zero_block() {
            if !zero_block_pristine() {
                yerror!("written to malloc(0) block {:x}", ip);
                (*hb).stats.errors += 1;
            }
            return alloc::yal_heap(hb, newlen, false);
        }
        let mhb = bind::get_mini(false);
        let mlen = bump::mini_find(mhb, ip, 0);
        if mlen != 0 {
            // mini blocks are never released individually
            if newlen <= mlen {
                return p;
            }
            (*hb).stats.reallocgts += 1;
            return real_copy(hb, p, mlen, newlen);
        }
        return real_remote(hb, ip, p, newlen);
    }

    match (*reg).typ {
        Rtype::Slab => real_slab(hb, reg as *mut Region, p, newlen),
        Rtype::Mmap => real_mmap(hb, reg, p, newlen),
        Rtype::MmapFree => {
            yerror!("realloc({:x}) of released mapped block region {:x}", ip, (*reg).dirid);
            (*hb).stats.invalid_reallocs += 1;
            null_mut()
        }
        Rtype::None => {
            yerror!("realloc({:x}): stale region {:x}", ip, (*reg).dirid);
            (*hb).stats.invalid_reallocs += 1;
            null_mut()
        }
    }
}

// Main entry. A null pointer allocates, a zero length releases and hands
// back the zero block.
pub unsafe fn yrealloc(p: *mut u8, newlen: usize) -> *mut u8 {
    crate::init::process_init();

    if p.is_null() {
        return alloc::ymalloc(newlen, false);
    }
    if newlen == 0 {
        free::yfree(p, 0);
        return zero_block();
    }
    if newlen >= MAX_LEN {
        os::set_errno_oom();
        return null_mut();
    }

    let mut hb = bind::get_heap();
    if hb.is_null() {
        hb = bind::new_heap();
        if hb.is_null() {
            return null_mut();
        }
    }
    real_heap(hb, p, newlen)
}
