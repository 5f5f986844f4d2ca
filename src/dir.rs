// Page directory: a three-level trie per heap mapping any page in the
// process VM space to the directory id of the region owning it. The owner
// thread writes; any thread may read under the version-counter protocol.
//
// A mid-level slot may hold a tagged id (DIR_WIDE) instead of a leaf pointer
// when one region covers the whole sub-range.

use core::{
    ptr::null_mut,
    sync::atomic::{AtomicU16, AtomicUsize, Ordering},
};

use crate::{
    internal::align_up,
    os,
    types::{
        Heap, XRegion, DIR1_MASK, DIR2_BITS, DIR2_MASK, DIR3_BITS, DIR3_LEN, DIR3_MASK,
        DIRMEM_GROW, DIRMEM_LEAF, DIRMEM_NODE, DIR_WIDE, PAGE_BITS, VM_SIZE,
    },
};

// Bump storage for trie nodes, refilled from the OS when the heap's pool
// runs out. Node memory is never returned; the pool only grows.
unsafe fn dirmem_alloc(hb: *mut Heap, len: usize) -> *mut u8 {
    let pos = align_up((*hb).dirmem_pos, 16);
    if (*hb).dirmem.is_null() || pos + len > (*hb).dirmem_top {
        let chunk = os::map(DIRMEM_GROW);
        if chunk.is_null() {
            return null_mut();
        }
        (*hb).stats.mmaps += 1;
        (*hb).dirmem = chunk;
        (*hb).dirmem_top = DIRMEM_GROW;
        (*hb).dirmem_pos = len;
        return chunk;
    }
    let p = (*hb).dirmem.add(pos);
    (*hb).dirmem_pos = pos + len;
    p
}

// Write `id` at every leaf covering [base, base + len).
unsafe fn walk_write(hb: *mut Heap, base: usize, len: usize, id: u16) -> bool {
    let mut org = base >> PAGE_BITS;
    let end = (base + len) >> PAGE_BITS;

    while org < end {
        let pos1 = (org >> (DIR2_BITS + DIR3_BITS)) & DIR1_MASK;
        let slot1 = &(*hb).rootdir[pos1];
        let mut d2 = slot1.load(Ordering::Relaxed);
        if d2 == 0 {
            let node = dirmem_alloc(hb, DIRMEM_NODE);
            if node.is_null() {
                return false;
            }
            d2 = node as usize;
            slot1.store(d2, Ordering::Release);
        }
        let dir2 = d2 as *mut AtomicUsize;

        let pos2 = (org >> DIR3_BITS) & DIR2_MASK;
        let pos3 = org & DIR3_MASK;
        let posend = core::cmp::min(end - org + pos3, DIR3_LEN);
        org += posend - pos3;

        let slot2 = &*dir2.add(pos2);
        if pos3 == 0 && posend == DIR3_LEN {
            // the region owns this whole sub-range
            slot2.store(id as usize | DIR_WIDE, Ordering::Release);
            continue;
        }

        let mut d3 = slot2.load(Ordering::Relaxed);
        if d3 & DIR_WIDE != 0 {
            // partial overwrite of a wide entry: spill the old id into a leaf
            let leaf = dirmem_alloc(hb, DIRMEM_LEAF);
            if leaf.is_null() {
                return false;
            }
            let old = (d3 & !DIR_WIDE) as u16;
            let lp = leaf as *mut AtomicU16;
            if old != 0 {
                for i in 0..DIR3_LEN {
                    (*lp.add(i)).store(old, Ordering::Relaxed);
                }
            }
            d3 = leaf as usize;
            slot2.store(d3, Ordering::Release);
        } else if d3 == 0 {
            let leaf = dirmem_alloc(hb, DIRMEM_LEAF);
            if leaf.is_null() {
                return false;
            }
            d3 = leaf as usize;
            slot2.store(d3, Ordering::Release);
        }
        let dir3 = d3 as *mut AtomicU16;
        for i in pos3..posend {
            (*dir3.add(i)).store(id, Ordering::Release);
        }
    }
    true
}

// Drop a region's footprint: only its own entries are cleared, so a leaf
// shared with a later mapping stays intact.
unsafe fn walk_clear(hb: *mut Heap, base: usize, len: usize, id: u16) {
    let mut org = base >> PAGE_BITS;
    let end = (base + len) >> PAGE_BITS;

    while org < end {
        let pos1 = (org >> (DIR2_BITS + DIR3_BITS)) & DIR1_MASK;
        let d2 = (*hb).rootdir[pos1].load(Ordering::Relaxed);

        let pos3 = org & DIR3_MASK;
        let posend = core::cmp::min(end - org + pos3, DIR3_LEN);
        let pos2 = (org >> DIR3_BITS) & DIR2_MASK;
        org += posend - pos3;

        if d2 == 0 {
            continue;
        }
        let slot2 = &*(d2 as *mut AtomicUsize).add(pos2);
        let d3 = slot2.load(Ordering::Relaxed);
        if d3 == 0 {
            continue;
        }
        if d3 & DIR_WIDE != 0 {
            if (d3 & !DIR_WIDE) as u16 == id {
                slot2.store(0, Ordering::Release);
            }
            continue;
        }
        let dir3 = d3 as *mut AtomicU16;
        for i in pos3..posend {
            let slot3 = &*dir3.add(i);
            let _ = slot3.compare_exchange(id, 0, Ordering::AcqRel, Ordering::Relaxed);
        }
    }
}

// Enter a region in the directory. Brackets its writes with the version
// counter: odd while writing, even when quiescent.
pub unsafe fn set_region(hb: *mut Heap, reg: *mut XRegion, base: usize, len: usize) -> bool {
    let id = (*reg).dirid;
    debug_assert!(id != 0);
    (*(*hb).regs.add(id as usize)).store(reg as usize, Ordering::Release);

    (*hb).dirversion.fetch_add(1, Ordering::AcqRel);
    let ok = walk_write(hb, base, len, id);
    (*hb).dirversion.fetch_add(1, Ordering::AcqRel);
    ok
}

pub unsafe fn unset_region(hb: *mut Heap, reg: *mut XRegion) -> bool {
    let base = (*reg).user as usize;
    let len = (*reg).len;
    if base == 0 || len == 0 {
        yerror!("heap {} region {:x} is already empty", (*hb).id, (*reg).dirid);
        return false;
    }
    (*hb).dirversion.fetch_add(1, Ordering::AcqRel);
    walk_clear(hb, base, len, (*reg).dirid);
    (*hb).dirversion.fetch_add(1, Ordering::AcqRel);
    true
}

// Map an address to its owning region in O(1). Lock-free; local callers can
// use it directly, foreign callers go through find_region_foreign.
#[inline]
pub unsafe fn find_region(hb: *mut Heap, ip: usize) -> *mut XRegion {
    if ip >= VM_SIZE {
        return null_mut();
    }
    let page = ip >> PAGE_BITS;

    let d2 = (*hb).rootdir[(page >> (DIR2_BITS + DIR3_BITS)) & DIR1_MASK].load(Ordering::Acquire);
    if d2 == 0 {
        return null_mut();
    }
    let slot2 =
        (*(d2 as *const AtomicUsize).add((page >> DIR3_BITS) & DIR2_MASK)).load(Ordering::Acquire);
    let rid = if slot2 & DIR_WIDE != 0 {
        (slot2 & !DIR_WIDE) as u16
    } else {
        if slot2 == 0 {
            return null_mut();
        }
        (*(slot2 as *const AtomicU16).add(page & DIR3_MASK)).load(Ordering::Acquire)
    };
    if rid == 0 {
        return null_mut();
    }

    let reg = (*(*hb).regs.add(rid as usize)).load(Ordering::Acquire) as *mut XRegion;
    if reg.is_null() {
        return null_mut();
    }
    let base = (*reg).user as usize;
    if ip < base || ip >= base + (*reg).len {
        return null_mut();
    }
    reg
}

// Search a foreign heap's directory. Retried while an update is in flight:
// the version is odd, or changed between entry and exit.
pub unsafe fn find_region_foreign(xhb: *mut Heap, ip: usize) -> *mut XRegion {
    let mut iter = 5;
    loop {
        let v1 = (*xhb).dirversion.load(Ordering::Acquire);
        let reg = find_region(xhb, ip);
        let v2 = (*xhb).dirversion.load(Ordering::Acquire);
        if v1 == v2 && v1 & 1 == 0 {
            return reg;
        }
        iter -= 1;
        if iter == 0 {
            return null_mut();
        }
    }
}

// Diagnosing descent: reports which level rejected the address. Used once an
// invalid free is already suspected.
pub unsafe fn find_region_rep(hb: *mut Heap, ip: usize) -> *mut XRegion {
    if ip >= VM_SIZE {
        yerror!("ptr {:x} is outside the {} bit VM space", ip, crate::types::VM_BITS);
        return null_mut();
    }
    let page = ip >> PAGE_BITS;
    let pos1 = (page >> (DIR2_BITS + DIR3_BITS)) & DIR1_MASK;
    let d2 = (*hb).rootdir[pos1].load(Ordering::Acquire);
    if d2 == 0 {
        yerror!("heap {}: no page dir at pos {:x} for ptr {:x}", (*hb).id, pos1, ip);
        return null_mut();
    }
    let pos2 = (page >> DIR3_BITS) & DIR2_MASK;
    let slot2 = (*(d2 as *const AtomicUsize).add(pos2)).load(Ordering::Acquire);
    let (rid, pos3) = if slot2 & DIR_WIDE != 0 {
        ((slot2 & !DIR_WIDE) as u16, 0)
    } else {
        if slot2 == 0 {
            yerror!("heap {}: no page dir at pos {:x},{:x} for ptr {:x}", (*hb).id, pos1, pos2, ip);
            return null_mut();
        }
        let pos3 = page & DIR3_MASK;
        ((*(slot2 as *const AtomicU16).add(pos3)).load(Ordering::Acquire), pos3)
    };
    if rid == 0 {
        yerror!(
            "heap {}: no region at pos {:x},{:x},{:x} for ptr {:x}",
            (*hb).id,
            pos1,
            pos2,
            pos3,
            ip
        );
        return null_mut();
    }
    let reg = (*(*hb).regs.add(rid as usize)).load(Ordering::Acquire) as *mut XRegion;
    if reg.is_null() {
        yerror!("heap {}: empty region {:x} for ptr {:x}", (*hb).id, rid, ip);
        return null_mut();
    }
    let base = (*reg).user as usize;
    if ip < base {
        yerror!(
            "heap {}: ptr {:x} is {} bytes before region {:x} at {:x}",
            (*hb).id,
            ip,
            base - ip,
            rid,
            base
        );
        return null_mut();
    }
    if ip >= base + (*reg).len {
        yerror!(
            "heap {}: ptr {:x} is {} bytes beyond region {:x} of len {}",
            (*hb).id,
            ip,
            ip - base - (*reg).len,
            rid,
            (*reg).len
        );
        return null_mut();
    }
    reg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap;
    use crate::types::{Rtype, PAGE_SIZE};

    // a detached heap and a bare descriptor are enough to drive the trie
    unsafe fn mkheap() -> *mut Heap {
        let hb = heap::new_heap_raw();
        assert!(!hb.is_null());
        hb
    }

    unsafe fn mkreg(hb: *mut Heap, dirid: u16, base: usize, len: usize) -> *mut XRegion {
        let reg = crate::boot::boot_alloc(7, core::mem::size_of::<XRegion>()) as *mut XRegion;
        (*reg).user = base as *mut u8;
        (*reg).len = len;
        (*reg).ulen = len;
        (*reg).abase = 0;
        (*reg).typ = Rtype::Mmap;
        (*reg).nxt = 0;
        (*reg).dirid = dirid;
        assert!(set_region(hb, reg, base, len));
        reg
    }

    #[test]
    fn set_find_unset() {
        unsafe {
            let hb = mkheap();
            let base = 0x7000_0000_0000usize;
            let reg = mkreg(hb, 5, base, 16 * PAGE_SIZE);

            assert_eq!(find_region(hb, base), reg);
            assert_eq!(find_region(hb, base + 7 * PAGE_SIZE + 123), reg);
            assert_eq!(find_region(hb, base + 16 * PAGE_SIZE), null_mut());
            assert_eq!(find_region(hb, base - 1), null_mut());

            assert!(unset_region(hb, reg));
            assert_eq!(find_region(hb, base), null_mut());
            assert_eq!(find_region(hb, base + PAGE_SIZE), null_mut());
        }
    }

    #[test]
    fn wide_entry() {
        unsafe {
            let hb = mkheap();
            // one full leaf sub-range, aligned: takes the tagged path
            let span = DIR3_LEN * PAGE_SIZE;
            let base = 0x6000_0000_0000usize & !(span - 1);
            let reg = mkreg(hb, 9, base, span);

            assert_eq!(find_region(hb, base), reg);
            assert_eq!(find_region(hb, base + span - 1), reg);
            assert_eq!(find_region(hb, base + span), null_mut());

            // partial overwrite spills the wide entry into a leaf
            let base2 = base + span / 2;
            let reg2 = mkreg(hb, 10, base2, 4 * PAGE_SIZE);
            assert_eq!(find_region(hb, base2), reg2);
            assert_eq!(find_region(hb, base), reg);

            assert!(unset_region(hb, reg2));
            assert!(unset_region(hb, reg));
        }
    }

    #[test]
    fn version_counter_settles() {
        unsafe {
            let hb = mkheap();
            let base = 0x5000_0000_0000usize;
            let reg = mkreg(hb, 11, base, PAGE_SIZE);
            assert_eq!((*hb).dirversion.load(Ordering::Relaxed) & 1, 0);
            assert_eq!(find_region_foreign(hb, base + 5), reg);
            assert!(unset_region(hb, reg));
            assert_eq!((*hb).dirversion.load(Ordering::Relaxed) & 1, 0);
        }
    }
}
