// Region descriptor pool. Descriptors live in grow-only chunks owned by the
// heap; released descriptors recycle through intrusive free lists keyed by
// directory id. Direct-mapped blocks get the lean XRegion form, slabs the
// full Region form sharing the same header.

use core::{mem::size_of, ptr::null_mut, sync::atomic::Ordering};

use crate::{
    dir, heap,
    internal::page_align,
    os,
    types::{
        Heap, Region, Rtype, Status, XRegion, CLAS_REGS, REGIONS, REGMEM_INC, XREGMEM_INC,
    },
};

// ------------------------------------------------------
// Free lists in directory-id space
// ------------------------------------------------------

unsafe fn pop_free(hb: *mut Heap, xlist: bool) -> *mut XRegion {
    let head = if xlist { &(*hb).freexregs } else { &(*hb).freeregs };
    let freeid = head.load(Ordering::Acquire);
    if freeid == 0 {
        return null_mut();
    }
    let reg = (*(*hb).regs.add(freeid as usize)).load(Ordering::Acquire) as *mut XRegion;
    if reg.is_null() {
        return null_mut();
    }
    let nxt = (*reg).nxt;
    if head
        .compare_exchange(freeid, nxt, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return null_mut();
    }
    (*hb).freeregcnt = (*hb).freeregcnt.saturating_sub(1);
    reg
}

pub unsafe fn push_free(hb: *mut Heap, reg: *mut XRegion, xlist: bool) {
    let head = if xlist { &(*hb).freexregs } else { &(*hb).freeregs };
    loop {
        let cur = head.load(Ordering::Acquire);
        (*reg).nxt = cur;
        if head
            .compare_exchange_weak(cur, (*reg).dirid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
    (*hb).freeregcnt += 1;
}

// ------------------------------------------------------
// Descriptor storage
// ------------------------------------------------------

// Directory ids are monotonic within a heap; id 0 means unmapped. The id
// space is a hard bound.
unsafe fn new_dirid(hb: *mut Heap) -> u16 {
    let rid = (*hb).allocregcnt + 1;
    if rid as usize >= REGIONS - 1 {
        yerror!("heap {}: out of region ids at {}", (*hb).id, rid);
        (*hb).status = Status::Error;
        return 0;
    }
    if rid + 1 >= (*hb).regmaplen {
        let map = heap::osmem(hb, REGIONS * size_of::<usize>());
        if map.is_null() {
            return 0;
        }
        core::ptr::copy_nonoverlapping(
            (*hb).regs as *const u8,
            map,
            (*hb).regmaplen as usize * size_of::<usize>(),
        );
        (*hb).regs = map as *mut core::sync::atomic::AtomicUsize;
        (*hb).regmaplen = REGIONS as u32;
    }
    (*hb).allocregcnt = rid;
    rid as u16
}

unsafe fn new_regmem(hb: *mut Heap) -> *mut Region {
    let pos = (*hb).regmem_pos as usize;
    if (*hb).regmem.is_null() || pos == REGMEM_INC {
        let chunk = heap::osmem(hb, REGMEM_INC * size_of::<Region>()) as *mut Region;
        if chunk.is_null() {
            return null_mut();
        }
        (*hb).regmem = chunk;
        (*hb).regmem_pos = 1;
        return chunk;
    }
    let reg = (*hb).regmem.add(pos);
    (*hb).regmem_pos += 1;
    reg
}

unsafe fn new_xregmem(hb: *mut Heap) -> *mut XRegion {
    let pos = (*hb).xregmem_pos as usize;
    if (*hb).xregmem.is_null() || pos == XREGMEM_INC {
        let chunk = heap::osmem(hb, XREGMEM_INC * size_of::<XRegion>()) as *mut XRegion;
        if chunk.is_null() {
            return null_mut();
        }
        (*hb).xregmem = chunk;
        (*hb).xregmem_pos = 1;
        return chunk;
    }
    let reg = (*hb).xregmem.add(pos);
    (*hb).xregmem_pos += 1;
    reg
}

// ------------------------------------------------------
// Slab regions
// ------------------------------------------------------

// Create a slab region: user range and metadata block are separate mappings,
// the descriptor comes from the pool or the free list.
pub unsafe fn new_region(
    hb: *mut Heap,
    order: u32,
    len: usize,
    metalen: usize,
    typ: Rtype,
) -> *mut Region {
    debug_assert!(len != 0 && typ == Rtype::Slab);

    (*hb).status = Status::Oom; // default until fully built

    let user = heap::osmem(hb, len);
    if user.is_null() {
        return null_mut();
    }

    let mut reg: *mut Region = null_mut();
    // reuse a recycled descriptor once a quarter of the id space is used
    if (*hb).allocregcnt as usize > REGIONS / 4 {
        reg = pop_free(hb, false) as *mut Region;
        if !reg.is_null() {
            let dirid = (*reg).hdr.dirid;
            let id = (*reg).id;
            core::ptr::write_bytes(reg as *mut u8, 0, size_of::<Region>());
            (*reg).hdr.dirid = dirid;
            (*reg).id = id;
        }
    }
    if reg.is_null() {
        let dirid = new_dirid(hb);
        if dirid == 0 {
            os::unmap(user, page_align(len));
            return null_mut();
        }
        reg = new_regmem(hb);
        if reg.is_null() {
            os::unmap(user, page_align(len));
            return null_mut();
        }
        (*(*hb).regs.add(dirid as usize)).store(reg as usize, Ordering::Release);
        (*reg).hdr.dirid = dirid;
        (*reg).id = ((*hb).id << 16) | dirid as u32;
    }

    (*reg).hdr.typ = typ;
    (*reg).hdr.user = user;
    (*reg).hdr.len = len;
    (*reg).hdr.ulen = len;
    (*reg).hdr.abase = 0;
    (*reg).order = order as u16;
    (*reg).status = Status::Ok;

    let mlen = page_align(metalen);
    let meta = heap::osmem(hb, mlen);
    if meta.is_null() {
        os::unmap(user, page_align(len));
        (*reg).hdr.user = null_mut();
        (*reg).hdr.len = 0;
        (*reg).hdr.typ = Rtype::None;
        push_free(hb, reg as *mut XRegion, false);
        return null_mut();
    }
    (*reg).meta = meta as *mut u64;
    (*reg).metacnt = mlen / 8;

    if !dir::set_region(hb, reg as *mut XRegion, user as usize, len) {
        return null_mut();
    }
    heap::map_count(2);
    (*hb).stats.region_cnt += 1;
    (*hb).status = Status::Ok;
    ytrace!("heap {} new region {:x} len {} meta {}", (*hb).id, (*reg).id, len, mlen);
    reg
}

// Release a fully free slab region: drop its directory footprint, return its
// mappings to the OS and recycle the descriptor.
pub unsafe fn del_region(hb: *mut Heap, reg: *mut Region) {
    let xreg = reg as *mut XRegion;

    dir::unset_region(hb, xreg);

    let user = (*reg).hdr.user;
    let len = (*reg).hdr.len;
    if !user.is_null() {
        os::unmap(user, page_align(len));
        (*hb).stats.munmaps += 1;
    }
    if !(*reg).meta.is_null() {
        os::unmap((*reg).meta as *mut u8, (*reg).metacnt * 8);
        (*hb).stats.munmaps += 1;
        (*reg).meta = null_mut();
        (*reg).metacnt = 0;
    }
    (*reg).hdr.user = null_mut();
    (*reg).hdr.len = 0;
    (*reg).hdr.typ = Rtype::None;

    // unhook from the class table and the MRU slots
    let clas = (*reg).clas as usize;
    let pos = (*reg).claspos as usize;
    if pos < CLAS_REGS && (*hb).clasregs[clas * CLAS_REGS + pos] == reg {
        (*hb).clasregs[clas * CLAS_REGS + pos] = null_mut();
    }
    if (*hb).prvallreg == reg {
        (*hb).prvallreg = null_mut();
    }
    if (*hb).mrufrereg == xreg {
        (*hb).mrufrereg = null_mut();
    }

    push_free(hb, xreg, false);
    (*hb).stats.region_cnt = (*hb).stats.region_cnt.saturating_sub(1);
    heap::map_count(-2);
    ytrace!("heap {} del region {:x}", (*hb).id, (*reg).id);
}

// ------------------------------------------------------
// Direct-map regions
// ------------------------------------------------------

// Wrap a fresh OS mapping in a lean descriptor so release through the common
// path stays O(1).
pub unsafe fn new_xregion(hb: *mut Heap, user: *mut u8, len: usize, ulen: usize) -> *mut XRegion {
    debug_assert!(len != 0 && ulen <= len);

    let mut reg: *mut XRegion = null_mut();
    if (*hb).allocregcnt as usize > REGIONS / 2 {
        reg = pop_free(hb, true);
        if !reg.is_null() {
            // the freed mapping kept its directory footprint for double-free
            // diagnosis; clear it now that the descriptor moves on
            dir::unset_region(hb, reg);
        }
    }
    if reg.is_null() {
        let dirid = new_dirid(hb);
        if dirid == 0 {
            return null_mut();
        }
        reg = new_xregmem(hb);
        if reg.is_null() {
            return null_mut();
        }
        (*(*hb).regs.add(dirid as usize)).store(reg as usize, Ordering::Release);
        (*reg).dirid = dirid;
    }
    (*reg).user = user;
    (*reg).len = len;
    (*reg).ulen = ulen;
    (*reg).abase = 0;
    (*reg).typ = Rtype::Mmap;

    if !dir::set_region(hb, reg, user as usize, len) {
        return null_mut();
    }
    heap::map_count(1);
    (*hb).stats.xregion_cnt += 1;
    reg
}

// Release a direct mapping. The kind flips to MmapFree before the unmap and
// the directory entry stays, so a later double free is diagnosed rather than
// silently accepted. The descriptor is recyclable from now on.
pub unsafe fn del_xregion(hb: *mut Heap, reg: *mut XRegion) -> Status {
    let user = (*reg).user;
    let len = (*reg).len;

    (*reg).typ = Rtype::MmapFree;
    let ok = os::unmap(user, len);
    (*hb).stats.munmaps += 1;
    (*hb).stats.xregion_cnt = (*hb).stats.xregion_cnt.saturating_sub(1);

    if (*hb).mrufrereg == reg {
        (*hb).mrufrereg = null_mut();
    }

    push_free(hb, reg, true);
    heap::map_count(-1);
    if ok {
        Status::Ok
    } else {
        Status::Error
    }
}
