// Heap administration: creation, the global heap lists, the pressure-driven
// region order, and trimming of long-idle regions.

use core::{
    mem::size_of,
    ptr::null_mut,
    sync::atomic::{AtomicI64, AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
    internal::{align_up, page_align},
    os, region,
    types::{
        Heap, Region, Rtype, Status, XRegion, DIRMEM_INIT, INI_REGS, MIN_REGION, MMAP_THRESHOLD,
        MULTI_LEN, REGMEM_INC, TRIM_AGE, TRIM_AGE_LARGE, TRIM_SCAN, XREGMEM_INC,
    },
};

// ------------------------------------------------------
// Process-wide state
// ------------------------------------------------------

static GLOBAL_HEAPS: AtomicPtr<Heap> = AtomicPtr::new(null_mut());
static FREE_HEAPS: AtomicPtr<Heap> = AtomicPtr::new(null_mut());
static HEAP_GID: AtomicU32 = AtomicU32::new(1);
static GLOBAL_MAPCNT: AtomicI64 = AtomicI64::new(1);

pub fn map_count(delta: i32) {
    GLOBAL_MAPCNT.fetch_add(delta as i64, Ordering::Relaxed);
}

pub fn heaps_head() -> *mut Heap {
    GLOBAL_HEAPS.load(Ordering::Acquire)
}

// Region order for a fresh region: grows with the process-wide map count so
// busy processes get larger regions and fewer maps.
static MAP_SHIFTS: [u32; 32] = [
    0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 10, 11, 12, 13,
    14, 15, 15,
];

pub fn new_reg_order() -> u32 {
    let mapcnt = GLOBAL_MAPCNT.load(Ordering::Relaxed);
    if mapcnt <= 0 {
        return MIN_REGION;
    }
    let mapcnt = mapcnt as u64;
    let mut mapord = (64 - mapcnt.leading_zeros()) as usize;
    if mapcnt & (mapcnt - 1) != 0 {
        mapord += 1;
    }
    MIN_REGION + MAP_SHIFTS[core::cmp::min(mapord, 31)]
}

// ------------------------------------------------------
// OS memory with heap accounting
// ------------------------------------------------------

pub unsafe fn oom(hb: *mut Heap, len: usize) {
    (*hb).status = Status::Oom;
    os::set_errno_oom();
    yerror!("heap {}: out of memory allocating {} bytes", (*hb).id, len);
}

// Get a chunk of memory from the OS, counted against the heap.
pub unsafe fn osmem(hb: *mut Heap, len: usize) -> *mut u8 {
    let alen = page_align(len);
    (*hb).stats.mmaps += 1;
    let p = os::map(alen);
    if !p.is_null() {
        return p;
    }
    let p = os::map(alen); // a failed map may be transient
    if !p.is_null() {
        return p;
    }
    oom(hb, len);
    null_mut()
}

// ------------------------------------------------------
// Heap creation
// ------------------------------------------------------

fn heap_init(hb: *mut Heap) {
    unsafe {
        (*hb).status = Status::Ok;
        (*hb).mmap_threshold = MMAP_THRESHOLD;
        (*hb).prvallreg = null_mut();
        (*hb).mrufrereg = null_mut();
        (*hb).prvxheap = null_mut();
        (*hb).stats.minlen = u64::max_value();
    }
}

// Map and initialise a heap base: descriptor chunks, region map and the
// directory node pool ride in the same mapping.
pub unsafe fn new_heap_raw() -> *mut Heap {
    let hlen = align_up(size_of::<Heap>(), 16);
    let mlen = INI_REGS * size_of::<usize>();
    let rlen = REGMEM_INC * size_of::<Region>();
    let xlen = XREGMEM_INC * size_of::<XRegion>();
    let dlen = DIRMEM_INIT;
    let len = page_align(hlen + mlen + rlen + xlen + dlen);

    let base = os::map(len);
    if base.is_null() {
        return null_mut();
    }
    let hb = base as *mut Heap;

    (*hb).id = HEAP_GID.fetch_add(1, Ordering::Relaxed);

    (*hb).regs = base.add(hlen) as *mut AtomicUsize;
    (*hb).regmaplen = INI_REGS as u32;
    (*hb).regmem = base.add(hlen + mlen) as *mut Region;
    (*hb).xregmem = base.add(hlen + mlen + rlen) as *mut XRegion;
    (*hb).dirmem = base.add(hlen + mlen + rlen + xlen);
    (*hb).dirmem_top = dlen;

    heap_init(hb);
    map_count(1);

    loop {
        let head = GLOBAL_HEAPS.load(Ordering::Acquire);
        (*hb).nxt = head;
        if GLOBAL_HEAPS
            .compare_exchange_weak(head, hb, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
    ytrace!("new heap {}", (*hb).id);
    hb
}

// Retired heaps keep their regions; a later thread adopts them wholesale.
pub unsafe fn pop_free_heap() -> *mut Heap {
    loop {
        let hb = FREE_HEAPS.load(Ordering::Acquire);
        if hb.is_null() {
            return null_mut();
        }
        let nxt = (*hb).free;
        if FREE_HEAPS
            .compare_exchange(hb, nxt, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            (*hb).free = null_mut();
            heap_init(hb);
            return hb;
        }
    }
}

pub unsafe fn push_free_heap(hb: *mut Heap) {
    loop {
        let head = FREE_HEAPS.load(Ordering::Acquire);
        (*hb).free = head;
        if FREE_HEAPS
            .compare_exchange_weak(head, hb, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
}

// ------------------------------------------------------
// Trim
// ------------------------------------------------------

// Round-robin scan of the descriptor table. A slab region that stays fully
// free across enough scans goes back to the OS; any activity resets its age.
pub unsafe fn heap_trim(hb: *mut Heap) {
    let top = (*hb).allocregcnt;
    if top == 0 {
        return;
    }
    let mut pos = (*hb).trim_pos;
    let scan = core::cmp::min(TRIM_SCAN, top);

    for _ in 0..scan {
        pos += 1;
        if pos > top {
            pos = 1;
        }
        let reg = (*(*hb).regs.add(pos as usize)).load(Ordering::Acquire) as *mut XRegion;
        if reg.is_null() || (*reg).typ != Rtype::Slab {
            continue;
        }
        let creg = reg as *mut Region;
        if (*creg).celcnt == (*creg).frecnt + (*creg).binpos as u32 {
            let age = (*creg).age + 1;
            let lim = if (*creg).cellen > MULTI_LEN { TRIM_AGE_LARGE } else { TRIM_AGE };
            if age > lim {
                region::del_region(hb, creg);
            } else {
                (*creg).age = age;
            }
        } else {
            (*creg).age = 0;
        }
    }
    (*hb).trim_pos = pos;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_base_layout() {
        unsafe {
            let hb = new_heap_raw();
            assert!(!hb.is_null());
            assert!((*hb).id > 0);
            assert_eq!((*hb).status, Status::Ok);
            assert_eq!((*hb).mmap_threshold, MMAP_THRESHOLD);
            assert!(!(*hb).regs.is_null());
            assert!(!(*hb).dirmem.is_null());
            assert_eq!((*hb).dirmem_pos, 0);
            // linked into the global list
            let mut walk = heaps_head();
            let mut found = false;
            while !walk.is_null() {
                if walk == hb {
                    found = true;
                    break;
                }
                walk = (*walk).nxt;
            }
            assert!(found);
        }
    }

    #[test]
    fn order_grows_with_pressure() {
        let before = new_reg_order();
        assert!(before >= MIN_REGION);
        map_count(1 << 20);
        let after = new_reg_order();
        assert!(after >= before);
        map_count(-(1 << 20));
    }

    #[test]
    fn free_heap_roundtrip() {
        unsafe {
            let hb = new_heap_raw();
            push_free_heap(hb);
            // other threads may race for the list; whatever comes back is a
            // reinitialised heap with a cleared link
            let got = pop_free_heap();
            if !got.is_null() {
                assert!((*got).free.is_null());
                assert_eq!((*got).status, Status::Ok);
            }
        }
    }
}
