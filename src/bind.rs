// Thread binding: resolves the calling thread to its heap without any
// thread-local storage. A power-of-two open-addressing table keyed by a
// murmur-mixed thread id, fronted by a process-wide most-recent binding.
// On crowding the table doubles twice; the old table stays readable while
// the new one fills, so readers never block.

use core::{
    mem::size_of,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
    bump, heap,
    internal::page_align,
    os,
    types::{Heap, MiniHeap},
};

pub const INI_HASH_ORDER: u32 = 10;
pub const HASH_ORDERS: usize = 28;

pub struct TidEntry {
    tid: AtomicUsize,
    heap: AtomicPtr<Heap>,
    mheap: AtomicPtr<MiniHeap>,
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY: TidEntry = TidEntry {
    tid: AtomicUsize::new(0),
    heap: AtomicPtr::new(null_mut()),
    mheap: AtomicPtr::new(null_mut()),
};

static INITAB: [TidEntry; 1 << INI_HASH_ORDER] = [EMPTY; 1 << INI_HASH_ORDER];

#[allow(clippy::declare_interior_mutable_const)]
const NULLTAB: AtomicPtr<TidEntry> = AtomicPtr::new(null_mut());

static HASHTABS: [AtomicPtr<TidEntry>; HASH_ORDERS] = [NULLTAB; HASH_ORDERS];
static HASH_ORD: AtomicU32 = AtomicU32::new(INI_HASH_ORDER);
static RESIZE_LOCK: AtomicU32 = AtomicU32::new(0);

// most recent (thread, heap) binding, in front of the hash
static PRV_HB: AtomicPtr<Heap> = AtomicPtr::new(null_mut());

// Stafford's murmur3 variant mixer.
fn murmurmix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

fn table(ord: u32) -> *mut TidEntry {
    let t = HASHTABS[ord as usize].load(Ordering::Acquire);
    if !t.is_null() {
        return t;
    }
    if ord == INI_HASH_ORDER {
        return INITAB.as_ptr() as *mut TidEntry;
    }
    null_mut()
}

// Find or claim the entry for tid. Returns the entry and the probe count,
// the crowding signal for resize.
unsafe fn map_getadd(mp: *mut TidEntry, tid: usize, ord: u32) -> (*mut TidEntry, u32) {
    let len = 1usize << ord;
    let msk = len - 1;
    let h = murmurmix(tid as u64);
    let k0 = (h as usize) & msk;

    let hp = mp.add(k0);
    let t = (*hp).tid.load(Ordering::Acquire);
    if t == tid {
        return (hp, 0);
    }
    if t == 0
        && (*hp)
            .tid
            .compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    {
        return (hp, 0);
    }

    // second probe with the rest of the hash, then linear
    let mut k = (k0 + (h >> ord) as usize) & msk;
    let k2 = k;
    let mut cnt = 0u32;
    loop {
        let hp = mp.add(k);
        let t = (*hp).tid.load(Ordering::Acquire);
        if t == tid {
            return (hp, cnt);
        }
        if t == 0
            && (*hp)
                .tid
                .compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            return (hp, cnt);
        }
        k = (k + 1) & msk;
        cnt += 1;
        if k == k2 {
            return (null_mut(), cnt);
        }
    }
}

unsafe fn map_grow(mp: *mut TidEntry, newmp: *mut TidEntry, ord: u32, neword: u32) {
    let len = 1usize << ord;
    for k in 0..len {
        let hp = mp.add(k);
        let tid = (*hp).tid.load(Ordering::Acquire);
        if tid == 0 {
            continue;
        }
        let (newhp, _) = map_getadd(newmp, tid, neword);
        if newhp.is_null() {
            continue;
        }
        (*newhp)
            .heap
            .store((*hp).heap.load(Ordering::Acquire), Ordering::Release);
        (*newhp)
            .mheap
            .store((*hp).mheap.load(Ordering::Acquire), Ordering::Release);
    }
}

unsafe fn maybe_resize(ord: u32, cnt: u32) {
    let len = 1u32 << ord;
    let lim = core::cmp::min(len >> 2, 64);
    if cnt < lim {
        return;
    }
    if RESIZE_LOCK
        .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        return;
    }
    let neword = ord + 2;
    if HASH_ORD.load(Ordering::Acquire) == ord && (neword as usize) < HASH_ORDERS {
        let newtab =
            os::map(page_align((1usize << neword) * size_of::<TidEntry>())) as *mut TidEntry;
        if !newtab.is_null() {
            map_grow(table(ord), newtab, ord, neword);
            HASHTABS[neword as usize].store(newtab, Ordering::Release);
            HASH_ORD.store(neword, Ordering::Release);
        }
    }
    RESIZE_LOCK.store(0, Ordering::Release);
}

unsafe fn do_getheap(tid: usize, create: bool) -> *mut Heap {
    let ord = HASH_ORD.load(Ordering::Acquire);
    let tp = table(ord);
    if tp.is_null() {
        return null_mut();
    }
    let (hp, cnt) = map_getadd(tp, tid, ord);
    if hp.is_null() {
        return null_mut();
    }
    let mut hb = (*hp).heap.load(Ordering::Acquire);
    if hb.is_null() {
        if !create {
            return null_mut();
        }
        hb = heap::pop_free_heap();
        if hb.is_null() {
            hb = heap::new_heap_raw();
        }
        if hb.is_null() {
            return null_mut();
        }
        (*hb).tid.store(tid, Ordering::Release);
        (*hp).heap.store(hb, Ordering::Release);
    }
    maybe_resize(ord, cnt);
    hb
}

// ------------------------------------------------------
// Public binding
// ------------------------------------------------------

// The current thread's heap, or null before its first heavy allocation.
pub unsafe fn get_heap() -> *mut Heap {
    let tid = os::thread_id();
    let hb = PRV_HB.load(Ordering::Acquire);
    if !hb.is_null() && (*hb).tid.load(Ordering::Relaxed) == tid {
        return hb;
    }
    let hb = do_getheap(tid, false);
    if !hb.is_null() {
        PRV_HB.store(hb, Ordering::Release);
    }
    hb
}

// Create (or adopt a retired) heap for the current thread.
pub unsafe fn new_heap() -> *mut Heap {
    let tid = os::thread_id();
    let hb = do_getheap(tid, true);
    if !hb.is_null() {
        PRV_HB.store(hb, Ordering::Release);
    }
    hb
}

pub unsafe fn get_mini(create: bool) -> *mut MiniHeap {
    let tid = os::thread_id();
    let ord = HASH_ORD.load(Ordering::Acquire);
    let tp = table(ord);
    if tp.is_null() {
        return null_mut();
    }
    let (hp, _) = map_getadd(tp, tid, ord);
    if hp.is_null() {
        return null_mut();
    }
    let mut mhb = (*hp).mheap.load(Ordering::Acquire);
    if mhb.is_null() && create {
        mhb = bump::new_mheap();
        if !mhb.is_null() {
            (*hp).mheap.store(mhb, Ordering::Release);
        }
    }
    mhb
}

// Retire the calling thread's heap to the free list. Its regions stay live
// and findable; a later thread adopts them with the heap.
pub unsafe fn thread_done() {
    let tid = os::thread_id();
    let ord = HASH_ORD.load(Ordering::Acquire);
    let tp = table(ord);
    if tp.is_null() {
        return;
    }
    let (hp, _) = map_getadd(tp, tid, ord);
    if hp.is_null() {
        return;
    }
    let hb = (*hp).heap.swap(null_mut(), Ordering::AcqRel);
    if hb.is_null() {
        return;
    }
    let _ = PRV_HB.compare_exchange(hb, null_mut(), Ordering::AcqRel, Ordering::Acquire);
    (*hb).tid.store(0, Ordering::Release);
    heap::push_free_heap(hb);
    ytrace!("thread done: heap {} retired", (*hb).id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_is_stable() {
        unsafe {
            let hb = new_heap();
            assert!(!hb.is_null());
            assert_eq!(get_heap(), hb);
            assert_eq!(new_heap(), hb);
            assert_eq!((*hb).tid.load(Ordering::Relaxed), os::thread_id());
        }
    }

    #[test]
    fn mini_binding() {
        unsafe {
            let mhb = get_mini(true);
            assert!(!mhb.is_null());
            assert_eq!(get_mini(false), mhb);
        }
    }

    #[test]
    fn retire_and_recreate() {
        // a dedicated thread so the binding of other tests stays untouched
        std::thread::spawn(|| unsafe {
            let hb = new_heap();
            assert!(!hb.is_null());
            thread_done();
            assert!(get_heap().is_null());
            let hb2 = new_heap();
            assert!(!hb2.is_null());
        })
        .join()
        .unwrap();
    }

    #[test]
    fn mixer_is_bijective_on_samples() {
        // every step of the mixer is invertible, so distinct thread ids can
        // never collide on the full hash
        let mut prev = murmurmix(0);
        for i in 1..64u64 {
            let h = murmurmix(i);
            assert_ne!(h, prev);
            prev = h;
        }
    }
}
