// Mini-heap: a per-thread bump buffer serving the first few small blocks
// before the thread's real heap exists. One 16-bit length slot per 16-byte
// unit; zero means "not the start of any block". Blocks are never freed
// individually; the buffer is simply superseded by the real heap.

use core::{
    mem::size_of,
    ptr::null_mut,
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
};

use crate::{
    boot,
    internal::align_up,
    os,
    types::{MiniHeap, BUMP_LEN, BUMP_MAX, STD_ALIGN},
};

static GLOBAL_MHEAPS: AtomicPtr<MiniHeap> = AtomicPtr::new(null_mut());
static MHEAP_GID: AtomicU32 = AtomicU32::new(1);

// The descriptor and the length map come from the boot pool, the user range
// from its own mapping.
pub unsafe fn new_mheap() -> *mut MiniHeap {
    let id = MHEAP_GID.fetch_add(1, Ordering::Relaxed);

    let mhb = boot::boot_alloc(id, size_of::<MiniHeap>()) as *mut MiniHeap;
    if mhb.is_null() {
        return null_mut();
    }
    let user = os::map(BUMP_LEN);
    if user.is_null() {
        return null_mut();
    }
    let meta = boot::boot_alloc(id, (BUMP_LEN / STD_ALIGN) * 2) as *mut u16;
    if meta.is_null() {
        return null_mut();
    }

    (*mhb).pos = 0;
    (*mhb).id = id;
    (*mhb).user = user;
    (*mhb).meta = meta;

    loop {
        let head = GLOBAL_MHEAPS.load(Ordering::Acquire);
        (*mhb).nxt = head;
        if GLOBAL_MHEAPS
            .compare_exchange_weak(head, mhb, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
    mhb
}

// Bump one block. Fails on overflow; the caller falls back to a real heap.
pub unsafe fn mini_alloc(mhb: *mut MiniHeap, len: usize) -> *mut u8 {
    debug_assert!(len != 0 && len < BUMP_MAX);

    let alen = align_up(len, STD_ALIGN);
    let pos = (*mhb).pos as usize;
    if pos + alen > BUMP_LEN {
        return null_mut();
    }
    *(*mhb).meta.add(pos / STD_ALIGN) = (alen / STD_ALIGN) as u16;
    (*mhb).pos = (pos + alen) as u32;
    (*mhb).user.add(pos)
}

// Length of the block starting at ip, 0 when ip is not one of ours.
pub unsafe fn mini_find(mhb: *mut MiniHeap, ip: usize, clen: usize) -> usize {
    if mhb.is_null() {
        return 0;
    }
    let base = (*mhb).user as usize;
    if ip < base || ip > base + BUMP_LEN - STD_ALIGN {
        return 0;
    }
    let ofs = ip - base;
    if ofs & (STD_ALIGN - 1) != 0 {
        yerror!("invalid ptr {:x} in mini heap {}", ip, (*mhb).id);
        return 0;
    }
    let units = *(*mhb).meta.add(ofs / STD_ALIGN) as usize;
    if units == 0 {
        yerror!("invalid ptr {:x} in mini heap {}", ip, (*mhb).id);
        return 0;
    }
    let len = units * STD_ALIGN;
    if clen != 0 && align_up(clen, STD_ALIGN) != len {
        yerror!("block {:x} has len {}, not {}", ip, len, clen);
    }
    len
}

// Check every thread's mini-heap, for frees of early blocks that crossed
// threads.
pub unsafe fn mini_find_global(ip: usize, clen: usize) -> usize {
    let mut mhb = GLOBAL_MHEAPS.load(Ordering::Acquire);
    let mut iter = 50;
    while !mhb.is_null() && iter != 0 {
        let len = mini_find(mhb, ip, clen);
        if len != 0 {
            return len;
        }
        mhb = (*mhb).nxt;
        iter -= 1;
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_and_find() {
        unsafe {
            let mhb = new_mheap();
            assert!(!mhb.is_null());
            let a = mini_alloc(mhb, 1);
            let b = mini_alloc(mhb, 17);
            assert_eq!(b as usize - a as usize, STD_ALIGN);
            assert_eq!(mini_find(mhb, a as usize, 0), STD_ALIGN);
            assert_eq!(mini_find(mhb, b as usize, 0), 2 * STD_ALIGN);
            // not the start of any block
            assert_eq!(mini_find(mhb, a as usize + STD_ALIGN + 32, 0), 0);
            assert_eq!(mini_find(mhb, a as usize + 1, 0), 0);
            // visible through the global walk
            assert_eq!(mini_find_global(a as usize, 0), STD_ALIGN);
        }
    }

    #[test]
    fn overflow_fails() {
        unsafe {
            let mhb = new_mheap();
            let mut n = 0usize;
            loop {
                let p = mini_alloc(mhb, BUMP_MAX - 1);
                if p.is_null() {
                    break;
                }
                n += 1;
            }
            assert_eq!(n, BUMP_LEN / BUMP_MAX);
        }
    }
}
