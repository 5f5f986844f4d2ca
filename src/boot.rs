// Boot pool: process-lifetime metadata storage available before any heap
// exists. A small static buffer, strictly less than one page, split into
// independent sub-pools hashed by the caller id to scatter the startup storm.
// A contended or oversized request is served by its own OS mapping instead;
// an exhausted sub-pool expands into a fresh mapping and keeps bumping.
// Releases are not supported.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU32, AtomicUsize, Ordering},
};

use crate::{internal::align_up, os, types::PAGE_SIZE};

pub const BOOT_CNT: usize = 4;
pub const BOOT_MEM: usize = 1008;

const _: () = assert!(BOOT_CNT * BOOT_MEM < PAGE_SIZE);

struct BootPool {
    inimem: UnsafeCell<[u8; BOOT_MEM]>,
    mem: AtomicUsize, // current chunk base; the static buffer at first
    pos: AtomicUsize,
    lock: AtomicU32,
    allocs: AtomicU32,
    maps: AtomicU32,
    nolocks: AtomicU32,
}

unsafe impl Sync for BootPool {}

#[allow(clippy::declare_interior_mutable_const)]
const POOL_INIT: BootPool = BootPool {
    inimem: UnsafeCell::new([0; BOOT_MEM]),
    mem: AtomicUsize::new(0),
    pos: AtomicUsize::new(0),
    lock: AtomicU32::new(0),
    allocs: AtomicU32::new(0),
    maps: AtomicU32::new(0),
    nolocks: AtomicU32::new(0),
};

static BOOT_POOLS: [BootPool; BOOT_CNT] = [POOL_INIT; BOOT_CNT];

// Bump allocator from a canned, expanding pool. The returned block lives for
// the rest of the process.
pub fn boot_alloc(id: u32, ulen: usize) -> *mut u8 {
    let pool = &BOOT_POOLS[(id as usize) & (BOOT_CNT - 1)];

    if ulen == 0 {
        return core::ptr::null_mut();
    }

    let len = align_up(ulen, 16);

    if len >= BOOT_MEM {
        pool.maps.fetch_add(1, Ordering::Relaxed);
        return unsafe { os::map(align_up(len, PAGE_SIZE)) };
    }
    pool.allocs.fetch_add(1, Ordering::Relaxed);

    let mut iter = 8;
    loop {
        if pool.lock.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed).is_ok() {
            break;
        }
        iter -= 1;
        if iter == 0 {
            // contended: not worth waiting for a few bytes
            pool.nolocks.fetch_add(1, Ordering::Relaxed);
            return unsafe { os::map(align_up(len, PAGE_SIZE)) };
        }
    }

    let mut mem = pool.mem.load(Ordering::Relaxed);
    if mem == 0 {
        mem = pool.inimem.get() as usize;
        pool.mem.store(mem, Ordering::Relaxed);
    }
    let pos = pool.pos.load(Ordering::Relaxed);

    if pos + len <= BOOT_MEM {
        pool.pos.store(pos + len, Ordering::Relaxed);
        pool.lock.store(0, Ordering::Release);
        return (mem + pos) as *mut u8;
    }

    // pool exhausted: expand with a fresh mapping
    pool.maps.fetch_add(1, Ordering::Relaxed);
    let np = unsafe { os::map(PAGE_SIZE) };
    if np.is_null() {
        pool.lock.store(0, Ordering::Release);
        crate::diag::fatal(format_args!("out of memory allocating {} bytes of boot memory", len));
    }
    pool.mem.store(np as usize, Ordering::Relaxed);
    pool.pos.store(len, Ordering::Relaxed);
    pool.lock.store(0, Ordering::Release);
    np
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_distinct() {
        let a = boot_alloc(100, 10);
        let b = boot_alloc(100, 10);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        assert_eq!(a as usize & 15, 0);
        assert_eq!(b as usize & 15, 0);
        unsafe {
            *a = 1;
            *b = 2;
            assert_eq!(*a, 1);
        }
    }

    #[test]
    fn large_falls_back_to_map() {
        let p = boot_alloc(101, BOOT_MEM + 1);
        assert!(!p.is_null());
        unsafe { *p.add(BOOT_MEM) = 7 };
    }

    #[test]
    fn exhaustion_expands() {
        // drain one sub-pool well past its static buffer
        for _ in 0..200 {
            let p = boot_alloc(102, 64);
            assert!(!p.is_null());
            unsafe { *p = 3 };
        }
    }
}
