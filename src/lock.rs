// Heap lock: an uncontended acquire is one compare-and-swap. Contention
// spins briefly, marks the word contended and waits on the OS with a
// timeout. State: 0 free, 1 held, 2 held with possible waiters.

use core::{
    hint::spin_loop,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    os,
    types::{Heap, Status, LOCK_SPIN, LOCK_TIMEOUT_US},
};

#[inline]
pub fn try_lock(lock: &AtomicU32) -> bool {
    lock.compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
}

// Slow path. Acquires as contended so the release always wakes a waiter.
fn lock_slow(lock: &AtomicU32) -> Status {
    let mut iter = 50u32;
    loop {
        let mut spin = LOCK_SPIN;
        loop {
            match lock.load(Ordering::Relaxed) {
                0 => {
                    if lock
                        .compare_exchange_weak(0, 2, Ordering::Acquire, Ordering::Relaxed)
                        .is_ok()
                    {
                        return Status::Ok;
                    }
                }
                2 => break,
                _ => {}
            }
            spin_loop();
            spin -= 1;
            if spin == 0 {
                break;
            }
        }

        match lock.load(Ordering::Relaxed) {
            0 => continue,
            1 => {
                let _ = lock.compare_exchange(1, 2, Ordering::Relaxed, Ordering::Relaxed);
            }
            _ => {}
        }
        match os::wait(lock, 2, LOCK_TIMEOUT_US) {
            Status::Tmo => return Status::Tmo,
            Status::Error => return Status::Error,
            _ => {}
        }
        if lock
            .compare_exchange(0, 2, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return Status::Ok;
        }
        iter -= 1;
        if iter == 0 {
            return Status::Tmo;
        }
    }
}

// Lock a heap. On timeout nothing was acquired and nothing was mutated.
pub unsafe fn lock_heap(hb: *mut Heap) -> Status {
    if try_lock(&(*hb).lock) {
        (*hb).stats.locks += 1;
        return Status::Ok;
    }
    let rv = lock_slow(&(*hb).lock);
    if rv == Status::Ok {
        (*hb).stats.locks += 1;
        (*hb).stats.oslocks += 1;
    }
    rv
}

pub unsafe fn unlock_heap(hb: *mut Heap) {
    let lock = &(*hb).lock;
    if lock
        .compare_exchange(1, 0, Ordering::Release, Ordering::Relaxed)
        .is_ok()
    {
        return;
    }
    // contended: release and wake one waiter
    lock.store(0, Ordering::Release);
    os::wake(lock);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::AtomicU32;

    #[test]
    fn uncontended() {
        let l = AtomicU32::new(0);
        assert!(try_lock(&l));
        assert!(!try_lock(&l));
        l.store(0, Ordering::Release);
        assert!(try_lock(&l));
    }

    #[test]
    fn slow_path_times_out() {
        let l = AtomicU32::new(2);
        assert_eq!(lock_slow(&l), Status::Tmo);
        assert_eq!(l.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn slow_path_grabs_free_lock() {
        let l = AtomicU32::new(0);
        assert_eq!(lock_slow(&l), Status::Ok);
        assert_eq!(l.load(Ordering::Relaxed), 2);
    }
}
