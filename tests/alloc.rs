// End-to-end allocator behaviour through the public API. Every test runs on
// its own harness thread, so each gets its own heap.

use std::collections::HashSet;
use std::sync::{mpsc, Arc, Barrier};
use std::thread;

use yamalloc::api::*;

// Force the calling thread past the mini-heap onto a real heap.
fn warm_up() {
    unsafe {
        let p = malloc(4096);
        assert!(!p.is_null());
        free(p);
    }
}

#[test]
fn zero_length_sentinel() {
    unsafe {
        warm_up();
        let z1 = malloc(0);
        let z2 = malloc(0);
        assert!(!z1.is_null());
        assert_eq!(z1, z2, "malloc(0) is one process-wide block");
        assert_eq!(usable_size(z1), 0);

        let inv = stats().invalid_frees;
        free(z1);
        free(z1); // still a no-op: the block is pristine
        assert_eq!(stats().invalid_frees, inv);

        // resizing the zero block allocates a real one
        let p = realloc(z1, 10);
        assert!(!p.is_null());
        assert_ne!(p, z1);
        free(p);
    }
}

#[test]
fn tiny_classes_are_packed() {
    unsafe {
        warm_up();
        let p1 = malloc(1) as usize;
        let p2 = malloc(1) as usize;
        let p3 = malloc(1) as usize;
        assert!(p1 != 0 && p2 != 0 && p3 != 0);
        assert_eq!(p2 - p1, 2, "one-byte blocks live in the 2-byte class");
        assert_eq!(p3 - p2, 2);
        assert_eq!(usable_size(p1 as *mut u8), 2);
        free(p1 as *mut u8);
        free(p2 as *mut u8);
        free(p3 as *mut u8);
    }
}

#[test]
fn weak_alignment() {
    unsafe {
        warm_up();
        assert_eq!(malloc(1) as usize & 1, 0);
        assert_eq!(malloc(3) as usize & 3, 0);
        assert_eq!(malloc(5) as usize & 7, 0);
        assert_eq!(malloc(16) as usize & 15, 0);
        assert_eq!(malloc(100) as usize & 15, 0);
        assert_eq!(malloc(1000) as usize & 15, 0);
    }
}

#[test]
fn bin_returns_blocks_lifo() {
    unsafe {
        warm_up();
        let mut ptrs = Vec::new();
        for _ in 0..128 {
            let p = malloc(16);
            assert!(!p.is_null());
            ptrs.push(p as usize);
        }
        // release the even-indexed blocks in order
        let mut released = Vec::new();
        for i in (0..128).step_by(2) {
            free(ptrs[i] as *mut u8);
            released.push(ptrs[i]);
        }
        // the 64 fresh blocks are exactly the released ones, most recent
        // release first
        for i in 0..64 {
            let p = malloc(16) as usize;
            assert_eq!(p, released[63 - i], "alloc {} out of LIFO order", i);
        }
        for p in ptrs.iter().skip(1).step_by(2) {
            free(*p as *mut u8);
        }
    }
}

#[test]
fn double_free_is_counted_once() {
    unsafe {
        warm_up();
        let p = malloc(64);
        assert!(!p.is_null());
        free(p);
        let inv = stats().invalid_frees;
        free(p);
        assert_eq!(stats().invalid_frees, inv + 1);
        // and the program carries on
        let q = malloc(64);
        assert!(!q.is_null());
        free(q);
    }
}

#[test]
fn inside_block_pointer_is_invalid() {
    unsafe {
        warm_up();
        let p = malloc(64);
        let inv = stats().invalid_frees;
        free((p as usize + 8) as *mut u8);
        assert_eq!(stats().invalid_frees, inv + 1);
        free(p);
        assert_eq!(stats().invalid_frees, inv + 1);
    }
}

#[test]
fn usable_size_drops_on_release() {
    unsafe {
        warm_up();
        let p = malloc(200);
        assert!(usable_size(p) >= 200);
        free(p);
        assert_eq!(usable_size(p), 0);

        let q = malloc(1 << 20);
        assert!(usable_size(q) >= 1 << 20);
        free(q);
        assert_eq!(usable_size(q), 0);
    }
}

#[test]
fn threshold_boundary() {
    unsafe {
        warm_up();
        let maps = stats().mapallocs;
        let p = malloc((1 << 16) - 1); // below: slab
        assert!(!p.is_null());
        assert_eq!(stats().mapallocs, maps);
        let q = malloc(1 << 16); // at: direct map
        assert!(!q.is_null());
        assert_eq!(stats().mapallocs, maps + 1);
        assert_eq!(q as usize & 4095, 0);
        free(p);
        free(q);
    }
}

#[test]
fn calloc_zeroes_and_checks_overflow() {
    unsafe {
        warm_up();
        assert!(calloc(usize::max_value() / 2, 3).is_null());

        // dirty a cell, release it, then calloc must hand back zeroed bytes
        let p = malloc(64);
        std::ptr::write_bytes(p, 0xa5, 64);
        free(p);
        let c = calloc(4, 16);
        for i in 0..64 {
            assert_eq!(*c.add(i), 0, "byte {} not zeroed", i);
        }
        free(c);
    }
}

#[test]
fn realloc_in_place_and_copy() {
    unsafe {
        warm_up();
        // resize to the usable size never moves
        let p = malloc(100);
        let cap = usable_size(p);
        assert!(cap >= 100);
        assert_eq!(realloc(p, cap), p);
        assert_eq!(realloc(p, 50), p);

        // growth preserves contents
        for i in 0..100 {
            *p.add(i) = i as u8;
        }
        let q = realloc(p, 5000);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(*q.add(i), i as u8);
        }
        free(q);

        // null pointer behaves like malloc, zero length like free
        let r = realloc(std::ptr::null_mut(), 32);
        assert!(!r.is_null());
        let z = realloc(r, 0);
        assert_eq!(usable_size(z), 0);
    }
}

#[test]
fn realloc_of_released_block_fails() {
    unsafe {
        warm_up();
        let p = malloc(64);
        free(p);
        let bad = stats().invalid_reallocs;
        assert!(realloc(p, 128).is_null());
        assert_eq!(stats().invalid_reallocs, bad + 1);
    }
}

#[test]
fn direct_map_resize() {
    unsafe {
        warm_up();
        let len = 1 << 20;
        let p = malloc(len);
        assert!(!p.is_null());
        for i in (0..len).step_by(4096) {
            *p.add(i) = (i >> 12) as u8;
        }
        let q = realloc(p, 2 << 20);
        assert!(!q.is_null());
        assert!(usable_size(q) >= 2 << 20);
        for i in (0..len).step_by(4096) {
            assert_eq!(*q.add(i), (i >> 12) as u8, "page {} lost", i >> 12);
        }
        // and shrink back down
        let s = realloc(q, 1 << 16);
        assert!(!s.is_null());
        assert!(usable_size(s) >= 1 << 16);
        assert_eq!(*s.add(0), 0);
        free(s);
    }
}

#[test]
fn aligned_allocation() {
    unsafe {
        warm_up();
        let inv = stats().invalid_frees;

        let p = aligned_alloc(4096, 100);
        assert!(!p.is_null());
        assert_eq!(p as usize & 4095, 0);
        assert!(usable_size(p) >= 100);
        free(p);

        // above the page size the mapping is over-allocated and adjusted
        let q = aligned_alloc(16384, 1000);
        assert!(!q.is_null());
        assert_eq!(q as usize & 16383, 0);
        assert!(usable_size(q) >= 1000);
        free(q);

        // small alignments are natural
        let r = aligned_alloc(8, 24);
        assert!(!r.is_null());
        assert_eq!(r as usize & 7, 0);
        free(r);

        assert_eq!(stats().invalid_frees, inv);
        assert!(aligned_alloc(3, 100).is_null(), "alignment must be a power of two");
    }
}

#[test]
fn sized_release_checks_length() {
    unsafe {
        warm_up();
        let p = malloc(300);
        let errs = stats().errors;
        free_sized(p, 8); // wrong length: refused
        assert_eq!(stats().errors, errs + 1);
        assert!(usable_size(p) >= 300, "block must survive a refused release");
        free_sized(p, 300);
        assert_eq!(usable_size(p), 0);
        assert_eq!(stats().errors, errs + 1);
    }
}

#[test]
fn cross_thread_release() {
    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel::<Vec<usize>>();

    let b2 = barrier.clone();
    let consumer = thread::spawn(move || {
        warm_up();
        let ptrs = rx.recv().unwrap();
        unsafe {
            for ip in &ptrs {
                free(*ip as *mut u8);
            }
        }
        b2.wait();
    });

    warm_up();
    let mut ptrs = Vec::new();
    unsafe {
        for _ in 0..1000 {
            let p = malloc(48);
            assert!(!p.is_null());
            ptrs.push(p as usize);
        }
    }
    let freed: HashSet<usize> = ptrs.iter().cloned().collect();
    tx.send(ptrs).unwrap();
    barrier.wait();

    // the remote frees are visible: allocation reuses released blocks
    unsafe {
        let mut hits = 0;
        for _ in 0..1000 {
            let p = malloc(48) as usize;
            assert!(p != 0);
            if freed.contains(&p) {
                hits += 1;
            }
        }
        assert!(hits > 0, "no released block was reused after remote free");
    }
    consumer.join().unwrap();
}

#[test]
fn mini_heap_serves_first_blocks() {
    // a brand-new thread with only tiny allocations stays on the mini-heap
    thread::spawn(|| unsafe {
        let p = malloc(8);
        let q = malloc(24);
        assert!(!p.is_null() && !q.is_null());
        assert_eq!(p as usize & 15, 0);
        // mini blocks report their rounded length
        assert_eq!(usable_size(p), 16);
        assert_eq!(usable_size(q), 32);
        // releases of mini blocks are accepted and ignored
        let inv = stats().invalid_frees;
        free(p);
        free(q);
        assert_eq!(stats().invalid_frees, inv);
        // heavier use flips to a real heap
        let r = malloc(512);
        assert!(!r.is_null());
        free(r);
    })
    .join()
    .unwrap();
}

#[test]
fn thread_retirement_recycles_heaps() {
    thread::spawn(|| unsafe {
        warm_up();
        let p = malloc(100);
        free(p);
        thread_done();
    })
    .join()
    .unwrap();

    // a later thread adopts a retired heap or builds a fresh one; either
    // way allocation works
    thread::spawn(|| unsafe {
        let p = malloc(100);
        assert!(!p.is_null());
        free(p);
    })
    .join()
    .unwrap();
}

#[test]
fn stats_trigger_prints() {
    unsafe {
        warm_up();
        // the debugging hook: calloc(0, magic) prints statistics and hands
        // back the zero block
        let z = calloc(0, 0x1122_3344);
        assert_eq!(usable_size(z), 0);
    }
}

#[test]
fn churn_stays_consistent() {
    unsafe {
        warm_up();
        let mut live: Vec<(usize, usize)> = Vec::new();
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for round in 0..20_000u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let len = 1 + (seed as usize % 700);
            let p = malloc(len);
            assert!(!p.is_null());
            assert!(usable_size(p) >= len, "round {}", round);
            *p = round as u8;
            *p.add(len - 1) = (round >> 8) as u8;
            live.push((p as usize, len));
            if live.len() > 64 {
                let (victim, _) = live.swap_remove((seed >> 32) as usize % live.len());
                free(victim as *mut u8);
            }
        }
        let inv = stats().invalid_frees;
        for (p, _) in live {
            free(p as *mut u8);
        }
        assert_eq!(stats().invalid_frees, inv);
    }
}
