// Statistics: plain per-heap counters, mutated by the owner (or a lock
// holder), snapshotted and printed on demand or at exit. The print path
// writes straight to stderr; it runs inside atexit.

use core::sync::atomic::Ordering;

use crate::{
    bind, diag, heap, options,
    types::{Heap, Region, Rtype, Stats},
};

// Snapshot of the calling thread's heap counters.
pub unsafe fn thread_stats() -> Stats {
    let hb = bind::get_heap();
    if hb.is_null() {
        return Stats::default();
    }
    (*hb).stats
}

unsafe fn print_heap(hb: *mut Heap, detail: bool) {
    let s = &(*hb).stats;
    diag::out(
        diag::ERR_FD,
        format_args!(
            "heap {:<3} alloc {:<8} calloc {:<6} free {:<8} map {:<5} unmap {:<5} remote {:<5}",
            (*hb).id,
            s.allocs,
            s.callocs,
            s.frees,
            s.mapallocs,
            s.munmaps,
            s.remote_frees
        ),
    );
    if s.invalid_frees + s.invalid_reallocs + s.errors + s.oslocktimeouts != 0 {
        diag::out(
            diag::ERR_FD,
            format_args!(
                "  invalid-free {} invalid-realloc {} error {} lock-timeout {}",
                s.invalid_frees, s.invalid_reallocs, s.errors, s.oslocktimeouts
            ),
        );
    }
    if !detail {
        return;
    }
    for rid in 1..=(*hb).allocregcnt as usize {
        let reg = (*(*hb).regs.add(rid)).load(Ordering::Acquire) as *mut Region;
        if reg.is_null() || (*reg).hdr.typ != Rtype::Slab {
            continue;
        }
        let rs = &(*reg).stats;
        if rs.allocs + rs.binallocs == 0 {
            continue;
        }
        diag::out(
            diag::ERR_FD,
            format_args!(
                "  region {:<6x} len {:<9} cellen {:<6} alloc {:<8} bin {:<7} pre {:<6} free {:<8} binned {}",
                (*reg).id,
                (*reg).hdr.len,
                (*reg).cellen,
                rs.allocs,
                rs.binallocs,
                rs.preallocs,
                rs.frees,
                rs.binned
            ),
        );
    }
}

// Summary per heap, optional per-region detail, totals over all heaps.
pub fn stats_print() {
    let opt = options::stats();
    let detail = opt & options::STATS_DETAIL != 0;

    unsafe {
        let mut hb = heap::heaps_head();
        let mut tot = Stats::default();
        let mut heaps = 0u32;
        while !hb.is_null() {
            print_heap(hb, detail);
            let s = &(*hb).stats;
            tot.allocs += s.allocs;
            tot.callocs += s.callocs;
            tot.frees += s.frees;
            tot.mapallocs += s.mapallocs;
            tot.mmaps += s.mmaps;
            tot.munmaps += s.munmaps;
            tot.remote_frees += s.remote_frees;
            tot.invalid_frees += s.invalid_frees;
            tot.invalid_reallocs += s.invalid_reallocs;
            tot.errors += s.errors;
            tot.oslocktimeouts += s.oslocktimeouts;
            heaps += 1;
            hb = (*hb).nxt;
        }
        diag::out(
            diag::ERR_FD,
            format_args!(
                "total {} heap(s): alloc {} calloc {} free {} map {} unmap {} remote {} invalid {}",
                heaps,
                tot.allocs,
                tot.callocs,
                tot.frees,
                tot.mapallocs,
                tot.munmaps,
                tot.remote_frees,
                tot.invalid_frees + tot.invalid_reallocs
            ),
        );
    }
}
