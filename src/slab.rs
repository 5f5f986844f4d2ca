// Slab engine: regions of fixed-size cells.
//
// Metadata layout, in 64-bit words:
//   bin mask    one bit per cell, set while the cell sits in the bin
//   line words  pairs (alloc, ever-freed), pair k covers cells [64k, 64k+64)
//   accel A     one bit per line word, set when the line is fully allocated
//   accel B     one bit per A word, set when the A word is all ones
//   run words   pairs (in-run, last-of-run), only when cellen > MULTI_LEN
// Accelerators C (one bit per B word) and D (one bit per C word) are small
// enough to live in the descriptor.
//
// Allocation order: recycling bin, then the preallocation run. The run
// grabs every free cell of one line in a single step so subsequent
// allocations are one bit scan.

use core::ptr::null_mut;

use crate::{
    bits::{cel_msk, BitChunk},
    heap, region,
    types::{
        Heap, Region, Rtype, Status, BIN, BIN_FULL, FULL, MIN_REGION, MULTI_LEN, NOCEL, RUN_MAX,
        VM_BITS,
    },
};

#[inline]
unsafe fn m(reg: *mut Region, idx: usize) -> u64 {
    debug_assert!(idx < (*reg).metacnt);
    *(*reg).meta.add(idx)
}

#[inline]
unsafe fn mset(reg: *mut Region, idx: usize, val: u64) {
    debug_assert!(idx < (*reg).metacnt);
    *(*reg).meta.add(idx) = val;
}

// ------------------------------------------------------
// Region creation
// ------------------------------------------------------

// One slab region serves one cell length. The order is the maximum of a
// class-pressure minimum and the global order that grows with overall map
// count; large cells get extra headroom.
pub unsafe fn new_slab(
    hb: *mut Heap,
    cellen: u32,
    userlen: u32,
    clas: u16,
    addcnt: u16,
) -> *mut Region {
    let addord: u32 = match addcnt {
        0 | 1 => 0,
        2 | 3 => 1,
        4 | 5 => 2,
        6 => 3,
        7 => 4,
        8 => 5,
        9 => 6,
        10 => 8,
        11 => 10,
        12 => 12,
        13 => 14,
        14 => 15,
        n => n as u32,
    };

    let tzord = cellen.trailing_zeros();
    let maxord = core::cmp::min(VM_BITS as u32 - 2, tzord + 6 + 6 * 3);
    let mut order = core::cmp::max(MIN_REGION + addord, heap::new_reg_order());
    if tzord > 8 {
        order += tzord / 4;
    }
    order = core::cmp::min(maxord, order);

    let reglen = 1usize << order;
    let (cnt, celord) = if cellen.is_power_of_two() {
        ((reglen >> tzord) as u32, tzord as u16)
    } else {
        ((reglen / cellen as usize) as u32, 0u16)
    };
    debug_assert!(cnt > 1);

    let cnt64 = cnt >> 6;
    let linlen = cnt64 + 1; // one permanently-guarded overflow word
    let lena = (linlen >> 6) + 1;
    let lenb = (lena >> 6) + 1;

    let userun = cellen > MULTI_LEN;
    let runlen = if userun { 2 * linlen } else { 0 };

    let linpos = linlen;
    let apos = linpos + 2 * linlen;
    let bpos = apos + lena;
    let rpos = bpos + lenb;

    let mut metalen = ((rpos + runlen) as usize) * 8;
    if metalen < 0x2000 {
        metalen = 0x2000;
    }

    let reg = region::new_region(hb, order, reglen, metalen, Rtype::Slab);
    if reg.is_null() {
        return null_mut();
    }

    (*reg).celcnt = cnt;
    (*reg).frecnt = cnt;
    (*reg).linecnt = (cnt + 63) >> 6;
    (*reg).cellen = cellen;
    (*reg).ucellen = userlen;
    (*reg).celord = celord;
    (*reg).clas = clas;
    (*reg).userun = userun;

    (*reg).lpos = linpos;
    (*reg).apos = apos;
    (*reg).bpos = bpos;
    (*reg).rpos = rpos;

    // tail cells past celcnt never exist; pre-mark them allocated
    let xtra = cnt & 63;
    let msk = if xtra != 0 { FULL << xtra } else { FULL };
    mset(reg, (linpos + cnt64 * 2) as usize, msk);

    reg
}

// ------------------------------------------------------
// Preallocation run
// ------------------------------------------------------

// Set one accelerator bit for a now-full line, cascading upward.
unsafe fn fill_cascade(reg: *mut Region, ofs: usize) {
    let apos = (*reg).apos as usize;
    let bpos = (*reg).bpos as usize;

    let aacc = ofs >> 6;
    let abit = (ofs & 63) as u32;
    let na = BitChunk(m(reg, apos + aacc)).set(abit);
    mset(reg, apos + aacc, na.0);
    if !na.is_full() {
        return;
    }
    let bacc = aacc >> 6;
    let bbit = (aacc & 63) as u32;
    let nb = BitChunk(m(reg, bpos + bacc)).set(bbit);
    mset(reg, bpos + bacc, nb.0);
    if !nb.is_full() {
        return;
    }
    let cacc = bacc >> 6;
    let cbit = (bacc & 63) as u32;
    let nc = BitChunk((*reg).accc[cacc]).set(cbit);
    (*reg).accc[cacc] = nc.0;
    if nc.is_full() {
        (*reg).dmsk = BitChunk((*reg).dmsk).set(cacc as u32).0;
    }
}

// Clear the accelerator bit of a line that was full, cascading upward
// through levels that were themselves full.
unsafe fn drop_cascade(reg: *mut Region, ofs: usize) {
    let apos = (*reg).apos as usize;
    let bpos = (*reg).bpos as usize;

    let aacc = ofs >> 6;
    let abit = (ofs & 63) as u32;
    let amask = BitChunk(m(reg, apos + aacc));
    mset(reg, apos + aacc, amask.clear(abit).0);
    if !amask.is_full() {
        return;
    }
    let bacc = aacc >> 6;
    let bbit = (aacc & 63) as u32;
    let bmask = BitChunk(m(reg, bpos + bacc));
    mset(reg, bpos + bacc, bmask.clear(bbit).0);
    if !bmask.is_full() {
        return;
    }
    let cacc = bacc >> 6;
    let cbit = (bacc & 63) as u32;
    let cmask = BitChunk((*reg).accc[cacc]);
    (*reg).accc[cacc] = cmask.clear(cbit).0;
    if cmask.is_full() {
        (*reg).dmsk = BitChunk((*reg).dmsk).clear(cacc as u32).0;
    }
}

// Carve a run of up to 64 cells out of the first line with any free cell.
// Returns the inverted allocation mask, 0 when the region is full.
pub unsafe fn slab_prealloc(reg: *mut Region) -> u64 {
    let lpos = (*reg).lpos as usize;
    let apos = (*reg).apos as usize;
    let bpos = (*reg).bpos as usize;

    let dmsk = BitChunk((*reg).dmsk);
    if dmsk.is_full() {
        return 0;
    }
    let dbit = dmsk.first_clear();
    let cmsk = BitChunk((*reg).accc[dbit as usize]);
    let cbit = cmsk.first_clear();
    let bacc = (dbit << 6) + cbit;
    let bmsk = BitChunk(m(reg, bpos + bacc as usize));
    let bbit = bmsk.first_clear();
    let aacc = (bacc << 6) + bbit;
    let amsk = BitChunk(m(reg, apos + aacc as usize));
    let abit = amsk.first_clear();
    let ofs = (aacc << 6) + abit;

    if ofs >= (*reg).linecnt {
        return 0; // only guard words are left: genuinely full
    }

    let ofs2 = (ofs as usize) * 2;
    let almsk = m(reg, lpos + ofs2);
    if almsk == FULL {
        yerror!(
            "region {:x}: unexpected full run at {}/{}",
            (*reg).id,
            ofs,
            (*reg).linecnt
        );
        (*reg).status = Status::Error;
        return 0;
    }

    // grab every free cell of the line in one step
    mset(reg, lpos + ofs2, FULL);
    // cells entering the run lose their freed history
    let fremsk = m(reg, lpos + ofs2 + 1);
    mset(reg, lpos + ofs2 + 1, fremsk & almsk);

    (*reg).preofs = ofs;
    fill_cascade(reg, ofs as usize);
    (*reg).stats.preallocs += 1;

    !almsk
}

// ------------------------------------------------------
// Allocation
// ------------------------------------------------------

pub unsafe fn slab_alloc(hb: *mut Heap, reg: *mut Region) -> *mut u8 {
    let base = (*reg).hdr.user as usize;
    let cellen = (*reg).cellen as usize;

    // recycling bin first, most recent entry first
    let pos = (*reg).binpos;
    if pos != 0 {
        let pos = pos - 1;
        let cel = (*reg).bin[pos as usize];
        (*reg).binpos = pos;
        if cel >= (*reg).celcnt {
            yerror!("heap {} region {:x}: bin cell {} out of range", (*hb).id, (*reg).id, cel);
            (*reg).status = Status::Error;
            return null_mut();
        }
        let (ofs, _bit, msk) = cel_msk(cel);
        let binmsk = m(reg, ofs);
        if binmsk & msk == 0 {
            yerror!("heap {} region {:x}: bin cell {} not marked", (*hb).id, (*reg).id, cel);
            (*reg).status = Status::Error;
            return null_mut();
        }
        mset(reg, ofs, binmsk & !msk);
        (*reg).stats.binallocs += 1;
        return (base + cel as usize * cellen) as *mut u8;
    }

    let mut premsk = (*reg).premsk;
    if premsk == 0 {
        premsk = slab_prealloc(reg);
        if premsk == 0 {
            return null_mut(); // full: the caller moves to another region
        }
    }

    let bit = BitChunk(premsk).first_set();
    let cel = ((*reg).preofs << 6) + bit;
    debug_assert!(cel < (*reg).celcnt);
    (*reg).premsk = premsk & (premsk - 1);
    (*reg).frecnt -= 1;
    (*reg).stats.allocs += 1;
    (base + cel as usize * cellen) as *mut u8
}

// ------------------------------------------------------
// Pointer checking
// ------------------------------------------------------

// Checked cell id for a pointer into the region.
pub unsafe fn slab_cel(reg: *mut Region, ip: usize) -> u32 {
    let base = (*reg).hdr.user as usize;
    let cellen = (*reg).cellen;

    if ip < base {
        yerror!("ptr {:x} of size {} below region {:x}", ip, cellen, (*reg).id);
        return NOCEL;
    }
    let ofs8 = ip - base;
    let cel = if (*reg).celord != 0 {
        (ofs8 >> (*reg).celord) as u32
    } else {
        (ofs8 / cellen as usize) as u32
    };
    if cel >= (*reg).celcnt {
        yerror!(
            "ptr {:x} of size {} is {} blocks beyond region {:x} of {} blocks",
            ip,
            cellen,
            cel - (*reg).celcnt,
            (*reg).id,
            (*reg).celcnt
        );
        return NOCEL;
    }
    if cel as usize * cellen as usize != ofs8 {
        yerror!(
            "ptr {:x} of size {} is {} bytes inside block {} of region {:x}",
            ip,
            cellen,
            ofs8 - cel as usize * cellen as usize,
            cel,
            (*reg).id
        );
        return NOCEL;
    }
    cel
}

// Allocation state of a checked cell: handed out, or free/binned/in-run.
pub unsafe fn slab_is_alloc(reg: *mut Region, cel: u32) -> bool {
    let (ofs, _bit, msk) = cel_msk(cel);
    if m(reg, ofs) & msk != 0 {
        return false; // in the bin
    }
    if ofs as u32 == (*reg).preofs && (*reg).premsk & msk != 0 {
        return false; // in the preallocation run
    }
    m(reg, (*reg).lpos as usize + ofs * 2) & msk != 0
}

// Cells backing the block at cel: the run length for a grown block, 1
// otherwise.
pub unsafe fn slab_usable(reg: *mut Region, cel: u32) -> u32 {
    if (*reg).hasrun && run_bit(reg, cel) {
        run_len(reg, cel)
    } else {
        1
    }
}

// ------------------------------------------------------
// Runs
// ------------------------------------------------------

#[inline]
unsafe fn run_bit(reg: *mut Region, cel: u32) -> bool {
    let (ofs, _bit, msk) = cel_msk(cel);
    m(reg, (*reg).rpos as usize + ofs * 2) & msk != 0
}

#[inline]
unsafe fn last_bit(reg: *mut Region, cel: u32) -> bool {
    let (ofs, _bit, msk) = cel_msk(cel);
    m(reg, (*reg).rpos as usize + ofs * 2 + 1) & msk != 0
}

unsafe fn set_run(reg: *mut Region, cel: u32, last: bool) {
    let (ofs, _bit, msk) = cel_msk(cel);
    let rpos = (*reg).rpos as usize;
    mset(reg, rpos + ofs * 2, m(reg, rpos + ofs * 2) | msk);
    let lw = m(reg, rpos + ofs * 2 + 1);
    if last {
        mset(reg, rpos + ofs * 2 + 1, lw | msk);
    } else {
        mset(reg, rpos + ofs * 2 + 1, lw & !msk);
    }
}

unsafe fn clear_run(reg: *mut Region, cel: u32) {
    let (ofs, _bit, msk) = cel_msk(cel);
    let rpos = (*reg).rpos as usize;
    mset(reg, rpos + ofs * 2, m(reg, rpos + ofs * 2) & !msk);
    mset(reg, rpos + ofs * 2 + 1, m(reg, rpos + ofs * 2 + 1) & !msk);
}

// Length of the run starting at cel, bounded by RUN_MAX.
unsafe fn run_len(reg: *mut Region, cel: u32) -> u32 {
    let mut c = cel;
    loop {
        if last_bit(reg, c) {
            break;
        }
        c += 1;
        if c - cel >= RUN_MAX || c >= (*reg).celcnt {
            break;
        }
    }
    c - cel + 1
}

// ------------------------------------------------------
// Free
// ------------------------------------------------------

// Check a to-be-freed cell and mark it binned. Detects, before touching any
// state: cell inside the preallocation run, cell not allocated (stray or
// double free), cell already binned, and a pointer into the middle of a
// multi-cell run. Returns the run length, 0 on error.
pub unsafe fn slab_prefree(reg: *mut Region, cel: u32) -> u32 {
    let (ofs, _bit, msk) = cel_msk(cel);
    let lpos = (*reg).lpos as usize;
    let ofs2 = ofs * 2;
    let base = (*reg).hdr.user as usize;
    let ip = base + cel as usize * (*reg).cellen as usize;

    // still sitting in the preallocation run, never handed out
    if ofs as u32 == (*reg).preofs && (*reg).premsk & msk != 0 {
        yerror!("invalid free({:x}) of size {}: preallocated", ip, (*reg).cellen);
        return 0;
    }

    let almsk = m(reg, lpos + ofs2);
    if almsk & msk == 0 {
        // not allocated: double free if it ever was freed, stray otherwise
        if m(reg, lpos + ofs2 + 1) & msk != 0 {
            yerror!(
                "double free of ptr {:x} len {} region {:x}",
                ip,
                (*reg).cellen,
                (*reg).id
            );
        } else {
            yerror!("region {:x}: free({:x}) was never allocated", (*reg).id, ip);
        }
        return 0;
    }

    let binmsk = m(reg, ofs);
    if binmsk & msk != 0 {
        yerror!(
            "double free of ptr {:x} len {} region {:x}: already binned",
            ip,
            (*reg).cellen,
            (*reg).id
        );
        return 0;
    }

    let mut run = 1u32;
    if (*reg).hasrun && run_bit(reg, cel) {
        if cel != 0 && run_bit(reg, cel - 1) && !last_bit(reg, cel - 1) {
            yerror!(
                "region {:x}: ptr {:x} points inside a multi-cell block",
                (*reg).id,
                ip
            );
            return 0;
        }
        run = run_len(reg, cel);
        for c in cel..cel + run {
            clear_run(reg, c);
        }
    }

    for c in cel..cel + run {
        let (o, _b, m2) = cel_msk(c);
        mset(reg, o, m(reg, o) | m2);
    }
    run
}

// Genuinely free a batch of binned cells: fold them back into the bitmaps,
// dropping accelerator bits as lines leave the fully-allocated state.
// Consecutive cells sharing a line word fold in a single update.
pub unsafe fn slab_free(hb: *mut Heap, reg: *mut Region, cels: &[u32]) -> Status {
    let lpos = (*reg).lpos as usize;
    let base = (*reg).hdr.user as usize;
    let cellen = (*reg).cellen as usize;

    let mut rv = Status::Ok;
    let mut freed = 0u32;
    let mut i = 0usize;

    while i < cels.len() {
        let cel = cels[i];
        if cel >= (*reg).celcnt {
            yerror!("region {:x}: bin holds cell {} of {}", (*reg).id, cel, (*reg).celcnt);
            (*reg).status = Status::Error;
            i += 1;
            rv = Status::Error;
            continue;
        }
        let ofs = (cel >> 6) as usize;
        let mut cmsk = 1u64 << (cel & 63);
        let mut j = i + 1;
        while j < cels.len() && cels[j] < (*reg).celcnt && (cels[j] >> 6) as usize == ofs {
            cmsk |= 1u64 << (cels[j] & 63);
            j += 1;
        }
        i = j;

        let ofs2 = ofs * 2;
        let almsk = m(reg, lpos + ofs2);
        let fremsk = m(reg, lpos + ofs2 + 1);

        if almsk & cmsk != cmsk {
            // some cells are not allocated; report each and drop it
            let mut bad = cmsk & !almsk;
            while bad != 0 {
                let bit = bad.trailing_zeros();
                bad &= bad - 1;
                let ip = base + (ofs * 64 + bit as usize) * cellen;
                if fremsk & (1u64 << bit) != 0 {
                    yerror!("double free of ptr {:x} region {:x}", ip, (*reg).id);
                } else {
                    yerror!("ptr {:x} was not allocated in region {:x}", ip, (*reg).id);
                }
                (*hb).stats.invalid_frees += 1;
            }
            cmsk &= almsk;
            rv = Status::Error;
            if cmsk == 0 {
                continue;
            }
        }

        mset(reg, ofs, m(reg, ofs) & !cmsk); // leave the bin
        mset(reg, lpos + ofs2, almsk & !cmsk);
        mset(reg, lpos + ofs2 + 1, fremsk | cmsk);
        freed += cmsk.count_ones();

        if almsk == FULL {
            drop_cascade(reg, ofs);
        }
    }

    (*reg).frecnt += freed;
    (*reg).stats.frees += freed as u64;
    rv
}

// Check a pointer and push its cell (or run of cells) onto the bin. When the
// bin is full, the oldest batch is genuinely freed first. Returns whether
// the region is now entirely free.
pub unsafe fn slab_bin(hb: *mut Heap, reg: *mut Region, ip: usize) -> bool {
    let cel = slab_cel(reg, ip);
    if cel == NOCEL {
        (*hb).stats.invalid_frees += 1;
        return false;
    }
    let run = slab_prefree(reg, cel);
    if run == 0 {
        (*hb).stats.invalid_frees += 1;
        return false;
    }
    (*reg).stats.binned += run as u64;

    let mut binpos = (*reg).binpos as usize;
    for r in 0..run {
        if binpos == BIN {
            let mut batch = [0u32; BIN_FULL];
            core::ptr::copy_nonoverlapping((*reg).bin.as_ptr(), batch.as_mut_ptr(), BIN_FULL);
            slab_free(hb, reg, &batch);
            core::ptr::copy(
                (*reg).bin.as_ptr().add(BIN_FULL),
                (*reg).bin.as_mut_ptr(),
                BIN - BIN_FULL,
            );
            binpos = BIN - BIN_FULL;
        }
        (*reg).bin[binpos] = cel + r;
        binpos += 1;
    }
    (*reg).binpos = binpos as u16;

    (*reg).celcnt == (*reg).frecnt + binpos as u32
}

// ------------------------------------------------------
// In-place growth
// ------------------------------------------------------

// Try to grow the block at ip to newlen by extending its run over the
// following cells. Oom means the caller falls back to allocate-copy-free.
pub unsafe fn slab_real(hb: *mut Heap, reg: *mut Region, ip: usize, newlen: usize) -> Status {
    let cellen = (*reg).cellen;
    let lpos = (*reg).lpos as usize;

    let cel = slab_cel(reg, ip);
    if cel == NOCEL {
        (*hb).stats.invalid_reallocs += 1;
        return Status::Error;
    }
    let (ofs, _bit, msk) = cel_msk(cel);

    if ofs as u32 == (*reg).preofs && (*reg).premsk & msk != 0 {
        yerror!("invalid realloc({:x}) of size {}: preallocated", ip, cellen);
        (*hb).stats.invalid_reallocs += 1;
        return Status::Error;
    }
    let almsk = m(reg, lpos + ofs * 2);
    if almsk & msk == 0 {
        if m(reg, lpos + ofs * 2 + 1) & msk != 0 {
            yerror!("realloc({:x}) of freed block in region {:x}", ip, (*reg).id);
        } else {
            yerror!("realloc({:x}) was never allocated in region {:x}", ip, (*reg).id);
        }
        (*hb).stats.invalid_reallocs += 1;
        return Status::Error;
    }
    if m(reg, ofs) & msk != 0 {
        yerror!("realloc({:x}) of binned block in region {:x}", ip, (*reg).id);
        (*hb).stats.invalid_reallocs += 1;
        return Status::Error;
    }

    let mut cur = 1u32;
    if (*reg).hasrun && run_bit(reg, cel) {
        if cel != 0 && run_bit(reg, cel - 1) && !last_bit(reg, cel - 1) {
            yerror!("region {:x}: realloc({:x}) points inside a multi-cell block", (*reg).id, ip);
            (*hb).stats.invalid_reallocs += 1;
            return Status::Error;
        }
        cur = run_len(reg, cel);
    }

    let needcnt = ((newlen + cellen as usize - 1) / cellen as usize) as u32;
    if needcnt <= cur {
        return Status::Ok; // large enough already
    }
    if needcnt > RUN_MAX || cel + needcnt > (*reg).celcnt {
        return Status::Oom;
    }

    // every extension cell must be free: folded back, or still available in
    // the current preallocation run
    for c in cel + cur..cel + needcnt {
        let (o, _b, m2) = cel_msk(c);
        if m(reg, lpos + o * 2) & m2 == 0 {
            continue;
        }
        if o as u32 == (*reg).preofs && (*reg).premsk & m2 != 0 {
            continue;
        }
        return Status::Oom;
    }

    for c in cel + cur..cel + needcnt {
        let (o, _b, m2) = cel_msk(c);
        let al = m(reg, lpos + o * 2);
        if al & m2 == 0 {
            let nal = al | m2;
            mset(reg, lpos + o * 2, nal);
            mset(reg, lpos + o * 2 + 1, m(reg, lpos + o * 2 + 1) & !m2);
            if nal == FULL {
                fill_cascade(reg, o);
            }
        } else {
            (*reg).premsk &= !m2;
        }
        (*reg).frecnt -= 1;
    }

    for c in cel..cel + needcnt {
        set_run(reg, c, c == cel + needcnt - 1);
    }
    (*reg).hasrun = true;
    Status::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::new_heap_raw;

    unsafe fn mkslab(cellen: u32) -> (*mut Heap, *mut Region) {
        let hb = new_heap_raw();
        assert!(!hb.is_null());
        let reg = new_slab(hb, cellen, cellen, 1, 0);
        assert!(!reg.is_null());
        (hb, reg)
    }

    #[test]
    fn contiguous_cells() {
        unsafe {
            let (hb, reg) = mkslab(2);
            let p1 = slab_alloc(hb, reg) as usize;
            let p2 = slab_alloc(hb, reg) as usize;
            let p3 = slab_alloc(hb, reg) as usize;
            assert_eq!(p2 - p1, 2);
            assert_eq!(p3 - p2, 2);
            assert_eq!((*reg).frecnt, (*reg).celcnt - 3);
        }
    }

    #[test]
    fn bin_is_lifo() {
        unsafe {
            let (hb, reg) = mkslab(16);
            let mut ptrs = [0usize; 8];
            for p in ptrs.iter_mut() {
                *p = slab_alloc(hb, reg) as usize;
            }
            for p in ptrs.iter() {
                slab_bin(hb, reg, *p);
            }
            assert_eq!((*reg).binpos, 8);
            for p in ptrs.iter().rev() {
                assert_eq!(slab_alloc(hb, reg) as usize, *p);
            }
            assert_eq!((*reg).binpos, 0);
        }
    }

    #[test]
    fn accelerators_track_full_lines() {
        unsafe {
            let (hb, reg) = mkslab(8);
            // drain the first two runs entirely
            for _ in 0..128 {
                assert!(!slab_alloc(hb, reg).is_null());
            }
            let apos = (*reg).apos as usize;
            assert_eq!(m(reg, apos) & 3, 3); // lines 0 and 1 full
            // folding a cell back clears the line's accelerator bit
            let cel = slab_cel(reg, (*reg).hdr.user as usize);
            assert_eq!(slab_prefree(reg, cel), 1);
            slab_free(hb, reg, &[cel]);
            assert_eq!(m(reg, apos) & 1, 0);
            assert_eq!(m(reg, apos) & 2, 2);
            // the next prealloc lands on the reopened line
            (*reg).premsk = 0;
            let run = slab_prealloc(reg);
            assert_eq!((*reg).preofs, 0);
            assert_eq!(run, 1); // only the folded cell is free there
        }
    }

    #[test]
    fn misuse_is_detected() {
        unsafe {
            let (hb, reg) = mkslab(32);
            let p = slab_alloc(hb, reg) as usize;
            assert!(slab_cel(reg, p + 1) == NOCEL); // inside block
            assert_eq!(slab_prefree(reg, slab_cel(reg, p)), 1);
            assert_eq!(slab_prefree(reg, slab_cel(reg, p)), 0); // already binned
            // a cell never handed out is caught through the run mask
            let cel9 = 9u32;
            assert_eq!(slab_prefree(reg, cel9), 0); // still preallocated
        }
    }

    #[test]
    fn grow_in_place() {
        unsafe {
            let (hb, reg) = mkslab(2048);
            assert!((*reg).userun);
            let p = slab_alloc(hb, reg) as usize;
            // the neighbour cell is still in the preallocation run
            assert_eq!(slab_real(hb, reg, p, 4096), Status::Ok);
            assert_eq!(run_len(reg, 0), 2);
            // freeing the run returns both cells
            assert_eq!(slab_prefree(reg, 0), 2);
        }
    }
}
