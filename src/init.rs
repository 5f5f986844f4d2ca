// One-time process initialisation, triggered by the first public call of
// the first thread. No implicit static initialisation allocates anything.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::{diag, options, os, stats, types::PAGE_SIZE};

static PROCESS_STATE: AtomicU32 = AtomicU32::new(0); // 0 fresh, 1 busy, 2 up

extern "C" fn at_exit_hook() {
    if options::stats() != 0 {
        stats::stats_print();
    }
}

#[inline]
pub fn process_init() {
    if PROCESS_STATE.load(Ordering::Acquire) == 2 {
        return;
    }
    process_init_slow();
}

fn process_init_slow() {
    match PROCESS_STATE.compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            options::init_env();
            let page = os::page_size();
            if page != PAGE_SIZE {
                diag::fatal(format_args!("os page size {}, configured {}", page, PAGE_SIZE));
            }
            if options::stats() != 0 {
                os::at_exit(at_exit_hook);
            }
            PROCESS_STATE.store(2, Ordering::Release);
        }
        Err(_) => {
            // another thread is in init; wait for it
            while PROCESS_STATE.load(Ordering::Acquire) != 2 {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        process_init();
        process_init();
        assert_eq!(PROCESS_STATE.load(Ordering::Relaxed), 2);
    }
}
