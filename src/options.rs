// Run-time options, initialised once from the environment and adjustable
// through the public API.
//
// check level is a bit mask: 1 detect and count, 2 also print, 4 also exit.
// stats mask: 1 summary per heap, 2 detail per region, 4 totals.
// trace level: 0..7.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::os;

pub const CHECK_COUNT: u32 = 1;
pub const CHECK_PRINT: u32 = 2;
pub const CHECK_EXIT: u32 = 4;

pub const STATS_SUMMARY: u32 = 1;
pub const STATS_DETAIL: u32 = 2;
pub const STATS_TOTALS: u32 = 4;

pub const CHECK_DEFAULT: u32 = CHECK_COUNT | CHECK_PRINT;

pub const CHECK_ENVVAR: &[u8] = b"YAMALLOC_CHECK\0";
pub const STATS_ENVVAR: &[u8] = b"YAMALLOC_STATS\0";
pub const TRACE_ENVVAR: &[u8] = b"YAMALLOC_TRACE\0";

static GLOBAL_CHECK: AtomicU32 = AtomicU32::new(CHECK_DEFAULT);
static GLOBAL_STATS: AtomicU32 = AtomicU32::new(0);
static GLOBAL_TRACE: AtomicU32 = AtomicU32::new(0);
static GLOBAL_PID: AtomicU32 = AtomicU32::new(0);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Opt {
    Check,
    Stats,
    Trace,
}

pub fn init_env() {
    let val = os::getenv_u32(CHECK_ENVVAR);
    if val != !0u32 {
        GLOBAL_CHECK.store(val, Ordering::Relaxed);
    }
    let val = os::getenv_u32(STATS_ENVVAR);
    if val != !0u32 {
        GLOBAL_STATS.store(val, Ordering::Relaxed);
    }
    let val = os::getenv_u32(TRACE_ENVVAR);
    if val != !0u32 {
        GLOBAL_TRACE.store(val & 7, Ordering::Relaxed);
    }
    GLOBAL_PID.store(os::pid(), Ordering::Relaxed);
}

pub fn set(opt: Opt, val: u32) {
    match opt {
        Opt::Check => GLOBAL_CHECK.store(val, Ordering::Relaxed),
        Opt::Stats => GLOBAL_STATS.store(val, Ordering::Relaxed),
        Opt::Trace => GLOBAL_TRACE.store(val & 7, Ordering::Relaxed),
    }
}

#[inline]
pub fn check() -> u32 {
    GLOBAL_CHECK.load(Ordering::Relaxed)
}

#[inline]
pub fn stats() -> u32 {
    GLOBAL_STATS.load(Ordering::Relaxed)
}

#[inline]
pub fn trace() -> u32 {
    GLOBAL_TRACE.load(Ordering::Relaxed)
}

#[inline]
pub fn pid() -> u32 {
    GLOBAL_PID.load(Ordering::Relaxed)
}
