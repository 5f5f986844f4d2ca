use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicUsize},
};

// ------------------------------------------------------
// Compile-time configuration
// ------------------------------------------------------

// Virtual address width. Pointers with bits above this set are rejected.
pub const VM_BITS: usize = 48;
pub const VM_SIZE: usize = 1 << VM_BITS;

// Page order is fixed at build time and verified against the OS at init.
pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

// Directory fan-outs. The three levels cover every page in the VM space.
pub const DIR1_BITS: usize = 12;
pub const DIR2_BITS: usize = 12;
pub const DIR3_BITS: usize = 12;

pub const DIR1_LEN: usize = 1 << DIR1_BITS;
pub const DIR2_LEN: usize = 1 << DIR2_BITS;
pub const DIR3_LEN: usize = 1 << DIR3_BITS;

pub const DIR1_MASK: usize = DIR1_LEN - 1;
pub const DIR2_MASK: usize = DIR2_LEN - 1;
pub const DIR3_MASK: usize = DIR3_LEN - 1;

const _: () = assert!(DIR1_BITS + DIR2_BITS + DIR3_BITS == VM_BITS - PAGE_BITS);
const _: () = assert!(core::mem::size_of::<usize>() == 8);

// A mid-level directory slot with this bit set holds a region id directly:
// the whole sub-range belongs to one region.
pub const DIR_WIDE: usize = 1 << 63;

// Base alignment of blocks larger than 8 bytes.
pub const STD_ALIGN: usize = 16;

// A fresh slab region is at least 1 << MIN_REGION bytes; the order grows
// with overall heap pressure.
pub const MIN_REGION: u32 = 16;

// Blocks at or above this length are served by their own OS mapping.
pub const MMAP_THRESHOLD: usize = 1 << 16;

// Sub-classes between adjacent powers of two: 1 << CLAS_BITS.
pub const CLAS_BITS: u32 = 2;
pub const TINY_CLAS: usize = 6;
pub const CLAS_CNT: usize = 128;
pub const CLAS_REGS: usize = 32;

// Recycling bin capacity and drain batch.
pub const BIN: usize = 128;
pub const BIN_FULL: usize = 64;

const _: () = assert!(BIN > 2 && BIN_FULL < BIN);

// Cell lengths above this carry run metadata for in-place growth.
pub const MULTI_LEN: u32 = 1024;
pub const RUN_MAX: u32 = 64;

// Mini-heap: per-thread bump buffer used before a real heap exists.
pub const BUMP_LEN: usize = 0x4000;
pub const BUMP_MAX: usize = 256;

const _: () = assert!(BUMP_LEN & (STD_ALIGN - 1) == 0);
const _: () = assert!(BUMP_LEN / STD_ALIGN < 65536);
const _: () = assert!(BUMP_MAX < BUMP_LEN / 2);

// Directory-id space per heap, bounded by the u16 leaf entries.
pub const REGIONS: usize = 1 << 16;
pub const INI_REGS: usize = 256;
pub const REGMEM_INC: usize = 32;
pub const XREGMEM_INC: usize = 256;

// Directory node pool sizes, in bytes.
pub const DIRMEM_LEAF: usize = DIR3_LEN * 2;
pub const DIRMEM_NODE: usize = DIR2_LEN * 8;
pub const DIRMEM_INIT: usize = DIRMEM_LEAF * 8;
pub const DIRMEM_GROW: usize = DIRMEM_NODE * 16;

// Trim: every REGION_INTERVAL local frees, scan up to TRIM_SCAN descriptors;
// a region sitting fully free for more than its age threshold is released.
pub const REGION_INTERVAL: u32 = 0xff;
pub const TRIM_SCAN: u32 = 64;
pub const TRIM_AGE: u32 = 2;
pub const TRIM_AGE_LARGE: u32 = 3;

// Heap lock: spin briefly, then wait on the OS with a timeout.
pub const LOCK_SPIN: u32 = 100;
pub const LOCK_TIMEOUT_US: u32 = 1000;

// calloc(0, STATS_TRIGGER) prints statistics: debugging hook.
pub const STATS_TRIGGER: usize = 0x1122_3344;

pub const FULL: u64 = !0u64;
pub const NOCEL: u32 = !0u32;

// ------------------------------------------------------
// Region descriptors
// ------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Rtype {
    None = 0,
    Slab,
    Mmap,
    MmapFree,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Oom,
    Tmo,
    Error,
}

// Lean descriptor for direct-mapped blocks. Also the common header of a full
// slab region, so a directory hit can be dispatched on `typ` alone.
#[repr(C)]
pub struct XRegion {
    pub user: *mut u8,  // user block base
    pub len: usize,     // mapping length, page aligned
    pub ulen: usize,    // net requested length
    pub abase: usize,   // adjusted base for aligned allocations, 0 otherwise
    pub typ: Rtype,
    pub nxt: u16,       // free-list link in directory-id space
    pub dirid: u16,
}

#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct RegStats {
    pub allocs: u64,
    pub binallocs: u64,
    pub preallocs: u64,
    pub frees: u64,
    pub binned: u64,
}

// Slab region. Metadata lives in a separately mapped block so user writes
// cannot reach it:
//   bin mask     - one bit per cell, set while the cell sits in the bin
//   line words   - alternating alloc / ever-freed words, one bit per cell
//   accel A      - one bit per full line word
//   accel B      - one bit per full A word
//   run words    - alternating in-run / last-of-run words, when userun
// The deeper accelerator levels C and D live in the descriptor itself.
#[repr(C)]
pub struct Region {
    pub hdr: XRegion,

    pub meta: *mut u64,
    pub metacnt: usize, // in words

    pub celcnt: u32,
    pub frecnt: u32,  // cells free in the bitmaps or in the prealloc run
    pub linecnt: u32, // line words holding live cells
    pub cellen: u32,  // gross cell length
    pub ucellen: u32, // net length the class was created for
    pub celord: u16,  // shift when cellen is a power of two, else 0
    pub clas: u16,
    pub claspos: u16,
    pub order: u16,
    pub userun: bool,
    pub hasrun: bool,
    pub status: Status,
    pub age: u32, // trim scans this region sat fully free
    pub id: u32,  // heap id in high bits, dirid in low

    pub lpos: u32,
    pub apos: u32,
    pub bpos: u32,
    pub rpos: u32,

    pub preofs: u32, // line word of the current prealloc run
    pub premsk: u64, // bit set: cell still available in the run
    pub dmsk: u64,       // accelerator D
    pub accc: [u64; 64], // accelerator C

    pub binpos: u16,
    pub bin: [u32; BIN],

    pub stats: RegStats,
}

// ------------------------------------------------------
// Statistics
// ------------------------------------------------------

#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Stats {
    pub allocs: u64,
    pub callocs: u64,
    pub reallocles: u64,
    pub reallocgts: u64,
    pub frees: u64,
    pub binned: u64,
    pub mapallocs: u64,
    pub mmaps: u64,
    pub munmaps: u64,
    pub remote_frees: u64,
    pub invalid_frees: u64,
    pub invalid_reallocs: u64,
    pub errors: u64,
    pub locks: u64,
    pub oslocks: u64,
    pub oslocktimeouts: u64,
    pub region_cnt: u64,
    pub xregion_cnt: u64,
    pub minlen: u64,
    pub maxlen: u64,
}

// ------------------------------------------------------
// Heap
// ------------------------------------------------------

// Per-thread heap base. Lives in one page-aligned OS mapping together with
// its initial region-descriptor chunks, region map and directory node pool.
#[repr(C)]
pub struct Heap {
    pub lock: AtomicU32,
    pub lockmode: AtomicI32, // 0 idle  1 requested  2 active
    pub dirversion: AtomicUsize,
    pub freeregs: AtomicU16, // free-list heads in directory-id space
    pub freexregs: AtomicU16,
    pub tid: AtomicUsize,

    pub id: u32,
    pub status: Status,
    pub mmap_threshold: usize,

    // slab classes
    pub claslens: [u32; CLAS_CNT],
    pub claspos: [u16; CLAS_CNT],
    pub clastop: [u16; CLAS_CNT],
    pub clasregs: [*mut Region; CLAS_CNT * CLAS_REGS],

    pub prvallreg: *mut Region,  // last region allocated from
    pub mrufrereg: *mut XRegion, // last region freed into
    pub prvxheap: *mut Heap,     // most recent foreign heap

    // page directory
    pub rootdir: [AtomicUsize; DIR1_LEN],
    pub dirmem: *mut u8,
    pub dirmem_pos: usize,
    pub dirmem_top: usize,

    // region pool
    pub regs: *mut AtomicUsize, // dirid -> descriptor
    pub regmaplen: u32,
    pub regmem: *mut Region,
    pub regmem_pos: u32,
    pub xregmem: *mut XRegion,
    pub xregmem_pos: u32,
    pub allocregcnt: u32,
    pub freeregcnt: u32,

    pub free_tick: u32,
    pub trim_pos: u32,

    pub nxt: *mut Heap,  // chain of all heaps
    pub free: *mut Heap, // chain of retired heaps

    pub stats: Stats,
}

// ------------------------------------------------------
// Mini-heap
// ------------------------------------------------------

// Bump buffer serving the first few small blocks of a thread. One u16 length
// slot per 16-byte unit of user space; blocks are never freed individually.
#[repr(C)]
pub struct MiniHeap {
    pub pos: u32,
    pub id: u32,
    pub nxt: *mut MiniHeap,
    pub user: *mut u8,
    pub meta: *mut u16,
}

// ------------------------------------------------------
// Zero block
// ------------------------------------------------------

// The single process-wide block returned by malloc(0). Deliberately writable
// so that a client scribbling on it can be diagnosed at the next call.
#[repr(align(16))]
pub struct ZeroBlock(pub UnsafeCell<[u8; STD_ALIGN]>);

unsafe impl Sync for ZeroBlock {}

pub static ZERO_BLOCK: ZeroBlock = ZeroBlock(UnsafeCell::new([0; STD_ALIGN]));

#[inline]
pub fn zero_block() -> *mut u8 {
    ZERO_BLOCK.0.get() as *mut u8
}

pub fn zero_block_pristine() -> bool {
    let blk = unsafe { *ZERO_BLOCK.0.get() };
    blk.iter().all(|&b| b == 0)
}
