// Operating system bindings: anonymous mappings, remap, page size, thread
// and process identity, and the wait/wake primitive behind the heap lock.
// Everything platform-specific lives here.

use core::sync::atomic::AtomicU32;

use crate::types::Status;

use log::warn;

#[cfg(unix)]
use core::ptr::null_mut;

#[cfg(windows)]
use winapi::um::{
    memoryapi::{VirtualAlloc, VirtualFree},
    processthreadsapi::{GetCurrentProcessId, GetCurrentThreadId},
    synchapi::{WaitOnAddress, WakeByAddressSingle},
    sysinfoapi::{GetSystemInfo, SYSTEM_INFO},
    winnt::{MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE},
};

// ------------------------------------------------------
// Mapping
// ------------------------------------------------------

// Map a fresh zeroed range. Lengths are page multiples; callers round.
#[cfg(unix)]
pub unsafe fn map(len: usize) -> *mut u8 {
    let p = libc::mmap(
        null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if p == libc::MAP_FAILED {
        warn!("mmap of {} bytes failed: {}", len, errno::errno());
        return null_mut();
    }
    p as *mut u8
}

#[cfg(windows)]
pub unsafe fn map(len: usize) -> *mut u8 {
    let p = VirtualAlloc(core::ptr::null_mut(), len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
    if p.is_null() {
        warn!("VirtualAlloc of {} bytes failed: {}", len, errno::errno());
    }
    p as *mut u8
}

#[cfg(unix)]
pub unsafe fn unmap(p: *mut u8, len: usize) -> bool {
    if libc::munmap(p as *mut libc::c_void, len) == -1 {
        warn!("munmap failed: {}, addr {:x}, len {}", errno::errno(), p as usize, len);
        return false;
    }
    true
}

#[cfg(windows)]
pub unsafe fn unmap(p: *mut u8, _len: usize) -> bool {
    if VirtualFree(p as *mut _, 0, MEM_RELEASE) == 0 {
        warn!("VirtualFree failed: {}, addr {:x}", errno::errno(), p as usize);
        return false;
    }
    true
}

// Grow or shrink a mapping in place when the OS can, else move it. Returns
// null when nothing could be done; the caller falls back to allocate-copy.
#[cfg(target_os = "linux")]
pub unsafe fn remap(p: *mut u8, oldlen: usize, newlen: usize) -> *mut u8 {
    let np = libc::mremap(p as *mut libc::c_void, oldlen, newlen, libc::MREMAP_MAYMOVE);
    if np == libc::MAP_FAILED {
        warn!("mremap {} -> {} failed: {}", oldlen, newlen, errno::errno());
        return null_mut();
    }
    np as *mut u8
}

#[cfg(not(target_os = "linux"))]
pub unsafe fn remap(p: *mut u8, oldlen: usize, newlen: usize) -> *mut u8 {
    let np = map(newlen);
    if np.is_null() {
        return np;
    }
    let n = if oldlen < newlen { oldlen } else { newlen };
    core::ptr::copy_nonoverlapping(p, np, n);
    unmap(p, oldlen);
    np
}

// ------------------------------------------------------
// Identity
// ------------------------------------------------------

#[cfg(unix)]
pub fn page_size() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret <= 0 {
        0
    } else {
        ret as usize
    }
}

#[cfg(windows)]
pub fn page_size() -> usize {
    unsafe {
        let mut si: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut si);
        si.dwPageSize as usize
    }
}

#[cfg(unix)]
pub fn pid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

#[cfg(windows)]
pub fn pid() -> u32 {
    unsafe { GetCurrentProcessId() }
}

#[cfg(unix)]
pub fn thread_id() -> usize {
    unsafe { libc::pthread_self() as usize }
}

#[cfg(windows)]
pub fn thread_id() -> usize {
    unsafe { GetCurrentThreadId() as usize }
}

// ------------------------------------------------------
// Environment
// ------------------------------------------------------

// Read a small unsigned decimal from the environment. u32::MAX when unset.
#[cfg(unix)]
pub fn getenv_u32(name: &[u8]) -> u32 {
    debug_assert!(*name.last().unwrap() == 0);
    unsafe {
        let p = libc::getenv(name.as_ptr() as *const libc::c_char);
        if p.is_null() {
            return !0u32;
        }
        atou(p as *const u8)
    }
}

#[cfg(windows)]
pub fn getenv_u32(name: &[u8]) -> u32 {
    use winapi::um::processenv::GetEnvironmentVariableA;
    unsafe {
        let mut buf = [0u8; 16];
        let n = GetEnvironmentVariableA(
            name.as_ptr() as *const i8,
            buf.as_mut_ptr() as *mut i8,
            buf.len() as u32,
        );
        if n == 0 || n as usize >= buf.len() {
            return !0u32;
        }
        atou(buf.as_ptr())
    }
}

unsafe fn atou(mut p: *const u8) -> u32 {
    let mut val = 0u32;
    let mut seen = false;
    while *p >= b'0' && *p <= b'9' {
        val = val.wrapping_mul(10).wrapping_add((*p - b'0') as u32);
        seen = true;
        p = p.add(1);
    }
    if seen {
        val
    } else {
        !0u32
    }
}

#[cfg(unix)]
pub fn at_exit(f: extern "C" fn()) {
    unsafe {
        libc::atexit(f);
    }
}

#[cfg(windows)]
pub fn at_exit(_f: extern "C" fn()) {}

#[cfg(unix)]
pub fn exit(code: i32) -> ! {
    unsafe { libc::_exit(code) }
}

#[cfg(windows)]
pub fn exit(code: i32) -> ! {
    unsafe { winapi::um::processthreadsapi::ExitProcess(code as u32) };
    loop {}
}

#[cfg(unix)]
pub unsafe fn write_fd(fd: i32, buf: &[u8]) {
    libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len());
}

#[cfg(windows)]
pub unsafe fn write_fd(_fd: i32, buf: &[u8]) {
    use winapi::um::fileapi::WriteFile;
    use winapi::um::processenv::GetStdHandle;
    use winapi::um::winbase::STD_ERROR_HANDLE;
    let h = GetStdHandle(STD_ERROR_HANDLE);
    let mut written = 0u32;
    WriteFile(h, buf.as_ptr() as *const _, buf.len() as u32, &mut written, core::ptr::null_mut());
}

// ------------------------------------------------------
// errno
// ------------------------------------------------------

#[cfg(unix)]
const ENOMEM: i32 = libc::ENOMEM;
#[cfg(windows)]
const ENOMEM: i32 = 12;

#[cfg(unix)]
const EAGAIN: i32 = libc::EAGAIN;
#[cfg(windows)]
const EAGAIN: i32 = 11;

pub fn set_errno_oom() {
    errno::set_errno(errno::Errno(ENOMEM));
}

pub fn set_errno_again() {
    errno::set_errno(errno::Errno(EAGAIN));
}

// ------------------------------------------------------
// Wait / wake, for the contended heap lock
// ------------------------------------------------------

// Sleep while *addr == cmp, up to timeout_us. Spurious returns are fine;
// the caller rechecks the lock word.
#[cfg(target_os = "linux")]
pub fn wait(addr: &AtomicU32, cmp: u32, timeout_us: u32) -> Status {
    let ts = libc::timespec {
        tv_sec: (timeout_us / 1_000_000) as libc::time_t,
        tv_nsec: ((timeout_us % 1_000_000) * 1000) as libc::c_long,
    };
    let rv = unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *mut u32,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            cmp,
            &ts as *const libc::timespec,
            0usize,
            0u32,
        )
    };
    if rv == -1 {
        match errno::errno().0 {
            libc::ETIMEDOUT => Status::Tmo,
            libc::EAGAIN | libc::EINTR => Status::Ok,
            _ => Status::Error,
        }
    } else {
        Status::Ok
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn wait(addr: &AtomicU32, cmp: u32, timeout_us: u32) -> Status {
    use core::sync::atomic::Ordering;
    // No portable address wait; sleep in slices and recheck.
    let mut left = timeout_us;
    let slice = libc::timespec { tv_sec: 0, tv_nsec: 50_000 };
    while left != 0 {
        if addr.load(Ordering::Relaxed) != cmp {
            return Status::Ok;
        }
        unsafe { libc::nanosleep(&slice, core::ptr::null_mut()) };
        left = left.saturating_sub(50);
    }
    Status::Tmo
}

#[cfg(windows)]
pub fn wait(addr: &AtomicU32, cmp: u32, timeout_us: u32) -> Status {
    let cmpval = cmp;
    let ok = unsafe {
        WaitOnAddress(
            addr as *const AtomicU32 as *mut _,
            &cmpval as *const u32 as *mut _,
            4,
            if timeout_us < 1000 { 1 } else { timeout_us / 1000 },
        )
    };
    if ok == 0 {
        Status::Tmo
    } else {
        Status::Ok
    }
}

#[cfg(target_os = "linux")]
pub fn wake(addr: &AtomicU32) {
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            addr as *const AtomicU32 as *mut u32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            1u32,
            0usize,
            0usize,
            0u32,
        );
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn wake(_addr: &AtomicU32) {}

#[cfg(windows)]
pub fn wake(addr: &AtomicU32) {
    unsafe { WakeByAddressSingle(addr as *const AtomicU32 as *mut _) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_roundtrip() {
        unsafe {
            let p = map(PAGE);
            assert!(!p.is_null());
            assert_eq!(p as usize & (PAGE - 1), 0);
            *p = 0xa5;
            assert_eq!(*p, 0xa5);
            assert!(unmap(p, PAGE));
        }
    }

    #[test]
    fn remap_keeps_contents() {
        unsafe {
            let p = map(PAGE);
            *p.add(100) = 42;
            let q = remap(p, PAGE, 4 * PAGE);
            assert!(!q.is_null());
            assert_eq!(*q.add(100), 42);
            assert!(unmap(q, 4 * PAGE));
        }
    }

    #[test]
    fn identity() {
        assert!(page_size() > 0);
        assert!(pid() > 0);
        assert!(thread_id() != 0);
    }

    const PAGE: usize = crate::types::PAGE_SIZE;
}
