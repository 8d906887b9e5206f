//! Executable memory with write and execute never enabled together.
//!
//! Bytes are copied into a fresh read/write anonymous mapping which is
//! then switched to read/execute. A mapping failure is recorded in a
//! process-wide flag so the compiler stops trying.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::error::{JitError, JitResult};

static MAPPING_FAILED: AtomicBool = AtomicBool::new(false);

/// Whether any executable mapping has failed in this process.
pub fn mapping_failed() -> bool {
    MAPPING_FAILED.load(Ordering::Acquire)
}

fn fail(what: &str) -> JitError {
    let err = std::io::Error::last_os_error();
    MAPPING_FAILED.store(true, Ordering::Release);
    log::error!("{} failed ({}), disabling JIT compilation", what, err);
    JitError::memory_map(format!("{}: {}", what, err))
}

/// A read/execute mapping holding one function.
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
    mapped: usize,
}

// The mapping is immutable after construction.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

#[cfg(unix)]
fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

impl ExecutableMemory {
    #[cfg(unix)]
    pub fn new(code: &[u8]) -> JitResult<Self> {
        let page = page_size();
        let mapped = code.len().max(1).div_ceil(page) * page;
        // SAFETY: anonymous private mapping, no existing memory is touched.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(fail("mmap"));
        }
        let ptr = ptr as *mut u8;
        // SAFETY: the mapping is at least code.len() bytes and writable.
        unsafe { std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len()) };
        // SAFETY: ptr/mapped describe the mapping created above.
        if unsafe { libc::mprotect(ptr as *mut libc::c_void, mapped, libc::PROT_READ | libc::PROT_EXEC) } != 0 {
            let err = fail("mprotect");
            // SAFETY: unmapping the region we own.
            unsafe { libc::munmap(ptr as *mut libc::c_void, mapped) };
            return Err(err);
        }
        log::trace!("mapped {} bytes at {:p}", code.len(), ptr);
        Ok(Self {
            ptr,
            len: code.len(),
            mapped,
        })
    }

    #[cfg(not(unix))]
    pub fn new(_code: &[u8]) -> JitResult<Self> {
        MAPPING_FAILED.store(true, Ordering::Release);
        Err(JitError::memory_map("executable mappings are not supported on this platform"))
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    /// Size of the code, not of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping stays readable and unchanged until drop.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl Drop for ExecutableMemory {
    #[cfg(unix)]
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `new` and is unmapped once.
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.mapped) };
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {}
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_copies_code_into_page_sized_mapping() {
        let code = [0xc3u8; 10];
        let mem = ExecutableMemory::new(&code).unwrap();
        assert_eq!(mem.len(), 10);
        assert_eq!(mem.bytes(), &code);
        assert_eq!(mem.mapped_len() % page_size(), 0);
        assert!(!mapping_failed());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_mapping_is_executable() {
        // mov eax, 42; ret
        let mem = ExecutableMemory::new(&[0xb8, 42, 0, 0, 0, 0xc3]).unwrap();
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(mem.as_ptr()) };
        assert_eq!(f(), 42);
    }
}
