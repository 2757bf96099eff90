//! Executable memory for installed stubs.
//!
//! Pages are mapped writable, filled, then flipped to read+execute. The
//! mapping never goes back to writable; stubs are replaced, not patched.

use std::ops::Range;
use std::ptr::NonNull;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("mmap of {0} bytes failed")]
    AllocationFailed(usize),
    #[error("mprotect failed: {0}")]
    ProtectionFailed(std::io::Error),
    #[error("write of {len} bytes at offset {offset} does not fit in {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },
    #[error("memory is already executable")]
    AlreadyExecutable,
    #[error("zero-sized mapping")]
    ZeroSize,
}

/// A page-aligned block of memory that ends up executable.
pub struct ExecutableMemory {
    ptr: NonNull<u8>,
    size: usize,
    executable: bool,
}

impl ExecutableMemory {
    /// Map at least `size` writable bytes.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroSize);
        }
        let page_size = page_size();
        let aligned_size = (size + page_size - 1) & !(page_size - 1);

        // SAFETY: anonymous private mapping, no file descriptor involved.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(aligned_size));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed(aligned_size))?;

        Ok(Self {
            ptr,
            size: aligned_size,
            executable: false,
        })
    }

    /// Map, copy `code` in and make it executable in one step.
    pub fn with_code(code: &[u8]) -> Result<Self, MemoryError> {
        let mut mem = Self::new(code.len())?;
        mem.write(0, code)?;
        mem.make_executable()?;
        Ok(mem)
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Address range covered by the mapping.
    pub fn range(&self) -> Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.size
    }

    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if self.executable {
            return Err(MemoryError::AlreadyExecutable);
        }
        if offset.checked_add(data.len()).is_none_or(|end| end > self.size) {
            return Err(MemoryError::OutOfBounds {
                offset,
                len: data.len(),
                size: self.size,
            });
        }
        // SAFETY: bounds checked above; the mapping is writable and owned.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }

    pub fn make_executable(&mut self) -> Result<(), MemoryError> {
        if self.executable {
            return Ok(());
        }
        // SAFETY: the range is exactly the mapping created in `new`.
        let result = unsafe {
            libc::mprotect(
                self.ptr.as_ptr() as *mut libc::c_void,
                self.size,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            return Err(MemoryError::ProtectionFailed(std::io::Error::last_os_error()));
        }
        self.executable = true;
        Ok(())
    }

    pub fn is_executable(&self) -> bool {
        self.executable
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        // SAFETY: unmapping the region created in `new`.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
    }
}

// The mapping is owned and immutable once executable.
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_code_is_executable_and_readable() {
        let mem = ExecutableMemory::with_code(&[0xC3, 0xCC]).unwrap();
        assert!(mem.is_executable());
        assert!(mem.size() >= 2);
        // SAFETY: PROT_READ is kept after the flip.
        let bytes = unsafe { std::slice::from_raw_parts(mem.as_ptr(), 2) };
        assert_eq!(bytes, &[0xC3, 0xCC]);
        assert!(mem.range().contains(&(mem.as_ptr() as usize)));
    }

    #[test]
    fn test_cannot_write_after_executable() {
        let mut mem = ExecutableMemory::new(16).unwrap();
        mem.make_executable().unwrap();
        assert!(matches!(mem.write(0, &[0x90]), Err(MemoryError::AlreadyExecutable)));
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mut mem = ExecutableMemory::new(16).unwrap();
        let size = mem.size();
        assert!(matches!(
            mem.write(size, &[0x90]),
            Err(MemoryError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_zero_size_rejected() {
        assert!(matches!(ExecutableMemory::new(0), Err(MemoryError::ZeroSize)));
    }
}
