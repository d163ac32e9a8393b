//! Fixed-capacity executable code region with a write cursor and forward
//! branch fixups. Compiled shaders are function pointers into this region,
//! so the cache holding them must be dropped before `clear` is called.

use super::{JitError, JitResult};

/// One 4 MiB page pool is enough for every shader a title compiles.
pub const CODE_BUFFER_CAPACITY: usize = 4 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchCondition {
    Zero,
    NotZero,
}

/// A pending forward branch. Every token must be passed to
/// [`CodeBuffer::patch`] before the emitted function runs; leaking one leaves
/// a zero displacement behind.
#[derive(Debug)]
#[must_use]
pub struct FixupBranch {
    disp_offset: usize,
}

pub struct CodeBuffer {
    ptr: *mut u8,
    capacity: usize,
    cursor: usize,
}

impl CodeBuffer {
    pub fn new() -> JitResult<Self> {
        Self::with_capacity(CODE_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> JitResult<Self> {
        let ptr = alloc_executable_region(capacity)?;
        Ok(CodeBuffer {
            ptr,
            capacity,
            cursor: 0,
        })
    }

    /// Current cursor, used as a label for patches and backward branches.
    pub fn here(&self) -> usize {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn code(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.cursor) }
    }

    /// Native address of a previously returned cursor position.
    pub fn entry_ptr(&self, at: usize) -> *const u8 {
        debug_assert!(at <= self.cursor);
        unsafe { self.ptr.add(at) }
    }

    /// Rewinds the cursor, discarding everything emitted after `at`. Used to
    /// drop partially emitted shaders on compile failure.
    pub fn rewind(&mut self, at: usize) {
        debug_assert!(at <= self.cursor);
        self.cursor = at;
    }

    pub fn append(&mut self, bytes: &[u8]) -> JitResult<()> {
        if self.cursor + bytes.len() > self.capacity {
            return Err(JitError::OutOfSpace {
                needed: bytes.len(),
                capacity: self.capacity,
            });
        }
        unsafe {
            self.ptr
                .add(self.cursor)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        self.cursor += bytes.len();
        Ok(())
    }

    /// Emits a branch with a placeholder 32-bit displacement; `None` emits an
    /// unconditional jump.
    pub fn record_branch(&mut self, condition: Option<BranchCondition>) -> JitResult<FixupBranch> {
        match condition {
            Some(BranchCondition::Zero) => self.append(&[0x0F, 0x84])?, // jz rel32
            Some(BranchCondition::NotZero) => self.append(&[0x0F, 0x85])?, // jnz rel32
            None => self.append(&[0xE9])?, // jmp rel32
        }
        let disp_offset = self.cursor;
        self.append(&[0, 0, 0, 0])?;
        Ok(FixupBranch { disp_offset })
    }

    /// Resolves a recorded branch so it lands on the cursor position
    /// `target` (usually `here()` at patch time).
    pub fn patch(&mut self, branch: FixupBranch, target: usize) {
        let rel = target as i64 - (branch.disp_offset as i64 + 4);
        debug_assert!(i32::try_from(rel).is_ok());
        let bytes = (rel as i32).to_le_bytes();
        unsafe {
            self.ptr
                .add(branch.disp_offset)
                .copy_from_nonoverlapping(bytes.as_ptr(), 4);
        }
    }

    /// Emits a branch to an already-emitted cursor position.
    pub fn branch_to(
        &mut self,
        condition: Option<BranchCondition>,
        target: usize,
    ) -> JitResult<()> {
        let branch = self.record_branch(condition)?;
        self.patch(branch, target);
        Ok(())
    }

    /// Resets the cursor, logically invalidating every function pointer
    /// previously handed out. Callers must have dropped their cache first.
    pub fn clear(&mut self) {
        self.cursor = 0;
    }
}

impl Drop for CodeBuffer {
    fn drop(&mut self) {
        free_executable_region(self.ptr, self.capacity);
    }
}

#[cfg(all(unix, not(target_os = "macos")))]
fn alloc_executable_region(len: usize) -> JitResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(JitError::ExecRegion(format!(
            "mmap failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(target_os = "macos")]
fn alloc_executable_region(len: usize) -> JitResult<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(JitError::ExecRegion(format!(
            "mmap(MAP_JIT) failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr as *mut u8)
}

#[cfg(unix)]
fn free_executable_region(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    unsafe {
        libc::munmap(ptr as *mut _, len);
    }
}

#[cfg(windows)]
fn alloc_executable_region(len: usize) -> JitResult<*mut u8> {
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };

    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        ) as *mut u8
    };
    if ptr.is_null() {
        return Err(JitError::ExecRegion(format!(
            "VirtualAlloc failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(ptr)
}

#[cfg(windows)]
fn free_executable_region(ptr: *mut u8, _len: usize) {
    use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};

    if ptr.is_null() {
        return;
    }
    unsafe {
        VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_advances_cursor() {
        let mut buffer = CodeBuffer::with_capacity(64).expect("region should map");
        buffer.append(&[0x90, 0x90]).expect("append should fit");
        assert_eq!(buffer.here(), 2);
        assert_eq!(buffer.code(), &[0x90, 0x90]);
    }

    #[test]
    fn overflow_reports_out_of_space() {
        let mut buffer = CodeBuffer::with_capacity(4).expect("region should map");
        buffer.append(&[0; 4]).expect("append should fit");
        match buffer.append(&[0]) {
            Err(JitError::OutOfSpace { needed, capacity }) => {
                assert_eq!(needed, 1);
                assert_eq!(capacity, 4);
            }
            other => panic!("expected OutOfSpace, got {other:?}"),
        }
    }

    #[test]
    fn patched_branch_encodes_forward_displacement() {
        let mut buffer = CodeBuffer::with_capacity(64).expect("region should map");
        let branch = buffer
            .record_branch(Some(BranchCondition::Zero))
            .expect("branch should fit");
        buffer.append(&[0x90; 10]).expect("append should fit");
        let target = buffer.here();
        buffer.patch(branch, target);
        // jz rel32 with a 10-byte body between the branch and the label
        assert_eq!(&buffer.code()[..6], &[0x0F, 0x84, 10, 0, 0, 0]);
    }

    #[test]
    fn backward_branch_encodes_negative_displacement() {
        let mut buffer = CodeBuffer::with_capacity(64).expect("region should map");
        let target = buffer.here();
        buffer.append(&[0x90; 4]).expect("append should fit");
        buffer
            .branch_to(Some(BranchCondition::NotZero), target)
            .expect("branch should fit");
        // rel32 = target(0) - end_of_branch(10) = -10
        assert_eq!(
            &buffer.code()[4..],
            &[0x0F, 0x85, 0xF6, 0xFF, 0xFF, 0xFF]
        );
    }

    #[test]
    fn clear_and_rewind_reset_cursor() {
        let mut buffer = CodeBuffer::with_capacity(64).expect("region should map");
        buffer.append(&[1, 2, 3]).expect("append should fit");
        buffer.rewind(1);
        assert_eq!(buffer.here(), 1);
        buffer.clear();
        assert_eq!(buffer.here(), 0);
    }
}
