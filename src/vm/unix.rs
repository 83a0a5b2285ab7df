use core::ptr::NonNull;

use crate::ptr_utils;

use super::VirtualMemory;

/// [`VirtualMemory`] backed by `mmap`.
#[derive(Debug, Default)]
pub struct MmapMemory;

impl MmapMemory {
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl VirtualMemory for MmapMemory {
    fn page_size(&self) -> usize {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 { 4096 } else { page_size as usize }
    }

    fn reserve(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // over-reserve, then trim the unaligned head and the excess tail
        let padded = size.checked_add(align)?;

        let x = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                padded,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };

        if x == libc::MAP_FAILED {
            return None;
        }

        let raw = x.cast::<u8>();
        let aligned = ptr_utils::align_up(raw as usize, align);
        let head = aligned - raw as usize;
        let tail = padded - head - size;

        unsafe {
            if head != 0 {
                libc::munmap(raw.cast(), head);
            }
            if tail != 0 {
                libc::munmap(raw.add(head + size).cast(), tail);
            }
        }

        NonNull::new(raw.wrapping_add(head))
    }

    unsafe fn release(&mut self, base: NonNull<u8>, size: usize) {
        let result = unsafe { libc::munmap(base.as_ptr().cast(), size) };
        debug_assert_eq!(result, 0);
    }

    unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        debug_assert!(ptr_utils::is_aligned_to(base.as_ptr(), self.page_size()));

        let result = unsafe {
            libc::mprotect(base.as_ptr().cast(), size, libc::PROT_READ | libc::PROT_WRITE)
        };
        result == 0
    }

    unsafe fn uncommit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        debug_assert!(ptr_utils::is_aligned_to(base.as_ptr(), self.page_size()));

        let result = unsafe { libc::madvise(base.as_ptr().cast(), size, libc::MADV_DONTNEED) };
        if result != 0 {
            return false;
        }
        let result = unsafe { libc::mprotect(base.as_ptr().cast(), size, libc::PROT_NONE) };
        result == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmap_reserve_commit() {
        let mut vm = MmapMemory::new();
        let align = 4 << 20;
        let base = vm.reserve(8 << 20, align).unwrap();
        assert!(ptr_utils::is_aligned_to(base.as_ptr(), align));

        let page = vm.page_size();
        unsafe {
            assert!(vm.commit(base, 4 * page));
            base.as_ptr().write_bytes(0x5a, 4 * page);
            assert!(vm.uncommit(base, 4 * page));
            assert!(vm.commit(base, page));
            assert_eq!(*base.as_ptr(), 0);
            vm.release(base, 8 << 20);
        }
    }
}
