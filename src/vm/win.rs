use windows_sys::Win32::System::Memory::*;
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

use core::ptr::{NonNull, null_mut};

use crate::ptr_utils;

use super::VirtualMemory;

/// Attempts at placing an aligned reservation before giving up.
const ALIGNED_RESERVE_ATTEMPTS: usize = 8;

/// [`VirtualMemory`] backed by `VirtualAlloc`.
#[derive(Debug, Default)]
pub struct VirtualAllocMemory;

impl VirtualAllocMemory {
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl VirtualMemory for VirtualAllocMemory {
    fn page_size(&self) -> usize {
        let mut info: SYSTEM_INFO = unsafe { core::mem::zeroed() };
        unsafe { GetSystemInfo(&mut info) };
        info.dwPageSize as usize
    }

    fn reserve(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        // reservations can't be partially released, so find an aligned
        // address with a padded probe, then reserve exactly there
        for _ in 0..ALIGNED_RESERVE_ATTEMPTS {
            let probe = unsafe {
                VirtualAlloc(null_mut(), size.checked_add(align)?, MEM_RESERVE, PAGE_NOACCESS)
            };
            if probe.is_null() {
                return None;
            }

            let aligned = ptr_utils::align_up(probe as usize, align) as *mut core::ffi::c_void;
            unsafe { VirtualFree(probe, 0, MEM_RELEASE) };

            let memory = unsafe { VirtualAlloc(aligned, size, MEM_RESERVE, PAGE_NOACCESS) };
            if let Some(memory) = NonNull::new(memory.cast::<u8>()) {
                return Some(memory);
            }
        }

        None
    }

    unsafe fn release(&mut self, base: NonNull<u8>, _size: usize) {
        let successful = unsafe { VirtualFree(base.as_ptr().cast(), 0, MEM_RELEASE) };
        debug_assert!(successful != 0);
    }

    unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        let result =
            unsafe { VirtualAlloc(base.as_ptr().cast(), size, MEM_COMMIT, PAGE_READWRITE) };
        !result.is_null()
    }

    unsafe fn uncommit(&mut self, base: NonNull<u8>, size: usize) -> bool {
        let result = unsafe { VirtualFree(base.as_ptr().cast(), size, MEM_DECOMMIT) };
        result != 0
    }
}
