//! Virtual memory backends.
//!
//! A [`VirtualMemory`] hands out address space reservations and commits or
//! uncommits pages within them. [`HeapMemory`] works anywhere and is used by
//! tests; [`SystemMemory`] maps directly onto the operating system when the
//! `system-backed` feature is enabled.

use core::ptr::NonNull;

mod heap;

#[cfg(all(feature = "system-backed", target_family = "unix"))]
pub mod unix;
#[cfg(all(feature = "system-backed", target_family = "windows"))]
pub mod win;

pub use heap::HeapMemory;

#[cfg(all(feature = "system-backed", target_family = "unix"))]
pub type SystemMemory = unix::MmapMemory;

#[cfg(all(feature = "system-backed", target_family = "windows"))]
pub type SystemMemory = win::VirtualAllocMemory;

/// Reserve, commit, uncommit and release address space.
///
/// # Safety
/// Implementors must return reservations of at least the requested size,
/// aligned as requested, that do not overlap any live reservation.
/// Committed ranges must be readable and writable until uncommitted or released.
pub unsafe trait VirtualMemory {
    /// Granularity of commit and uncommit. A power of two.
    fn page_size(&self) -> usize;

    /// Reserve `size` bytes aligned to `align`.
    ///
    /// `size` and `align` are page multiples and `align` is a power of two.
    /// The memory is inaccessible until committed.
    fn reserve(&mut self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Release a reservation made by [`reserve`](Self::reserve).
    ///
    /// # Safety
    /// `base` and `size` must match a live reservation exactly.
    unsafe fn release(&mut self, base: NonNull<u8>, size: usize);

    /// Make a page-aligned range of a reservation accessible.
    ///
    /// # Safety
    /// The range must lie within a live reservation.
    unsafe fn commit(&mut self, base: NonNull<u8>, size: usize) -> bool;

    /// Return a page-aligned range of a reservation to the system.
    ///
    /// # Safety
    /// The range must lie within a live reservation and must not be accessed
    /// until committed again.
    unsafe fn uncommit(&mut self, base: NonNull<u8>, size: usize) -> bool;
}
