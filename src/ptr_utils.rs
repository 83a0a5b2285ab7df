//! Generic utilities for pointer handling and sizing.
//!
//! Metaspace measures everything in machine words. Byte quantities only
//! appear at the [`VirtualMemory`](crate::vm::VirtualMemory) boundary
//! and in [`Settings`](crate::Settings).

use core::ptr::NonNull;

use crate::MetaWord;

pub const WORD_SIZE: usize = core::mem::size_of::<MetaWord>();

/// Aligns `value` up to the next multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Aligns `value` down to a multiple of `align`.
///
/// `align` must be a power of two.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[inline]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

#[inline]
pub fn is_aligned_to(ptr: *const u8, align: usize) -> bool {
    is_aligned(ptr as usize, align)
}

#[inline]
pub const fn words_to_bytes(words: usize) -> usize {
    words * WORD_SIZE
}

/// Converts `bytes` to words, rounding up.
#[inline]
pub const fn bytes_to_words(bytes: usize) -> usize {
    (bytes + WORD_SIZE - 1) / WORD_SIZE
}

/// Offsets a word pointer by `words` words.
///
/// # Safety
/// The result must stay within the same reservation as `base`.
#[inline]
pub unsafe fn word_add(base: NonNull<MetaWord>, words: usize) -> NonNull<MetaWord> {
    NonNull::new_unchecked(base.as_ptr().add(words))
}

/// Number of words from `base` to `ptr`.
///
/// `ptr` must not be below `base`.
#[inline]
pub fn word_offset(base: NonNull<MetaWord>, ptr: NonNull<MetaWord>) -> usize {
    debug_assert!(ptr >= base);
    (ptr.as_ptr() as usize - base.as_ptr() as usize) / WORD_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_test() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 4096), 4096);

        assert_eq!(align_down(0, 8), 0);
        assert_eq!(align_down(7, 8), 0);
        assert_eq!(align_down(4097, 4096), 4096);

        assert!(is_aligned(1 << 20, 1 << 12));
        assert!(!is_aligned((1 << 20) + 8, 1 << 12));
    }

    #[test]
    fn word_conversion_test() {
        assert_eq!(bytes_to_words(0), 0);
        assert_eq!(bytes_to_words(1), 1);
        assert_eq!(bytes_to_words(WORD_SIZE), 1);
        assert_eq!(bytes_to_words(WORD_SIZE + 1), 2);
        assert_eq!(words_to_bytes(3), 3 * WORD_SIZE);
    }

    #[test]
    fn word_offset_test() {
        let mut buf = [0usize; 16];
        let base = NonNull::new(buf.as_mut_ptr()).unwrap();
        let ptr = unsafe { word_add(base, 5) };

        assert_eq!(word_offset(base, ptr), 5);
        assert_eq!(word_offset(base, base), 0);
    }
}
