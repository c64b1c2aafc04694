//! Sector-aligned I/O buffers
//!
//! Zoned transports want page-aligned, pinned-size memory for transfers.
//! `DmaBuf` is a heap allocation aligned to [`DMA_ALIGNMENT`] that frees
//! itself on drop. It backs `Ztl::alloc_dma_buffer` and the scratch pool used
//! by the metadata log and the object read/write paths.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::slice;

use crate::error::{Error, Result};

/// Alignment of every DMA buffer (one 4 KiB page)
pub const DMA_ALIGNMENT: usize = 4096;

/// An aligned, zero-initialised I/O buffer.
#[derive(Debug)]
pub struct DmaBuf {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: DmaBuf owns its memory exclusively; access goes through &self/&mut self.
unsafe impl Send for DmaBuf {}
unsafe impl Sync for DmaBuf {}

impl DmaBuf {
    /// Allocate a zeroed buffer of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::DmaAllocationFailed` if `size` is 0 or the allocator
    /// is out of memory.
    pub fn new(size: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::DmaAllocationFailed {
                size,
                reason: "size must be greater than 0".into(),
            });
        }

        let layout = Layout::from_size_align(size, DMA_ALIGNMENT).map_err(|e| {
            Error::DmaAllocationFailed {
                size,
                reason: format!("invalid layout: {}", e),
            }
        })?;

        // SAFETY: layout has a non-zero size (checked above).
        let ptr = unsafe { alloc_zeroed(layout) };

        NonNull::new(ptr).map_or_else(
            || {
                Err(Error::DmaAllocationFailed {
                    size,
                    reason: "allocation failed".into(),
                })
            },
            |ptr| Ok(Self { ptr, size, layout }),
        )
    }

    /// Allocate a buffer of at least `min_size` bytes, rounded up to whole
    /// blocks of `block_size` (a power of two).
    pub fn new_aligned(min_size: usize, block_size: usize) -> Result<Self> {
        if !block_size.is_power_of_two() {
            return Err(Error::DmaAllocationFailed {
                size: min_size,
                reason: format!("block_size {} must be a power of 2", block_size),
            });
        }

        let aligned_size = (min_size + block_size - 1) & !(block_size - 1);
        Self::new(aligned_size)
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Always false for a constructed buffer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Raw pointer, valid for the lifetime of the buffer.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Whether the pointer honours [`DMA_ALIGNMENT`].
    #[inline]
    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % DMA_ALIGNMENT == 0
    }

    /// Fill the whole buffer with `value`.
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }

    /// Copy `data` to the start of the buffer and zero the rest of the first
    /// `padded_len` bytes.
    ///
    /// Returns `Error::InvalidArgument` if `data` is longer than `padded_len`
    /// or `padded_len` exceeds the buffer.
    pub fn load_padded(&mut self, data: &[u8], padded_len: usize) -> Result<()> {
        if data.len() > padded_len || padded_len > self.size {
            return Err(Error::InvalidArgument(format!(
                "cannot load {} bytes padded to {} into a {}-byte buffer",
                data.len(),
                padded_len,
                self.size
            )));
        }
        let target = &mut self.as_mut_slice()[..padded_len];
        target[..data.len()].copy_from_slice(data);
        target[data.len()..].fill(0);
        Ok(())
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for self.size bytes and we hold a shared borrow.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for self.size bytes and we hold an exclusive borrow.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated with this layout and is freed only here.
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl Deref for DmaBuf {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl DerefMut for DmaBuf {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for DmaBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for DmaBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_size_error() {
        let result = DmaBuf::new(0);
        assert!(result.is_err());
        if let Err(Error::DmaAllocationFailed { size, reason }) = result {
            assert_eq!(size, 0);
            assert!(reason.contains("greater than 0"));
        }
    }

    #[test]
    fn test_buffer_is_aligned_and_zeroed() {
        let buf = DmaBuf::new(8192).unwrap();
        assert_eq!(buf.len(), 8192);
        assert!(buf.is_aligned());
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_new_aligned_rounds_up() {
        let buf = DmaBuf::new_aligned(1000, 512).unwrap();
        assert_eq!(buf.len(), 1024);

        let result = DmaBuf::new_aligned(1000, 500);
        assert!(matches!(result, Err(Error::DmaAllocationFailed { .. })));
    }

    #[test]
    fn test_load_padded_clears_tail() {
        let mut buf = DmaBuf::new(4096).unwrap();
        buf.fill(0xAA);
        buf.load_padded(b"abc", 16).unwrap();

        assert_eq!(&buf[..3], b"abc");
        assert!(buf[3..16].iter().all(|&b| b == 0));
        // Bytes past the padded length are left alone
        assert_eq!(buf[16], 0xAA);
    }

    #[test]
    fn test_load_padded_rejects_oversized_input() {
        let mut buf = DmaBuf::new(512).unwrap();
        buf.fill(0x11);

        let result = buf.load_padded(&[0u8; 32], 16);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        let result = buf.load_padded(b"abc", 1024);
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        // Nothing was written
        assert!(buf.iter().all(|&b| b == 0x11));
    }
}
