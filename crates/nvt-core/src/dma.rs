use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

use tracing::trace;

/// Alignment of every I/O buffer, matching the page size devices expect.
pub const DMA_ALIGN: usize = 4096;

/// A page-aligned, zero-initialized I/O buffer.
///
/// The buffer is handed to the transport as a raw pointer at submission and
/// written by the "device" until the completion is polled, so the underlying
/// memory is shared with in-flight I/O the borrow checker cannot see. Owners
/// must keep the buffer alive until every command referencing it has
/// completed; the worker and the test suite do this by pooling buffers for
/// the whole run.
pub struct DmaBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// Raw-pointer field only; the allocation is owned and freed exactly once.
unsafe impl Send for DmaBuf {}

impl DmaBuf {
    /// Allocates `bytes` of zeroed, 4096-byte-aligned memory. Allocation
    /// failure is fatal, as it is for every caller of this test driver.
    pub fn alloc(bytes: usize) -> Self {
        assert!(bytes > 0, "zero-length DMA buffer");
        let layout = Layout::from_size_align(bytes, DMA_ALIGN).expect("dma layout");
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout);
        };
        trace!(ptr = ?ptr.as_ptr(), bytes, "dma buffer allocated");
        Self {
            ptr,
            len: bytes,
            layout,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The address a device would DMA to. In this user-space build it is the
    /// virtual address; transports that need a real IOVA translate
    /// internally.
    pub fn phys_addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for DmaBuf {
    fn drop(&mut self) {
        trace!(ptr = ?self.ptr.as_ptr(), "dma buffer freed");
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
