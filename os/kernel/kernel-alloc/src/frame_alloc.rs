use kernel_memory_addresses::FrameNumber;
use kernel_sync::SpinLock;

/// Errors reported by a [`FrameAlloc`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameAllocError {
    /// No free, suitably aligned run of `2^order` frames exists.
    #[error("out of physical memory for an order-{order} allocation")]
    FrameExhausted { order: u8 },
    /// Double free, misaligned or out-of-range frame, or a frame that was
    /// never handed out by the allocator.
    #[error("invalid frame {frame} for order {order}")]
    InvalidFrame { frame: FrameNumber, order: u8 },
    /// Exclusive free of a frame that is still referenced elsewhere.
    #[error("frame {frame} still has {refs} references")]
    Shared { frame: FrameNumber, refs: u32 },
}

/// Physical frame allocator interface.
///
/// Orders are powers of two in frames: order 0 is one 4 KiB frame,
/// order 1 two contiguous frames, and so on.
pub trait FrameAlloc {
    /// Claims the first free run of `2^order` frames.
    ///
    /// # Errors
    /// [`FrameAllocError::FrameExhausted`] if no run is available. Nothing is
    /// claimed in that case.
    fn allocate(&mut self, order: u8) -> Result<FrameNumber, FrameAllocError>;

    /// Returns a run previously obtained from [`allocate`](Self::allocate).
    ///
    /// # Errors
    /// [`FrameAllocError::InvalidFrame`] on double free or a foreign frame,
    /// [`FrameAllocError::Shared`] if the run is still shared.
    fn free(&mut self, frame: FrameNumber, order: u8) -> Result<(), FrameAllocError>;

    /// Adds a reference to an allocated frame and returns the new count.
    ///
    /// # Errors
    /// [`FrameAllocError::InvalidFrame`] if `frame` is not allocated.
    fn share(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError>;

    /// Drops one reference to an order-0 frame, freeing it on the last one.
    /// Returns the number of references left.
    ///
    /// # Errors
    /// [`FrameAllocError::InvalidFrame`] if `frame` is not allocated.
    fn release(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError>;

    /// Current reference count; zero for free or reserved frames.
    fn ref_count(&self, frame: FrameNumber) -> u32;

    /// Convenience for a single zero-order frame.
    ///
    /// # Errors
    /// See [`allocate`](Self::allocate).
    #[inline]
    fn alloc_4k(&mut self) -> Result<FrameNumber, FrameAllocError> {
        self.allocate(0)
    }
}

impl<A: FrameAlloc + ?Sized> FrameAlloc for &mut A {
    #[inline]
    fn allocate(&mut self, order: u8) -> Result<FrameNumber, FrameAllocError> {
        (**self).allocate(order)
    }

    #[inline]
    fn free(&mut self, frame: FrameNumber, order: u8) -> Result<(), FrameAllocError> {
        (**self).free(frame, order)
    }

    #[inline]
    fn share(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError> {
        (**self).share(frame)
    }

    #[inline]
    fn release(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError> {
        (**self).release(frame)
    }

    #[inline]
    fn ref_count(&self, frame: FrameNumber) -> u32 {
        (**self).ref_count(frame)
    }
}

/// A shared, lock-guarded allocator. Each call holds the lock only for
/// its own scan-and-claim or clear.
impl<A: FrameAlloc> FrameAlloc for &SpinLock<A> {
    #[inline]
    fn allocate(&mut self, order: u8) -> Result<FrameNumber, FrameAllocError> {
        self.with_lock(|a| a.allocate(order))
    }

    #[inline]
    fn free(&mut self, frame: FrameNumber, order: u8) -> Result<(), FrameAllocError> {
        self.with_lock(|a| a.free(frame, order))
    }

    #[inline]
    fn share(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError> {
        self.with_lock(|a| a.share(frame))
    }

    #[inline]
    fn release(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError> {
        self.with_lock(|a| a.release(frame))
    }

    #[inline]
    fn ref_count(&self, frame: FrameNumber) -> u32 {
        self.with_lock(|a| a.ref_count(frame))
    }
}
