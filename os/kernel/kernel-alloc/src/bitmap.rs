use crate::{FrameAlloc, FrameAllocError};
use alloc::vec;
use alloc::vec::Vec;
use kernel_info::boot::BootMemoryMap;
use kernel_memory_addresses::{FrameNumber, PageSize, Size4K, align_down, align_up};
use log::{info, trace, warn};

/// Largest supported allocation order (`2^10` frames = 4 MiB).
pub const MAX_ORDER: u8 = 10;

const BITS: u64 = u64::BITS as u64;

/// Bitmap-backed physical frame allocator.
///
/// One bit per 4 KiB frame, set when the frame is claimed (by an
/// allocation or by a reservation from the boot memory map). Bits past the
/// last tracked frame are permanently set so the scan never has to special
/// case the final word.
pub struct BitmapFrameAlloc {
    words: Vec<u64>,
    /// Reference count of the first frame of every live allocation.
    refs: Vec<u32>,
    /// Order each live allocation was made with, indexed like `refs`.
    orders: Vec<u8>,
    total: u64,
    free: u64,
}

impl BitmapFrameAlloc {
    /// Tracks `total` frames starting at physical address zero, all free.
    #[must_use]
    pub fn new(total: u64) -> Self {
        let mut this = Self::all_claimed(total);
        this.clear_range(0, total);
        this.free = total;
        this
    }

    /// Sizes the bitmap to the highest usable address of `map` and
    /// pre-marks every frame that is not fully covered by a usable region,
    /// or that overlaps a reserved one.
    #[must_use]
    pub fn from_memory_map(map: &BootMemoryMap<'_>) -> Self {
        let total = map.usable_end().as_u64() >> Size4K::SHIFT;
        let mut this = Self::all_claimed(total);

        for region in map.usable() {
            let first = align_up(region.start.as_u64(), Size4K::SIZE) >> Size4K::SHIFT;
            let end = align_down(region.end().as_u64(), Size4K::SIZE) >> Size4K::SHIFT;
            if end > first {
                this.clear_range(first, end - first);
            }
        }

        for region in map.reserved() {
            let first = region.start.as_u64() >> Size4K::SHIFT;
            let end = (align_up(region.end().as_u64(), Size4K::SIZE) >> Size4K::SHIFT).min(total);
            if end > first {
                this.set_range(first, end - first);
            }
        }

        this.free = this.count_free();
        info!(
            "Frame allocator tracks {total} frames, {} usable",
            this.free
        );
        this
    }

    fn all_claimed(total: u64) -> Self {
        let words = total.div_ceil(BITS);
        #[allow(clippy::cast_possible_truncation)]
        Self {
            words: vec![u64::MAX; words as usize],
            refs: vec![0; total as usize],
            orders: vec![0; total as usize],
            total,
            free: 0,
        }
    }

    /// Number of frames tracked by the bitmap.
    #[must_use]
    pub const fn total_frames(&self) -> u64 {
        self.total
    }

    /// Number of frames currently available.
    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free
    }

    #[must_use]
    pub fn is_claimed(&self, frame: FrameNumber) -> bool {
        let index = frame.as_u64();
        index >= self.total || self.test(index)
    }

    fn test(&self, index: u64) -> bool {
        self.words[word_of(index)] & bit_of(index) != 0
    }

    fn set_range(&mut self, first: u64, count: u64) {
        for index in first..first + count {
            self.words[word_of(index)] |= bit_of(index);
        }
    }

    fn clear_range(&mut self, first: u64, count: u64) {
        for index in first..first + count {
            self.words[word_of(index)] &= !bit_of(index);
        }
    }

    fn count_free(&self) -> u64 {
        self.words
            .iter()
            .map(|w| u64::from(w.count_zeros()))
            .sum()
    }

    /// First-fit search for a free, naturally aligned run of `2^order` frames.
    fn find_run(&self, order: u8) -> Option<u64> {
        let run = 1u64 << order;

        if run < BITS {
            // Aligned runs never straddle a word.
            let mask = (1u64 << run) - 1;
            self.words
                .iter()
                .enumerate()
                .filter(|&(_, &word)| word != u64::MAX)
                .find_map(|(w, &word)| {
                    (0..BITS)
                        .step_by(1 << order)
                        .find(|&shift| word & (mask << shift) == 0)
                        .map(|shift| w as u64 * BITS + shift)
                })
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let span = (run / BITS) as usize;
            self.words
                .chunks_exact(span)
                .position(|chunk| chunk.iter().all(|&w| w == 0))
                .map(|c| (c * span) as u64 * BITS)
        }
    }

    fn check_allocated(&self, frame: FrameNumber, order: u8) -> Result<usize, FrameAllocError> {
        let index = frame.as_u64();
        let run = 1u64 << order;
        if order > MAX_ORDER || index % run != 0 || index + run > self.total {
            return Err(FrameAllocError::InvalidFrame { frame, order });
        }

        let slot = frame.as_usize();
        if self.refs[slot] == 0 || self.orders[slot] != order {
            return Err(FrameAllocError::InvalidFrame { frame, order });
        }

        debug_assert!((index..index + run).all(|i| self.test(i)));
        Ok(slot)
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn allocate(&mut self, order: u8) -> Result<FrameNumber, FrameAllocError> {
        debug_assert!(order <= MAX_ORDER, "order {order} exceeds MAX_ORDER");

        let Some(base) = self.find_run(order) else {
            warn!(
                "Frame allocator exhausted: no order-{order} run among {} free frames",
                self.free
            );
            return Err(FrameAllocError::FrameExhausted { order });
        };

        let run = 1u64 << order;
        self.set_range(base, run);
        self.free -= run;

        let frame = FrameNumber::new(base);
        self.refs[frame.as_usize()] = 1;
        self.orders[frame.as_usize()] = order;
        trace!("Allocated order-{order} run at frame {frame}");
        Ok(frame)
    }

    fn free(&mut self, frame: FrameNumber, order: u8) -> Result<(), FrameAllocError> {
        let slot = self.check_allocated(frame, order)?;
        let refs = self.refs[slot];
        if refs > 1 {
            return Err(FrameAllocError::Shared { frame, refs });
        }

        let run = 1u64 << order;
        self.refs[slot] = 0;
        self.clear_range(frame.as_u64(), run);
        self.free += run;
        trace!("Freed order-{order} run at frame {frame}");
        Ok(())
    }

    fn share(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError> {
        let slot = self.check_allocated(frame, 0)?;
        self.refs[slot] += 1;
        Ok(self.refs[slot])
    }

    fn release(&mut self, frame: FrameNumber) -> Result<u32, FrameAllocError> {
        let slot = self.check_allocated(frame, 0)?;
        self.refs[slot] -= 1;

        let left = self.refs[slot];
        if left == 0 {
            self.clear_range(frame.as_u64(), 1);
            self.free += 1;
            trace!("Released last reference to frame {frame}");
        }
        Ok(left)
    }

    fn ref_count(&self, frame: FrameNumber) -> u32 {
        self.refs.get(frame.as_usize()).copied().unwrap_or(0)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn word_of(index: u64) -> usize {
    (index / BITS) as usize
}

const fn bit_of(index: u64) -> u64 {
    1 << (index % BITS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::boot::MemoryRegion;

    #[test]
    fn first_fit_is_deterministic() {
        let mut frames = BitmapFrameAlloc::new(128);
        assert_eq!(frames.allocate(0), Ok(FrameNumber::new(0)));
        assert_eq!(frames.allocate(0), Ok(FrameNumber::new(1)));
        // order 1 needs an even base
        assert_eq!(frames.allocate(1), Ok(FrameNumber::new(2)));
        assert_eq!(frames.allocate(0), Ok(FrameNumber::new(4)));
        assert_eq!(frames.allocate(2), Ok(FrameNumber::new(8)));
        assert_eq!(frames.allocate(0), Ok(FrameNumber::new(5)));
        assert_eq!(frames.free_frames(), 128 - 10);
    }

    #[test]
    fn free_then_allocate_can_reuse() {
        let mut frames = BitmapFrameAlloc::new(64);
        let a = frames.allocate(1).unwrap();
        let _b = frames.allocate(1).unwrap();
        frames.free(a, 1).unwrap();
        assert_eq!(frames.allocate(1), Ok(a));
    }

    #[test]
    fn large_orders_span_whole_words() {
        let mut frames = BitmapFrameAlloc::new(512);
        let _ = frames.allocate(0).unwrap();
        // word 0 is dirty, so the first order-7 run starts at word 2
        assert_eq!(frames.allocate(7), Ok(FrameNumber::new(128)));
        assert_eq!(frames.allocate(8), Ok(FrameNumber::new(256)));
        assert_eq!(
            frames.allocate(8),
            Err(FrameAllocError::FrameExhausted { order: 8 })
        );
    }

    #[test]
    fn exhaustion_claims_nothing() {
        let mut frames = BitmapFrameAlloc::new(6);
        assert_eq!(frames.allocate(2), Ok(FrameNumber::new(0)));
        // frames 4 and 5 are free but an order-2 run needs 4..8
        assert_eq!(
            frames.allocate(2),
            Err(FrameAllocError::FrameExhausted { order: 2 })
        );
        assert_eq!(frames.free_frames(), 2);
        assert!(!frames.is_claimed(FrameNumber::new(4)));
        assert!(frames.is_claimed(FrameNumber::new(6)));
    }

    #[test]
    fn invalid_frees_are_rejected() {
        let mut frames = BitmapFrameAlloc::new(64);
        let a = frames.allocate(1).unwrap();

        assert_eq!(
            frames.free(a + 1, 0),
            Err(FrameAllocError::InvalidFrame { frame: a + 1, order: 0 })
        );
        assert_eq!(
            frames.free(a + 1, 1),
            Err(FrameAllocError::InvalidFrame { frame: a + 1, order: 1 })
        );
        assert_eq!(
            frames.free(FrameNumber::new(64), 0),
            Err(FrameAllocError::InvalidFrame {
                frame: FrameNumber::new(64),
                order: 0
            })
        );

        frames.free(a, 1).unwrap();
        assert_eq!(
            frames.free(a, 1),
            Err(FrameAllocError::InvalidFrame { frame: a, order: 1 })
        );
    }

    #[test]
    fn frees_must_match_the_allocation_order() {
        let mut frames = BitmapFrameAlloc::new(64);
        let a = frames.allocate(0).unwrap();
        let b = frames.allocate(0).unwrap();
        assert_eq!(b, a + 1);

        // an order-1 free would also clear `b`
        assert_eq!(
            frames.free(a, 1),
            Err(FrameAllocError::InvalidFrame { frame: a, order: 1 })
        );
        assert!(frames.is_claimed(a));
        assert!(frames.is_claimed(b));
        assert_eq!(frames.free_frames(), 62);
        assert_eq!(frames.allocate(0), Ok(b + 1));

        let stack = frames.allocate(1).unwrap();
        assert_eq!(
            frames.free(stack, 0),
            Err(FrameAllocError::InvalidFrame { frame: stack, order: 0 })
        );
        frames.free(stack, 1).unwrap();
        frames.free(a, 0).unwrap();
        assert_eq!(frames.ref_count(b), 1);
    }

    #[test]
    fn only_single_frames_are_shared() {
        let mut frames = BitmapFrameAlloc::new(64);
        let run = frames.allocate(1).unwrap();
        assert_eq!(
            frames.share(run),
            Err(FrameAllocError::InvalidFrame { frame: run, order: 0 })
        );
        assert_eq!(
            frames.release(run),
            Err(FrameAllocError::InvalidFrame { frame: run, order: 0 })
        );
        assert_eq!(frames.ref_count(run), 1);
    }

    #[test]
    fn shared_frames_are_freed_on_last_release() {
        let mut frames = BitmapFrameAlloc::new(64);
        let f = frames.alloc_4k().unwrap();
        assert_eq!(frames.share(f), Ok(2));
        assert_eq!(frames.free(f, 0), Err(FrameAllocError::Shared { frame: f, refs: 2 }));

        assert_eq!(frames.release(f), Ok(1));
        assert!(frames.is_claimed(f));
        assert_eq!(frames.release(f), Ok(0));
        assert!(!frames.is_claimed(f));
        assert_eq!(frames.ref_count(f), 0);
        assert!(frames.release(f).is_err());
    }

    #[test]
    fn memory_map_reservations_are_premarked() {
        let regions = [
            MemoryRegion::usable(0, 0x9_f000),
            MemoryRegion::reserved(0, 0x1000),
            MemoryRegion::reserved(0x9_f000, 0x6_1000),
            MemoryRegion::usable(0x10_0000, 0x10_0000),
            // firmware claims two frames in the middle of usable RAM
            MemoryRegion::reserved(0x10_2000, 0x1800),
        ];
        let mut frames = BitmapFrameAlloc::from_memory_map(&BootMemoryMap::new(&regions));

        assert_eq!(frames.total_frames(), 0x200);
        assert_eq!(frames.free_frames(), 0x9e + 0x100 - 2);
        assert!(frames.is_claimed(FrameNumber::new(0)));
        assert!(frames.is_claimed(FrameNumber::new(0xa0)));
        assert!(frames.is_claimed(FrameNumber::new(0x103)));

        assert_eq!(frames.allocate(0), Ok(FrameNumber::new(1)));
        // reserved frames were never allocated, so they cannot be freed
        assert!(frames.free(FrameNumber::new(0x102), 0).is_err());
    }
}
