use crate::BitmapFrameAlloc;
use kernel_info::boot::BootMemoryMap;
use kernel_sync::{SpinLock, SyncOnceCell};
use log::warn;

/// Handle to the process-wide allocator; implements [`FrameAlloc`](crate::FrameAlloc).
pub type GlobalFrames = &'static SpinLock<BitmapFrameAlloc>;

static FRAMES: SyncOnceCell<SpinLock<BitmapFrameAlloc>> = SyncOnceCell::new();

/// Builds the global frame allocator from the boot memory map.
///
/// Runs once on the bootstrap processor before any other processor is
/// started. Later calls keep the first allocator and log a warning.
pub fn init_frames(map: &BootMemoryMap<'_>) -> GlobalFrames {
    let mut built = false;
    let frames = FRAMES.get_or_init(|| {
        built = true;
        SpinLock::new(BitmapFrameAlloc::from_memory_map(map))
    });

    if !built {
        warn!("Frame allocator already initialized; ignoring new memory map");
    }
    frames
}

/// The global frame allocator, if [`init_frames`] has run.
#[must_use]
pub fn frames() -> Option<GlobalFrames> {
    FRAMES.get()
}
