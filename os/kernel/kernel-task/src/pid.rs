use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Process identifier. Never reused.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pid(u64);

impl Pid {
    /// Take the next identifier from the process-wide counter.
    ///
    /// Only uniqueness matters, so a relaxed increment suffices even when
    /// several processors fork at once.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_increase() {
        let a = Pid::next();
        let b = Pid::next();
        assert!(b > a);
        assert_ne!(a.as_u64(), 0);
    }
}
