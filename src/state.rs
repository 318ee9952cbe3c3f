//! §3 `FuzzState`: the run's coarse fuzzing phase. Progression is monotone.

use std::sync::atomic::{AtomicU8, Ordering};

/// One of {unset, static, dynamic-pre, dynamic-main}.
///
/// *Static*: no feedback loop engaged; mutations drawn from the seed files
/// only. *DynamicPre*: the seed set is being warmed — each seed is executed
/// unmodified to populate the bitmap. *DynamicMain*: mutations flow from the
/// dynamic queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum FuzzState {
    Unset = 0,
    Static = 1,
    DynamicPre = 2,
    DynamicMain = 3,
}

impl FuzzState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FuzzState::Unset,
            1 => FuzzState::Static,
            2 => FuzzState::DynamicPre,
            _ => FuzzState::DynamicMain,
        }
    }
}

/// An atomically-readable, monotonically-advancing [`FuzzState`], shared
/// across every worker.
pub struct SharedFuzzState {
    inner: AtomicU8,
}

impl SharedFuzzState {
    pub fn new(initial: FuzzState) -> Self {
        SharedFuzzState {
            inner: AtomicU8::new(initial as u8),
        }
    }

    pub fn get(&self) -> FuzzState {
        FuzzState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Advance to `next` iff `next` is strictly later in the progression.
    /// No-op (and returns `false`) if the state has already moved past it.
    pub fn advance_to(&self, next: FuzzState) -> bool {
        loop {
            let current = self.inner.load(Ordering::Acquire);
            if FuzzState::from_u8(current) >= next {
                return false;
            }
            if self
                .inner
                .compare_exchange(current, next as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progression_is_monotone() {
        let state = SharedFuzzState::new(FuzzState::Static);
        assert!(state.advance_to(FuzzState::DynamicPre));
        assert_eq!(state.get(), FuzzState::DynamicPre);
        assert!(!state.advance_to(FuzzState::Static));
        assert_eq!(state.get(), FuzzState::DynamicPre);
        assert!(state.advance_to(FuzzState::DynamicMain));
    }
}
