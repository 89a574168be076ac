use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MuxState {
    /// Constructed; pumps not running.
    Created = 0,
    Running = 1,
    /// `shutdown` in progress.
    Draining = 2,
    Stopped = 3,
}

impl MuxState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => MuxState::Created,
            1 => MuxState::Running,
            2 => MuxState::Draining,
            _ => MuxState::Stopped,
        }
    }
}

/// Atomically shared lifecycle state.
#[derive(Debug)]
pub(crate) struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(MuxState::Created as u8))
    }

    pub(crate) fn get(&self) -> MuxState {
        MuxState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: MuxState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; false if another caller got there first.
    pub(crate) fn transition(&self, from: MuxState, to: MuxState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
