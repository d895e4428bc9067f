//! Command buffer progress as published by the submission layer.
//!
//! The submission layer registers its command buffers, marks the one it is
//! recording into as active, and reports each fence signal and retirement.
//! Pools that must wait on GPU work store `(command buffer, fence counter)`
//! pairs and compare them against a [`SubmissionSnapshot`].

use core::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use ahash::AHashMap;

/// Opaque identity of a command buffer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CmdBufferId(u64);

impl CmdBufferId {

    #[inline(always)]
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Default, Debug)]
struct CmdBufferProgress {
    submitted: u64,
    signaled: u64,
}

#[derive(Default)]
struct TrackerState {
    buffers: AHashMap<CmdBufferId, CmdBufferProgress>,
    active: Option<CmdBufferId>,
}

#[derive(Default)]
pub struct SubmissionTracker {
    next_id: AtomicU64,
    state: Mutex<TrackerState>,
}

impl SubmissionTracker {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self) -> CmdBufferId {
        let id = CmdBufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().buffers.insert(id, CmdBufferProgress::default());
        id
    }

    /// Marks `cmd` as the command buffer new work is recorded into.
    pub fn set_active(&self, cmd: CmdBufferId) {
        self.state.lock().active = Some(cmd);
    }

    pub fn on_submitted(&self, cmd: CmdBufferId) {
        if let Some(progress) = self.state.lock().buffers.get_mut(&cmd) {
            progress.submitted += 1;
        }
    }

    /// Records that the fence of `cmd`'s latest submission signaled.
    pub fn on_fence_signaled(&self, cmd: CmdBufferId) {
        if let Some(progress) = self.state.lock().buffers.get_mut(&cmd) {
            progress.signaled += 1;
        }
    }

    /// Forgets `cmd`. Everything waiting on it counts as complete from now on.
    pub fn retire(&self, cmd: CmdBufferId) {
        let mut state = self.state.lock();
        state.buffers.remove(&cmd);
        if state.active == Some(cmd) {
            state.active = None;
        }
    }

    pub fn signaled_counter(&self, cmd: CmdBufferId) -> Option<u64> {
        self.state.lock().buffers.get(&cmd).map(|progress| progress.signaled)
    }

    pub fn submitted_counter(&self, cmd: CmdBufferId) -> Option<u64> {
        self.state.lock().buffers.get(&cmd).map(|progress| progress.submitted)
    }

    /// The active command buffer with its current fence signaled counter.
    pub fn active(&self) -> Option<(CmdBufferId, u64)> {
        let state = self.state.lock();
        let cmd = state.active?;
        state.buffers.get(&cmd).map(|progress| (cmd, progress.signaled))
    }

    pub fn snapshot(&self) -> SubmissionSnapshot {
        let state = self.state.lock();
        SubmissionSnapshot {
            signaled: state.buffers
                .iter()
                .map(|(&cmd, progress)| (cmd, progress.signaled))
                .collect(),
        }
    }
}

/// Point-in-time copy of the fence counters of every live command buffer.
#[derive(Default, Clone, Debug)]
pub struct SubmissionSnapshot {
    signaled: AHashMap<CmdBufferId, u64>,
}

impl SubmissionSnapshot {

    /// Whether `cmd`'s fence signaled again after it stood at `counter`.
    ///
    /// Command buffers the tracker no longer knows of have retired.
    #[inline(always)]
    pub fn has_completed(&self, cmd: CmdBufferId, counter: u64) -> bool {
        self.signaled
            .get(&cmd)
            .is_none_or(|&signaled| counter < signaled)
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn completion_needs_a_later_signal_or_retirement() {
        let tracker = SubmissionTracker::new();
        let a = tracker.register();
        let b = tracker.register();
        tracker.set_active(a);
        let (active, counter) = tracker.active().unwrap();
        assert_eq!(active, a);
        assert_eq!(counter, 0);
        tracker.on_submitted(a);
        assert!(!tracker.snapshot().has_completed(a, counter));
        tracker.on_fence_signaled(a);
        assert!(tracker.snapshot().has_completed(a, counter));
        assert!(!tracker.snapshot().has_completed(a, 1));
        assert!(!tracker.snapshot().has_completed(b, 0));
        tracker.retire(b);
        assert!(tracker.snapshot().has_completed(b, 0));
        tracker.retire(a);
        assert!(tracker.active().is_none());
        assert_eq!(tracker.submitted_counter(a), None);
    }
}
