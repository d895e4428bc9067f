use std::sync::Arc;

use ash::vk::Handle;

use parking_lot::Mutex;

use ahash::AHashSet;

use kasa_log::trace;

use crate::{
    device::{RawDevice, ObjectKind, DeletableObject},
    submission::{CmdBufferId, SubmissionSnapshot},
};

#[derive(Clone, Copy, Debug)]
struct PendingDeletion {
    kind: ObjectKind,
    raw: u64,
    cmd: Option<CmdBufferId>,
    fence_counter: u64,
    frame: u64,
}

#[derive(Default)]
struct DeletionState {
    entries: Vec<PendingDeletion>,
    queued: AHashSet<(ObjectKind, u64)>,
}

/// Driver objects waiting for the GPU to stop using them.
pub struct DeferredDeletionQueue {
    device: Arc<dyn RawDevice>,
    frame_delay: u64,
    state: Mutex<DeletionState>,
}

impl DeferredDeletionQueue {

    pub fn new(device: Arc<dyn RawDevice>, frame_delay: u64) -> Self {
        Self {
            device,
            frame_delay,
            state: Mutex::new(DeletionState::default()),
        }
    }

    #[inline(always)]
    pub fn enqueue<T: DeletableObject>(
        &self,
        object: T,
        submission: Option<(CmdBufferId, u64)>,
        frame: u64,
    ) {
        self.enqueue_raw(T::KIND, object.as_raw(), submission, frame)
    }

    /// Queues `raw` for destruction once `frame_delay` frames have passed and the
    /// command buffer in `submission` moved past the captured fence counter.
    ///
    /// # Panics
    /// If the same object is already queued.
    pub fn enqueue_raw(
        &self,
        kind: ObjectKind,
        raw: u64,
        submission: Option<(CmdBufferId, u64)>,
        frame: u64,
    ) {
        assert!(raw != 0, "deferred deletion of a null {kind:?}");
        let mut state = self.state.lock();
        assert!(state.queued.insert((kind, raw)), "{kind:?} {raw:#x} queued for deletion twice");
        state.entries.push(PendingDeletion {
            kind,
            raw,
            cmd: submission.map(|(cmd, _)| cmd),
            fence_counter: submission.map(|(_, counter)| counter).unwrap_or_default(),
            frame,
        });
    }

    /// Destroys every entry that is old enough and whose GPU work completed, or every
    /// entry when `immediately` is set. Returns the number destroyed.
    pub fn release_resources(
        &self,
        immediately: bool,
        frame: u64,
        submissions: &SubmissionSnapshot,
    ) -> usize
    {
        let ready: Vec<_> = {
            let mut state = self.state.lock();
            let state = &mut *state;
            let mut ready = vec![];
            state.entries.retain(|entry| {
                let expired = immediately || (
                    frame >= entry.frame + self.frame_delay &&
                    entry.cmd.is_none_or(|cmd| submissions.has_completed(cmd, entry.fence_counter))
                );
                if expired {
                    state.queued.remove(&(entry.kind, entry.raw));
                    ready.push(*entry);
                }
                !expired
            });
            ready
        };
        for entry in &ready {
            trace!("destroying {:?} {:#x} queued at frame {}", entry.kind, entry.raw, entry.frame);
            unsafe {
                self.device.destroy_object(entry.kind, entry.raw);
            }
        }
        ready.len()
    }

    /// Drops the command buffer reference of entries waiting on `cmd`.
    pub fn on_command_buffer_retired(&self, cmd: CmdBufferId) {
        for entry in &mut self.state.lock().entries {
            if entry.cmd == Some(cmd) {
                entry.cmd = None;
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use ash::vk;

    use crate::{
        device::HeadlessDevice,
        submission::SubmissionTracker,
    };

    fn queue(delay: u64) -> (Arc<HeadlessDevice>, DeferredDeletionQueue) {
        let device = Arc::new(HeadlessDevice::new());
        (device.clone(), DeferredDeletionQueue::new(device, delay))
    }

    #[test]
    fn entries_wait_for_the_frame_delay() {
        let (device, queue) = queue(3);
        let sampler: vk::Sampler = device.create_object();
        queue.enqueue(sampler, None, 5);
        let none = SubmissionSnapshot::default();
        assert_eq!(queue.release_resources(false, 6, &none), 0);
        assert_eq!(queue.release_resources(false, 7, &none), 0);
        assert_eq!(queue.release_resources(false, 8, &none), 1);
        assert!(device.was_destroyed(sampler));
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn entries_wait_for_their_command_buffer() {
        let (device, queue) = queue(1);
        let tracker = SubmissionTracker::new();
        let cmd = tracker.register();
        tracker.set_active(cmd);
        let view: vk::ImageView = device.create_object();
        let pipeline: vk::Pipeline = device.create_object();
        queue.enqueue(view, tracker.active(), 0);
        queue.enqueue(pipeline, tracker.active(), 0);
        assert_eq!(queue.release_resources(false, 10, &tracker.snapshot()), 0);
        tracker.on_fence_signaled(cmd);
        assert_eq!(queue.release_resources(false, 10, &tracker.snapshot()), 2);
        assert!(device.was_destroyed(view));
        assert!(device.was_destroyed(pipeline));
    }

    #[test]
    fn retired_command_buffers_release_their_entries() {
        let (device, queue) = queue(0);
        let tracker = SubmissionTracker::new();
        let cmd = tracker.register();
        tracker.set_active(cmd);
        let event: vk::Event = device.create_object();
        queue.enqueue(event, tracker.active(), 0);
        let snapshot = tracker.snapshot();
        assert_eq!(queue.release_resources(false, 0, &snapshot), 0);
        queue.on_command_buffer_retired(cmd);
        assert_eq!(queue.release_resources(false, 0, &snapshot), 1);
    }

    #[test]
    fn immediate_release_ignores_every_gate() {
        let (device, queue) = queue(100);
        let tracker = SubmissionTracker::new();
        tracker.set_active(tracker.register());
        let layout: vk::PipelineLayout = device.create_object();
        queue.enqueue(layout, tracker.active(), 0);
        assert_eq!(queue.release_resources(true, 0, &tracker.snapshot()), 1);
        assert_eq!(device.destroyed_objects(), vec![(ObjectKind::PipelineLayout, layout.as_raw())]);
    }

    #[test]
    #[should_panic(expected = "queued for deletion twice")]
    fn double_enqueue_panics() {
        let (device, queue) = queue(1);
        let sampler: vk::Sampler = device.create_object();
        queue.enqueue(sampler, None, 0);
        queue.enqueue(sampler, None, 0);
    }
}
