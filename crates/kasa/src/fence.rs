use std::sync::Arc;

use ash::vk;

use parking_lot::Mutex;

use crate::{
    device::RawDevice,
    error::Result,
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FenceState {
    NotReady,
    Signaled,
}

/// A pooled fence. Give it back with [`FencePool::release`].
#[derive(Debug)]
pub struct Fence {
    handle: vk::Fence,
    state: FenceState,
}

impl Fence {

    #[inline(always)]
    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Last known state, without asking the device.
    #[inline(always)]
    pub fn state(&self) -> FenceState {
        self.state
    }
}

#[derive(Default)]
struct FencePoolState {
    free: Vec<vk::Fence>,
    used: usize,
}

#[derive(Clone, Copy, Default, Debug)]
pub struct FenceReport {
    pub used: usize,
    pub free: usize,
}

pub struct FencePool {
    device: Arc<dyn RawDevice>,
    state: Mutex<FencePoolState>,
}

impl FencePool {

    pub fn new(device: Arc<dyn RawDevice>) -> Self {
        Self {
            device,
            state: Mutex::new(FencePoolState::default()),
        }
    }

    /// Reuses a free fence or creates one.
    pub fn allocate(&self, create_signaled: bool) -> Result<Fence> {
        let reused = {
            let mut state = self.state.lock();
            let reused = state.free.pop();
            if reused.is_some() {
                state.used += 1;
            }
            reused
        };
        if let Some(handle) = reused {
            return Ok(Fence {
                handle,
                state: if create_signaled { FenceState::Signaled } else { FenceState::NotReady },
            })
        }
        let handle = self.device.create_fence(create_signaled)?;
        self.state.lock().used += 1;
        Ok(Fence {
            handle,
            state: if create_signaled { FenceState::Signaled } else { FenceState::NotReady },
        })
    }

    /// Polls the device without blocking.
    pub fn check_state(&self, fence: &mut Fence) -> Result<FenceState> {
        if fence.state == FenceState::NotReady && unsafe { self.device.fence_status(fence.handle)? } {
            fence.state = FenceState::Signaled;
        }
        Ok(fence.state)
    }

    #[inline(always)]
    pub fn is_signaled(&self, fence: &mut Fence) -> Result<bool> {
        Ok(self.check_state(fence)? == FenceState::Signaled)
    }

    /// Blocks up to `timeout_ns`. Returns `false` if the fence did not signal in time.
    pub fn wait(&self, fence: &mut Fence, timeout_ns: u64) -> Result<bool> {
        if fence.state == FenceState::Signaled {
            return Ok(true)
        }
        if unsafe { self.device.wait_for_fence(fence.handle, timeout_ns)? } {
            fence.state = FenceState::Signaled;
            return Ok(true)
        }
        Ok(false)
    }

    pub fn reset(&self, fence: &mut Fence) -> Result<()> {
        if fence.state != FenceState::NotReady {
            unsafe {
                self.device.reset_fence(fence.handle)?;
            }
            fence.state = FenceState::NotReady;
        }
        Ok(())
    }

    /// Resets the fence and returns it to the free pool. A fence that fails to reset
    /// is destroyed instead.
    pub fn release(&self, mut fence: Fence) -> Result<()> {
        let reset = self.reset(&mut fence);
        let mut state = self.state.lock();
        state.used -= 1;
        if reset.is_ok() {
            state.free.push(fence.handle);
        } else {
            drop(state);
            unsafe {
                self.device.destroy_fence(fence.handle);
            }
        }
        reset
    }

    /// Waits for the fence and releases it. Hands the fence back if it timed out.
    pub fn wait_and_release(&self, mut fence: Fence, timeout_ns: u64) -> Result<Option<Fence>> {
        if !self.wait(&mut fence, timeout_ns)? {
            return Ok(Some(fence))
        }
        self.release(fence)?;
        Ok(None)
    }

    pub fn report(&self) -> FenceReport {
        let state = self.state.lock();
        FenceReport {
            used: state.used,
            free: state.free.len(),
        }
    }

    /// Destroys the free fences and returns how many were never released.
    pub fn destroy_free(&self) -> usize {
        let (free, used) = {
            let mut state = self.state.lock();
            (core::mem::take(&mut state.free), state.used)
        };
        for handle in free {
            unsafe {
                self.device.destroy_fence(handle);
            }
        }
        used
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use crate::device::HeadlessDevice;

    fn pool() -> (Arc<HeadlessDevice>, FencePool) {
        let device = Arc::new(HeadlessDevice::new());
        (device.clone(), FencePool::new(device))
    }

    #[test]
    fn released_fences_are_reused_unsignaled() {
        let (device, pool) = pool();
        let mut fence = pool.allocate(false).unwrap();
        let handle = fence.handle();
        assert!(!pool.is_signaled(&mut fence).unwrap());
        device.signal_fence(handle);
        assert!(pool.is_signaled(&mut fence).unwrap());
        pool.release(fence).unwrap();
        assert_eq!(pool.report().free, 1);
        let mut again = pool.allocate(false).unwrap();
        assert_eq!(again.handle(), handle);
        assert_eq!(again.state(), FenceState::NotReady);
        assert!(!pool.is_signaled(&mut again).unwrap());
        assert_eq!(device.live_fence_count(), 1);
        pool.release(again).unwrap();
    }

    #[test]
    fn signaled_allocation_reports_signaled() {
        let (_device, pool) = pool();
        let mut fresh = pool.allocate(true).unwrap();
        assert!(pool.wait(&mut fresh, 0).unwrap());
        pool.release(fresh).unwrap();
        let reused = pool.allocate(true).unwrap();
        assert_eq!(reused.state(), FenceState::Signaled);
        pool.release(reused).unwrap();
    }

    #[test]
    fn timed_out_wait_hands_the_fence_back() {
        let (device, pool) = pool();
        let fence = pool.allocate(false).unwrap();
        let fence = pool.wait_and_release(fence, 1_000).unwrap().unwrap();
        device.signal_fence(fence.handle());
        assert!(pool.wait_and_release(fence, 1_000).unwrap().is_none());
        assert_eq!(pool.report().used, 0);
        assert_eq!(pool.destroy_free(), 0);
        assert_eq!(device.live_fence_count(), 0);
    }
}
