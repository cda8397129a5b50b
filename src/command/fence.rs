//! Fences
//!
//! Creates and owns fences; exposes the blocking wait and the
//! non-blocking completed-value read.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::device::{Device, DeviceObject, FenceId};
use crate::error::{DeviceResultExt, Error, Result};

/// A fence value marking the end of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceToken {
    pub fence: FenceId,
    pub value: u64,
}

pub struct FenceManager {
    device: Arc<dyn Device>,
    timeout: Option<Duration>,
    fences: Mutex<Option<HashSet<FenceId>>>,
}

impl FenceManager {
    const NAME: &'static str = "FenceManager";

    /// `timeout` bounds every blocking wait. `None` waits forever.
    pub fn new(device: Arc<dyn Device>, timeout: Option<Duration>) -> Self {
        Self {
            device,
            timeout,
            fences: Mutex::new(Some(HashSet::new())),
        }
    }

    pub fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        let mut guard = self.fences.lock();
        let fences = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let fence = self
            .device
            .create_fence(initial_value)
            .during("CreateFence")?;
        fences.insert(fence);
        debug!("Created {} at value {}", fence, initial_value);
        Ok(fence)
    }

    fn ensure_known(&self, fence: FenceId) -> Result<()> {
        let guard = self.fences.lock();
        let fences = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        if fences.contains(&fence) {
            Ok(())
        } else {
            Err(Error::UnknownHandle {
                kind: "fence",
                id: fence.raw(),
            })
        }
    }

    /// Non-blocking read of the last value the GPU signaled.
    pub fn completed_value(&self, fence: FenceId) -> Result<u64> {
        self.ensure_known(fence)?;
        self.device
            .completed_fence_value(fence)
            .during("GetCompletedValue")
    }

    pub fn is_complete(&self, token: FenceToken) -> Result<bool> {
        Ok(self.completed_value(token.fence)? >= token.value)
    }

    /// Block until `fence` reaches `value`.
    ///
    /// Returns immediately when the value was already reached. Running out
    /// of the configured timeout is fatal and reported as
    /// [`Error::FenceTimeout`].
    pub fn wait(&self, fence: FenceId, value: u64) -> Result<()> {
        let completed = self.completed_value(fence)?;
        if completed >= value {
            trace!("{} already at {} (waited for {})", fence, completed, value);
            return Ok(());
        }

        debug!("Waiting for {} to reach {} (at {})", fence, value, completed);
        let reached = self
            .device
            .wait_for_fence(fence, value, self.timeout)
            .during("SetEventOnCompletion")?;
        if reached {
            return Ok(());
        }

        let completed = self.completed_value(fence)?;
        let timeout = self.timeout.unwrap_or_default();
        error!(
            "Fence wait timed out after {:?}: {} at {}, wanted {}",
            timeout, fence, completed, value
        );
        Err(Error::FenceTimeout {
            fence,
            value,
            completed,
            timeout,
        })
    }

    pub fn wait_for_token(&self, token: FenceToken) -> Result<()> {
        self.wait(token.fence, token.value)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Release every fence. Further calls fail with [`Error::UseAfterClear`].
    pub fn clear(&self) -> Result<usize> {
        let fences = self.fences
            .lock()
            .take()
            .ok_or(Error::UseAfterClear(Self::NAME))?;
        for fence in &fences {
            self.device.release(DeviceObject::Fence(*fence));
        }
        debug!("Released {} fences", fences.len());
        Ok(fences.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CommandListType, CompletionMode, HeadlessDevice};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn test_wait_on_reached_value_returns_immediately() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let fences = FenceManager::new(device, Some(Duration::from_millis(10)));
        let fence = fences.create_fence(5).unwrap();
        fences.wait(fence, 3).unwrap();
        fences.wait(fence, 5).unwrap();
        assert!(fences
            .is_complete(FenceToken { fence, value: 5 })
            .unwrap());
    }

    #[test]
    fn test_wait_times_out() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let fences = FenceManager::new(device, Some(Duration::from_millis(20)));
        let fence = fences.create_fence(0).unwrap();
        let err = fences.wait(fence, 1).unwrap_err();
        assert!(matches!(
            err,
            Error::FenceTimeout {
                value: 1,
                completed: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_wait_blocks_until_signaled() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let fences = Arc::new(FenceManager::new(device.clone(), None));
        let fence = fences.create_fence(0).unwrap();
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        device.signal(queue, fence, 1).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let fences = fences.clone();
            thread::spawn(move || {
                fences.wait(fence, 1).unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        device.retire_all();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn test_use_after_clear() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let fences = FenceManager::new(device, None);
        let fence = fences.create_fence(0).unwrap();
        assert_eq!(fences.clear().unwrap(), 1);
        assert!(matches!(
            fences.completed_value(fence),
            Err(Error::UseAfterClear(_))
        ));
        assert!(matches!(fences.create_fence(0), Err(Error::UseAfterClear(_))));
        assert!(matches!(fences.clear(), Err(Error::UseAfterClear(_))));
    }
}
