//! Command Queues
//!
//! Owns the native queues, submits closed command lists and enqueues fence
//! signals behind them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::command::CommandList;
use crate::device::{CommandListType, Device, DeviceObject, FenceId, QueueId};
use crate::error::{DeviceResultExt, Error, Result};

struct QueueEntry {
    list_type: CommandListType,
    submitted_lists: u64,
    submissions: u64,
}

#[derive(Default)]
struct QueueRegistry {
    queues: HashMap<QueueId, QueueEntry>,
    last_signaled: HashMap<FenceId, u64>,
}

pub struct CommandQueueManager {
    device: Arc<dyn Device>,
    registry: Mutex<Option<QueueRegistry>>,
}

/// Whether lists of type `list` may run on a queue of type `queue`.
fn accepts(queue: CommandListType, list: CommandListType) -> bool {
    match queue {
        CommandListType::Direct => true,
        CommandListType::Compute => {
            matches!(list, CommandListType::Compute | CommandListType::Copy)
        }
        CommandListType::Copy => list == CommandListType::Copy,
    }
}

impl CommandQueueManager {
    const NAME: &'static str = "CommandQueueManager";

    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            registry: Mutex::new(Some(QueueRegistry::default())),
        }
    }

    pub fn create_command_queue(&self, list_type: CommandListType) -> Result<QueueId> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let queue = self
            .device
            .create_command_queue(list_type)
            .during("CreateCommandQueue")?;
        registry.queues.insert(
            queue,
            QueueEntry {
                list_type,
                submitted_lists: 0,
                submissions: 0,
            },
        );
        debug!("Created {} ({:?})", queue, list_type);
        Ok(queue)
    }

    /// Submit `lists` to `queue`; they execute in slice order.
    ///
    /// Every list must be closed and of a type the queue accepts. Nothing is
    /// submitted when any list fails the check.
    pub fn execute_command_lists(&self, queue: QueueId, lists: &[&CommandList]) -> Result<()> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = registry.queues.get_mut(&queue).ok_or(Error::UnknownHandle {
            kind: "command queue",
            id: queue.raw(),
        })?;

        for list in lists {
            if !list.is_closed() {
                return Err(Error::ClosedListRequired(list.id()));
            }
            if !accepts(entry.list_type, list.list_type()) {
                return Err(Error::InvalidArgument(format!(
                    "{} ({:?}) cannot run on {} ({:?})",
                    list.id(),
                    list.list_type(),
                    queue,
                    entry.list_type
                )));
            }
        }

        self.device
            .execute_command_lists(queue, lists)
            .during("ExecuteCommandLists")?;
        entry.submitted_lists += lists.len() as u64;
        entry.submissions += 1;
        trace!("Submitted {} lists to {}", lists.len(), queue);
        Ok(())
    }

    /// Enqueue a GPU-side update of `fence` to `value` after all work
    /// already submitted to `queue`. Values must strictly increase per fence.
    pub fn signal(&self, queue: QueueId, fence: FenceId, value: u64) -> Result<()> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        if !registry.queues.contains_key(&queue) {
            return Err(Error::UnknownHandle {
                kind: "command queue",
                id: queue.raw(),
            });
        }
        let last = registry.last_signaled.get(&fence).copied().unwrap_or(0);
        if value <= last {
            return Err(Error::NonMonotonicFenceValue { fence, value, last });
        }

        self.device
            .signal(queue, fence, value)
            .during("CommandQueue::Signal")?;
        registry.last_signaled.insert(fence, value);
        trace!("{} will signal {} = {}", queue, fence, value);
        Ok(())
    }

    pub fn last_signaled_value(&self, fence: FenceId) -> Result<u64> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        Ok(registry.last_signaled.get(&fence).copied().unwrap_or(0))
    }

    /// Number of command lists submitted to `queue` so far.
    pub fn submitted_list_count(&self, queue: QueueId) -> Result<u64> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        registry
            .queues
            .get(&queue)
            .map(|entry| entry.submitted_lists)
            .ok_or(Error::UnknownHandle {
                kind: "command queue",
                id: queue.raw(),
            })
    }

    /// Number of `execute_command_lists` calls accepted by `queue`.
    pub fn submission_count(&self, queue: QueueId) -> Result<u64> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        registry
            .queues
            .get(&queue)
            .map(|entry| entry.submissions)
            .ok_or(Error::UnknownHandle {
                kind: "command queue",
                id: queue.raw(),
            })
    }

    /// Release every queue. Further calls fail with [`Error::UseAfterClear`].
    pub fn clear(&self) -> Result<usize> {
        let registry = self.registry
            .lock()
            .take()
            .ok_or(Error::UseAfterClear(Self::NAME))?;
        for queue in registry.queues.keys() {
            self.device.release(DeviceObject::Queue(*queue));
        }
        debug!("Released {} command queues", registry.queues.len());
        Ok(registry.queues.len())
    }
}
