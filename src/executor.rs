//! Command List Executor
//!
//! Collects closed command lists from the recorders and submits them to a
//! direct queue in insertion order, one batch per call, followed by a
//! single fence signal. The signal's value is the batch's completion token.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

use crate::command::{CommandList, FenceToken, SharedCommandList};
use crate::context::RenderContext;
use crate::device::{CommandListType, FenceId, QueueId};
use crate::error::{Error, Result};

struct ExecutorState {
    pending: Vec<SharedCommandList>,
    next_value: u64,
    last_submitted: Option<FenceToken>,
    executed_lists: u64,
}

pub struct CommandListExecutor {
    context: Arc<RenderContext>,
    queue: QueueId,
    fence: FenceId,
    state: Mutex<ExecutorState>,
}

impl CommandListExecutor {
    /// Create the executor with its own direct queue and fence.
    pub fn new(context: Arc<RenderContext>) -> Result<Self> {
        let queue = context
            .queues()
            .create_command_queue(CommandListType::Direct)?;
        let fence = context.fences().create_fence(0)?;
        info!("Command list executor ready on {} with {}", queue, fence);
        Ok(Self {
            context,
            queue,
            fence,
            state: Mutex::new(ExecutorState {
                pending: Vec::new(),
                next_value: 1,
                last_submitted: None,
                executed_lists: 0,
            }),
        })
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn fence(&self) -> FenceId {
        self.fence
    }

    /// Queue a closed list for the next [`execute_command_lists`](Self::execute_command_lists).
    ///
    /// Fails with [`Error::ClosedListRequired`] when the list is still recording.
    pub fn add_command_list_to_execute(&self, list: SharedCommandList) -> Result<()> {
        let id = {
            let guard = list.lock();
            if !guard.is_closed() {
                return Err(Error::ClosedListRequired(guard.id()));
            }
            guard.id()
        };

        let mut state = self.state.lock();
        if state.pending.iter().any(|queued| Arc::ptr_eq(queued, &list)) {
            return Err(Error::InvalidArgument(format!(
                "{} is already queued for execution",
                id
            )));
        }
        state.pending.push(list);
        trace!("Queued {} ({} pending)", id, state.pending.len());
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Submit every queued list as one batch, then signal the fence once.
    ///
    /// An empty batch still signals. When submission fails the whole batch
    /// is dropped and the queue's submission history is left as it was.
    /// When only the signal fails, the batch's allocators stay in flight
    /// behind a token that never completes, so they are never reset.
    pub fn execute_command_lists(&self) -> Result<FenceToken> {
        let mut state = self.state.lock();
        let batch = std::mem::take(&mut state.pending);

        let guards: Vec<MutexGuard<'_, CommandList>> = batch.iter().map(|list| list.lock()).collect();
        let lists: Vec<&CommandList> = guards.iter().map(|guard| &**guard).collect();

        if !lists.is_empty() {
            if let Err(err) = self
                .context
                .queues()
                .execute_command_lists(self.queue, &lists)
            {
                error!("Dropping batch of {} command lists: {}", lists.len(), err);
                return Err(err);
            }
        }

        // The batch is on the GPU from here on.
        let token = FenceToken {
            fence: self.fence,
            value: state.next_value,
        };
        state.next_value += 1;
        let mut first_error = None;
        for list in &lists {
            if let Err(err) = self
                .context
                .allocators()
                .mark_in_flight(list.allocator(), token)
            {
                first_error.get_or_insert(err);
            }
        }
        state.executed_lists += lists.len() as u64;

        if let Err(err) = self
            .context
            .queues()
            .signal(self.queue, token.fence, token.value)
        {
            error!(
                "Batch of {} command lists submitted but signal {} failed: {}",
                lists.len(),
                token.value,
                err
            );
            return Err(err);
        }
        state.last_submitted = Some(token);
        if let Some(err) = first_error {
            return Err(err);
        }
        debug!("Submitted {} command lists, signal {}", lists.len(), token.value);
        Ok(token)
    }

    /// Submit `list` together with anything already queued and block until
    /// the GPU finishes it.
    pub fn execute_command_list_and_wait_for_completion(
        &self,
        list: SharedCommandList,
    ) -> Result<FenceToken> {
        self.add_command_list_to_execute(list)?;
        let token = self.execute_command_lists()?;
        self.context.fences().wait_for_token(token)?;
        Ok(token)
    }

    /// Signal the next fence value behind all submitted work and wait for it.
    pub fn signal_fence_and_wait_for_completion(&self) -> Result<FenceToken> {
        let token = {
            let mut state = self.state.lock();
            let token = FenceToken {
                fence: self.fence,
                value: state.next_value,
            };
            self.context
                .queues()
                .signal(self.queue, token.fence, token.value)?;
            state.next_value += 1;
            state.last_submitted = Some(token);
            token
        };
        self.context.fences().wait_for_token(token)?;
        Ok(token)
    }

    /// Submit whatever is queued and wait until the GPU is idle.
    pub fn flush(&self) -> Result<()> {
        let token = self.execute_command_lists()?;
        self.context.fences().wait_for_token(token)?;
        debug!("Flushed up to {}", token.value);
        Ok(())
    }

    pub fn last_submitted(&self) -> Option<FenceToken> {
        self.state.lock().last_submitted
    }

    pub fn executed_command_list_count(&self) -> u64 {
        self.state.lock().executed_lists
    }

    pub fn reset_executed_command_list_count(&self) {
        self.state.lock().executed_lists = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::{CompletionMode, HeadlessDevice, QueueEvent};

    fn setup(mode: CompletionMode) -> (Arc<HeadlessDevice>, Arc<RenderContext>, CommandListExecutor) {
        let device = Arc::new(HeadlessDevice::new(mode).unwrap().with_submission_log());
        let context = RenderContext::new(device.clone(), &Config::default()).unwrap();
        let executor = CommandListExecutor::new(context.clone()).unwrap();
        (device, context, executor)
    }

    fn closed_list(context: &RenderContext) -> SharedCommandList {
        let allocator = context
            .allocators()
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let list = context
            .lists()
            .create_command_list(context.allocators(), allocator, None)
            .unwrap();
        list.lock().close().unwrap();
        list
    }

    #[test]
    fn test_batch_submitted_in_order_then_signaled() {
        let (device, context, executor) = setup(CompletionMode::Immediate);
        let lists: Vec<_> = (0..3).map(|_| closed_list(&context)).collect();
        let ids: Vec<_> = lists.iter().map(|list| list.lock().id()).collect();

        let before = executor.signal_fence_and_wait_for_completion().unwrap();
        for list in &lists {
            executor.add_command_list_to_execute(list.clone()).unwrap();
        }
        assert_eq!(executor.pending_count(), 3);
        let token = executor.execute_command_lists().unwrap();
        assert!(token.value > before.value);
        assert_eq!(executor.pending_count(), 0);
        assert_eq!(executor.executed_command_list_count(), 3);

        let log = device.submission_log();
        assert_eq!(
            &log[1..],
            &[
                QueueEvent::Execute {
                    queue: executor.queue(),
                    lists: ids,
                },
                QueueEvent::Signal {
                    queue: executor.queue(),
                    fence: executor.fence(),
                    value: token.value,
                },
            ]
        );
    }

    #[test]
    fn test_open_list_rejected_without_touching_history() {
        let (device, context, executor) = setup(CompletionMode::Immediate);
        let allocator = context
            .allocators()
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let open = context
            .lists()
            .create_command_list(context.allocators(), allocator, None)
            .unwrap();

        assert!(matches!(
            executor.add_command_list_to_execute(open),
            Err(Error::ClosedListRequired(_))
        ));
        assert_eq!(executor.pending_count(), 0);
        assert!(device.submission_log().is_empty());
        assert_eq!(
            context.queues().submitted_list_count(executor.queue()).unwrap(),
            0
        );
    }

    #[test]
    fn test_list_reopened_after_queueing_aborts_the_batch() {
        let (device, context, executor) = setup(CompletionMode::Immediate);
        let first = closed_list(&context);
        let second = closed_list(&context);
        executor.add_command_list_to_execute(first).unwrap();
        executor.add_command_list_to_execute(second.clone()).unwrap();

        let allocator = second.lock().allocator();
        second.lock().reset(allocator, None).unwrap();

        assert!(matches!(
            executor.execute_command_lists(),
            Err(Error::ClosedListRequired(_))
        ));
        assert_eq!(executor.pending_count(), 0);
        assert_eq!(executor.last_submitted(), None);
        assert!(device.submission_log().is_empty());
    }

    #[test]
    fn test_duplicate_list_rejected() {
        let (_device, context, executor) = setup(CompletionMode::Immediate);
        let list = closed_list(&context);
        executor.add_command_list_to_execute(list.clone()).unwrap();
        assert!(matches!(
            executor.add_command_list_to_execute(list),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_submission_marks_allocators_in_flight() {
        let (device, context, executor) = setup(CompletionMode::Manual);
        let list = closed_list(&context);
        let allocator = list.lock().allocator();
        executor.add_command_list_to_execute(list).unwrap();
        let token = executor.execute_command_lists().unwrap();

        assert_eq!(
            context.allocators().pending_token(allocator).unwrap(),
            Some(token)
        );
        assert!(matches!(
            context
                .allocators()
                .reset_command_allocator(allocator, context.fences()),
            Err(Error::AllocatorInFlight { .. })
        ));

        device.retire_all();
        assert!(context.fences().is_complete(token).unwrap());
        context
            .allocators()
            .reset_command_allocator(allocator, context.fences())
            .unwrap();
        executor.reset_executed_command_list_count();
        assert_eq!(executor.executed_command_list_count(), 0);
    }

    #[test]
    fn test_failed_signal_keeps_allocators_in_flight() {
        let (device, context, executor) = setup(CompletionMode::Manual);
        let list = closed_list(&context);
        let allocator = list.lock().allocator();
        context
            .queues()
            .signal(executor.queue(), executor.fence(), 10)
            .unwrap();
        executor.add_command_list_to_execute(list).unwrap();

        assert!(matches!(
            executor.execute_command_lists(),
            Err(Error::NonMonotonicFenceValue { value: 1, last: 10, .. })
        ));
        assert_eq!(executor.last_submitted(), None);
        assert_eq!(executor.executed_command_list_count(), 1);
        assert_eq!(
            context.allocators().pending_token(allocator).unwrap(),
            Some(FenceToken {
                fence: executor.fence(),
                value: 1
            })
        );
        assert!(matches!(
            context
                .allocators()
                .reset_command_allocator(allocator, context.fences()),
            Err(Error::AllocatorInFlight { pending: 1, .. })
        ));
        assert_eq!(device.pending_work(), 2);
    }
}
