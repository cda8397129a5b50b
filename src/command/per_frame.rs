//! Per-Frame Command Lists
//!
//! A fixed ring of `{allocator, list, last fence token}` slots, one per
//! queued frame. Acquiring a slot waits for the GPU to retire the work the
//! slot recorded on its previous turn. This wait is the only place the
//! frame loop blocks, and it bounds how far the CPU can run ahead.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::command::{FenceToken, SharedCommandList};
use crate::context::RenderContext;
use crate::device::{CommandAllocatorId, CommandListType, PipelineStateId};
use crate::error::{Error, Result};

struct FrameSlot {
    allocator: CommandAllocatorId,
    list: SharedCommandList,
    last_token: Option<FenceToken>,
}

struct Ring {
    slots: Vec<FrameSlot>,
    next: usize,
    acquired: Option<usize>,
}

pub struct CommandListPerFrame {
    context: Arc<RenderContext>,
    name: String,
    ring: Mutex<Ring>,
}

impl CommandListPerFrame {
    /// Create `queued_frames` slots of `list_type`. Their lists start closed.
    pub fn new(
        context: Arc<RenderContext>,
        list_type: CommandListType,
        queued_frames: usize,
        name: &str,
    ) -> Result<Self> {
        if queued_frames == 0 {
            return Err(Error::InvalidArgument(format!(
                "{}: at least one queued frame is required",
                name
            )));
        }

        let mut slots = Vec::with_capacity(queued_frames);
        for index in 0..queued_frames {
            let allocator = context.allocators().create_command_allocator(list_type)?;
            let list = context.lists().create_command_list(
                context.allocators(),
                allocator,
                Some(&format!("{}[{}]", name, index)),
            )?;
            list.lock().close()?;
            slots.push(FrameSlot {
                allocator,
                list,
                last_token: None,
            });
        }
        debug!("Created {} with {} frame slots", name, queued_frames);

        Ok(Self {
            context,
            name: name.to_string(),
            ring: Mutex::new(Ring {
                slots,
                next: 0,
                acquired: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slot_count(&self) -> usize {
        self.ring.lock().slots.len()
    }

    /// Index of the slot currently acquired, if any.
    pub fn current_index(&self) -> Option<usize> {
        self.ring.lock().acquired
    }

    /// Token recorded on `index` by its last release.
    pub fn last_token(&self, index: usize) -> Option<FenceToken> {
        self.ring.lock()
            .slots
            .get(index)
            .and_then(|slot| slot.last_token)
    }

    /// Take the next slot and reopen its list for recording.
    ///
    /// Blocks until the slot's previous submission has retired, and returns
    /// without waiting when the GPU is already past it.
    pub fn acquire_slot(&self, initial_state: Option<PipelineStateId>) -> Result<SharedCommandList> {
        let mut ring = self.ring.lock();
        if let Some(index) = ring.acquired {
            return Err(Error::InvalidArgument(format!(
                "{}: slot {} is already acquired",
                self.name, index
            )));
        }

        let index = ring.next;
        let slot = &ring.slots[index];
        if let Some(token) = slot.last_token {
            trace!("{}[{}] waiting for {} = {}", self.name, index, token.fence, token.value);
            self.context.fences().wait_for_token(token)?;
        }
        self.context
            .allocators()
            .reset_command_allocator(slot.allocator, self.context.fences())?;

        {
            let mut list = slot.list.lock();
            if !list.is_closed() {
                warn!("{}[{}] was abandoned while recording", self.name, index);
                list.close()?;
            }
            list.reset(slot.allocator, initial_state)?;
        }

        let list = slot.list.clone();
        ring.acquired = Some(index);
        ring.next = (index + 1) % ring.slots.len();
        Ok(list)
    }

    /// Hand back the acquired slot with the token its work completes at.
    pub fn release_slot(&self, token: FenceToken) -> Result<()> {
        let mut ring = self.ring.lock();
        let index = ring.acquired.take().ok_or_else(|| {
            Error::InvalidArgument(format!("{}: no slot is acquired", self.name))
        })?;
        ring.slots[index].last_token = Some(token);
        trace!("{}[{}] in flight until {}", self.name, index, token.value);
        Ok(())
    }

    /// Give up the acquired slot without submitting it. The slot keeps the
    /// token of its previous submission.
    pub fn abandon_slot(&self) -> Result<()> {
        let mut ring = self.ring.lock();
        let index = ring.acquired.take().ok_or_else(|| {
            Error::InvalidArgument(format!("{}: no slot is acquired", self.name))
        })?;
        debug!("{}[{}] abandoned", self.name, index);
        Ok(())
    }
}
