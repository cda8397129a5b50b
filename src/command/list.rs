//! Command Lists
//!
//! CPU-side recording of GPU commands and the manager that creates lists
//! bound to an allocator.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::command::CommandAllocatorManager;
use crate::device::{
    CommandAllocatorId, CommandListId, CommandListType, CpuDescriptorHandle, DescriptorHeapId,
    GpuDescriptorHandle, PipelineStateId, ResourceId, RootSignatureId,
};
use crate::error::{Error, Result};
use crate::resource_state::ResourceBarrier;

/// A command list shared between its recorder and the executor.
pub type SharedCommandList = Arc<Mutex<CommandList>>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl ScissorRect {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferView {
    pub resource: ResourceId,
    pub offset: u64,
    pub size: u32,
    pub stride: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferView {
    pub resource: ResourceId,
    pub offset: u64,
    pub size: u32,
    pub format: IndexFormat,
}

/// A single recorded GPU command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ResourceBarrier(Vec<ResourceBarrier>),
    ClearRenderTarget {
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    },
    ClearDepthStencil {
        dsv: CpuDescriptorHandle,
        depth: f32,
        stencil: u8,
    },
    SetRenderTargets {
        rtvs: Vec<CpuDescriptorHandle>,
        dsv: Option<CpuDescriptorHandle>,
    },
    SetViewport(Viewport),
    SetScissorRect(ScissorRect),
    SetPipelineState(PipelineStateId),
    SetGraphicsRootSignature(RootSignatureId),
    SetDescriptorHeaps(Vec<DescriptorHeapId>),
    SetGraphicsRootDescriptorTable {
        parameter: u32,
        base: GpuDescriptorHandle,
    },
    SetGraphicsRootConstantBufferView {
        parameter: u32,
        resource: ResourceId,
        offset: u64,
    },
    SetVertexBuffer {
        slot: u32,
        view: VertexBufferView,
    },
    SetIndexBuffer(IndexBufferView),
    DrawInstanced {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    },
    DrawIndexedInstanced {
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    CopyBufferRegion {
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    },
    CopyResource {
        dst: ResourceId,
        src: ResourceId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListStatus {
    Recording,
    Closed,
}

/// Recorded command list.
///
/// Lists are created open. Every recording call fails with
/// [`Error::ListNotRecording`] once the list is closed.
#[derive(Debug)]
pub struct CommandList {
    id: CommandListId,
    list_type: CommandListType,
    allocator: CommandAllocatorId,
    status: ListStatus,
    commands: Vec<Command>,
    name: Option<String>,
}

impl CommandList {
    fn new(
        id: CommandListId,
        list_type: CommandListType,
        allocator: CommandAllocatorId,
        name: Option<String>,
    ) -> Self {
        Self {
            id,
            list_type,
            allocator,
            status: ListStatus::Recording,
            commands: Vec::new(),
            name,
        }
    }

    pub fn id(&self) -> CommandListId {
        self.id
    }

    pub fn list_type(&self) -> CommandListType {
        self.list_type
    }

    /// Allocator currently backing the recorded commands.
    pub fn allocator(&self) -> CommandAllocatorId {
        self.allocator
    }

    pub fn status(&self) -> ListStatus {
        self.status
    }

    pub fn is_closed(&self) -> bool {
        self.status == ListStatus::Closed
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn ensure_recording(&self) -> Result<()> {
        match self.status {
            ListStatus::Recording => Ok(()),
            ListStatus::Closed => Err(Error::ListNotRecording(self.id)),
        }
    }

    /// Finish recording. The list may now be submitted.
    pub fn close(&mut self) -> Result<()> {
        self.ensure_recording()?;
        self.status = ListStatus::Closed;
        trace!("Closed {} with {} commands", self.id, self.commands.len());
        Ok(())
    }

    /// Reopen a closed list on `allocator`, dropping previous commands.
    pub(crate) fn reset(
        &mut self,
        allocator: CommandAllocatorId,
        initial_state: Option<PipelineStateId>,
    ) -> Result<()> {
        if self.status == ListStatus::Recording {
            return Err(Error::InvalidArgument(format!(
                "{} must be closed before it is reset",
                self.id
            )));
        }
        self.allocator = allocator;
        self.commands.clear();
        self.status = ListStatus::Recording;
        if let Some(pso) = initial_state {
            self.commands.push(Command::SetPipelineState(pso));
        }
        Ok(())
    }

    fn record(&mut self, command: Command) -> Result<()> {
        self.ensure_recording()?;
        self.commands.push(command);
        Ok(())
    }

    /// Record every barrier in `barriers` as one batch.
    ///
    /// Nothing is recorded when the iterator is empty, so the result of
    /// [`ResourceStateManager::request_transition`](crate::resource_state::ResourceStateManager::request_transition)
    /// can be passed straight through. Returns the number of barriers recorded.
    pub fn resource_barrier<I>(&mut self, barriers: I) -> Result<usize>
    where
        I: IntoIterator<Item = ResourceBarrier>,
    {
        self.ensure_recording()?;
        let batch: Vec<ResourceBarrier> = barriers.into_iter().collect();
        let count = batch.len();
        if count > 0 {
            self.commands.push(Command::ResourceBarrier(batch));
        }
        Ok(count)
    }

    pub fn clear_render_target_view(
        &mut self,
        rtv: CpuDescriptorHandle,
        color: [f32; 4],
    ) -> Result<()> {
        self.record(Command::ClearRenderTarget { rtv, color })
    }

    pub fn clear_depth_stencil_view(
        &mut self,
        dsv: CpuDescriptorHandle,
        depth: f32,
        stencil: u8,
    ) -> Result<()> {
        self.record(Command::ClearDepthStencil {
            dsv,
            depth,
            stencil,
        })
    }

    pub fn set_render_targets(
        &mut self,
        rtvs: &[CpuDescriptorHandle],
        dsv: Option<CpuDescriptorHandle>,
    ) -> Result<()> {
        self.record(Command::SetRenderTargets {
            rtvs: rtvs.to_vec(),
            dsv,
        })
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.record(Command::SetViewport(viewport))
    }

    pub fn set_scissor_rect(&mut self, rect: ScissorRect) -> Result<()> {
        self.record(Command::SetScissorRect(rect))
    }

    pub fn set_pipeline_state(&mut self, pso: PipelineStateId) -> Result<()> {
        self.record(Command::SetPipelineState(pso))
    }

    pub fn set_graphics_root_signature(&mut self, root_signature: RootSignatureId) -> Result<()> {
        self.record(Command::SetGraphicsRootSignature(root_signature))
    }

    pub fn set_descriptor_heaps(&mut self, heaps: &[DescriptorHeapId]) -> Result<()> {
        self.record(Command::SetDescriptorHeaps(heaps.to_vec()))
    }

    pub fn set_graphics_root_descriptor_table(
        &mut self,
        parameter: u32,
        base: GpuDescriptorHandle,
    ) -> Result<()> {
        self.record(Command::SetGraphicsRootDescriptorTable { parameter, base })
    }

    pub fn set_graphics_root_constant_buffer_view(
        &mut self,
        parameter: u32,
        resource: ResourceId,
        offset: u64,
    ) -> Result<()> {
        self.record(Command::SetGraphicsRootConstantBufferView {
            parameter,
            resource,
            offset,
        })
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, view: VertexBufferView) -> Result<()> {
        self.record(Command::SetVertexBuffer { slot, view })
    }

    pub fn set_index_buffer(&mut self, view: IndexBufferView) -> Result<()> {
        self.record(Command::SetIndexBuffer(view))
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
    ) -> Result<()> {
        self.record(Command::DrawInstanced {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
        })
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        start_index: u32,
        base_vertex: i32,
        start_instance: u32,
    ) -> Result<()> {
        self.record(Command::DrawIndexedInstanced {
            index_count,
            instance_count,
            start_index,
            base_vertex,
            start_instance,
        })
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.record(Command::Dispatch { x, y, z })
    }

    pub fn copy_buffer_region(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: u64,
    ) -> Result<()> {
        self.record(Command::CopyBufferRegion {
            dst,
            dst_offset,
            src,
            src_offset,
            size,
        })
    }

    pub fn copy_resource(&mut self, dst: ResourceId, src: ResourceId) -> Result<()> {
        self.record(Command::CopyResource { dst, src })
    }
}

struct ListRegistry {
    lists: HashMap<CommandListId, SharedCommandList>,
    next_id: u64,
}

/// Creates command lists bound to an allocator and keeps them by id.
pub struct CommandListManager {
    registry: Mutex<Option<ListRegistry>>,
}

impl CommandListManager {
    const NAME: &'static str = "CommandListManager";

    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Some(ListRegistry {
                lists: HashMap::new(),
                next_id: 1,
            })),
        }
    }

    /// Create an open list recording into `allocator`. Its type is the
    /// allocator's type.
    pub fn create_command_list(
        &self,
        allocators: &CommandAllocatorManager,
        allocator: CommandAllocatorId,
        name: Option<&str>,
    ) -> Result<SharedCommandList> {
        let list_type = allocators.list_type(allocator)?;
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;

        let id = CommandListId::from_raw(registry.next_id);
        registry.next_id += 1;
        let list = Arc::new(Mutex::new(CommandList::new(
            id,
            list_type,
            allocator,
            name.map(str::to_owned),
        )));
        registry.lists.insert(id, list.clone());
        debug!("Created {} ({:?}) on {}", id, list_type, allocator);
        Ok(list)
    }

    pub fn get_command_list(&self, id: CommandListId) -> Result<SharedCommandList> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        registry
            .lists
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownHandle {
                kind: "command list",
                id: id.raw(),
            })
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        Ok(registry.lists.len())
    }

    /// Drop every list. Further calls fail with [`Error::UseAfterClear`].
    pub fn clear(&self) -> Result<usize> {
        let registry = self.registry
            .lock()
            .take()
            .ok_or(Error::UseAfterClear(Self::NAME))?;
        let count = registry.lists.len();
        debug!("Cleared {} command lists", count);
        Ok(count)
    }
}

impl Default for CommandListManager {
    fn default() -> Self {
        Self::new()
    }
}
