//! Command List Recorders
//!
//! A recorder turns per-frame inputs into one closed command list. The
//! executor and the frame loop only see [`CommandListRecorder`]; each
//! rendering technique is one implementation owning its own
//! [`CommandListPerFrame`] ring and GPU resources.

use std::sync::Arc;

use tracing::debug;

use crate::command::{
    CommandList, CommandListPerFrame, FenceToken, IndexBufferView, IndexFormat, ScissorRect,
    SharedCommandList, VertexBufferView, Viewport,
};
use crate::context::RenderContext;
use crate::descriptor::{CbvSrvUavView, Descriptor, DepthStencilView, RenderTargetView};
use crate::device::{
    CommandListType, Format, PipelineStateId, ResourceDesc, ResourceId, ResourceState,
    RootSignatureId,
};
use crate::error::{Error, Result};
use crate::executor::CommandListExecutor;
use crate::upload::UploadBufferPerFrame;

/// Per-frame data handed to every recorder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInputs {
    pub frame_index: u64,
    pub clear_color: [f32; 4],
    pub world_view_projection: [[f32; 4]; 4],
}

impl FrameInputs {
    pub fn new(frame_index: u64) -> Self {
        let mut world_view_projection = [[0.0; 4]; 4];
        for (i, row) in world_view_projection.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            frame_index,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            world_view_projection,
        }
    }
}

pub trait CommandListRecorder: Send {
    fn name(&self) -> &str;

    /// Record this frame's work and return the closed list.
    fn record(&mut self, inputs: &FrameInputs) -> Result<SharedCommandList>;

    /// The list returned by the last `record` was submitted and completes
    /// at `token`.
    fn submitted(&mut self, token: FenceToken) -> Result<()>;

    /// The list returned by the last `record` will not be submitted.
    fn abandon(&mut self) -> Result<()>;
}

/// Record into the ring's next slot, giving the slot back if recording fails.
fn record_frame<F>(
    frames: &CommandListPerFrame,
    initial_state: Option<PipelineStateId>,
    record: F,
) -> Result<SharedCommandList>
where
    F: FnOnce(&mut CommandList, usize) -> Result<()>,
{
    let shared = frames.acquire_slot(initial_state)?;
    let slot = frames
        .current_index()
        .ok_or_else(|| Error::InvalidArgument(format!("{}: no slot acquired", frames.name())))?;
    let result = {
        let mut list = shared.lock();
        record(&mut *list, slot).and_then(|()| list.close())
    };
    match result {
        Ok(()) => Ok(shared),
        Err(err) => {
            frames.abandon_slot()?;
            Err(err)
        }
    }
}

/// Clears a presentable back buffer: Present, RenderTarget, clear, Present.
pub struct ClearPassRecorder {
    context: Arc<RenderContext>,
    frames: CommandListPerFrame,
    target: ResourceId,
    rtv: Descriptor,
    width: u32,
    height: u32,
}

impl ClearPassRecorder {
    pub fn new(context: Arc<RenderContext>, width: u32, height: u32) -> Result<Self> {
        let format = Format::Rgba8Unorm;
        let target = context.resources().create_committed_resource(
            context.states(),
            &ResourceDesc::texture_2d(width, height, format)
                .render_target()
                .named("back buffer"),
            ResourceState::Present,
        )?;
        let rtv = context
            .rtv()
            .create_view(target, &RenderTargetView { format })?;
        let frames = CommandListPerFrame::new(
            context.clone(),
            CommandListType::Direct,
            context.queued_frames(),
            "clear-pass",
        )?;
        Ok(Self {
            context,
            frames,
            target,
            rtv,
            width,
            height,
        })
    }

    pub fn target(&self) -> ResourceId {
        self.target
    }
}

impl CommandListRecorder for ClearPassRecorder {
    fn name(&self) -> &str {
        self.frames.name()
    }

    fn record(&mut self, inputs: &FrameInputs) -> Result<SharedCommandList> {
        let states = self.context.states();
        let (target, rtv) = (self.target, self.rtv.cpu_handle());
        let (width, height) = (self.width, self.height);

        record_frame(&self.frames, None, |list, _slot| {
            states.transition_resource(list, target, ResourceState::RenderTarget)?;
            list.set_viewport(Viewport::full(width, height))?;
            list.set_scissor_rect(ScissorRect::full(width, height))?;
            list.set_render_targets(&[rtv], None)?;
            list.clear_render_target_view(rtv, inputs.clear_color)?;
            states.transition_resource(list, target, ResourceState::Present)?;
            Ok(())
        })
    }

    fn submitted(&mut self, token: FenceToken) -> Result<()> {
        self.frames.release_slot(token)
    }

    fn abandon(&mut self) -> Result<()> {
        self.frames.abandon_slot()
    }
}

/// Geometry handed to [`GeometryPassRecorder`].
#[derive(Debug, Clone, Copy)]
pub struct MeshData<'a> {
    pub vertices: &'a [u8],
    pub vertex_stride: u32,
    pub indices: &'a [u32],
}

/// Draws an indexed mesh into an offscreen color target with depth.
///
/// The color target ends every frame in PixelShaderResource. Depth stays
/// in DepthWrite, so its per-frame transition request is a no-op.
pub struct GeometryPassRecorder {
    context: Arc<RenderContext>,
    frames: CommandListPerFrame,
    pipeline: PipelineStateId,
    root_signature: RootSignatureId,
    color: ResourceId,
    depth: ResourceId,
    rtv: Descriptor,
    dsv: Descriptor,
    constants: UploadBufferPerFrame,
    cbvs: Vec<Descriptor>,
    vertices: VertexBufferView,
    indices: IndexBufferView,
    index_count: u32,
    width: u32,
    height: u32,
    in_flight_slot: Option<usize>,
}

impl GeometryPassRecorder {
    /// Create the pass and upload `mesh`, blocking until the upload is done.
    pub fn new(
        context: Arc<RenderContext>,
        executor: &CommandListExecutor,
        mesh: MeshData<'_>,
        pipeline: PipelineStateId,
        root_signature: RootSignatureId,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let resources = context.resources();
        let states = context.states();

        let color_format = Format::Rgba16Float;
        let color = resources.create_committed_resource(
            states,
            &ResourceDesc::texture_2d(width, height, color_format)
                .render_target()
                .named("geometry color"),
            ResourceState::PixelShaderResource,
        )?;
        let depth = resources.create_committed_resource(
            states,
            &ResourceDesc::texture_2d(width, height, Format::D32Float)
                .depth_stencil()
                .named("geometry depth"),
            ResourceState::DepthWrite,
        )?;
        let rtv = context.rtv().create_view(
            color,
            &RenderTargetView {
                format: color_format,
            },
        )?;
        let dsv = context.dsv().create_view(
            depth,
            &DepthStencilView {
                format: Format::D32Float,
            },
        )?;

        let frames = context.queued_frames();
        let constants = UploadBufferPerFrame::new(
            context.uploads(),
            frames,
            std::mem::size_of::<[[f32; 4]; 4]>() as u64,
            1,
            true,
            "geometry constants",
        )?;
        let buffers: Vec<ResourceId> = constants
            .buffers()
            .iter()
            .map(|buffer| buffer.resource())
            .collect();
        let views = vec![
            CbvSrvUavView::ConstantBuffer {
                offset: 0,
                size: constants.get(0).element_size() as u32,
            };
            frames
        ];
        let cbvs = context.cbv_srv_uav().create_views(&buffers, &views)?;

        let index_bytes: Vec<u8> = mesh.indices.iter().flat_map(|i| i.to_le_bytes()).collect();
        let allocator = context
            .allocators()
            .acquire_command_allocator(CommandListType::Direct, context.fences())?;
        let upload = context.lists().create_command_list(
            context.allocators(),
            allocator,
            Some("geometry upload"),
        )?;
        let (vertex_buffer, index_buffer) = {
            let mut list = upload.lock();
            let vertex_buffer = resources.create_default_buffer(
                states,
                &mut list,
                mesh.vertices,
                ResourceState::VertexAndConstantBuffer,
                Some("geometry vertices"),
            )?;
            let index_buffer = resources.create_default_buffer(
                states,
                &mut list,
                &index_bytes,
                ResourceState::IndexBuffer,
                Some("geometry indices"),
            )?;
            list.close()?;
            (vertex_buffer, index_buffer)
        };
        let token = executor.execute_command_list_and_wait_for_completion(upload)?;
        resources.release_after(vertex_buffer.staging, token)?;
        resources.release_after(index_buffer.staging, token)?;
        resources.collect_retired(states, context.fences())?;
        context.allocators().release_command_allocator(allocator)?;
        debug!(
            "Uploaded {} vertex bytes and {} indices",
            mesh.vertices.len(),
            mesh.indices.len()
        );

        let frames = CommandListPerFrame::new(
            context.clone(),
            CommandListType::Direct,
            frames,
            "geometry-pass",
        )?;
        Ok(Self {
            frames,
            pipeline,
            root_signature,
            color,
            depth,
            rtv,
            dsv,
            constants,
            cbvs,
            vertices: VertexBufferView {
                resource: vertex_buffer.buffer,
                offset: 0,
                size: mesh.vertices.len() as u32,
                stride: mesh.vertex_stride,
            },
            indices: IndexBufferView {
                resource: index_buffer.buffer,
                offset: 0,
                size: index_bytes.len() as u32,
                format: IndexFormat::U32,
            },
            index_count: mesh.indices.len() as u32,
            width,
            height,
            in_flight_slot: None,
            context,
        })
    }

    pub fn color_target(&self) -> ResourceId {
        self.color
    }

    pub fn depth_target(&self) -> ResourceId {
        self.depth
    }
}

impl CommandListRecorder for GeometryPassRecorder {
    fn name(&self) -> &str {
        self.frames.name()
    }

    fn record(&mut self, inputs: &FrameInputs) -> Result<SharedCommandList> {
        let states = self.context.states();
        let heap = self.context.cbv_srv_uav().heap_info()?.id;
        let constants: Vec<u8> = inputs
            .world_view_projection
            .iter()
            .flatten()
            .flat_map(|value| value.to_le_bytes())
            .collect();
        let (rtv, dsv) = (self.rtv.cpu_handle(), self.dsv.cpu_handle());
        let (color, depth) = (self.color, self.depth);
        let (width, height) = (self.width, self.height);

        let mut recorded_slot = None;
        let list = record_frame(&self.frames, Some(self.pipeline), |list, slot| {
            self.constants.get(slot).copy_data(0, &constants)?;
            let table = self.cbvs[slot % self.cbvs.len()]
                .gpu_handle()
                .ok_or_else(|| Error::InvalidArgument("CBV heap is not shader visible".into()))?;

            list.set_graphics_root_signature(self.root_signature)?;
            list.set_descriptor_heaps(&[heap])?;
            list.set_graphics_root_descriptor_table(0, table)?;
            list.set_viewport(Viewport::full(width, height))?;
            list.set_scissor_rect(ScissorRect::full(width, height))?;
            states.transition_resources(
                list,
                &[
                    (color, ResourceState::RenderTarget),
                    (depth, ResourceState::DepthWrite),
                ],
            )?;
            list.set_render_targets(&[rtv], Some(dsv))?;
            list.clear_render_target_view(rtv, inputs.clear_color)?;
            list.clear_depth_stencil_view(dsv, 1.0, 0)?;
            list.set_vertex_buffer(0, self.vertices)?;
            list.set_index_buffer(self.indices)?;
            list.draw_indexed_instanced(self.index_count, 1, 0, 0, 0)?;
            states.transition_resource(list, color, ResourceState::PixelShaderResource)?;
            recorded_slot = Some(slot);
            Ok(())
        })?;
        self.in_flight_slot = recorded_slot;
        Ok(list)
    }

    fn submitted(&mut self, token: FenceToken) -> Result<()> {
        if let Some(slot) = self.in_flight_slot.take() {
            self.context
                .uploads()
                .mark_used(self.constants.get(slot), token)?;
        }
        self.frames.release_slot(token)
    }

    fn abandon(&mut self) -> Result<()> {
        self.in_flight_slot = None;
        self.frames.abandon_slot()
    }
}
