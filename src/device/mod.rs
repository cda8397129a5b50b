//! Device Module
//!
//! The single seam between the submission core and a graphics API. Every
//! native object (queues, allocators, fences, descriptor heaps, resources)
//! is created through [`Device`] and referred to afterwards by a typed id.

use std::fmt;
use std::time::Duration;

use crate::command::CommandList;

pub mod headless;

pub use headless::{CompletionMode, HeadlessDevice, QueueEvent};

macro_rules! native_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            pub const fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, "#{}"), self.0)
            }
        }
    };
}

native_id!(
    /// Native command queue.
    QueueId,
    "queue"
);
native_id!(
    /// Native fence.
    FenceId,
    "fence"
);
native_id!(
    /// Native command allocator.
    CommandAllocatorId,
    "allocator"
);
native_id!(
    /// CPU-side command list, assigned by the command list manager.
    CommandListId,
    "list"
);
native_id!(
    /// GPU resource (buffer or texture).
    ResourceId,
    "resource"
);
native_id!(
    /// Native descriptor heap.
    DescriptorHeapId,
    "heap"
);
native_id!(
    /// Pipeline state object authored outside this crate.
    PipelineStateId,
    "pso"
);
native_id!(
    /// Root signature authored outside this crate.
    RootSignatureId,
    "root-signature"
);

/// Command list / queue type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandListType {
    Direct,
    Compute,
    Copy,
}

/// Usage state of a GPU resource
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common = 0,
    VertexAndConstantBuffer = 1,
    IndexBuffer = 2,
    RenderTarget = 3,
    UnorderedAccess = 4,
    DepthWrite = 5,
    DepthRead = 6,
    NonPixelShaderResource = 7,
    PixelShaderResource = 8,
    IndirectArgument = 9,
    CopyDest = 10,
    CopySource = 11,
    GenericRead = 12,
    Present = 13,
}

impl ResourceState {
    const ALL: [ResourceState; 14] = [
        ResourceState::Common,
        ResourceState::VertexAndConstantBuffer,
        ResourceState::IndexBuffer,
        ResourceState::RenderTarget,
        ResourceState::UnorderedAccess,
        ResourceState::DepthWrite,
        ResourceState::DepthRead,
        ResourceState::NonPixelShaderResource,
        ResourceState::PixelShaderResource,
        ResourceState::IndirectArgument,
        ResourceState::CopyDest,
        ResourceState::CopySource,
        ResourceState::GenericRead,
        ResourceState::Present,
    ];

    pub const fn bits(self) -> u32 {
        self as u32
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.get(bits as usize).copied()
    }
}

/// Memory pool a committed resource lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapType {
    /// GPU-only memory
    Default,
    /// CPU-writable, GPU-readable
    Upload,
    /// GPU-writable, CPU-readable
    Readback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Unknown,
    Rgba8Unorm,
    Bgra8Unorm,
    Rgba16Float,
    R32Float,
    R32Uint,
    D24UnormS8Uint,
    D32Float,
}

impl Format {
    pub fn bytes_per_pixel(self) -> u64 {
        match self {
            Format::Unknown => 1,
            Format::Rgba16Float => 8,
            Format::Rgba8Unorm
            | Format::Bgra8Unorm
            | Format::R32Float
            | Format::R32Uint
            | Format::D24UnormS8Uint
            | Format::D32Float => 4,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D24UnormS8Uint | Format::D32Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceDimension {
    Buffer,
    Texture2D,
}

/// Description of a committed resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDesc {
    pub dimension: ResourceDimension,
    pub heap: HeapType,
    pub width: u64,
    pub height: u32,
    pub format: Format,
    pub allow_render_target: bool,
    pub allow_depth_stencil: bool,
    pub allow_unordered_access: bool,
    pub name: Option<String>,
}

impl ResourceDesc {
    pub fn buffer(heap: HeapType, size: u64) -> Self {
        Self {
            dimension: ResourceDimension::Buffer,
            heap,
            width: size,
            height: 1,
            format: Format::Unknown,
            allow_render_target: false,
            allow_depth_stencil: false,
            allow_unordered_access: false,
            name: None,
        }
    }

    pub fn texture_2d(width: u32, height: u32, format: Format) -> Self {
        Self {
            dimension: ResourceDimension::Texture2D,
            heap: HeapType::Default,
            width: u64::from(width),
            height,
            format,
            allow_render_target: false,
            allow_depth_stencil: false,
            allow_unordered_access: false,
            name: None,
        }
    }

    pub fn render_target(mut self) -> Self {
        self.allow_render_target = true;
        self
    }

    pub fn depth_stencil(mut self) -> Self {
        self.allow_depth_stencil = true;
        self
    }

    pub fn unordered_access(mut self) -> Self {
        self.allow_unordered_access = true;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Size of the backing allocation in bytes.
    pub fn size_in_bytes(&self) -> u64 {
        match self.dimension {
            ResourceDimension::Buffer => self.width,
            ResourceDimension::Texture2D => {
                self.width * u64::from(self.height) * self.format.bytes_per_pixel()
            }
        }
    }
}

/// Descriptor heap type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorHeapKind {
    CbvSrvUav,
    RenderTarget,
    DepthStencil,
}

impl DescriptorHeapKind {
    /// Only CBV/SRV/UAV heaps are bound to the pipeline and get GPU handles.
    pub fn is_shader_visible(self) -> bool {
        matches!(self, DescriptorHeapKind::CbvSrvUav)
    }
}

impl fmt::Display for DescriptorHeapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorHeapKind::CbvSrvUav => "CBV/SRV/UAV",
            DescriptorHeapKind::RenderTarget => "RTV",
            DescriptorHeapKind::DepthStencil => "DSV",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuDescriptorHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GpuDescriptorHandle(pub u64);

impl CpuDescriptorHandle {
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

impl GpuDescriptorHandle {
    pub fn offset(self, index: u32, increment: u32) -> Self {
        Self(self.0 + u64::from(index) * u64::from(increment))
    }
}

/// What the device reports back after creating a descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    pub id: DescriptorHeapId,
    pub kind: DescriptorHeapKind,
    pub capacity: u32,
    pub cpu_start: CpuDescriptorHandle,
    pub gpu_start: Option<GpuDescriptorHandle>,
    pub increment: u32,
}

/// Kind of view stored in a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    ConstantBuffer,
    ShaderResource,
    UnorderedAccess,
    RenderTarget,
    DepthStencil,
}

/// A view description written into a descriptor heap slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewDesc {
    ConstantBuffer {
        resource: ResourceId,
        offset: u64,
        size: u32,
    },
    ShaderResource {
        resource: ResourceId,
        format: Format,
        mip_levels: u32,
    },
    UnorderedAccess {
        resource: ResourceId,
        format: Format,
    },
    RenderTarget {
        resource: ResourceId,
        format: Format,
    },
    DepthStencil {
        resource: ResourceId,
        format: Format,
    },
}

impl ViewDesc {
    pub fn resource(&self) -> ResourceId {
        match *self {
            ViewDesc::ConstantBuffer { resource, .. }
            | ViewDesc::ShaderResource { resource, .. }
            | ViewDesc::UnorderedAccess { resource, .. }
            | ViewDesc::RenderTarget { resource, .. }
            | ViewDesc::DepthStencil { resource, .. } => resource,
        }
    }

    pub fn kind(&self) -> ViewKind {
        match self {
            ViewDesc::ConstantBuffer { .. } => ViewKind::ConstantBuffer,
            ViewDesc::ShaderResource { .. } => ViewKind::ShaderResource,
            ViewDesc::UnorderedAccess { .. } => ViewKind::UnorderedAccess,
            ViewDesc::RenderTarget { .. } => ViewKind::RenderTarget,
            ViewDesc::DepthStencil { .. } => ViewKind::DepthStencil,
        }
    }

    /// Heap type this view must be written into.
    pub fn heap_kind(&self) -> DescriptorHeapKind {
        match self.kind() {
            ViewKind::ConstantBuffer | ViewKind::ShaderResource | ViewKind::UnorderedAccess => {
                DescriptorHeapKind::CbvSrvUav
            }
            ViewKind::RenderTarget => DescriptorHeapKind::RenderTarget,
            ViewKind::DepthStencil => DescriptorHeapKind::DepthStencil,
        }
    }
}

/// Any releasable native object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceObject {
    Queue(QueueId),
    Fence(FenceId),
    CommandAllocator(CommandAllocatorId),
    Resource(ResourceId),
    DescriptorHeap(DescriptorHeapId),
}

/// Failure reported by the underlying graphics device
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of memory allocating {requested} bytes")]
    OutOfMemory { requested: u64 },

    #[error("device removed: {0}")]
    Removed(String),

    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("unknown {kind} object {id}")]
    UnknownObject { kind: &'static str, id: u64 },
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Native object factory and GPU timeline.
///
/// Implementations must execute submissions on a queue strictly in
/// submission order and only advance a fence once every piece of work
/// submitted before the matching `signal` has finished.
pub trait Device: Send + Sync {
    /// Human readable adapter description.
    fn description(&self) -> &str;

    fn create_command_queue(&self, list_type: CommandListType) -> DeviceResult<QueueId>;

    fn create_command_allocator(&self, list_type: CommandListType)
        -> DeviceResult<CommandAllocatorId>;

    /// Reclaim the memory of every list recorded through `allocator`.
    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> DeviceResult<()>;

    fn create_fence(&self, initial_value: u64) -> DeviceResult<FenceId>;

    fn completed_fence_value(&self, fence: FenceId) -> DeviceResult<u64>;

    /// Block until `fence` reaches `value`. Returns `false` when `timeout`
    /// elapsed first.
    fn wait_for_fence(
        &self,
        fence: FenceId,
        value: u64,
        timeout: Option<Duration>,
    ) -> DeviceResult<bool>;

    /// Submit closed command lists; they execute in slice order.
    fn execute_command_lists(&self, queue: QueueId, lists: &[&CommandList]) -> DeviceResult<()>;

    /// Enqueue a GPU-side fence update after all prior work on `queue`.
    fn signal(&self, queue: QueueId, fence: FenceId, value: u64) -> DeviceResult<()>;

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> DeviceResult<DescriptorHeapInfo>;

    /// Write `view` into slot `index` of `heap`.
    fn create_view(&self, heap: DescriptorHeapId, index: u32, view: &ViewDesc)
        -> DeviceResult<()>;

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> DeviceResult<ResourceId>;

    /// CPU write into a mapped upload-heap resource.
    fn write_buffer(&self, resource: ResourceId, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// CPU read of a resource's contents.
    fn read_buffer(&self, resource: ResourceId, offset: u64, len: u64) -> DeviceResult<Vec<u8>>;

    fn release(&self, object: DeviceObject);
}
