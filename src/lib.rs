//! Fence Ring
//!
//! Command submission and GPU resource lifecycle core for explicit
//! graphics APIs:
//! 1. Fences and the per-frame command list ring that paces the CPU
//! 2. Command allocators, lists and queues
//! 3. Resource state tracking with barrier generation
//! 4. CBV/SRV/UAV, RTV and DSV descriptor heaps
//! 5. Upload buffers and committed resources with deferred release
//! 6. Ordered, fence-signaled batch submission
//!
//! All native work goes through [`device::Device`]. [`device::HeadlessDevice`]
//! implements it in software with a simulated GPU timeline.

pub mod command;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod executor;
pub mod recorder;
pub mod resource;
pub mod resource_state;
pub mod upload;


pub use command::{
    CommandAllocatorManager, CommandList, CommandListManager, CommandListPerFrame,
    CommandQueueManager, FenceManager, FenceToken, SharedCommandList,
};
pub use config::Config;
pub use context::RenderContext;
pub use descriptor::{
    CbvSrvUavDescriptorManager, DepthStencilDescriptorManager, Descriptor,
    RenderTargetDescriptorManager,
};
pub use device::{CompletionMode, Device, HeadlessDevice};
pub use error::{Error, ErrorCategory, Result};
pub use executor::CommandListExecutor;
pub use recorder::{
    ClearPassRecorder, CommandListRecorder, FrameInputs, GeometryPassRecorder, MeshData,
};
pub use resource::ResourceManager;
pub use resource_state::{ResourceBarrier, ResourceStateManager};
pub use upload::{UploadBuffer, UploadBufferManager, UploadBufferPerFrame};
