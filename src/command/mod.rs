//! Command recording and submission: fences, allocators, lists, queues and
//! the per-frame ring.

pub mod allocator;
pub mod fence;
pub mod list;
pub mod per_frame;
pub mod queue;

pub use allocator::CommandAllocatorManager;
pub use fence::{FenceManager, FenceToken};
pub use list::{
    Command, CommandList, CommandListManager, IndexBufferView, IndexFormat, ListStatus,
    ScissorRect, SharedCommandList, VertexBufferView, Viewport,
};
pub use per_frame::CommandListPerFrame;
pub use queue::CommandQueueManager;
