//! Render Context
//!
//! Owns one instance of every manager for a device. Recorders, the
//! executor and the per-frame rings receive it explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::command::{
    CommandAllocatorManager, CommandListManager, CommandQueueManager, FenceManager,
};
use crate::config::Config;
use crate::descriptor::{
    CbvSrvUavDescriptorManager, DepthStencilDescriptorManager, RenderTargetDescriptorManager,
};
use crate::device::Device;
use crate::error::{Error, Result};
use crate::resource::ResourceManager;
use crate::resource_state::ResourceStateManager;
use crate::upload::UploadBufferManager;

pub struct RenderContext {
    device: Arc<dyn Device>,
    queued_frames: usize,
    fences: FenceManager,
    allocators: CommandAllocatorManager,
    lists: CommandListManager,
    queues: CommandQueueManager,
    states: ResourceStateManager,
    cbv_srv_uav: CbvSrvUavDescriptorManager,
    rtv: RenderTargetDescriptorManager,
    dsv: DepthStencilDescriptorManager,
    uploads: UploadBufferManager,
    resources: ResourceManager,
    shut_down: AtomicBool,
}

impl RenderContext {
    pub fn new(device: Arc<dyn Device>, config: &Config) -> Result<Arc<Self>> {
        if config.queued_frame_count == 0 {
            return Err(Error::InvalidArgument(
                "at least one queued frame is required".into(),
            ));
        }
        info!(
            "Creating render context on {} ({} queued frames)",
            device.description(),
            config.queued_frame_count
        );
        Ok(Arc::new(Self {
            queued_frames: config.queued_frame_count,
            fences: FenceManager::new(device.clone(), config.fence_timeout()),
            allocators: CommandAllocatorManager::new(device.clone()),
            lists: CommandListManager::new(),
            queues: CommandQueueManager::new(device.clone()),
            states: ResourceStateManager::new(),
            cbv_srv_uav: CbvSrvUavDescriptorManager::new(
                device.clone(),
                config.cbv_srv_uav_heap_capacity,
            )?,
            rtv: RenderTargetDescriptorManager::new(device.clone(), config.rtv_heap_capacity)?,
            dsv: DepthStencilDescriptorManager::new(device.clone(), config.dsv_heap_capacity)?,
            uploads: UploadBufferManager::new(device.clone()),
            resources: ResourceManager::new(device.clone()),
            device,
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn queued_frames(&self) -> usize {
        self.queued_frames
    }

    pub fn fences(&self) -> &FenceManager {
        &self.fences
    }

    pub fn allocators(&self) -> &CommandAllocatorManager {
        &self.allocators
    }

    pub fn lists(&self) -> &CommandListManager {
        &self.lists
    }

    pub fn queues(&self) -> &CommandQueueManager {
        &self.queues
    }

    pub fn states(&self) -> &ResourceStateManager {
        &self.states
    }

    pub fn cbv_srv_uav(&self) -> &CbvSrvUavDescriptorManager {
        &self.cbv_srv_uav
    }

    pub fn rtv(&self) -> &RenderTargetDescriptorManager {
        &self.rtv
    }

    pub fn dsv(&self) -> &DepthStencilDescriptorManager {
        &self.dsv
    }

    pub fn uploads(&self) -> &UploadBufferManager {
        &self.uploads
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Clear every manager, dependents before their dependencies.
    ///
    /// Callable once. While any allocator, upload buffer or deferred
    /// release still waits on the GPU, nothing is cleared and
    /// [`Error::InFlightAtTeardown`] is returned; call again once the
    /// GPU is idle.
    pub fn shutdown(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(Error::UseAfterClear("RenderContext"));
        }
        let in_flight = [
            (
                "ResourceManager",
                self.resources.in_flight_count(&self.fences)?,
            ),
            (
                "UploadBufferManager",
                self.uploads.in_flight_count(&self.fences)?,
            ),
            (
                "CommandAllocatorManager",
                self.allocators.in_flight_count(&self.fences)?,
            ),
        ];
        if let Some((manager, count)) = in_flight.into_iter().find(|(_, count)| *count > 0) {
            warn!("Shutdown deferred: {} object(s) of {} in flight", count, manager);
            return Err(Error::InFlightAtTeardown { manager, count });
        }
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(Error::UseAfterClear("RenderContext"));
        }
        info!("Shutting down render context");

        let steps: [(&str, Result<usize>); 10] = [
            ("resources", self.resources.clear(&self.fences)),
            ("upload buffers", self.uploads.clear(&self.fences)),
            ("DSV heap", self.dsv.clear().map(|n| n as usize)),
            ("RTV heap", self.rtv.clear().map(|n| n as usize)),
            ("CBV/SRV/UAV heap", self.cbv_srv_uav.clear().map(|n| n as usize)),
            ("resource states", self.states.clear()),
            ("command lists", self.lists.clear()),
            ("command allocators", self.allocators.clear(&self.fences)),
            ("command queues", self.queues.clear()),
            ("fences", self.fences.clear()),
        ];

        let mut first_error = None;
        for (name, result) in steps {
            if let Err(err) = result {
                warn!("Failed to clear {}: {}", name, err);
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::FenceToken;
    use crate::device::{CommandListType, CompletionMode, HeadlessDevice};

    #[test]
    fn test_shutdown_once() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let context = RenderContext::new(device, &Config::default()).unwrap();
        assert_eq!(context.rtv().capacity().unwrap(), 16);
        assert_eq!(context.queued_frames(), 3);

        context.shutdown().unwrap();
        assert!(context.is_shut_down());
        assert!(matches!(context.shutdown(), Err(Error::UseAfterClear(_))));
        assert!(matches!(
            context.fences().create_fence(0),
            Err(Error::UseAfterClear(_))
        ));
    }

    #[test]
    fn test_shutdown_waits_for_idle_gpu() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let context = RenderContext::new(device.clone(), &Config::default()).unwrap();
        let queue = context
            .queues()
            .create_command_queue(CommandListType::Direct)
            .unwrap();
        let fence = context.fences().create_fence(0).unwrap();
        let allocator = context
            .allocators()
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        context.queues().signal(queue, fence, 1).unwrap();
        context
            .allocators()
            .mark_in_flight(allocator, FenceToken { fence, value: 1 })
            .unwrap();

        assert!(matches!(
            context.shutdown(),
            Err(Error::InFlightAtTeardown {
                manager: "CommandAllocatorManager",
                count: 1
            })
        ));
        assert!(!context.is_shut_down());
        assert_eq!(context.allocators().len().unwrap(), 1);
        assert_eq!(context.fences().completed_value(fence).unwrap(), 0);

        assert_eq!(device.retire_all(), 1);
        context.shutdown().unwrap();
        assert!(context.is_shut_down());
        assert!(matches!(
            context.allocators().len(),
            Err(Error::UseAfterClear(_))
        ));
    }
}
