//! Resource Manager
//!
//! Owns committed GPU resources. Each one is registered with the
//! [`ResourceStateManager`] in its initial state on creation, and can be
//! released immediately or once a fence token retires.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::command::{CommandList, FenceManager, FenceToken};
use crate::device::{Device, DeviceObject, HeapType, ResourceDesc, ResourceId, ResourceState};
use crate::error::{DeviceResultExt, Error, Result};
use crate::resource_state::ResourceStateManager;

/// A GPU-only buffer whose contents are being uploaded by a recorded copy.
///
/// `staging` must outlive the GPU work that performs the copy; hand it to
/// [`ResourceManager::release_after`] with the submission's token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultBuffer {
    pub buffer: ResourceId,
    pub staging: ResourceId,
}

#[derive(Default)]
struct Registry {
    resources: HashMap<ResourceId, ResourceDesc>,
    deferred: Vec<(ResourceId, FenceToken)>,
}

pub struct ResourceManager {
    device: Arc<dyn Device>,
    registry: Mutex<Option<Registry>>,
}

impl ResourceManager {
    const NAME: &'static str = "ResourceManager";

    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            registry: Mutex::new(Some(Registry::default())),
        }
    }

    pub fn create_committed_resource(
        &self,
        states: &ResourceStateManager,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> Result<ResourceId> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let resource = self
            .device
            .create_committed_resource(desc, initial_state)
            .during("CreateCommittedResource")?;
        if let Err(err) = states.register_resource(resource, initial_state) {
            self.device.release(DeviceObject::Resource(resource));
            return Err(err);
        }
        registry.resources.insert(resource, desc.clone());
        debug!(
            "Created {} {:?} ({} bytes) in {:?}",
            resource,
            desc.name.as_deref().unwrap_or("unnamed"),
            desc.size_in_bytes(),
            initial_state
        );
        Ok(resource)
    }

    /// Create a default-heap buffer holding `data` and record the upload
    /// into `list`: a staging copy followed by a transition to
    /// `final_state`.
    ///
    /// On failure both buffers are released and `list` should be
    /// discarded, since it may hold part of the upload.
    pub fn create_default_buffer(
        &self,
        states: &ResourceStateManager,
        list: &mut CommandList,
        data: &[u8],
        final_state: ResourceState,
        name: Option<&str>,
    ) -> Result<DefaultBuffer> {
        list.ensure_recording()?;
        let size = data.len() as u64;

        let mut staging_desc = ResourceDesc::buffer(HeapType::Upload, size);
        staging_desc.name = name.map(|name| format!("{} (staging)", name));
        let staging =
            self.create_committed_resource(states, &staging_desc, ResourceState::GenericRead)?;

        let mut created = None;
        match self.record_default_buffer_upload(
            states,
            list,
            staging,
            data,
            final_state,
            name,
            &mut created,
        ) {
            Ok(buffer) => Ok(DefaultBuffer { buffer, staging }),
            Err(err) => {
                warn!("Default buffer upload {:?} failed: {}", name.unwrap_or("unnamed"), err);
                for resource in created.into_iter().chain([staging]) {
                    if let Err(release_err) = self.release(states, resource) {
                        warn!("Failed to release {}: {}", resource, release_err);
                    }
                }
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_default_buffer_upload(
        &self,
        states: &ResourceStateManager,
        list: &mut CommandList,
        staging: ResourceId,
        data: &[u8],
        final_state: ResourceState,
        name: Option<&str>,
        created: &mut Option<ResourceId>,
    ) -> Result<ResourceId> {
        let size = data.len() as u64;
        self.device
            .write_buffer(staging, 0, data)
            .during("Map")?;

        let mut desc = ResourceDesc::buffer(HeapType::Default, size);
        desc.name = name.map(str::to_owned);
        let buffer = self.create_committed_resource(states, &desc, ResourceState::Common)?;
        *created = Some(buffer);

        states.transition_resource(list, buffer, ResourceState::CopyDest)?;
        list.copy_buffer_region(buffer, 0, staging, 0, size)?;
        states.transition_resource(list, buffer, final_state)?;
        Ok(buffer)
    }

    pub fn desc(&self, resource: ResourceId) -> Result<ResourceDesc> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        registry
            .resources
            .get(&resource)
            .cloned()
            .ok_or(unknown(resource))
    }

    pub fn read_buffer(&self, resource: ResourceId, offset: u64, len: u64) -> Result<Vec<u8>> {
        let size = self.desc(resource)?.size_in_bytes();
        if offset.saturating_add(len) > size {
            return Err(Error::OutOfBounds { offset, len, size });
        }
        self.device
            .read_buffer(resource, offset, len)
            .during("ReadFromSubresource")
    }

    /// Release `resource` now. The caller guarantees no pending GPU work
    /// references it.
    pub fn release(&self, states: &ResourceStateManager, resource: ResourceId) -> Result<()> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        if let Some((_, token)) = registry
            .deferred
            .iter()
            .find(|(deferred, _)| *deferred == resource)
        {
            return Err(Error::ResourceInFlight {
                resource,
                fence: token.fence,
                pending: token.value,
            });
        }
        registry.resources.remove(&resource).ok_or(unknown(resource))?;
        release_tracked(&*self.device, states, resource);
        Ok(())
    }

    /// Release `resource` once `token` has completed, see
    /// [`collect_retired`](Self::collect_retired).
    pub fn release_after(&self, resource: ResourceId, token: FenceToken) -> Result<()> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        if !registry.resources.contains_key(&resource) {
            return Err(unknown(resource));
        }
        match registry.deferred.iter_mut().find(|(r, _)| *r == resource) {
            Some((_, pending)) if pending.value < token.value => *pending = token,
            Some(_) => {}
            None => registry.deferred.push((resource, token)),
        }
        trace!("{} released after {} reaches {}", resource, token.fence, token.value);
        Ok(())
    }

    /// Release every deferred resource whose token has completed. Returns
    /// the number released.
    pub fn collect_retired(
        &self,
        states: &ResourceStateManager,
        fences: &FenceManager,
    ) -> Result<usize> {
        let mut guard = self.registry.lock();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;

        let mut retired = Vec::new();
        let mut index = 0;
        while index < registry.deferred.len() {
            let (resource, token) = registry.deferred[index];
            if fences.is_complete(token)? {
                registry.deferred.swap_remove(index);
                retired.push(resource);
            } else {
                index += 1;
            }
        }

        for resource in &retired {
            registry.resources.remove(resource);
            release_tracked(&*self.device, states, *resource);
        }
        if !retired.is_empty() {
            debug!("Released {} retired resources", retired.len());
        }
        Ok(retired.len())
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        Ok(registry.resources.len())
    }

    /// Number of deferred releases still waiting on the GPU.
    pub fn in_flight_count(&self, fences: &FenceManager) -> Result<usize> {
        let guard = self.registry.lock();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        registry.in_flight(fences)
    }

    /// Release every resource.
    ///
    /// Refuses with [`Error::InFlightAtTeardown`] while a deferred release
    /// is still waiting on the GPU.
    pub fn clear(&self, fences: &FenceManager) -> Result<usize> {
        let mut guard = self.registry.lock();
        let in_flight = guard
            .as_ref()
            .ok_or(Error::UseAfterClear(Self::NAME))?
            .in_flight(fences)?;
        if in_flight > 0 {
            warn!("{} resources still in flight at teardown", in_flight);
            return Err(Error::InFlightAtTeardown {
                manager: Self::NAME,
                count: in_flight,
            });
        }

        let registry = guard.take().ok_or(Error::UseAfterClear(Self::NAME))?;
        for resource in registry.resources.keys() {
            self.device.release(DeviceObject::Resource(*resource));
        }
        debug!("Released {} resources", registry.resources.len());
        Ok(registry.resources.len())
    }
}

impl Registry {
    fn in_flight(&self, fences: &FenceManager) -> Result<usize> {
        let mut count = 0;
        for (_, token) in &self.deferred {
            if !fences.is_complete(*token)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn release_tracked(device: &dyn Device, states: &ResourceStateManager, resource: ResourceId) {
    if let Err(err) = states.unregister_resource(resource) {
        warn!("Releasing {} without state tracking: {}", resource, err);
    }
    device.release(DeviceObject::Resource(resource));
}

fn unknown(resource: ResourceId) -> Error {
    Error::UnknownHandle {
        kind: "resource",
        id: resource.raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandAllocatorManager, CommandListManager, CommandQueueManager};
    use crate::device::{CommandListType, CompletionMode, DeviceError, Format, HeadlessDevice};

    #[test]
    fn test_committed_resource_is_tracked() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let states = ResourceStateManager::new();
        let resources = ResourceManager::new(device);
        let texture = resources
            .create_committed_resource(
                &states,
                &ResourceDesc::texture_2d(16, 16, Format::Rgba8Unorm).named("albedo"),
                ResourceState::CopyDest,
            )
            .unwrap();
        assert_eq!(
            states.resource_state(texture).unwrap(),
            ResourceState::CopyDest
        );
        assert_eq!(resources.desc(texture).unwrap().name.as_deref(), Some("albedo"));

        resources.release(&states, texture).unwrap();
        assert!(matches!(
            states.resource_state(texture),
            Err(Error::UnregisteredResource(_))
        ));
    }

    #[test]
    fn test_out_of_memory_is_a_device_error() {
        let device = Arc::new(
            HeadlessDevice::new(CompletionMode::Immediate)
                .unwrap()
                .with_memory_budget(64),
        );
        let states = ResourceStateManager::new();
        let resources = ResourceManager::new(device);
        let err = resources
            .create_committed_resource(
                &states,
                &ResourceDesc::buffer(HeapType::Default, 128),
                ResourceState::Common,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Device {
                operation: "CreateCommittedResource",
                source: DeviceError::OutOfMemory { requested: 128 },
            }
        ));
        assert_eq!(states.len().unwrap(), 0);
    }

    #[test]
    fn test_default_buffer_upload_and_deferred_release() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let fences = FenceManager::new(device.clone(), None);
        let allocators = CommandAllocatorManager::new(device.clone());
        let lists = CommandListManager::new();
        let queues = CommandQueueManager::new(device.clone());
        let states = ResourceStateManager::new();
        let resources = ResourceManager::new(device.clone());

        let queue = queues.create_command_queue(CommandListType::Direct).unwrap();
        let fence = fences.create_fence(0).unwrap();
        let allocator = allocators
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let shared = lists.create_command_list(&allocators, allocator, None).unwrap();
        let mut list = shared.lock();

        let uploaded = resources
            .create_default_buffer(
                &states,
                &mut list,
                &[1, 2, 3, 4],
                ResourceState::VertexAndConstantBuffer,
                Some("vertices"),
            )
            .unwrap();
        assert_eq!(
            states.resource_state(uploaded.buffer).unwrap(),
            ResourceState::VertexAndConstantBuffer
        );
        list.close().unwrap();
        queues.execute_command_lists(queue, &[&*list]).unwrap();
        queues.signal(queue, fence, 1).unwrap();
        let token = FenceToken { fence, value: 1 };
        resources.release_after(uploaded.staging, token).unwrap();

        assert!(matches!(
            resources.release(&states, uploaded.staging),
            Err(Error::ResourceInFlight { .. })
        ));
        assert_eq!(resources.collect_retired(&states, &fences).unwrap(), 0);
        assert!(matches!(
            resources.clear(&fences),
            Err(Error::InFlightAtTeardown { count: 1, .. })
        ));

        device.retire_all();
        assert_eq!(resources.collect_retired(&states, &fences).unwrap(), 1);
        assert_eq!(resources.read_buffer(uploaded.buffer, 0, 4).unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(
            device.resource_state(uploaded.buffer),
            Some(ResourceState::VertexAndConstantBuffer)
        );
        assert_eq!(resources.clear(&fences).unwrap(), 1);
    }

    #[test]
    fn test_failed_default_buffer_releases_staging() {
        let device = Arc::new(
            HeadlessDevice::new(CompletionMode::Immediate)
                .unwrap()
                .with_memory_budget(6),
        );
        let allocators = CommandAllocatorManager::new(device.clone());
        let lists = CommandListManager::new();
        let states = ResourceStateManager::new();
        let resources = ResourceManager::new(device.clone());
        let allocator = allocators
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let shared = lists.create_command_list(&allocators, allocator, None).unwrap();
        let mut list = shared.lock();

        let err = resources
            .create_default_buffer(
                &states,
                &mut list,
                &[1, 2, 3, 4],
                ResourceState::IndexBuffer,
                Some("indices"),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Device {
                source: DeviceError::OutOfMemory { requested: 4 },
                ..
            }
        ));
        assert_eq!(resources.len().unwrap(), 0);
        assert_eq!(states.len().unwrap(), 0);
        assert_eq!(device.memory_used(), 0);
        assert!(list.commands().is_empty());
    }

    #[test]
    fn test_use_after_clear() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let fences = FenceManager::new(device.clone(), None);
        let states = ResourceStateManager::new();
        let resources = ResourceManager::new(device.clone());
        let buffer = resources
            .create_committed_resource(
                &states,
                &ResourceDesc::buffer(HeapType::Default, 64),
                ResourceState::Common,
            )
            .unwrap();

        assert_eq!(resources.clear(&fences).unwrap(), 1);
        assert_eq!(device.memory_used(), 0);
        assert!(matches!(
            resources.create_committed_resource(
                &states,
                &ResourceDesc::buffer(HeapType::Default, 64),
                ResourceState::Common,
            ),
            Err(Error::UseAfterClear("ResourceManager"))
        ));
        assert!(matches!(resources.desc(buffer), Err(Error::UseAfterClear(_))));
        let fence = fences.create_fence(0).unwrap();
        assert!(matches!(
            resources.release_after(buffer, FenceToken { fence, value: 1 }),
            Err(Error::UseAfterClear(_))
        ));
        assert!(matches!(
            resources.collect_retired(&states, &fences),
            Err(Error::UseAfterClear(_))
        ));
        assert!(matches!(resources.clear(&fences), Err(Error::UseAfterClear(_))));
    }
}
