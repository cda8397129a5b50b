//! Resource State Tracking
//!
//! Process-wide registry of the current usage state of every tracked GPU
//! resource. Each entry is an atomic so transitions on different resources
//! only share a read lock; transitions on the same resource are ordered by
//! compare-and-swap and a lost race is reported instead of masked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace, warn};

use crate::command::CommandList;
use crate::device::{ResourceId, ResourceState};
use crate::error::{Error, Result};

/// Transition of one resource between two usage states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceBarrier {
    pub resource: ResourceId,
    pub before: ResourceState,
    pub after: ResourceState,
}

type Registry = HashMap<ResourceId, AtomicU32>;

pub struct ResourceStateManager {
    registry: RwLock<Option<Registry>>,
}

fn decode(bits: u32) -> ResourceState {
    // Entries are only ever written from `ResourceState::bits`.
    ResourceState::from_bits(bits).unwrap_or(ResourceState::Common)
}

impl ResourceStateManager {
    const NAME: &'static str = "ResourceStateManager";

    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Some(HashMap::new())),
        }
    }

    pub fn register_resource(&self, resource: ResourceId, initial: ResourceState) -> Result<()> {
        let mut guard = self.registry.write();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        if registry.contains_key(&resource) {
            return Err(Error::ResourceAlreadyRegistered(resource));
        }
        registry.insert(resource, AtomicU32::new(initial.bits()));
        trace!("Tracking {} in {:?}", resource, initial);
        Ok(())
    }

    /// Stop tracking `resource`, returning its last recorded state.
    pub fn unregister_resource(&self, resource: ResourceId) -> Result<ResourceState> {
        let mut guard = self.registry.write();
        let registry = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = registry
            .remove(&resource)
            .ok_or(Error::UnregisteredResource(resource))?;
        Ok(decode(entry.into_inner()))
    }

    pub fn resource_state(&self, resource: ResourceId) -> Result<ResourceState> {
        let guard = self.registry.read();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = registry
            .get(&resource)
            .ok_or(Error::UnregisteredResource(resource))?;
        Ok(decode(entry.load(Ordering::Acquire)))
    }

    /// Move `resource` to `target`.
    ///
    /// Returns `None` when the resource is already in `target`; there is no
    /// barrier to record in that case. Otherwise the registry is updated
    /// and the barrier describing the change is returned.
    pub fn request_transition(
        &self,
        resource: ResourceId,
        target: ResourceState,
    ) -> Result<Option<ResourceBarrier>> {
        let guard = self.registry.read();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = registry
            .get(&resource)
            .ok_or(Error::UnregisteredResource(resource))?;

        let current = entry.load(Ordering::Acquire);
        if current == target.bits() {
            return Ok(None);
        }
        swap_state(entry, resource, current, target).map(Some)
    }

    /// Like [`request_transition`](Self::request_transition), but fails with
    /// [`Error::UnexpectedResourceState`] unless the registry holds
    /// `expected`.
    pub fn request_transition_from(
        &self,
        resource: ResourceId,
        expected: ResourceState,
        target: ResourceState,
    ) -> Result<Option<ResourceBarrier>> {
        let guard = self.registry.read();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = registry
            .get(&resource)
            .ok_or(Error::UnregisteredResource(resource))?;

        let current = entry.load(Ordering::Acquire);
        if current != expected.bits() {
            return Err(Error::UnexpectedResourceState {
                resource,
                expected,
                actual: decode(current),
            });
        }
        if expected == target {
            return Ok(None);
        }
        swap_state(entry, resource, current, target).map(Some)
    }

    /// Transition `resource` and record the barrier into `list`.
    ///
    /// The list is checked first so the registry never moves without the
    /// matching barrier being recorded. Returns whether a barrier was
    /// recorded.
    pub fn transition_resource(
        &self,
        list: &mut CommandList,
        resource: ResourceId,
        target: ResourceState,
    ) -> Result<bool> {
        list.ensure_recording()?;
        let barrier = self.request_transition(resource, target)?;
        Ok(list.resource_barrier(barrier)? > 0)
    }

    /// Transition several resources and record the non-trivial barriers as
    /// a single batch. On failure every transition already applied is
    /// rolled back and nothing is recorded.
    pub fn transition_resources(
        &self,
        list: &mut CommandList,
        targets: &[(ResourceId, ResourceState)],
    ) -> Result<usize> {
        list.ensure_recording()?;
        let mut applied = Vec::with_capacity(targets.len());
        for &(resource, target) in targets {
            match self.request_transition(resource, target) {
                Ok(Some(barrier)) => applied.push(barrier),
                Ok(None) => {}
                Err(err) => {
                    self.roll_back(&applied);
                    return Err(err);
                }
            }
        }
        list.resource_barrier(applied)
    }

    fn roll_back(&self, applied: &[ResourceBarrier]) {
        for barrier in applied.iter().rev() {
            if let Err(err) =
                self.request_transition_from(barrier.resource, barrier.after, barrier.before)
            {
                warn!("Failed to roll back {:?}: {}", barrier, err);
            }
        }
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.registry.read();
        let registry = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        Ok(registry.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Forget every tracked resource. Further calls fail with
    /// [`Error::UseAfterClear`].
    pub fn clear(&self) -> Result<usize> {
        let registry = self.registry.write()
            .take()
            .ok_or(Error::UseAfterClear(Self::NAME))?;
        debug!("Dropped state tracking for {} resources", registry.len());
        Ok(registry.len())
    }
}

impl Default for ResourceStateManager {
    fn default() -> Self {
        Self::new()
    }
}

fn swap_state(
    entry: &AtomicU32,
    resource: ResourceId,
    current: u32,
    target: ResourceState,
) -> Result<ResourceBarrier> {
    match entry.compare_exchange(current, target.bits(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            let barrier = ResourceBarrier {
                resource,
                before: decode(current),
                after: target,
            };
            trace!("{}: {:?} -> {:?}", resource, barrier.before, barrier.after);
            Ok(barrier)
        }
        Err(actual) => {
            warn!(
                "Concurrent transition on {}: saw {:?}, now {:?}",
                resource,
                decode(current),
                decode(actual)
            );
            Err(Error::ConcurrentTransition {
                resource,
                observed: decode(current),
                actual: decode(actual),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandAllocatorManager, CommandListManager};
    use crate::device::{CommandListType, CompletionMode, Device, HeadlessDevice};
    use std::sync::Arc;
    use std::thread;

    fn resource(raw: u64) -> ResourceId {
        ResourceId::from_raw(raw)
    }

    #[test]
    fn test_barrier_sequence() {
        let states = ResourceStateManager::new();
        let texture = resource(1);
        states
            .register_resource(texture, ResourceState::Common)
            .unwrap();

        let targets = [
            ResourceState::CopyDest,
            ResourceState::PixelShaderResource,
            ResourceState::RenderTarget,
            ResourceState::Present,
        ];
        let mut previous = ResourceState::Common;
        for target in targets {
            let barrier = states.request_transition(texture, target).unwrap().unwrap();
            assert_eq!(barrier.resource, texture);
            assert_eq!(barrier.before, previous);
            assert_eq!(barrier.after, target);
            previous = target;
        }
        assert_eq!(
            states.resource_state(texture).unwrap(),
            ResourceState::Present
        );
    }

    #[test]
    fn test_same_state_is_no_op() {
        let states = ResourceStateManager::new();
        states
            .register_resource(resource(1), ResourceState::RenderTarget)
            .unwrap();
        assert_eq!(
            states
                .request_transition(resource(1), ResourceState::RenderTarget)
                .unwrap(),
            None
        );
        assert_eq!(
            states.resource_state(resource(1)).unwrap(),
            ResourceState::RenderTarget
        );
    }

    #[test]
    fn test_unregistered_and_duplicate() {
        let states = ResourceStateManager::new();
        assert!(matches!(
            states.request_transition(resource(4), ResourceState::Common),
            Err(Error::UnregisteredResource(_))
        ));
        states
            .register_resource(resource(4), ResourceState::Common)
            .unwrap();
        assert!(matches!(
            states.register_resource(resource(4), ResourceState::CopyDest),
            Err(Error::ResourceAlreadyRegistered(_))
        ));
        assert_eq!(
            states.unregister_resource(resource(4)).unwrap(),
            ResourceState::Common
        );
        assert!(states.is_empty().unwrap());
    }

    #[test]
    fn test_expected_state_mismatch() {
        let states = ResourceStateManager::new();
        states
            .register_resource(resource(2), ResourceState::CopyDest)
            .unwrap();
        let err = states
            .request_transition_from(
                resource(2),
                ResourceState::RenderTarget,
                ResourceState::Present,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnexpectedResourceState {
                actual: ResourceState::CopyDest,
                ..
            }
        ));
        assert_eq!(
            states.resource_state(resource(2)).unwrap(),
            ResourceState::CopyDest
        );
    }

    #[test]
    fn test_use_after_clear() {
        let states = ResourceStateManager::new();
        states
            .register_resource(resource(1), ResourceState::Common)
            .unwrap();
        assert_eq!(states.clear().unwrap(), 1);
        assert!(matches!(
            states.request_transition(resource(1), ResourceState::CopyDest),
            Err(Error::UseAfterClear(_))
        ));
        assert!(matches!(states.clear(), Err(Error::UseAfterClear(_))));
    }

    #[test]
    fn test_concurrent_transitions_on_distinct_resources() {
        let states = ResourceStateManager::new();
        for raw in 0..8 {
            states
                .register_resource(resource(raw), ResourceState::Common)
                .unwrap();
        }

        thread::scope(|scope| {
            for raw in 0..8 {
                let states = &states;
                scope.spawn(move || {
                    for _ in 0..100 {
                        states
                            .request_transition(resource(raw), ResourceState::RenderTarget)
                            .unwrap()
                            .unwrap();
                        states
                            .request_transition(resource(raw), ResourceState::Present)
                            .unwrap()
                            .unwrap();
                    }
                });
            }
        });

        for raw in 0..8 {
            assert_eq!(
                states.resource_state(resource(raw)).unwrap(),
                ResourceState::Present
            );
        }
    }

    #[test]
    fn test_batched_transitions_roll_back_on_failure() {
        let device: Arc<dyn Device> =
            Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let allocators = CommandAllocatorManager::new(device);
        let lists = CommandListManager::new();
        let allocator = allocators
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let shared = lists.create_command_list(&allocators, allocator, None).unwrap();
        let mut list = shared.lock();

        let states = ResourceStateManager::new();
        states
            .register_resource(resource(1), ResourceState::Common)
            .unwrap();
        states
            .register_resource(resource(2), ResourceState::CopyDest)
            .unwrap();

        let recorded = states
            .transition_resources(
                &mut list,
                &[
                    (resource(1), ResourceState::CopyDest),
                    (resource(2), ResourceState::CopyDest),
                ],
            )
            .unwrap();
        assert_eq!(recorded, 1);
        assert_eq!(list.commands().len(), 1);
        assert!(matches!(list.commands()[0], Command::ResourceBarrier(ref b) if b.len() == 1));

        let err = states.transition_resources(
            &mut list,
            &[
                (resource(1), ResourceState::CopySource),
                (resource(3), ResourceState::CopySource),
            ],
        );
        assert!(matches!(err, Err(Error::UnregisteredResource(_))));
        assert_eq!(
            states.resource_state(resource(1)).unwrap(),
            ResourceState::CopyDest
        );
        assert_eq!(list.commands().len(), 1);
    }

    #[test]
    fn test_transition_into_closed_list_leaves_registry_untouched() {
        let device: Arc<dyn Device> =
            Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let allocators = CommandAllocatorManager::new(device);
        let lists = CommandListManager::new();
        let allocator = allocators
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let shared = lists.create_command_list(&allocators, allocator, None).unwrap();
        let mut list = shared.lock();
        list.close().unwrap();

        let states = ResourceStateManager::new();
        states
            .register_resource(resource(1), ResourceState::Present)
            .unwrap();
        assert!(matches!(
            states.transition_resource(&mut list, resource(1), ResourceState::RenderTarget),
            Err(Error::ListNotRecording(_))
        ));
        assert_eq!(
            states.resource_state(resource(1)).unwrap(),
            ResourceState::Present
        );
    }
}
