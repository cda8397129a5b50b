//! Command Allocators
//!
//! Creates command allocators and recycles them through one pool per
//! command list type. Every allocator remembers the fence token of the last
//! submission that used it and refuses to be reset before that token
//! retires.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::command::{FenceManager, FenceToken};
use crate::device::{CommandAllocatorId, CommandListType, Device, DeviceObject};
use crate::error::{DeviceResultExt, Error, Result};

struct AllocatorEntry {
    list_type: CommandListType,
    in_flight: Option<FenceToken>,
}

#[derive(Default)]
struct AllocatorPool {
    entries: HashMap<CommandAllocatorId, AllocatorEntry>,
    free: HashMap<CommandListType, VecDeque<CommandAllocatorId>>,
}

pub struct CommandAllocatorManager {
    device: Arc<dyn Device>,
    pool: Mutex<Option<AllocatorPool>>,
}

impl CommandAllocatorManager {
    const NAME: &'static str = "CommandAllocatorManager";

    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            pool: Mutex::new(Some(AllocatorPool::default())),
        }
    }

    pub fn create_command_allocator(&self, list_type: CommandListType) -> Result<CommandAllocatorId> {
        let mut guard = self.pool.lock();
        let pool = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let id = self
            .device
            .create_command_allocator(list_type)
            .during("CreateCommandAllocator")?;
        pool.entries.insert(
            id,
            AllocatorEntry {
                list_type,
                in_flight: None,
            },
        );
        debug!("Created {} ({:?})", id, list_type);
        Ok(id)
    }

    /// Take a retired allocator of `list_type` from the pool, reset and
    /// ready to record, or create a new one when none is free.
    pub fn acquire_command_allocator(
        &self,
        list_type: CommandListType,
        fences: &FenceManager,
    ) -> Result<CommandAllocatorId> {
        let candidate = {
            let mut guard = self.pool.lock();
            let pool = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
            let free = pool.free.entry(list_type).or_default();
            match free.front().copied() {
                Some(id) => {
                    let token = pool.entries.get(&id).and_then(|e| e.in_flight);
                    let retired = match token {
                        Some(token) => fences.is_complete(token)?,
                        None => true,
                    };
                    if retired {
                        free.pop_front();
                        Some(id)
                    } else {
                        None
                    }
                }
                None => None,
            }
        };

        match candidate {
            Some(id) => {
                self.reset_command_allocator(id, fences)?;
                trace!("Recycled {}", id);
                Ok(id)
            }
            None => self.create_command_allocator(list_type),
        }
    }

    /// Return `allocator` to its type's pool. It is handed out again only
    /// after its last submission retires.
    pub fn release_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()> {
        let mut guard = self.pool.lock();
        let pool = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let list_type = pool
            .entries
            .get(&allocator)
            .map(|entry| entry.list_type)
            .ok_or(unknown(allocator))?;
        let free = pool.free.entry(list_type).or_default();
        if !free.contains(&allocator) {
            free.push_back(allocator);
        }
        Ok(())
    }

    pub fn list_type(&self, allocator: CommandAllocatorId) -> Result<CommandListType> {
        let guard = self.pool.lock();
        let pool = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        pool.entries
            .get(&allocator)
            .map(|entry| entry.list_type)
            .ok_or(unknown(allocator))
    }

    /// Record that work recorded through `allocator` completes at `token`.
    pub fn mark_in_flight(&self, allocator: CommandAllocatorId, token: FenceToken) -> Result<()> {
        let mut guard = self.pool.lock();
        let pool = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = pool
            .entries
            .get_mut(&allocator)
            .ok_or(unknown(allocator))?;
        entry.in_flight = Some(token);
        Ok(())
    }

    pub fn pending_token(&self, allocator: CommandAllocatorId) -> Result<Option<FenceToken>> {
        let guard = self.pool.lock();
        let pool = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        pool.entries
            .get(&allocator)
            .map(|entry| entry.in_flight)
            .ok_or(unknown(allocator))
    }

    /// Reclaim the memory of every list recorded through `allocator`.
    ///
    /// Fails with [`Error::AllocatorInFlight`] while its last submission has
    /// not retired. Nothing blocks here.
    pub fn reset_command_allocator(
        &self,
        allocator: CommandAllocatorId,
        fences: &FenceManager,
    ) -> Result<()> {
        let mut guard = self.pool.lock();
        let pool = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = pool
            .entries
            .get_mut(&allocator)
            .ok_or(unknown(allocator))?;

        if let Some(token) = entry.in_flight {
            let completed = fences.completed_value(token.fence)?;
            if completed < token.value {
                return Err(Error::AllocatorInFlight {
                    allocator,
                    fence: token.fence,
                    pending: token.value,
                    completed,
                });
            }
        }

        self.device
            .reset_command_allocator(allocator)
            .during("CommandAllocator::Reset")?;
        entry.in_flight = None;
        trace!("Reset {}", allocator);
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.pool.lock();
        let pool = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        Ok(pool.entries.len())
    }

    /// Number of allocators whose last submission has not retired.
    pub fn in_flight_count(&self, fences: &FenceManager) -> Result<usize> {
        let guard = self.pool.lock();
        let pool = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        pool.in_flight(fences)
    }

    /// Release every allocator.
    ///
    /// Refuses with [`Error::InFlightAtTeardown`] while any allocator still
    /// backs unfinished GPU work; the manager stays usable in that case.
    pub fn clear(&self, fences: &FenceManager) -> Result<usize> {
        let mut guard = self.pool.lock();
        let in_flight = guard
            .as_ref()
            .ok_or(Error::UseAfterClear(Self::NAME))?
            .in_flight(fences)?;
        if in_flight > 0 {
            warn!("{} command allocators still in flight at teardown", in_flight);
            return Err(Error::InFlightAtTeardown {
                manager: Self::NAME,
                count: in_flight,
            });
        }

        let pool = guard.take().ok_or(Error::UseAfterClear(Self::NAME))?;
        for id in pool.entries.keys() {
            self.device.release(DeviceObject::CommandAllocator(*id));
        }
        debug!("Released {} command allocators", pool.entries.len());
        Ok(pool.entries.len())
    }
}

impl AllocatorPool {
    fn in_flight(&self, fences: &FenceManager) -> Result<usize> {
        let mut count = 0;
        for token in self.entries.values().filter_map(|entry| entry.in_flight) {
            if !fences.is_complete(token)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

fn unknown(allocator: CommandAllocatorId) -> Error {
    Error::UnknownHandle {
        kind: "command allocator",
        id: allocator.raw(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CompletionMode, HeadlessDevice};

    fn setup() -> (Arc<HeadlessDevice>, FenceManager, CommandAllocatorManager) {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let fences = FenceManager::new(device.clone(), None);
        let allocators = CommandAllocatorManager::new(device.clone());
        (device, fences, allocators)
    }

    #[test]
    fn test_reset_refused_while_in_flight() {
        let (device, fences, allocators) = setup();
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let fence = fences.create_fence(0).unwrap();
        let allocator = allocators
            .create_command_allocator(CommandListType::Direct)
            .unwrap();

        device.signal(queue, fence, 1).unwrap();
        allocators
            .mark_in_flight(allocator, FenceToken { fence, value: 1 })
            .unwrap();

        let err = allocators
            .reset_command_allocator(allocator, &fences)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::AllocatorInFlight {
                pending: 1,
                completed: 0,
                ..
            }
        ));

        device.retire_all();
        allocators.reset_command_allocator(allocator, &fences).unwrap();
        assert_eq!(allocators.pending_token(allocator).unwrap(), None);
    }

    #[test]
    fn test_pool_recycles_retired_allocators_per_type() {
        let (device, fences, allocators) = setup();
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let fence = fences.create_fence(0).unwrap();

        let first = allocators
            .acquire_command_allocator(CommandListType::Direct, &fences)
            .unwrap();
        device.signal(queue, fence, 1).unwrap();
        allocators
            .mark_in_flight(first, FenceToken { fence, value: 1 })
            .unwrap();
        allocators.release_command_allocator(first).unwrap();

        let second = allocators
            .acquire_command_allocator(CommandListType::Direct, &fences)
            .unwrap();
        assert_ne!(first, second);

        let copy = allocators
            .acquire_command_allocator(CommandListType::Copy, &fences)
            .unwrap();
        assert_ne!(copy, first);

        device.retire_all();
        let third = allocators
            .acquire_command_allocator(CommandListType::Direct, &fences)
            .unwrap();
        assert_eq!(third, first);
        assert_eq!(allocators.len().unwrap(), 3);
    }

    #[test]
    fn test_clear_refuses_in_flight_then_tears_down() {
        let (device, fences, allocators) = setup();
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let fence = fences.create_fence(0).unwrap();
        let allocator = allocators
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        device.signal(queue, fence, 1).unwrap();
        allocators
            .mark_in_flight(allocator, FenceToken { fence, value: 1 })
            .unwrap();

        assert!(matches!(
            allocators.clear(&fences),
            Err(Error::InFlightAtTeardown { count: 1, .. })
        ));

        device.retire_all();
        assert_eq!(allocators.clear(&fences).unwrap(), 1);
        assert!(matches!(
            allocators.create_command_allocator(CommandListType::Direct),
            Err(Error::UseAfterClear(_))
        ));
        assert!(matches!(
            allocators.clear(&fences),
            Err(Error::UseAfterClear(_))
        ));
    }
}
