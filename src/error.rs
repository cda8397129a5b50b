//! Error Module
//!
//! Error taxonomy for the submission core. Every error belongs to one of
//! three classes, see [`ErrorCategory`].

use std::time::Duration;

use crate::device::{
    CommandAllocatorId, CommandListId, DescriptorHeapId, DescriptorHeapKind, DeviceError,
    FenceId, ResourceId, ResourceState,
};

/// Coarse class of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Caller bug. Never retried.
    ProgrammingContract,
    /// The graphics device failed. Recovery is up to the caller.
    Device,
    /// A fence wait exceeded its timeout. Treated as a device hang.
    SynchronizationTimeout,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0} is still recording; it must be closed before submission")]
    ClosedListRequired(CommandListId),

    #[error("{0} is not recording")]
    ListNotRecording(CommandListId),

    #[error("{0} is not registered with the resource state manager")]
    UnregisteredResource(ResourceId),

    #[error("{0} is already registered with the resource state manager")]
    ResourceAlreadyRegistered(ResourceId),

    #[error("{resource} expected in state {expected:?} but the registry holds {actual:?}")]
    UnexpectedResourceState {
        resource: ResourceId,
        expected: ResourceState,
        actual: ResourceState,
    },

    #[error("{resource} changed from {observed:?} to {actual:?} during a transition request")]
    ConcurrentTransition {
        resource: ResourceId,
        observed: ResourceState,
        actual: ResourceState,
    },

    #[error("{kind} descriptor heap exhausted: requested {requested}, {remaining} of {capacity} left")]
    HeapExhausted {
        kind: DescriptorHeapKind,
        requested: u32,
        remaining: u32,
        capacity: u32,
    },

    #[error("descriptor {index} of {heap} was invalidated by a heap reset")]
    StaleDescriptor { heap: DescriptorHeapId, index: u32 },

    #[error("{0} used after clear")]
    UseAfterClear(&'static str),

    #[error("unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },

    #[error("{allocator} is in flight until {fence} reaches {pending} (completed {completed})")]
    AllocatorInFlight {
        allocator: CommandAllocatorId,
        fence: FenceId,
        pending: u64,
        completed: u64,
    },

    #[error("{resource} is still used by GPU work until {fence} reaches {pending}")]
    ResourceInFlight {
        resource: ResourceId,
        fence: FenceId,
        pending: u64,
    },

    #[error("{count} object(s) still in flight at teardown of {manager}")]
    InFlightAtTeardown { manager: &'static str, count: usize },

    #[error("{fence} signal value {value} is not greater than last signaled {last}")]
    NonMonotonicFenceValue { fence: FenceId, value: u64, last: u64 },

    #[error("timed out after {timeout:?} waiting for {fence} to reach {value} (completed {completed})")]
    FenceTimeout {
        fence: FenceId,
        value: u64,
        completed: u64,
        timeout: Duration,
    },

    #[error("write of {len} bytes at offset {offset} exceeds size {size}")]
    OutOfBounds { offset: u64, len: u64, size: u64 },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} failed: {source}")]
    Device {
        operation: &'static str,
        #[source]
        source: DeviceError,
    },
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Device { .. } => ErrorCategory::Device,
            Error::FenceTimeout { .. } => ErrorCategory::SynchronizationTimeout,
            _ => ErrorCategory::ProgrammingContract,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Attach the failing operation's name to a device error.
pub(crate) trait DeviceResultExt<T> {
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> DeviceResultExt<T> for std::result::Result<T, DeviceError> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| Error::Device { operation, source })
    }
}
