//! Upload Buffers
//!
//! CPU-writable buffers in the upload heap, addressed by element. Constant
//! buffer elements are padded to the 256 byte alignment the GPU requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::command::{FenceManager, FenceToken};
use crate::device::{Device, DeviceObject, HeapType, ResourceDesc, ResourceId, ResourceState};
use crate::error::{DeviceResultExt, Error, Result};

pub const CONSTANT_BUFFER_ALIGNMENT: u64 = 256;

/// Round `size` up to the next multiple of 256 bytes.
pub fn rounded_constant_buffer_size(size: u64) -> u64 {
    (size + (CONSTANT_BUFFER_ALIGNMENT - 1)) & !(CONSTANT_BUFFER_ALIGNMENT - 1)
}

/// A mapped upload-heap buffer holding `element_count` equally sized elements.
#[derive(Clone)]
pub struct UploadBuffer {
    device: Arc<dyn Device>,
    resource: ResourceId,
    element_size: u64,
    element_count: u32,
}

impl std::fmt::Debug for UploadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadBuffer")
            .field("resource", &self.resource)
            .field("element_size", &self.element_size)
            .field("element_count", &self.element_count)
            .finish()
    }
}

impl UploadBuffer {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    /// Stride between elements, including constant buffer padding.
    pub fn element_size(&self) -> u64 {
        self.element_size
    }

    pub fn element_count(&self) -> u32 {
        self.element_count
    }

    pub fn size(&self) -> u64 {
        self.element_size * u64::from(self.element_count)
    }

    pub fn element_offset(&self, index: u32) -> u64 {
        self.element_size * u64::from(index)
    }

    /// Write `data` into element `index`.
    pub fn copy_data(&self, index: u32, data: &[u8]) -> Result<()> {
        let offset = self.element_offset(index);
        let len = data.len() as u64;
        if index >= self.element_count || len > self.element_size {
            return Err(Error::OutOfBounds {
                offset,
                len,
                size: self.size(),
            });
        }
        self.device
            .write_buffer(self.resource, offset, data)
            .during("Map")
    }
}

struct UploadEntry {
    size: u64,
    last_use: Option<FenceToken>,
}

pub struct UploadBufferManager {
    device: Arc<dyn Device>,
    buffers: Mutex<Option<HashMap<ResourceId, UploadEntry>>>,
}

impl UploadBufferManager {
    const NAME: &'static str = "UploadBufferManager";

    pub fn new(device: Arc<dyn Device>) -> Self {
        Self {
            device,
            buffers: Mutex::new(Some(HashMap::new())),
        }
    }

    /// Allocate a buffer of `element_count` elements of `element_size` bytes.
    /// Constant buffer elements are padded to 256 bytes.
    pub fn create_upload_buffer(
        &self,
        element_size: u64,
        element_count: u32,
        is_constant_buffer: bool,
        name: Option<&str>,
    ) -> Result<UploadBuffer> {
        if element_size == 0 || element_count == 0 {
            return Err(Error::InvalidArgument(
                "upload buffers need a non-empty element layout".into(),
            ));
        }
        let element_size = if is_constant_buffer {
            element_size
                .checked_next_multiple_of(CONSTANT_BUFFER_ALIGNMENT)
                .ok_or_else(|| Error::InvalidArgument("upload buffer size overflows".into()))?
        } else {
            element_size
        };
        let size = element_size
            .checked_mul(u64::from(element_count))
            .ok_or_else(|| Error::InvalidArgument("upload buffer size overflows".into()))?;

        let mut guard = self.buffers.lock();
        let buffers = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let mut desc = ResourceDesc::buffer(HeapType::Upload, size);
        desc.name = name.map(str::to_owned);
        let resource = self
            .device
            .create_committed_resource(&desc, ResourceState::GenericRead)
            .during("CreateCommittedResource")?;
        buffers.insert(
            resource,
            UploadEntry {
                size,
                last_use: None,
            },
        );
        debug!(
            "Created upload buffer {} ({} x {} bytes)",
            resource, element_count, element_size
        );
        Ok(UploadBuffer {
            device: self.device.clone(),
            resource,
            element_size,
            element_count,
        })
    }

    /// Note that GPU work reading `buffer` completes at `token`.
    pub fn mark_used(&self, buffer: &UploadBuffer, token: FenceToken) -> Result<()> {
        let mut guard = self.buffers.lock();
        let buffers = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = buffers.get_mut(&buffer.resource).ok_or(Error::UnknownHandle {
            kind: "upload buffer",
            id: buffer.resource.raw(),
        })?;
        entry.last_use = Some(token);
        Ok(())
    }

    /// Release `buffer`; refused while GPU work marked against it is pending.
    pub fn release(&self, buffer: &UploadBuffer, fences: &FenceManager) -> Result<()> {
        let mut guard = self.buffers.lock();
        let buffers = guard.as_mut().ok_or(Error::UseAfterClear(Self::NAME))?;
        let entry = buffers.get(&buffer.resource).ok_or(Error::UnknownHandle {
            kind: "upload buffer",
            id: buffer.resource.raw(),
        })?;
        if let Some(token) = entry.last_use {
            if !fences.is_complete(token)? {
                return Err(Error::ResourceInFlight {
                    resource: buffer.resource,
                    fence: token.fence,
                    pending: token.value,
                });
            }
        }
        buffers.remove(&buffer.resource);
        self.device.release(DeviceObject::Resource(buffer.resource));
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        let guard = self.buffers.lock();
        let buffers = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        Ok(buffers.len())
    }

    /// Bytes held by live upload buffers.
    pub fn total_size(&self) -> Result<u64> {
        let guard = self.buffers.lock();
        let buffers = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        Ok(buffers.values().map(|entry| entry.size).sum())
    }

    /// Number of buffers whose last marked use has not retired.
    pub fn in_flight_count(&self, fences: &FenceManager) -> Result<usize> {
        let guard = self.buffers.lock();
        let buffers = guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?;
        count_in_flight(buffers, fences)
    }

    /// Release every buffer. Further calls fail with [`Error::UseAfterClear`].
    ///
    /// Refuses with [`Error::InFlightAtTeardown`] while GPU work marked
    /// against any buffer is pending; the manager stays usable in that case.
    pub fn clear(&self, fences: &FenceManager) -> Result<usize> {
        let mut guard = self.buffers.lock();
        let in_flight = count_in_flight(
            guard.as_ref().ok_or(Error::UseAfterClear(Self::NAME))?,
            fences,
        )?;
        if in_flight > 0 {
            warn!("{} upload buffers still in flight at teardown", in_flight);
            return Err(Error::InFlightAtTeardown {
                manager: Self::NAME,
                count: in_flight,
            });
        }

        let buffers = guard.take().ok_or(Error::UseAfterClear(Self::NAME))?;
        for resource in buffers.keys() {
            self.device.release(DeviceObject::Resource(*resource));
        }
        debug!("Released {} upload buffers", buffers.len());
        Ok(buffers.len())
    }
}

fn count_in_flight(
    buffers: &HashMap<ResourceId, UploadEntry>,
    fences: &FenceManager,
) -> Result<usize> {
    let mut count = 0;
    for token in buffers.values().filter_map(|entry| entry.last_use) {
        if !fences.is_complete(token)? {
            count += 1;
        }
    }
    Ok(count)
}

/// One upload buffer per queued frame.
///
/// Frame slot `i` of a [`CommandListPerFrame`](crate::command::CommandListPerFrame)
/// writes buffer `i`; the ring's fence wait guarantees the GPU is done
/// reading it.
pub struct UploadBufferPerFrame {
    buffers: Vec<UploadBuffer>,
    current: AtomicUsize,
}

impl UploadBufferPerFrame {
    pub fn new(
        manager: &UploadBufferManager,
        queued_frames: usize,
        element_size: u64,
        element_count: u32,
        is_constant_buffer: bool,
        name: &str,
    ) -> Result<Self> {
        if queued_frames == 0 {
            return Err(Error::InvalidArgument(
                "at least one queued frame is required".into(),
            ));
        }
        let buffers = (0..queued_frames)
            .map(|frame| {
                manager.create_upload_buffer(
                    element_size,
                    element_count,
                    is_constant_buffer,
                    Some(&format!("{}[{}]", name, frame)),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            buffers,
            current: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer for frame slot `slot`.
    pub fn get(&self, slot: usize) -> &UploadBuffer {
        &self.buffers[slot % self.buffers.len()]
    }

    pub fn buffers(&self) -> &[UploadBuffer] {
        &self.buffers
    }

    /// Move to the next frame's buffer and return it.
    pub fn advance(&self) -> &UploadBuffer {
        let next = (self.current.load(Ordering::Relaxed) + 1) % self.buffers.len();
        self.current.store(next, Ordering::Relaxed);
        &self.buffers[next]
    }

    pub fn current(&self) -> &UploadBuffer {
        &self.buffers[self.current.load(Ordering::Relaxed)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{CommandListType, CompletionMode, HeadlessDevice};

    #[test]
    fn test_constant_buffer_rounding() {
        assert_eq!(rounded_constant_buffer_size(1), 256);
        assert_eq!(rounded_constant_buffer_size(256), 256);
        assert_eq!(rounded_constant_buffer_size(257), 512);
        assert_eq!(rounded_constant_buffer_size(64 * 4), 256);
    }

    #[test]
    fn test_copy_data_per_element() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let uploads = UploadBufferManager::new(device.clone());
        let buffer = uploads.create_upload_buffer(16, 3, true, None).unwrap();
        assert_eq!(buffer.element_size(), 256);
        assert_eq!(buffer.element_offset(2), 512);

        buffer.copy_data(1, &[7; 16]).unwrap();
        assert_eq!(device.read_buffer(buffer.resource(), 256, 16).unwrap(), vec![7; 16]);
        assert_eq!(device.read_buffer(buffer.resource(), 0, 4).unwrap(), vec![0; 4]);

        assert!(matches!(
            buffer.copy_data(3, &[0; 4]),
            Err(Error::OutOfBounds { offset: 768, .. })
        ));
        assert!(matches!(
            buffer.copy_data(0, &[0; 257]),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_release_waits_for_last_use() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let fences = FenceManager::new(device.clone(), None);
        let uploads = UploadBufferManager::new(device.clone());
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let fence = fences.create_fence(0).unwrap();

        let buffer = uploads.create_upload_buffer(64, 1, false, None).unwrap();
        device.signal(queue, fence, 1).unwrap();
        uploads
            .mark_used(&buffer, FenceToken { fence, value: 1 })
            .unwrap();
        assert!(matches!(
            uploads.release(&buffer, &fences),
            Err(Error::ResourceInFlight { pending: 1, .. })
        ));

        device.retire_all();
        uploads.release(&buffer, &fences).unwrap();
        assert_eq!(uploads.len().unwrap(), 0);
        assert_eq!(device.memory_used(), 0);
    }

    #[test]
    fn test_per_frame_buffers_rotate() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let uploads = UploadBufferManager::new(device);
        let ring = UploadBufferPerFrame::new(&uploads, 3, 64, 1, true, "constants").unwrap();
        assert_eq!(ring.len(), 3);
        let first = ring.current().resource();
        let second = ring.advance().resource();
        assert_ne!(first, second);
        ring.advance();
        assert_eq!(ring.advance().resource(), first);
        assert_eq!(ring.get(4).resource(), second);
        assert_eq!(uploads.total_size().unwrap(), 3 * 256);
    }

    #[test]
    fn test_clear_refused_while_in_flight() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let fences = FenceManager::new(device.clone(), None);
        let uploads = UploadBufferManager::new(device.clone());
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let fence = fences.create_fence(0).unwrap();

        let buffer = uploads.create_upload_buffer(64, 2, true, None).unwrap();
        device.signal(queue, fence, 1).unwrap();
        uploads
            .mark_used(&buffer, FenceToken { fence, value: 1 })
            .unwrap();
        assert_eq!(uploads.in_flight_count(&fences).unwrap(), 1);
        assert!(matches!(
            uploads.clear(&fences),
            Err(Error::InFlightAtTeardown {
                manager: "UploadBufferManager",
                count: 1
            })
        ));
        assert_eq!(uploads.len().unwrap(), 1);
        assert_eq!(device.memory_used(), 512);

        device.retire_all();
        assert_eq!(uploads.clear(&fences).unwrap(), 1);
        assert_eq!(device.memory_used(), 0);
    }

    #[test]
    fn test_use_after_clear() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let fences = FenceManager::new(device.clone(), None);
        let uploads = UploadBufferManager::new(device);
        let buffer = uploads.create_upload_buffer(16, 1, false, None).unwrap();
        let fence = fences.create_fence(0).unwrap();

        assert_eq!(uploads.clear(&fences).unwrap(), 1);
        assert!(matches!(
            uploads.create_upload_buffer(16, 1, false, None),
            Err(Error::UseAfterClear("UploadBufferManager"))
        ));
        assert!(matches!(
            uploads.mark_used(&buffer, FenceToken { fence, value: 1 }),
            Err(Error::UseAfterClear(_))
        ));
        assert!(matches!(
            uploads.release(&buffer, &fences),
            Err(Error::UseAfterClear(_))
        ));
        assert!(matches!(uploads.total_size(), Err(Error::UseAfterClear(_))));
        assert!(matches!(uploads.clear(&fences), Err(Error::UseAfterClear(_))));
    }

    #[test]
    fn test_oversized_layout_rejected() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let uploads = UploadBufferManager::new(device);
        assert!(matches!(
            uploads.create_upload_buffer(u64::MAX, 2, false, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            uploads.create_upload_buffer(u64::MAX - 8, 1, true, None),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(uploads.len().unwrap(), 0);
    }
}
