//! Headless Device
//!
//! A software GPU. Queued work runs on one simulated timeline in FIFO
//! order, buffer copies move real bytes, and every barrier is checked
//! against the device's own view of the resource. A failed check removes
//! the device, after which every call reports [`DeviceError::Removed`].

use std::collections::{HashMap, VecDeque};
use std::ops::Range;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, info, trace};

use crate::command::{Command, CommandList};
use crate::device::{
    CommandAllocatorId, CommandListId, CommandListType, CpuDescriptorHandle, DescriptorHeapId,
    DescriptorHeapInfo, DescriptorHeapKind, Device, DeviceError, DeviceObject, DeviceResult,
    FenceId, Format, GpuDescriptorHandle, HeapType, QueueId, ResourceDesc, ResourceDimension,
    ResourceId, ResourceState, ViewDesc,
};

/// How the simulated GPU timeline advances
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// Work retires inside the submitting call.
    Immediate,
    /// A worker thread retires each item `latency` after it was queued.
    Threaded { latency: Duration },
    /// Work retires only through [`HeadlessDevice::step`] or
    /// [`HeadlessDevice::retire_all`].
    Manual,
}

/// Queue traffic as seen by the device, in submission order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Execute {
        queue: QueueId,
        lists: Vec<CommandListId>,
    },
    Signal {
        queue: QueueId,
        fence: FenceId,
        value: u64,
    },
}

const GPU_HANDLE_BIT: u64 = 1 << 63;
const HANDLE_OFFSET_MASK: u64 = 0xFFFF_FFFF;

fn increment_for(kind: DescriptorHeapKind) -> u32 {
    match kind {
        DescriptorHeapKind::CbvSrvUav | DescriptorHeapKind::RenderTarget => 32,
        DescriptorHeapKind::DepthStencil => 8,
    }
}

struct RecordedList {
    id: CommandListId,
    commands: Vec<Command>,
}

enum Work {
    Execute(Vec<RecordedList>),
    Signal { fence: FenceId, value: u64 },
}

struct Pending {
    queue: QueueId,
    work: Work,
    ready_at: Instant,
}

struct HeapEntry {
    info: DescriptorHeapInfo,
    views: Vec<Option<ViewDesc>>,
}

struct ResourceEntry {
    desc: ResourceDesc,
    state: ResourceState,
    data: Vec<u8>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    removed: Option<String>,
    shutdown: bool,
    queues: HashMap<QueueId, CommandListType>,
    allocators: HashMap<CommandAllocatorId, CommandListType>,
    fences: HashMap<FenceId, u64>,
    heaps: HashMap<DescriptorHeapId, HeapEntry>,
    resources: HashMap<ResourceId, ResourceEntry>,
    pending: VecDeque<Pending>,
    memory_used: u64,
    memory_budget: Option<u64>,
    log: Option<Vec<QueueEvent>>,
}

impl State {
    fn next_raw(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn ensure_alive(&self) -> DeviceResult<()> {
        match &self.removed {
            Some(reason) => Err(DeviceError::Removed(reason.clone())),
            None => Ok(()),
        }
    }

    fn remove_device(&mut self, reason: String) -> DeviceError {
        error!("Device removed: {}", reason);
        self.removed = Some(reason.clone());
        DeviceError::Removed(reason)
    }

    fn resource(&self, id: ResourceId) -> DeviceResult<&ResourceEntry> {
        self.resources.get(&id).ok_or(DeviceError::UnknownObject {
            kind: "resource",
            id: id.raw(),
        })
    }

    fn view_at(&self, handle: CpuDescriptorHandle) -> Option<&ViewDesc> {
        let heap = DescriptorHeapId::from_raw(handle.0 >> 32);
        let entry = self.heaps.get(&heap)?;
        let index = (handle.0 & HANDLE_OFFSET_MASK) / u64::from(entry.info.increment);
        entry.views.get(index as usize)?.as_ref()
    }

    fn retire(&mut self, item: Pending) -> DeviceResult<()> {
        match item.work {
            Work::Execute(lists) => {
                for list in lists {
                    for command in &list.commands {
                        if let Err(reason) = self.apply(command) {
                            let reason = format!("{} on {}: {}", list.id, item.queue, reason);
                            return Err(self.remove_device(reason));
                        }
                    }
                    trace!("Retired {}", list.id);
                }
            }
            Work::Signal { fence, value } => {
                if let Some(current) = self.fences.get_mut(&fence) {
                    *current = value;
                    trace!("{} reached {}", fence, value);
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, command: &Command) -> Result<(), String> {
        match command {
            Command::ResourceBarrier(barriers) => {
                for barrier in barriers {
                    let entry = self
                        .resources
                        .get_mut(&barrier.resource)
                        .ok_or_else(|| format!("barrier on unknown {}", barrier.resource))?;
                    if entry.state != barrier.before {
                        return Err(format!(
                            "barrier before-state {:?} does not match {} in {:?}",
                            barrier.before, barrier.resource, entry.state
                        ));
                    }
                    entry.state = barrier.after;
                }
                Ok(())
            }
            Command::ClearRenderTarget { rtv, color } => {
                let resource = match self.view_at(*rtv) {
                    Some(ViewDesc::RenderTarget { resource, .. }) => *resource,
                    _ => return Err(format!("clear through {:?} which holds no RTV", rtv)),
                };
                let entry = self
                    .resources
                    .get_mut(&resource)
                    .ok_or_else(|| format!("clear of released {}", resource))?;
                if entry.state != ResourceState::RenderTarget {
                    return Err(format!(
                        "clear of {} in {:?}, expected RenderTarget",
                        resource, entry.state
                    ));
                }
                fill_color(entry, *color);
                Ok(())
            }
            Command::ClearDepthStencil { dsv, .. } => {
                let resource = match self.view_at(*dsv) {
                    Some(ViewDesc::DepthStencil { resource, .. }) => *resource,
                    _ => return Err(format!("clear through {:?} which holds no DSV", dsv)),
                };
                let entry = self
                    .resources
                    .get(&resource)
                    .ok_or_else(|| format!("clear of released {}", resource))?;
                if entry.state != ResourceState::DepthWrite {
                    return Err(format!(
                        "depth clear of {} in {:?}, expected DepthWrite",
                        resource, entry.state
                    ));
                }
                Ok(())
            }
            Command::CopyBufferRegion {
                dst,
                dst_offset,
                src,
                src_offset,
                size,
            } => self.copy(*dst, *dst_offset, *src, *src_offset, Some(*size)),
            Command::CopyResource { dst, src } => self.copy(*dst, 0, *src, 0, None),
            _ => Ok(()),
        }
    }

    fn copy(
        &mut self,
        dst: ResourceId,
        dst_offset: u64,
        src: ResourceId,
        src_offset: u64,
        size: Option<u64>,
    ) -> Result<(), String> {
        let source = self
            .resources
            .get(&src)
            .ok_or_else(|| format!("copy from unknown {}", src))?;
        if !matches!(
            source.state,
            ResourceState::CopySource | ResourceState::GenericRead
        ) {
            return Err(format!("copy source {} is in {:?}", src, source.state));
        }
        let size = size.unwrap_or(source.data.len() as u64);
        let bytes = byte_range(src_offset, size)
            .and_then(|range| source.data.get(range))
            .ok_or_else(|| format!("copy reads past the end of {}", src))?
            .to_vec();

        let target = self
            .resources
            .get_mut(&dst)
            .ok_or_else(|| format!("copy into unknown {}", dst))?;
        if target.state != ResourceState::CopyDest {
            return Err(format!("copy destination {} is in {:?}", dst, target.state));
        }
        byte_range(dst_offset, bytes.len() as u64)
            .and_then(|range| target.data.get_mut(range))
            .ok_or_else(|| format!("copy writes past the end of {}", dst))?
            .copy_from_slice(&bytes);
        Ok(())
    }
}

/// `offset..offset + len` as a slice range, or `None` when it overflows.
fn byte_range(offset: u64, len: u64) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    let end = start.checked_add(usize::try_from(len).ok()?)?;
    Some(start..end)
}

fn fill_color(entry: &mut ResourceEntry, color: [f32; 4]) {
    let channel = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    let pixel = match entry.desc.format {
        Format::Rgba8Unorm => [
            channel(color[0]),
            channel(color[1]),
            channel(color[2]),
            channel(color[3]),
        ],
        Format::Bgra8Unorm => [
            channel(color[2]),
            channel(color[1]),
            channel(color[0]),
            channel(color[3]),
        ],
        _ => return,
    };
    for chunk in entry.data.chunks_exact_mut(4) {
        chunk.copy_from_slice(&pixel);
    }
}

struct Shared {
    state: Mutex<State>,
    progress: Condvar,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock()
    }
}

pub struct HeadlessDevice {
    mode: CompletionMode,
    description: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HeadlessDevice {
    pub fn new(mode: CompletionMode) -> DeviceResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            progress: Condvar::new(),
        });

        let worker = match mode {
            CompletionMode::Threaded { .. } => {
                let shared = shared.clone();
                let handle = thread::Builder::new()
                    .name("headless-gpu".into())
                    .spawn(move || gpu_timeline(&shared))
                    .map_err(|e| {
                        DeviceError::InvalidCall(format!("failed to start GPU timeline: {}", e))
                    })?;
                Some(handle)
            }
            CompletionMode::Immediate | CompletionMode::Manual => None,
        };

        info!("Headless device created ({:?})", mode);
        Ok(Self {
            mode,
            description: format!("Headless software device ({:?})", mode),
            shared,
            worker: Mutex::new(worker),
        })
    }

    /// Fail resource creation once `bytes` are allocated.
    pub fn with_memory_budget(self, bytes: u64) -> Self {
        self.shared.state().memory_budget = Some(bytes);
        self
    }

    /// Keep a log of every execute and signal reaching a queue.
    pub fn with_submission_log(self) -> Self {
        self.shared.state().log = Some(Vec::new());
        self
    }

    pub fn mode(&self) -> CompletionMode {
        self.mode
    }

    pub fn submission_log(&self) -> Vec<QueueEvent> {
        self.shared.state().log.clone().unwrap_or_default()
    }

    /// Retire the oldest queued item. Returns `false` when nothing is queued.
    pub fn step(&self) -> bool {
        let mut state = self.shared.state();
        let retired = match state.pending.pop_front() {
            Some(item) => {
                let _ = state.retire(item);
                true
            }
            None => false,
        };
        drop(state);
        self.shared.progress.notify_all();
        retired
    }

    /// Retire everything queued so far. Returns the number of items retired.
    pub fn retire_all(&self) -> usize {
        let mut state = self.shared.state();
        let mut count = 0;
        while let Some(item) = state.pending.pop_front() {
            let _ = state.retire(item);
            count += 1;
        }
        drop(state);
        self.shared.progress.notify_all();
        count
    }

    pub fn pending_work(&self) -> usize {
        self.shared.state().pending.len()
    }

    /// The device's own view of a resource's state.
    pub fn resource_state(&self, resource: ResourceId) -> Option<ResourceState> {
        self.shared
            .state()
            .resources
            .get(&resource)
            .map(|entry| entry.state)
    }

    pub fn memory_used(&self) -> u64 {
        self.shared.state().memory_used
    }

    pub fn is_removed(&self) -> bool {
        self.shared.state().removed.is_some()
    }

    fn enqueue(&self, mut state: MutexGuard<'_, State>, queue: QueueId, work: Work) -> DeviceResult<()> {
        match self.mode {
            CompletionMode::Immediate => {
                let result = state.retire(Pending {
                    queue,
                    work,
                    ready_at: Instant::now(),
                });
                drop(state);
                self.shared.progress.notify_all();
                result
            }
            CompletionMode::Threaded { latency } => {
                state.pending.push_back(Pending {
                    queue,
                    work,
                    ready_at: Instant::now() + latency,
                });
                drop(state);
                self.shared.progress.notify_all();
                Ok(())
            }
            CompletionMode::Manual => {
                state.pending.push_back(Pending {
                    queue,
                    work,
                    ready_at: Instant::now(),
                });
                Ok(())
            }
        }
    }
}

fn gpu_timeline(shared: &Shared) {
    debug!("GPU timeline started");
    let mut state = shared.state();
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let next = state.pending.front().map(|item| item.ready_at);
        match next {
            Some(ready_at) if ready_at <= now => {
                if let Some(item) = state.pending.pop_front() {
                    let _ = state.retire(item);
                }
                shared.progress.notify_all();
            }
            Some(ready_at) => {
                shared.progress.wait_for(&mut state, ready_at - now);
            }
            None => shared.progress.wait(&mut state),
        }
    }
    debug!("GPU timeline stopped");
}

impl Drop for HeadlessDevice {
    fn drop(&mut self) {
        self.shared.state().shutdown = true;
        self.shared.progress.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                error!("GPU timeline thread panicked");
            }
        }
    }
}

impl Device for HeadlessDevice {
    fn description(&self) -> &str {
        &self.description
    }

    fn create_command_queue(&self, list_type: CommandListType) -> DeviceResult<QueueId> {
        let mut state = self.shared.state();
        state.ensure_alive()?;
        let id = QueueId::from_raw(state.next_raw());
        state.queues.insert(id, list_type);
        Ok(id)
    }

    fn create_command_allocator(
        &self,
        list_type: CommandListType,
    ) -> DeviceResult<CommandAllocatorId> {
        let mut state = self.shared.state();
        state.ensure_alive()?;
        let id = CommandAllocatorId::from_raw(state.next_raw());
        state.allocators.insert(id, list_type);
        Ok(id)
    }

    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> DeviceResult<()> {
        let state = self.shared.state();
        state.ensure_alive()?;
        if state.allocators.contains_key(&allocator) {
            Ok(())
        } else {
            Err(DeviceError::UnknownObject {
                kind: "command allocator",
                id: allocator.raw(),
            })
        }
    }

    fn create_fence(&self, initial_value: u64) -> DeviceResult<FenceId> {
        let mut state = self.shared.state();
        state.ensure_alive()?;
        let id = FenceId::from_raw(state.next_raw());
        state.fences.insert(id, initial_value);
        Ok(id)
    }

    fn completed_fence_value(&self, fence: FenceId) -> DeviceResult<u64> {
        let state = self.shared.state();
        state
            .fences
            .get(&fence)
            .copied()
            .ok_or(DeviceError::UnknownObject {
                kind: "fence",
                id: fence.raw(),
            })
    }

    fn wait_for_fence(
        &self,
        fence: FenceId,
        value: u64,
        timeout: Option<Duration>,
    ) -> DeviceResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.state();
        loop {
            let completed = state
                .fences
                .get(&fence)
                .copied()
                .ok_or(DeviceError::UnknownObject {
                    kind: "fence",
                    id: fence.raw(),
                })?;
            if completed >= value {
                return Ok(true);
            }
            state.ensure_alive()?;

            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    self.shared.progress.wait_for(&mut state, deadline - now);
                }
                None => self.shared.progress.wait(&mut state),
            }
        }
    }

    fn execute_command_lists(&self, queue: QueueId, lists: &[&CommandList]) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.ensure_alive()?;
        if !state.queues.contains_key(&queue) {
            return Err(DeviceError::UnknownObject {
                kind: "queue",
                id: queue.raw(),
            });
        }

        let mut recorded = Vec::with_capacity(lists.len());
        for list in lists {
            if !list.is_closed() {
                return Err(DeviceError::InvalidCall(format!(
                    "{} submitted while recording",
                    list.id()
                )));
            }
            if !state.allocators.contains_key(&list.allocator()) {
                return Err(DeviceError::InvalidCall(format!(
                    "{} recorded through released {}",
                    list.id(),
                    list.allocator()
                )));
            }
            recorded.push(RecordedList {
                id: list.id(),
                commands: list.commands().to_vec(),
            });
        }

        if let Some(log) = state.log.as_mut() {
            log.push(QueueEvent::Execute {
                queue,
                lists: recorded.iter().map(|list| list.id).collect(),
            });
        }
        self.enqueue(state, queue, Work::Execute(recorded))
    }

    fn signal(&self, queue: QueueId, fence: FenceId, value: u64) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.ensure_alive()?;
        if !state.queues.contains_key(&queue) {
            return Err(DeviceError::UnknownObject {
                kind: "queue",
                id: queue.raw(),
            });
        }
        if !state.fences.contains_key(&fence) {
            return Err(DeviceError::UnknownObject {
                kind: "fence",
                id: fence.raw(),
            });
        }
        if let Some(log) = state.log.as_mut() {
            log.push(QueueEvent::Signal {
                queue,
                fence,
                value,
            });
        }
        self.enqueue(state, queue, Work::Signal { fence, value })
    }

    fn create_descriptor_heap(
        &self,
        kind: DescriptorHeapKind,
        capacity: u32,
    ) -> DeviceResult<DescriptorHeapInfo> {
        if capacity == 0 {
            return Err(DeviceError::InvalidCall(format!(
                "{} heap with zero descriptors",
                kind
            )));
        }
        let mut state = self.shared.state();
        state.ensure_alive()?;
        let raw = state.next_raw();
        let base = raw << 32;
        let info = DescriptorHeapInfo {
            id: DescriptorHeapId::from_raw(raw),
            kind,
            capacity,
            cpu_start: CpuDescriptorHandle(base),
            gpu_start: kind
                .is_shader_visible()
                .then_some(GpuDescriptorHandle(GPU_HANDLE_BIT | base)),
            increment: increment_for(kind),
        };
        state.heaps.insert(
            info.id,
            HeapEntry {
                info,
                views: vec![None; capacity as usize],
            },
        );
        Ok(info)
    }

    fn create_view(&self, heap: DescriptorHeapId, index: u32, view: &ViewDesc) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.ensure_alive()?;

        let desc = state.resource(view.resource())?.desc.clone();
        let allowed = match view {
            ViewDesc::RenderTarget { .. } => desc.allow_render_target,
            ViewDesc::DepthStencil { .. } => desc.allow_depth_stencil,
            ViewDesc::UnorderedAccess { .. } => desc.allow_unordered_access,
            ViewDesc::ConstantBuffer { offset, size, .. } => {
                desc.dimension == ResourceDimension::Buffer
                    && offset
                        .checked_add(u64::from(*size))
                        .is_some_and(|end| end <= desc.size_in_bytes())
            }
            ViewDesc::ShaderResource { .. } => true,
        };
        if !allowed {
            return Err(DeviceError::InvalidCall(format!(
                "{:?} view not allowed on {}",
                view.kind(),
                view.resource()
            )));
        }

        let entry = state.heaps.get_mut(&heap).ok_or(DeviceError::UnknownObject {
            kind: "descriptor heap",
            id: heap.raw(),
        })?;
        if entry.info.kind != view.heap_kind() {
            return Err(DeviceError::InvalidCall(format!(
                "{:?} view written into a {} heap",
                view.kind(),
                entry.info.kind
            )));
        }
        let slot = entry
            .views
            .get_mut(index as usize)
            .ok_or_else(|| DeviceError::InvalidCall(format!("descriptor {} out of range", index)))?;
        *slot = Some(view.clone());
        Ok(())
    }

    fn create_committed_resource(
        &self,
        desc: &ResourceDesc,
        initial_state: ResourceState,
    ) -> DeviceResult<ResourceId> {
        let size = desc.size_in_bytes();
        if size == 0 {
            return Err(DeviceError::InvalidCall("zero-sized resource".into()));
        }
        match desc.heap {
            HeapType::Upload if initial_state != ResourceState::GenericRead => {
                return Err(DeviceError::InvalidCall(
                    "upload heap resources must start in GenericRead".into(),
                ));
            }
            HeapType::Readback if initial_state != ResourceState::CopyDest => {
                return Err(DeviceError::InvalidCall(
                    "readback heap resources must start in CopyDest".into(),
                ));
            }
            HeapType::Upload | HeapType::Readback
                if desc.dimension != ResourceDimension::Buffer =>
            {
                return Err(DeviceError::InvalidCall(
                    "only buffers may live in CPU-visible heaps".into(),
                ));
            }
            _ => {}
        }

        let mut state = self.shared.state();
        state.ensure_alive()?;
        if let Some(budget) = state.memory_budget {
            if state.memory_used.saturating_add(size) > budget {
                return Err(DeviceError::OutOfMemory { requested: size });
            }
        }

        let id = ResourceId::from_raw(state.next_raw());
        state.memory_used += size;
        state.resources.insert(
            id,
            ResourceEntry {
                desc: desc.clone(),
                state: initial_state,
                data: vec![0; size as usize],
            },
        );
        Ok(id)
    }

    fn write_buffer(&self, resource: ResourceId, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let mut state = self.shared.state();
        state.ensure_alive()?;
        let entry = state
            .resources
            .get_mut(&resource)
            .ok_or(DeviceError::UnknownObject {
                kind: "resource",
                id: resource.raw(),
            })?;
        if entry.desc.heap != HeapType::Upload {
            return Err(DeviceError::InvalidCall(format!(
                "{} is not CPU-writable",
                resource
            )));
        }
        byte_range(offset, data.len() as u64)
            .and_then(|range| entry.data.get_mut(range))
            .ok_or_else(|| DeviceError::InvalidCall(format!("write past the end of {}", resource)))?
            .copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, resource: ResourceId, offset: u64, len: u64) -> DeviceResult<Vec<u8>> {
        let state = self.shared.state();
        state.ensure_alive()?;
        let entry = state.resource(resource)?;
        byte_range(offset, len)
            .and_then(|range| entry.data.get(range))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| DeviceError::InvalidCall(format!("read past the end of {}", resource)))
    }

    fn release(&self, object: DeviceObject) {
        let mut state = self.shared.state();
        match object {
            DeviceObject::Queue(id) => {
                state.queues.remove(&id);
            }
            DeviceObject::Fence(id) => {
                state.fences.remove(&id);
            }
            DeviceObject::CommandAllocator(id) => {
                state.allocators.remove(&id);
            }
            DeviceObject::DescriptorHeap(id) => {
                state.heaps.remove(&id);
            }
            DeviceObject::Resource(id) => {
                if let Some(entry) = state.resources.remove(&id) {
                    state.memory_used -= entry.data.len() as u64;
                }
            }
        }
        trace!("Released {:?}", object);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandAllocatorManager, CommandListManager};
    use crate::resource_state::ResourceBarrier;

    fn recorded(
        device: &Arc<HeadlessDevice>,
        record: impl FnOnce(&mut CommandList),
    ) -> crate::command::SharedCommandList {
        let allocators = CommandAllocatorManager::new(device.clone());
        let allocator = allocators
            .create_command_allocator(CommandListType::Direct)
            .unwrap();
        let shared = CommandListManager::new()
            .create_command_list(&allocators, allocator, None)
            .unwrap();
        {
            let mut list = shared.lock();
            record(&mut list);
            list.close().unwrap();
        }
        shared
    }

    #[test]
    fn test_copy_moves_bytes_in_order() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Manual).unwrap());
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();
        let upload = device
            .create_committed_resource(
                &ResourceDesc::buffer(HeapType::Upload, 8),
                ResourceState::GenericRead,
            )
            .unwrap();
        let target = device
            .create_committed_resource(
                &ResourceDesc::buffer(HeapType::Default, 8),
                ResourceState::CopyDest,
            )
            .unwrap();
        device.write_buffer(upload, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let list = recorded(&device, |list| {
            list.copy_buffer_region(target, 0, upload, 4, 4).unwrap();
            list.resource_barrier(Some(ResourceBarrier {
                resource: target,
                before: ResourceState::CopyDest,
                after: ResourceState::VertexAndConstantBuffer,
            }))
            .unwrap();
        });
        device
            .execute_command_lists(queue, &[&*list.lock()])
            .unwrap();
        device.signal(queue, fence, 1).unwrap();

        assert_eq!(device.completed_fence_value(fence).unwrap(), 0);
        assert_eq!(device.pending_work(), 2);
        assert!(device.step());
        assert_eq!(device.completed_fence_value(fence).unwrap(), 0);
        assert!(device.step());
        assert_eq!(device.completed_fence_value(fence).unwrap(), 1);
        assert!(!device.step());

        assert_eq!(device.read_buffer(target, 0, 8).unwrap(), vec![5, 6, 7, 8, 0, 0, 0, 0]);
        assert_eq!(
            device.resource_state(target),
            Some(ResourceState::VertexAndConstantBuffer)
        );
    }

    #[test]
    fn test_mismatched_barrier_removes_device() {
        let device = Arc::new(HeadlessDevice::new(CompletionMode::Immediate).unwrap());
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let texture = device
            .create_committed_resource(
                &ResourceDesc::texture_2d(4, 4, Format::Rgba8Unorm),
                ResourceState::Common,
            )
            .unwrap();
        let list = recorded(&device, |list| {
            list.resource_barrier(Some(ResourceBarrier {
                resource: texture,
                before: ResourceState::RenderTarget,
                after: ResourceState::Present,
            }))
            .unwrap();
        });

        let err = device
            .execute_command_lists(queue, &[&*list.lock()])
            .unwrap_err();
        assert!(matches!(err, DeviceError::Removed(_)));
        assert!(device.is_removed());
        assert!(matches!(
            device.create_fence(0),
            Err(DeviceError::Removed(_))
        ));
    }

    #[test]
    fn test_threaded_timeline_completes_fences() {
        let device = HeadlessDevice::new(CompletionMode::Threaded {
            latency: Duration::from_millis(1),
        })
        .unwrap();
        let queue = device.create_command_queue(CommandListType::Direct).unwrap();
        let fence = device.create_fence(0).unwrap();
        for value in 1..=5 {
            device.signal(queue, fence, value).unwrap();
        }
        assert!(device
            .wait_for_fence(fence, 5, Some(Duration::from_secs(5)))
            .unwrap());
        assert_eq!(device.pending_work(), 0);
    }

    #[test]
    fn test_memory_budget() {
        let device = HeadlessDevice::new(CompletionMode::Immediate)
            .unwrap()
            .with_memory_budget(1024);
        let first = device
            .create_committed_resource(
                &ResourceDesc::buffer(HeapType::Default, 1000),
                ResourceState::Common,
            )
            .unwrap();
        assert_eq!(
            device.create_committed_resource(
                &ResourceDesc::buffer(HeapType::Default, 100),
                ResourceState::Common,
            ),
            Err(DeviceError::OutOfMemory { requested: 100 })
        );
        device.release(DeviceObject::Resource(first));
        assert_eq!(device.memory_used(), 0);
    }

    #[test]
    fn test_overflowing_ranges_are_errors() {
        let device = HeadlessDevice::new(CompletionMode::Immediate).unwrap();
        let buffer = device
            .create_committed_resource(
                &ResourceDesc::buffer(HeapType::Upload, 256),
                ResourceState::GenericRead,
            )
            .unwrap();
        let heap = device
            .create_descriptor_heap(DescriptorHeapKind::CbvSrvUav, 4)
            .unwrap();

        assert!(matches!(
            device.create_view(
                heap.id,
                0,
                &ViewDesc::ConstantBuffer {
                    resource: buffer,
                    offset: u64::MAX,
                    size: 256,
                },
            ),
            Err(DeviceError::InvalidCall(_))
        ));
        assert!(matches!(
            device.write_buffer(buffer, u64::MAX, &[1, 2, 3]),
            Err(DeviceError::InvalidCall(_))
        ));
        assert!(matches!(
            device.read_buffer(buffer, 1, u64::MAX),
            Err(DeviceError::InvalidCall(_))
        ));
        assert!(!device.is_removed());
    }

    #[test]
    fn test_upload_heap_must_start_generic_read() {
        let device = HeadlessDevice::new(CompletionMode::Immediate).unwrap();
        assert!(matches!(
            device.create_committed_resource(
                &ResourceDesc::buffer(HeapType::Upload, 64),
                ResourceState::Common,
            ),
            Err(DeviceError::InvalidCall(_))
        ));
    }
}
