//! Descriptor Heaps
//!
//! One manager per heap kind, each owning a single fixed-capacity heap.
//! Slots are handed out by a bump offset and never reused individually;
//! [`DescriptorManager::reset`] rewinds the offset and invalidates every
//! descriptor handed out before it.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::device::{
    CpuDescriptorHandle, DescriptorHeapId, DescriptorHeapInfo, DescriptorHeapKind, Device,
    DeviceObject, Format, GpuDescriptorHandle, ResourceId, ViewDesc, ViewKind,
};
use crate::error::{DeviceResultExt, Error, Result};

/// Heap kind a [`DescriptorManager`] is specialised for.
pub trait DescriptorKind: Send + Sync + 'static {
    const HEAP: DescriptorHeapKind;
    const NAME: &'static str;

    /// View parameters, minus the resource being viewed.
    type View: Clone + Send + Sync;

    fn view_desc(resource: ResourceId, view: &Self::View) -> ViewDesc;
}

/// Constant buffer, shader resource and unordered access views
pub struct CbvSrvUav;

/// Render target views
pub struct RenderTarget;

/// Depth stencil views
pub struct DepthStencil;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CbvSrvUavView {
    ConstantBuffer { offset: u64, size: u32 },
    ShaderResource { format: Format, mip_levels: u32 },
    UnorderedAccess { format: Format },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTargetView {
    pub format: Format,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilView {
    pub format: Format,
}

impl DescriptorKind for CbvSrvUav {
    const HEAP: DescriptorHeapKind = DescriptorHeapKind::CbvSrvUav;
    const NAME: &'static str = "CbvSrvUavDescriptorManager";
    type View = CbvSrvUavView;

    fn view_desc(resource: ResourceId, view: &CbvSrvUavView) -> ViewDesc {
        match *view {
            CbvSrvUavView::ConstantBuffer { offset, size } => ViewDesc::ConstantBuffer {
                resource,
                offset,
                size,
            },
            CbvSrvUavView::ShaderResource { format, mip_levels } => ViewDesc::ShaderResource {
                resource,
                format,
                mip_levels,
            },
            CbvSrvUavView::UnorderedAccess { format } => {
                ViewDesc::UnorderedAccess { resource, format }
            }
        }
    }
}

impl DescriptorKind for RenderTarget {
    const HEAP: DescriptorHeapKind = DescriptorHeapKind::RenderTarget;
    const NAME: &'static str = "RenderTargetDescriptorManager";
    type View = RenderTargetView;

    fn view_desc(resource: ResourceId, view: &RenderTargetView) -> ViewDesc {
        ViewDesc::RenderTarget {
            resource,
            format: view.format,
        }
    }
}

impl DescriptorKind for DepthStencil {
    const HEAP: DescriptorHeapKind = DescriptorHeapKind::DepthStencil;
    const NAME: &'static str = "DepthStencilDescriptorManager";
    type View = DepthStencilView;

    fn view_desc(resource: ResourceId, view: &DepthStencilView) -> ViewDesc {
        ViewDesc::DepthStencil {
            resource,
            format: view.format,
        }
    }
}

/// A view written into a descriptor heap slot.
///
/// Stays valid until the owning manager is reset or cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    heap: DescriptorHeapId,
    index: u32,
    generation: u64,
    kind: ViewKind,
    resource: ResourceId,
    cpu: CpuDescriptorHandle,
    gpu: Option<GpuDescriptorHandle>,
    increment: u32,
}

impl Descriptor {
    pub fn heap(&self) -> DescriptorHeapId {
        self.heap
    }

    /// Slot index within the heap.
    pub fn offset(&self) -> u32 {
        self.index
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub fn cpu_handle(&self) -> CpuDescriptorHandle {
        self.cpu
    }

    /// `None` for heaps that are not shader visible.
    pub fn gpu_handle(&self) -> Option<GpuDescriptorHandle> {
        self.gpu
    }

    /// CPU handle `n` slots past this descriptor, for base + index addressing
    /// of a contiguous range.
    pub fn cpu_handle_at(&self, n: u32) -> CpuDescriptorHandle {
        self.cpu.offset(n, self.increment)
    }

    pub fn gpu_handle_at(&self, n: u32) -> Option<GpuDescriptorHandle> {
        self.gpu.map(|gpu| gpu.offset(n, self.increment))
    }
}

struct HeapAllocation {
    info: DescriptorHeapInfo,
    next: u32,
    generation: u64,
}

impl HeapAllocation {
    fn remaining(&self) -> u32 {
        self.info.capacity - self.next
    }
}

pub struct DescriptorManager<K: DescriptorKind> {
    device: Arc<dyn Device>,
    heap: Mutex<Option<HeapAllocation>>,
    _kind: PhantomData<fn() -> K>,
}

pub type CbvSrvUavDescriptorManager = DescriptorManager<CbvSrvUav>;
pub type RenderTargetDescriptorManager = DescriptorManager<RenderTarget>;
pub type DepthStencilDescriptorManager = DescriptorManager<DepthStencil>;

impl<K: DescriptorKind> DescriptorManager<K> {
    /// Create the manager and its heap of `capacity` descriptors.
    pub fn new(device: Arc<dyn Device>, capacity: u32) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidArgument(format!(
                "{} heap capacity must be positive",
                K::HEAP
            )));
        }
        let info = device
            .create_descriptor_heap(K::HEAP, capacity)
            .during("CreateDescriptorHeap")?;
        debug!("Created {} heap {} with {} descriptors", K::HEAP, info.id, capacity);
        Ok(Self {
            device,
            heap: Mutex::new(Some(HeapAllocation {
                info,
                next: 0,
                generation: 0,
            })),
            _kind: PhantomData,
        })
    }

    pub fn create_view(&self, resource: ResourceId, view: &K::View) -> Result<Descriptor> {
        let mut descriptors = self.allocate(&[(resource, view.clone())])?;
        descriptors
            .pop()
            .ok_or_else(|| Error::InvalidArgument("empty descriptor allocation".into()))
    }

    /// Create one view per `(resource, view)` pair in a contiguous range.
    ///
    /// Either the whole range fits or nothing is allocated.
    pub fn create_views(
        &self,
        resources: &[ResourceId],
        views: &[K::View],
    ) -> Result<Vec<Descriptor>> {
        if resources.len() != views.len() {
            return Err(Error::InvalidArgument(format!(
                "{} resources but {} view descriptions",
                resources.len(),
                views.len()
            )));
        }
        let pairs: Vec<(ResourceId, K::View)> = resources
            .iter()
            .copied()
            .zip(views.iter().cloned())
            .collect();
        self.allocate(&pairs)
    }

    fn allocate(&self, pairs: &[(ResourceId, K::View)]) -> Result<Vec<Descriptor>> {
        let mut guard = self.heap.lock();
        let heap = guard.as_mut().ok_or(Error::UseAfterClear(K::NAME))?;
        let requested = u32::try_from(pairs.len()).unwrap_or(u32::MAX);
        if requested > heap.remaining() {
            warn!(
                "{} heap exhausted: requested {}, {} of {} left",
                K::HEAP,
                requested,
                heap.remaining(),
                heap.info.capacity
            );
            return Err(Error::HeapExhausted {
                kind: K::HEAP,
                requested,
                remaining: heap.remaining(),
                capacity: heap.info.capacity,
            });
        }

        let base = heap.next;
        let info = heap.info;
        let generation = heap.generation;

        let mut descriptors = Vec::with_capacity(pairs.len());
        for (index, (resource, view)) in (base..).zip(pairs) {
            let desc = K::view_desc(*resource, view);
            self.device
                .create_view(info.id, index, &desc)
                .during("CreateView")?;
            descriptors.push(Descriptor {
                heap: info.id,
                index,
                generation,
                kind: desc.kind(),
                resource: *resource,
                cpu: info.cpu_start.offset(index, info.increment),
                gpu: info.gpu_start.map(|gpu| gpu.offset(index, info.increment)),
                increment: info.increment,
            });
        }
        heap.next = base + requested;
        trace!("{} heap: allocated [{}, {})", K::HEAP, base, heap.next);
        Ok(descriptors)
    }

    /// Rewind the bump offset to zero. Every descriptor handed out so far
    /// becomes stale, see [`validate`](Self::validate).
    pub fn reset(&self) -> Result<()> {
        let mut guard = self.heap.lock();
        let heap = guard.as_mut().ok_or(Error::UseAfterClear(K::NAME))?;
        debug!("Resetting {} heap ({} descriptors dropped)", K::HEAP, heap.next);
        heap.next = 0;
        heap.generation += 1;
        Ok(())
    }

    /// Check that `descriptor` came from this heap since its last reset.
    pub fn validate(&self, descriptor: &Descriptor) -> Result<()> {
        let guard = self.heap.lock();
        let heap = guard.as_ref().ok_or(Error::UseAfterClear(K::NAME))?;
        if descriptor.heap != heap.info.id || descriptor.generation != heap.generation {
            return Err(Error::StaleDescriptor {
                heap: descriptor.heap,
                index: descriptor.index,
            });
        }
        Ok(())
    }

    pub fn capacity(&self) -> Result<u32> {
        Ok(self.heap_info()?.capacity)
    }

    pub fn allocated(&self) -> Result<u32> {
        let guard = self.heap.lock();
        let heap = guard.as_ref().ok_or(Error::UseAfterClear(K::NAME))?;
        Ok(heap.next)
    }

    pub fn remaining(&self) -> Result<u32> {
        let guard = self.heap.lock();
        let heap = guard.as_ref().ok_or(Error::UseAfterClear(K::NAME))?;
        Ok(heap.remaining())
    }

    pub fn heap_info(&self) -> Result<DescriptorHeapInfo> {
        let guard = self.heap.lock();
        let heap = guard.as_ref().ok_or(Error::UseAfterClear(K::NAME))?;
        Ok(heap.info)
    }

    /// Release the heap. Further calls fail with [`Error::UseAfterClear`].
    pub fn clear(&self) -> Result<u32> {
        let heap = self.heap
            .lock()
            .take()
            .ok_or(Error::UseAfterClear(K::NAME))?;
        self.device
            .release(DeviceObject::DescriptorHeap(heap.info.id));
        debug!("Released {} heap {}", K::HEAP, heap.info.id);
        Ok(heap.next)
    }
}
