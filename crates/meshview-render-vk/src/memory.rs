// SPDX-License-Identifier: CEPL-1.0
//! GPU memory ownership on top of `gpu-allocator`.
//!
//! [`StreamBuffer`] is a persistently mapped, host-visible buffer that only
//! ever grows; [`DeviceImage`] is a device-local image with its view. Both
//! free themselves on drop through a shared [`GpuMemory`] handle, which the
//! rendering context outlives.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, ensure, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator};
use gpu_allocator::MemoryLocation;
use tracing::{debug, error};

pub type SharedAllocator = Arc<Mutex<Allocator>>;

/// Over-provisioning factor applied whenever a stream buffer has to grow.
pub const GROWTH_SLACK: u64 = 2;

/// Device and allocator pair every GPU resource frees itself through.
#[derive(Clone)]
pub struct GpuMemory {
    device: ash::Device,
    allocator: SharedAllocator,
}

impl GpuMemory {
    pub fn new(device: ash::Device, allocator: Allocator) -> Self {
        Self {
            device,
            allocator: Arc::new(Mutex::new(allocator)),
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles still held by resources, this one excluded.
    pub fn outstanding(&self) -> usize {
        Arc::strong_count(&self.allocator) - 1
    }

    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> Result<Allocation> {
        self.allocator()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("allocate {} bytes for {name}", requirements.size))
    }

    fn free(&self, allocation: Allocation) {
        if let Err(e) = self.allocator().free(allocation) {
            error!("gpu-allocator free failed: {e}");
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Growth {
    Reused,
    Reallocated { capacity: u64 },
}

impl Growth {
    pub fn reallocated(self) -> bool {
        matches!(self, Growth::Reallocated { .. })
    }
}

/// Capacity decision for a payload of `needed` bytes. A buffer that already
/// fits is kept; otherwise the new one is `needed * GROWTH_SLACK`.
pub fn plan_capacity(current: Option<u64>, needed: u64) -> Growth {
    match current {
        Some(cap) if cap >= needed => Growth::Reused,
        _ => Growth::Reallocated {
            capacity: needed.max(1).saturating_mul(GROWTH_SLACK),
        },
    }
}

/// Drop the value in `slot`, then fill it with `make`. `invalidated` is set
/// before anything is dropped; on error the slot stays empty.
pub fn replace_slot<T>(
    slot: &mut Option<T>,
    invalidated: &mut bool,
    make: impl FnOnce() -> Result<T>,
) -> Result<()> {
    *invalidated = true;
    *slot = None;
    *slot = Some(make()?);
    Ok(())
}

pub struct StreamBuffer {
    mem: GpuMemory,
    raw: vk::Buffer,
    allocation: Option<Allocation>,
    capacity: u64,
}

impl StreamBuffer {
    pub fn new(
        mem: &GpuMemory,
        name: &str,
        usage: vk::BufferUsageFlags,
        capacity: u64,
    ) -> Result<Self> {
        let device = mem.device();
        let info = vk::BufferCreateInfo {
            s_type: vk::StructureType::BUFFER_CREATE_INFO,
            size: capacity,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        unsafe {
            let raw = device
                .create_buffer(&info, None)
                .with_context(|| format!("create_buffer({name}, {capacity})"))?;
            let requirements = device.get_buffer_memory_requirements(raw);
            let allocation = match mem.allocate(name, requirements, MemoryLocation::CpuToGpu, true)
            {
                Ok(a) => a,
                Err(e) => {
                    device.destroy_buffer(raw, None);
                    return Err(e);
                }
            };
            if let Err(e) = device.bind_buffer_memory(raw, allocation.memory(), allocation.offset())
            {
                mem.free(allocation);
                device.destroy_buffer(raw, None);
                return Err(anyhow!("bind_buffer_memory({name}): {e}"));
            }
            Ok(Self {
                mem: mem.clone(),
                raw,
                allocation: Some(allocation),
                capacity,
            })
        }
    }

    /// Make `slot` able to take `needed` bytes, replacing a too small buffer.
    /// The old buffer is released before the new one is created, and
    /// `invalidated` is raised first so commands recorded against it are
    /// never submitted again, even when the replacement fails.
    pub fn ensure(
        slot: &mut Option<Self>,
        invalidated: &mut bool,
        mem: &GpuMemory,
        name: &str,
        usage: vk::BufferUsageFlags,
        needed: u64,
    ) -> Result<Growth> {
        let growth = plan_capacity(slot.as_ref().map(Self::capacity), needed);
        if let Growth::Reallocated { capacity } = growth {
            replace_slot(slot, invalidated, || Self::new(mem, name, usage, capacity))?;
            debug!("{name}: grown to {capacity} bytes for a {needed} byte payload");
        }
        Ok(growth)
    }

    pub fn raw(&self) -> vk::Buffer {
        self.raw
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        ensure!(
            bytes.len() as u64 <= self.capacity,
            "payload of {} bytes exceeds capacity {}",
            bytes.len(),
            self.capacity
        );
        let mapped = self
            .allocation
            .as_mut()
            .and_then(Allocation::mapped_slice_mut)
            .ok_or_else(|| anyhow!("stream buffer memory is not host mapped"))?;
        // CpuToGpu memory is host coherent, no flush
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write<T: bytemuck::Pod>(&mut self, data: &[T]) -> Result<()> {
        self.write_bytes(bytemuck::cast_slice(data))
    }
}

impl Drop for StreamBuffer {
    fn drop(&mut self) {
        unsafe { self.mem.device().destroy_buffer(self.raw, None) };
        if let Some(a) = self.allocation.take() {
            self.mem.free(a);
        }
    }
}

/// Device-local 2D color image plus its view.
pub struct DeviceImage {
    mem: GpuMemory,
    image: vk::Image,
    view: vk::ImageView,
    allocation: Option<Allocation>,
}

impl DeviceImage {
    pub fn new(mem: &GpuMemory, name: &str, info: &vk::ImageCreateInfo<'_>) -> Result<Self> {
        let device = mem.device();
        unsafe {
            let image = device
                .create_image(info, None)
                .with_context(|| format!("create_image({name})"))?;
            let requirements = device.get_image_memory_requirements(image);
            let allocation =
                match mem.allocate(name, requirements, MemoryLocation::GpuOnly, false) {
                    Ok(a) => a,
                    Err(e) => {
                        device.destroy_image(image, None);
                        return Err(e);
                    }
                };
            let mut this = Self {
                mem: mem.clone(),
                image,
                view: vk::ImageView::null(),
                allocation: Some(allocation),
            };
            if let Some(a) = this.allocation.as_ref() {
                device
                    .bind_image_memory(image, a.memory(), a.offset())
                    .with_context(|| format!("bind_image_memory({name})"))?;
            }

            let view_info = vk::ImageViewCreateInfo {
                s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: info.format,
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            this.view = device
                .create_image_view(&view_info, None)
                .with_context(|| format!("create_image_view({name})"))?;
            Ok(this)
        }
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        let device = self.mem.device();
        unsafe {
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            device.destroy_image(self.image, None);
        }
        if let Some(a) = self.allocation.take() {
            self.mem.free(a);
        }
    }
}
