// Vertex buffer backed by the device's gpu-allocator
//
// Host-visible memory is enough for a tiny static mesh; the data is written
// once through the persistent mapping at creation.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::{Vertex, VulkanDevice};

pub struct VertexBuffer {
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub vertex_count: u32,
}

impl VertexBuffer {
    pub fn new(device: &Arc<VulkanDevice>, vertices: &[Vertex]) -> Result<Self> {
        let bytes: &[u8] = bytemuck::cast_slice(vertices);

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(bytes.len() as vk::DeviceSize)
            .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .device
                .create_buffer(&buffer_info, None)
                .context("Failed to create vertex buffer")?
        };

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device
            .allocator()
            .allocate(&AllocationCreateDesc {
                name: "vertex buffer",
                requirements,
                location: MemoryLocation::CpuToGpu,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .context("Failed to allocate vertex buffer memory")?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .context("Failed to bind vertex buffer memory")?;
        }

        let mut allocation = allocation;
        allocation
            .mapped_slice_mut()
            .context("Vertex buffer memory is not host-visible")?[..bytes.len()]
            .copy_from_slice(bytes);

        log::debug!("Uploaded {} vertices ({} bytes)", vertices.len(), bytes.len());

        Ok(Self {
            buffer,
            allocation: Some(allocation),
            vertex_count: vertices.len() as u32,
        })
    }

    /// Release the buffer and its memory. Must run before the device is
    /// destroyed; the caller is responsible for GPU idle.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator().free(allocation) {
                log::warn!("Failed to free vertex buffer allocation: {}", e);
            }
        }
        unsafe {
            device.device.destroy_buffer(self.buffer, None);
        }
        self.buffer = vk::Buffer::null();
    }
}
