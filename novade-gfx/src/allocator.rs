//! Buffers and images backed by `gpu-allocator`.
//!
//! `MemoryLocation::CpuToGpu` allocations come back persistently mapped and
//! host-coherent, so vertex spans and staging images are written through
//! `mapped_slice_mut` without explicit flushes.

use crate::error::Result;
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc};
use gpu_allocator::MemoryLocation;
use tracing::debug;

pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: &ash::Device,
) -> Result<Allocator> {
    let allocator = Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
    })?;
    debug!("GPU memory allocator created.");
    Ok(allocator)
}

#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub fn new(
        device: &ash::Device,
        allocator: &mut Allocator,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset())? };
        debug!("Buffer '{}' created: {} bytes, usage {:?}, {:?}", name, size, usage, location);
        Ok(Self { buffer, allocation, size })
    }

    /// The persistently mapped bytes of a host-visible buffer.
    pub fn mapped_bytes(&mut self) -> Option<&mut [u8]> {
        self.allocation.mapped_slice_mut()
    }

    pub fn destroy(self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe { device.destroy_buffer(self.buffer, None) };
        if let Err(e) = allocator.free(self.allocation) {
            tracing::warn!("Failed to free buffer allocation: {}", e);
        }
    }
}

#[derive(Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    /// Null for transfer-only images that are never sampled or attached.
    pub view: vk::ImageView,
    pub allocation: Allocation,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

impl GpuImage {
    pub fn new(
        device: &ash::Device,
        allocator: &mut Allocator,
        name: &str,
        create_info: &vk::ImageCreateInfo,
        location: MemoryLocation,
        view_aspect: Option<vk::ImageAspectFlags>,
    ) -> Result<Self> {
        let image = unsafe { device.create_image(create_info, None)? };
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let allocation = match allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: create_info.tiling == vk::ImageTiling::LINEAR,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e.into());
            }
        };
        unsafe { device.bind_image_memory(image, allocation.memory(), allocation.offset())? };

        let view = match view_aspect {
            Some(aspect_mask) => {
                let view_info = vk::ImageViewCreateInfo::builder()
                    .image(image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(create_info.format)
                    .subresource_range(vk::ImageSubresourceRange {
                        aspect_mask,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    });
                unsafe { device.create_image_view(&view_info, None)? }
            }
            None => vk::ImageView::null(),
        };

        debug!(
            "Image '{}' created: {}x{} {:?}, {:?}",
            name, create_info.extent.width, create_info.extent.height, create_info.format, location
        );
        Ok(Self {
            image,
            view,
            allocation,
            format: create_info.format,
            extent: vk::Extent2D {
                width: create_info.extent.width,
                height: create_info.extent.height,
            },
        })
    }

    pub fn mapped_bytes(&mut self) -> Option<&mut [u8]> {
        self.allocation.mapped_slice_mut()
    }

    pub fn destroy(self, device: &ash::Device, allocator: &mut Allocator) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
            }
            device.destroy_image(self.image, None);
        }
        if let Err(e) = allocator.free(self.allocation) {
            tracing::warn!("Failed to free image allocation: {}", e);
        }
    }
}
