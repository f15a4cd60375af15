use crate::allocator::GpuImage;
use ash::vk;

/// Access masks and pipeline stages for a layout transition, as
/// `(src_access, dst_access, src_stage, dst_stage)`.
pub fn layout_transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> (vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags) {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    match (old, new) {
        (L::UNDEFINED | L::PREINITIALIZED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::UNDEFINED | L::PREINITIALIZED, L::GENERAL) => (A::empty(), A::HOST_WRITE, S::TOP_OF_PIPE, S::HOST),
        (L::GENERAL | L::PREINITIALIZED, L::TRANSFER_SRC_OPTIMAL) => {
            (A::HOST_WRITE, A::TRANSFER_READ, S::HOST, S::TRANSFER)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::GENERAL) => (A::TRANSFER_READ, A::HOST_WRITE, S::TRANSFER, S::HOST),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::TRANSFER_WRITE, A::SHADER_READ, S::TRANSFER, S::FRAGMENT_SHADER)
        }
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            (A::SHADER_READ, A::TRANSFER_WRITE, S::FRAGMENT_SHADER, S::TRANSFER)
        }
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => {
            (A::empty(), A::SHADER_READ, S::TOP_OF_PIPE, S::FRAGMENT_SHADER)
        }
        (L::UNDEFINED, L::PRESENT_SRC_KHR) => (A::empty(), A::empty(), S::TOP_OF_PIPE, S::BOTTOM_OF_PIPE),
        _ => (
            A::MEMORY_WRITE,
            A::MEMORY_READ | A::MEMORY_WRITE,
            S::ALL_COMMANDS,
            S::ALL_COMMANDS,
        ),
    }
}

/// Records a pipeline barrier moving the color aspect of `image` from `old` to `new`.
pub fn cmd_transition_layout(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let (src_access, dst_access, src_stage, dst_stage) = layout_transition_masks(old, new);
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

/// An atlas or staging image together with the layout it was last moved to.
#[derive(Debug)]
pub struct AtlasTexture {
    pub image: GpuImage,
    pub layout: vk::ImageLayout,
}

impl AtlasTexture {
    pub fn new(image: GpuImage, initial_layout: vk::ImageLayout) -> Self {
        Self { image, layout: initial_layout }
    }

    /// Records a transition to `new` unless the texture is already there.
    pub fn transition(&mut self, device: &ash::Device, command_buffer: vk::CommandBuffer, new: vk::ImageLayout) {
        if self.layout != new {
            cmd_transition_layout(device, command_buffer, self.image.image, self.layout, new);
            self.layout = new;
        }
    }
}

/// Row pitch in texels of a linear, host-mapped image.
pub fn linear_row_pitch(device: &ash::Device, image: vk::Image, texel_size: u64) -> (usize, usize) {
    let layout = unsafe {
        device.get_image_subresource_layout(
            image,
            vk::ImageSubresource {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                array_layer: 0,
            },
        )
    };
    (layout.offset as usize, (layout.row_pitch / texel_size) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_path_waits_on_transfer_before_sampling() {
        let (src, dst, src_stage, dst_stage) =
            layout_transition_masks(vk::ImageLayout::TRANSFER_DST_OPTIMAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn staging_round_trip_hands_memory_back_to_the_host() {
        let (src, dst, _, dst_stage) =
            layout_transition_masks(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, vk::ImageLayout::GENERAL);
        assert_eq!(src, vk::AccessFlags::TRANSFER_READ);
        assert_eq!(dst, vk::AccessFlags::HOST_WRITE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::HOST);
    }

    #[test]
    fn unknown_transitions_use_a_full_barrier() {
        let (_, _, src_stage, dst_stage) = layout_transition_masks(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );
        assert_eq!(src_stage, vk::PipelineStageFlags::ALL_COMMANDS);
        assert_eq!(dst_stage, vk::PipelineStageFlags::ALL_COMMANDS);
    }
}
