//! Scoring of physical devices against a surface.
//!
//! The scoring works on a plain snapshot of what a device reports, so the
//! policy can be exercised without a GPU. `GfxSystem` builds the snapshot from
//! Vulkan queries and picks the device with the highest score.

use crate::atlas::{glyph, image};
use ash::vk;
use std::ffi::CStr;
use tracing::debug;

/// Device extensions every candidate must expose.
pub fn required_device_extensions() -> [&'static CStr; 5] {
    [
        ash::extensions::khr::Swapchain::name(),
        vk::KhrGetMemoryRequirements2Fn::name(),
        vk::KhrMaintenance3Fn::name(),
        vk::KhrImageFormatListFn::name(),
        vk::ExtDescriptorIndexingFn::name(),
    ]
}

/// Features the pipelines rely on. Robust buffer access is only requested in
/// debug builds.
pub fn required_features() -> vk::PhysicalDeviceFeatures {
    vk::PhysicalDeviceFeatures {
        robust_buffer_access: if cfg!(debug_assertions) { vk::TRUE } else { vk::FALSE },
        dual_src_blend: vk::TRUE,
        shader_sampled_image_array_dynamic_indexing: vk::TRUE,
        ..Default::default()
    }
}

/// The subset of `vk::PhysicalDeviceLimits` the renderer depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceLimits {
    pub max_image_dimension_2d: u32,
    pub max_per_stage_descriptor_sampled_images: u32,
}

impl DeviceLimits {
    pub fn required() -> Self {
        Self {
            max_image_dimension_2d: image::ATLAS_IMAGE_SIZE.max(glyph::ATLAS_IMAGE_SIZE),
            max_per_stage_descriptor_sampled_images: glyph::ATLAS_MAX_IMAGES as u32,
        }
    }

    pub fn from_vk(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            max_image_dimension_2d: limits.max_image_dimension2_d,
            max_per_stage_descriptor_sampled_images: limits.max_per_stage_descriptor_sampled_images,
        }
    }

    fn satisfies(&self, required: &DeviceLimits) -> bool {
        self.max_image_dimension_2d >= required.max_image_dimension_2d
            && self.max_per_stage_descriptor_sampled_images >= required.max_per_stage_descriptor_sampled_images
    }
}

/// What a queue family can do, with presentation checked against one surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueFamilyCapabilities {
    pub graphics: bool,
    pub compute: bool,
    pub present: bool,
}

/// Snapshot of a physical device as seen from one surface.
#[derive(Debug, Clone)]
pub struct DeviceCapabilities {
    pub name: String,
    pub device_type: vk::PhysicalDeviceType,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
    pub limits: DeviceLimits,
    pub queue_families: Vec<QueueFamilyCapabilities>,
    pub surface_formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Result of scoring a device. A `total` of -1 means the device cannot be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceScore {
    pub total: i64,
    pub surface_format: Option<vk::SurfaceFormatKHR>,
    pub present_mode: Option<vk::PresentModeKHR>,
}

impl DeviceScore {
    pub const DISQUALIFIED: DeviceScore = DeviceScore {
        total: -1,
        surface_format: None,
        present_mode: None,
    };

    pub fn is_usable(&self) -> bool {
        self.total > 0
    }
}

pub fn surface_format_score(format: &vk::SurfaceFormatKHR, allow_hdr: bool) -> i64 {
    let mut score = match format.color_space {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => 1,
        vk::ColorSpaceKHR::EXTENDED_SRGB_NONLINEAR_EXT => 10,
        _ => 0,
    };

    score += match format.format {
        vk::Format::R16G16B16A16_SFLOAT if allow_hdr => 12,
        vk::Format::R16G16B16_SFLOAT if allow_hdr => 11,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R16G16B16_SFLOAT => -100,
        vk::Format::A2B10G10R10_UNORM_PACK32 | vk::Format::A2R10G10B10_UNORM_PACK32 => -100,
        vk::Format::R8G8B8A8_SRGB | vk::Format::B8G8R8A8_SRGB => 4,
        vk::Format::R8G8B8_SRGB | vk::Format::B8G8R8_SRGB => 3,
        vk::Format::R8G8B8A8_UNORM | vk::Format::B8G8R8A8_UNORM => 2,
        vk::Format::R8G8B8_UNORM | vk::Format::B8G8R8_UNORM => 1,
        _ => -100,
    };
    score
}

/// FIFO is preferred since it never tears and paces the UI to the display.
pub fn present_mode_score(mode: vk::PresentModeKHR) -> Option<i64> {
    match mode {
        vk::PresentModeKHR::FIFO => Some(3),
        vk::PresentModeKHR::FIFO_RELAXED => Some(2),
        vk::PresentModeKHR::MAILBOX | vk::PresentModeKHR::IMMEDIATE => Some(1),
        _ => None,
    }
}

pub fn best_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    allow_hdr: bool,
) -> Option<(vk::SurfaceFormatKHR, i64)> {
    formats
        .iter()
        .map(|f| (*f, surface_format_score(f, allow_hdr)))
        .fold(None, |best, candidate| match best {
            Some((_, best_score)) if best_score >= candidate.1 => best,
            _ => Some(candidate),
        })
}

pub fn best_present_mode(modes: &[vk::PresentModeKHR]) -> Option<(vk::PresentModeKHR, i64)> {
    modes
        .iter()
        .filter_map(|m| present_mode_score(*m).map(|s| (*m, s)))
        .fold(None, |best, candidate| match best {
            Some((_, best_score)) if best_score >= candidate.1 => best,
            _ => Some(candidate),
        })
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> i64 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 4,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 3,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        _ => 1,
    }
}

fn has_features(available: &vk::PhysicalDeviceFeatures, required: &vk::PhysicalDeviceFeatures) -> bool {
    let needs = |req: vk::Bool32, avail: vk::Bool32| req == vk::FALSE || avail == vk::TRUE;
    needs(required.robust_buffer_access, available.robust_buffer_access)
        && needs(required.dual_src_blend, available.dual_src_blend)
        && needs(
            required.shader_sampled_image_array_dynamic_indexing,
            available.shader_sampled_image_array_dynamic_indexing,
        )
        && needs(required.independent_blend, available.independent_blend)
        && needs(required.sampler_anisotropy, available.sampler_anisotropy)
        && needs(required.shader_int16, available.shader_int16)
}

/// Scores a device for a surface, see `DeviceScore`.
pub fn score(caps: &DeviceCapabilities, allow_hdr: bool) -> DeviceScore {
    for required in required_device_extensions() {
        let required = required.to_string_lossy();
        if !caps.extensions.iter().any(|e| *e == required) {
            debug!("{}: missing required extension {}", caps.name, required);
            return DeviceScore::DISQUALIFIED;
        }
    }

    if !has_features(&caps.features, &required_features()) {
        debug!("{}: missing required features", caps.name);
        return DeviceScore::DISQUALIFIED;
    }

    if !caps.limits.satisfies(&DeviceLimits::required()) {
        debug!("{}: limits too small: {:?}", caps.name, caps.limits);
        return DeviceScore::DISQUALIFIED;
    }

    // Rendering and presenting happen on one queue.
    if !caps.queue_families.iter().any(|q| q.graphics && q.present) {
        debug!("{}: no queue family can both draw and present to the surface", caps.name);
        return DeviceScore::DISQUALIFIED;
    }

    let mut total = 10;
    if caps.queue_families.iter().any(|q| q.compute) {
        total += 1;
    }

    let Some((surface_format, format_score)) = best_surface_format(&caps.surface_formats, allow_hdr) else {
        debug!("{}: surface reports no formats", caps.name);
        return DeviceScore::DISQUALIFIED;
    };
    if format_score <= 0 {
        debug!("{}: no usable surface format (best {:?})", caps.name, surface_format);
        return DeviceScore::DISQUALIFIED;
    }
    total += format_score;

    let Some((present_mode, mode_score)) = best_present_mode(&caps.present_modes) else {
        debug!("{}: no usable present mode", caps.name);
        return DeviceScore::DISQUALIFIED;
    };
    total += mode_score;

    total += device_type_score(caps.device_type);

    debug!(
        "{}: score {} (format {:?}/{:?}, present mode {:?})",
        caps.name, total, surface_format.format, surface_format.color_space, present_mode
    );
    DeviceScore {
        total,
        surface_format: Some(surface_format),
        present_mode: Some(present_mode),
    }
}

/// Scores a device whose drawing and presenting queue family is already
/// fixed, as for a logical device created for another surface. The device is
/// unusable when that family cannot present to this surface.
pub fn score_with_queue_family(caps: &DeviceCapabilities, allow_hdr: bool, family: usize) -> DeviceScore {
    let fits = caps.queue_families.get(family).map_or(false, |q| q.graphics && q.present);
    if !fits {
        debug!("{}: queue family {} cannot present to the surface", caps.name, family);
        return DeviceScore::DISQUALIFIED;
    }
    score(caps, allow_hdr)
}

/// Linear scan for the highest score. Candidates that score zero or less are
/// never returned.
pub fn select_best<T>(candidates: impl IntoIterator<Item = (T, DeviceScore)>) -> Option<(T, DeviceScore)> {
    let mut best: Option<(T, DeviceScore)> = None;
    for (candidate, score) in candidates {
        if best.as_ref().map_or(true, |(_, b)| score.total > b.total) {
            best = Some((candidate, score));
        }
    }
    best.filter(|(_, s)| s.is_usable())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable_device() -> DeviceCapabilities {
        DeviceCapabilities {
            name: "test-gpu".to_string(),
            device_type: vk::PhysicalDeviceType::INTEGRATED_GPU,
            extensions: required_device_extensions()
                .iter()
                .map(|e| e.to_string_lossy().into_owned())
                .collect(),
            features: vk::PhysicalDeviceFeatures {
                robust_buffer_access: vk::TRUE,
                dual_src_blend: vk::TRUE,
                shader_sampled_image_array_dynamic_indexing: vk::TRUE,
                ..Default::default()
            },
            limits: DeviceLimits {
                max_image_dimension_2d: 16384,
                max_per_stage_descriptor_sampled_images: 1 << 20,
            },
            queue_families: vec![QueueFamilyCapabilities { graphics: true, compute: true, present: true }],
            surface_formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        }
    }

    #[test]
    fn capable_device_scores_positive() {
        let s = score(&capable_device(), true);
        assert!(s.is_usable());
        assert_eq!(s.present_mode, Some(vk::PresentModeKHR::FIFO));
        // 10 shared queue + 1 compute + 5 format + 3 fifo + 3 integrated
        assert_eq!(s.total, 22);
    }

    #[test]
    fn missing_extension_disqualifies() {
        let mut caps = capable_device();
        caps.extensions.retain(|e| !e.contains("descriptor_indexing"));
        assert_eq!(score(&caps, true), DeviceScore::DISQUALIFIED);
    }

    #[test]
    fn missing_feature_disqualifies() {
        let mut caps = capable_device();
        caps.features.dual_src_blend = vk::FALSE;
        assert_eq!(score(&caps, true).total, -1);
    }

    #[test]
    fn small_limits_disqualify() {
        let mut caps = capable_device();
        caps.limits.max_per_stage_descriptor_sampled_images = 16;
        assert_eq!(score(&caps, true).total, -1);
    }

    #[test]
    fn split_graphics_and_present_queues_disqualify() {
        let mut caps = capable_device();
        caps.queue_families = vec![
            QueueFamilyCapabilities { graphics: true, compute: true, present: false },
            QueueFamilyCapabilities { graphics: false, compute: false, present: true },
        ];
        assert_eq!(score(&caps, true).total, -1);

        caps.queue_families.clear();
        assert_eq!(score(&caps, true).total, -1);
    }

    #[test]
    fn fixed_queue_family_must_present_to_the_surface() {
        let mut caps = capable_device();
        caps.queue_families = vec![
            QueueFamilyCapabilities { graphics: true, compute: true, present: false },
            QueueFamilyCapabilities { graphics: true, compute: false, present: true },
        ];
        // Another family could serve this surface, but not the one already in use.
        assert!(score(&caps, true).is_usable());
        assert_eq!(score_with_queue_family(&caps, true, 0), DeviceScore::DISQUALIFIED);
        assert_eq!(score_with_queue_family(&caps, true, 1), score(&caps, true));
        assert_eq!(score_with_queue_family(&caps, true, 2), DeviceScore::DISQUALIFIED);
    }

    #[test]
    fn only_unusable_formats_or_modes_disqualify() {
        let mut caps = capable_device();
        caps.surface_formats = vec![vk::SurfaceFormatKHR {
            format: vk::Format::A2B10G10R10_UNORM_PACK32,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(score(&caps, true).total, -1);

        let mut caps = capable_device();
        caps.present_modes = vec![vk::PresentModeKHR::SHARED_DEMAND_REFRESH];
        assert_eq!(score(&caps, true).total, -1);
    }

    #[test]
    fn format_preference_is_hdr_then_srgb_then_unorm() {
        let fmt = |format| vk::SurfaceFormatKHR { format, color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR };
        let hdr = surface_format_score(&fmt(vk::Format::R16G16B16A16_SFLOAT), true);
        let srgb = surface_format_score(&fmt(vk::Format::B8G8R8A8_SRGB), true);
        let unorm = surface_format_score(&fmt(vk::Format::B8G8R8A8_UNORM), true);
        assert!(hdr > srgb && srgb > unorm && unorm > 0);
        assert!(surface_format_score(&fmt(vk::Format::R16G16B16A16_SFLOAT), false) <= 0);

        let formats = [fmt(vk::Format::B8G8R8A8_UNORM), fmt(vk::Format::R16G16B16A16_SFLOAT), fmt(vk::Format::B8G8R8A8_SRGB)];
        assert_eq!(best_surface_format(&formats, true).unwrap().0.format, vk::Format::R16G16B16A16_SFLOAT);
        assert_eq!(best_surface_format(&formats, false).unwrap().0.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn present_mode_preference_is_fifo_first() {
        let modes = [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::MAILBOX];
        assert_eq!(best_present_mode(&modes).unwrap().0, vk::PresentModeKHR::FIFO_RELAXED);
    }

    #[test]
    fn discrete_beats_integrated() {
        let integrated = capable_device();
        let mut discrete = capable_device();
        discrete.device_type = vk::PhysicalDeviceType::DISCRETE_GPU;
        let candidates = vec![("integrated", score(&integrated, true)), ("discrete", score(&discrete, true))];
        assert_eq!(select_best(candidates).unwrap().0, "discrete");
    }

    #[test]
    fn select_best_rejects_when_nothing_is_usable() {
        let mut caps = capable_device();
        caps.queue_families.clear();
        assert!(select_best(vec![(0, score(&caps, true))]).is_none());
        assert!(select_best(Vec::<(u32, DeviceScore)>::new()).is_none());
    }
}
