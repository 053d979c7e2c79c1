// SPDX-License-Identifier: CEPL-1.0
//! Settings negotiation: turn a [`CapabilityDescriptor`] into concrete
//! [`RenderSettings`], or name the first requirement the device misses.
//!
//! Steps run in a fixed order and stop at the first failure:
//! samples, format, usage, transform, composite alpha, present mode, image
//! count.
use ash::vk;
use thiserror::Error;

use crate::capability::CapabilityDescriptor;

/// Present modes in preference order. Immediate over FIFO keeps latency and
/// tearing low when presenting into a surface another toolkit composites.
/// Mailbox is never chosen.
pub const PRESENT_MODE_PREFERENCE: [vk::PresentModeKHR; 2] =
    [vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO];

/// Swapchain image count we aim for before device clamping.
pub const TARGET_IMAGE_COUNT: u32 = 2;

const SAMPLE_PREFERENCE: [vk::SampleCountFlags; 7] = [
    vk::SampleCountFlags::TYPE_64,
    vk::SampleCountFlags::TYPE_32,
    vk::SampleCountFlags::TYPE_16,
    vk::SampleCountFlags::TYPE_8,
    vk::SampleCountFlags::TYPE_4,
    vk::SampleCountFlags::TYPE_2,
    vk::SampleCountFlags::TYPE_1,
];

const FALLBACK_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_UNORM,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum UnmetRequirement {
    #[error("no applicable surface format")]
    SurfaceFormat,
    #[error("color attachment usage unsupported")]
    ImageUsage,
    #[error("opaque composite alpha unsupported")]
    CompositeAlpha,
    #[error("neither immediate nor FIFO present mode supported")]
    PresentMode,
}

/// Caller choices kept when the device still supports them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SettingsPreset {
    pub pre_transform: Option<vk::SurfaceTransformFlagsKHR>,
    pub composite_alpha: Option<vk::CompositeAlphaFlagsKHR>,
    pub min_image_count: Option<u32>,
}

/// Fixed for the lifetime of a rendering context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RenderSettings {
    pub sample_count: vk::SampleCountFlags,
    pub format: vk::SurfaceFormatKHR,
    pub image_usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub min_image_count: u32,
}

pub fn negotiate(
    desc: &CapabilityDescriptor,
    preset: &SettingsPreset,
) -> Result<RenderSettings, UnmetRequirement> {
    let caps = &desc.surface;
    Ok(RenderSettings {
        sample_count: pick_sample_count(desc.color_sample_counts),
        format: pick_format(&desc.formats)?,
        image_usage: pick_usage(caps.supported_usage_flags)?,
        pre_transform: pick_transform(caps, preset.pre_transform),
        composite_alpha: pick_composite_alpha(
            caps.supported_composite_alpha,
            preset.composite_alpha,
        )?,
        present_mode: pick_present_mode(&desc.present_modes)?,
        min_image_count: pick_image_count(
            caps.min_image_count,
            caps.max_image_count,
            preset.min_image_count,
        ),
    })
}

pub fn pick_sample_count(supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    SAMPLE_PREFERENCE
        .into_iter()
        .find(|&s| supported.contains(s))
        .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

pub fn pick_format(
    formats: &[vk::SurfaceFormatKHR],
) -> Result<vk::SurfaceFormatKHR, UnmetRequirement> {
    match formats {
        [] => Err(UnmetRequirement::SurfaceFormat),
        // a lone UNDEFINED means the surface takes any format
        [only] if only.format == vk::Format::UNDEFINED => Ok(FALLBACK_FORMAT),
        [first, ..] => Ok(*first),
    }
}

fn pick_usage(supported: vk::ImageUsageFlags) -> Result<vk::ImageUsageFlags, UnmetRequirement> {
    let usage = vk::ImageUsageFlags::COLOR_ATTACHMENT;
    if supported.contains(usage) {
        Ok(usage)
    } else {
        Err(UnmetRequirement::ImageUsage)
    }
}

fn pick_transform(
    caps: &vk::SurfaceCapabilitiesKHR,
    preset: Option<vk::SurfaceTransformFlagsKHR>,
) -> vk::SurfaceTransformFlagsKHR {
    if let Some(t) = preset.filter(|&t| !t.is_empty() && caps.supported_transforms.contains(t)) {
        return t;
    }
    if caps
        .supported_transforms
        .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
    {
        vk::SurfaceTransformFlagsKHR::IDENTITY
    } else {
        caps.current_transform
    }
}

fn pick_composite_alpha(
    supported: vk::CompositeAlphaFlagsKHR,
    preset: Option<vk::CompositeAlphaFlagsKHR>,
) -> Result<vk::CompositeAlphaFlagsKHR, UnmetRequirement> {
    if let Some(a) = preset.filter(|&a| !a.is_empty() && supported.contains(a)) {
        return Ok(a);
    }
    if supported.contains(vk::CompositeAlphaFlagsKHR::OPAQUE) {
        Ok(vk::CompositeAlphaFlagsKHR::OPAQUE)
    } else {
        Err(UnmetRequirement::CompositeAlpha)
    }
}

pub fn pick_present_mode(
    supported: &[vk::PresentModeKHR],
) -> Result<vk::PresentModeKHR, UnmetRequirement> {
    PRESENT_MODE_PREFERENCE
        .into_iter()
        .find(|m| supported.contains(m))
        .ok_or(UnmetRequirement::PresentMode)
}

/// `max == 0` means the surface has no upper bound.
pub fn pick_image_count(min: u32, max: u32, preset: Option<u32>) -> u32 {
    let within = |n: u32| n >= min && (max == 0 || n <= max);
    if let Some(n) = preset.filter(|&n| n > 0 && within(n)) {
        return n;
    }
    let mut n = TARGET_IMAGE_COUNT;
    if max != 0 && max < n {
        n = max;
    }
    n.max(min)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            current_transform: vk::SurfaceTransformFlagsKHR::ROTATE_90,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY
                | vk::SurfaceTransformFlagsKHR::ROTATE_90,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE
                | vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            ..Default::default()
        }
    }

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor {
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::R8G8B8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                FALLBACK_FORMAT,
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE],
            surface: caps(),
            color_sample_counts: vk::SampleCountFlags::TYPE_1
                | vk::SampleCountFlags::TYPE_2
                | vk::SampleCountFlags::TYPE_4
                | vk::SampleCountFlags::TYPE_8,
            ..Default::default()
        }
    }

    #[test]
    fn every_field_comes_from_the_descriptor() {
        let desc = descriptor();
        let s = negotiate(&desc, &SettingsPreset::default()).unwrap();
        assert!(desc.color_sample_counts.contains(s.sample_count));
        assert!(desc.formats.contains(&s.format));
        assert!(desc.surface.supported_usage_flags.contains(s.image_usage));
        assert!(desc.surface.supported_transforms.contains(s.pre_transform));
        assert!(desc
            .surface
            .supported_composite_alpha
            .contains(s.composite_alpha));
        assert!(desc.present_modes.contains(&s.present_mode));
        assert!(s.min_image_count >= 2 && s.min_image_count <= 3);

        assert_eq!(s.sample_count, vk::SampleCountFlags::TYPE_8);
        assert_eq!(s.format.format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(s.pre_transform, vk::SurfaceTransformFlagsKHR::IDENTITY);
        assert_eq!(s.composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);
    }

    #[test]
    fn missing_color_attachment_short_circuits() {
        let mut desc = descriptor();
        desc.surface.supported_usage_flags = vk::ImageUsageFlags::TRANSFER_DST;
        // later steps would fail too; usage must be the one reported
        desc.surface.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::empty();
        desc.present_modes = vec![vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            negotiate(&desc, &SettingsPreset::default()),
            Err(UnmetRequirement::ImageUsage)
        );
    }

    #[test]
    fn empty_format_list_fails_first() {
        let mut desc = descriptor();
        desc.formats.clear();
        desc.surface.supported_usage_flags = vk::ImageUsageFlags::empty();
        assert_eq!(
            negotiate(&desc, &SettingsPreset::default()),
            Err(UnmetRequirement::SurfaceFormat)
        );
    }

    #[test]
    fn undefined_sole_format_gets_default() {
        let undefined = vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(pick_format(&[undefined]), Ok(FALLBACK_FORMAT));
        // only a lone sentinel is special
        assert_eq!(pick_format(&[undefined, FALLBACK_FORMAT]), Ok(undefined));
    }

    #[test]
    fn present_mode_preference() {
        use vk::PresentModeKHR as M;
        assert_eq!(pick_present_mode(&[M::FIFO, M::MAILBOX]), Ok(M::FIFO));
        assert_eq!(pick_present_mode(&[M::IMMEDIATE, M::FIFO]), Ok(M::IMMEDIATE));
        assert_eq!(
            pick_present_mode(&[M::MAILBOX, M::FIFO_RELAXED]),
            Err(UnmetRequirement::PresentMode)
        );
    }

    #[test]
    fn image_count_clamps() {
        assert_eq!(pick_image_count(2, 3, None), 2);
        assert_eq!(pick_image_count(4, 8, None), 4);
        assert_eq!(pick_image_count(1, 1, None), 1);
        assert_eq!(pick_image_count(1, 0, None), 2);
        assert_eq!(pick_image_count(3, 0, None), 3);
    }

    #[test]
    fn image_count_preset_kept_only_in_bounds() {
        assert_eq!(pick_image_count(2, 8, Some(5)), 5);
        assert_eq!(pick_image_count(2, 0, Some(7)), 7);
        assert_eq!(pick_image_count(2, 3, Some(5)), 2);
        assert_eq!(pick_image_count(2, 3, Some(1)), 2);
        assert_eq!(pick_image_count(2, 3, Some(0)), 2);
    }

    #[test]
    fn presets_respected_when_supported() {
        let desc = descriptor();
        let preset = SettingsPreset {
            pre_transform: Some(vk::SurfaceTransformFlagsKHR::ROTATE_90),
            composite_alpha: Some(vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED),
            min_image_count: Some(3),
        };
        let s = negotiate(&desc, &preset).unwrap();
        assert_eq!(s.pre_transform, vk::SurfaceTransformFlagsKHR::ROTATE_90);
        assert_eq!(s.composite_alpha, vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED);
        assert_eq!(s.min_image_count, 3);
    }

    #[test]
    fn unsupported_presets_fall_back() {
        let mut desc = descriptor();
        desc.surface.supported_transforms = vk::SurfaceTransformFlagsKHR::ROTATE_90;
        let preset = SettingsPreset {
            pre_transform: Some(vk::SurfaceTransformFlagsKHR::ROTATE_180),
            composite_alpha: Some(vk::CompositeAlphaFlagsKHR::INHERIT),
            min_image_count: None,
        };
        let s = negotiate(&desc, &preset).unwrap();
        // no identity either: current transform
        assert_eq!(s.pre_transform, vk::SurfaceTransformFlagsKHR::ROTATE_90);
        assert_eq!(s.composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);
    }

    #[test]
    fn opaque_alpha_required() {
        let mut desc = descriptor();
        desc.surface.supported_composite_alpha = vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED;
        assert_eq!(
            negotiate(&desc, &SettingsPreset::default()),
            Err(UnmetRequirement::CompositeAlpha)
        );
    }

    #[test]
    fn sample_count_falls_back_to_one() {
        assert_eq!(
            pick_sample_count(vk::SampleCountFlags::empty()),
            vk::SampleCountFlags::TYPE_1
        );
        assert_eq!(
            pick_sample_count(vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_64),
            vk::SampleCountFlags::TYPE_64
        );
    }
}
