//! Image layout transitions.
//!
//! Only the layout pairs listed in [`layout_transition`] are supported. Any
//! other pair is rejected with [`GpuError::UnsupportedLayoutTransition`]
//! instead of falling back to a conservative full barrier.

use crate::error::{GpuError, Result};
use ash::vk;

/// Access and stage masks for one image layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutTransition {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

/// Look up the barrier masks for moving an image from `old` to `new`.
pub fn layout_transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Result<LayoutTransition> {
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    let (src_access, dst_access, src_stage, dst_stage) = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            (A::empty(), A::TRANSFER_WRITE, S::TOP_OF_PIPE, S::TRANSFER)
        }
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::empty(),
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::UNDEFINED, L::PRESENT_SRC_KHR) => {
            (A::empty(), A::empty(), S::TOP_OF_PIPE, S::BOTTOM_OF_PIPE)
        }
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::empty(),
            A::SHADER_READ,
            S::TOP_OF_PIPE,
            S::FRAGMENT_SHADER,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::TRANSFER_WRITE,
            A::COLOR_ATTACHMENT_WRITE,
            S::TRANSFER,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => (
            A::TRANSFER_WRITE,
            A::TRANSFER_READ,
            S::TRANSFER,
            S::TRANSFER,
        ),
        (L::TRANSFER_SRC_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::TRANSFER_READ,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        ),
        (L::COLOR_ATTACHMENT_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => (
            A::COLOR_ATTACHMENT_WRITE,
            A::SHADER_READ,
            S::COLOR_ATTACHMENT_OUTPUT,
            S::FRAGMENT_SHADER,
        ),
        (L::SHADER_READ_ONLY_OPTIMAL, L::COLOR_ATTACHMENT_OPTIMAL) => (
            A::SHADER_READ,
            A::COLOR_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER,
            S::COLOR_ATTACHMENT_OUTPUT,
        ),
        _ => return Err(GpuError::UnsupportedLayoutTransition { old, new }),
    };

    Ok(LayoutTransition {
        src_access,
        dst_access,
        src_stage,
        dst_stage,
    })
}

/// Whether the format carries depth.
pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Whether the format carries a stencil component.
pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Image aspect touched by views and barriers of `format`.
pub fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        if has_stencil_component(format) {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        } else {
            vk::ImageAspectFlags::DEPTH
        }
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Build the image memory barrier for a transition over a mip range of the
/// first `layer_count` array layers.
#[allow(clippy::too_many_arguments)]
pub fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    base_mip_level: u32,
    level_count: u32,
    layer_count: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    transition: &LayoutTransition,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(base_mip_level)
                .level_count(level_count)
                .base_array_layer(0)
                .layer_count(layer_count),
        )
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access)
}

/// Record a table-validated layout transition into `cmd`.
///
/// # Safety
/// The device, command buffer (recording) and image must be valid.
#[allow(clippy::too_many_arguments)]
pub unsafe fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    base_mip_level: u32,
    level_count: u32,
    layer_count: u32,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let transition = layout_transition(old, new)?;
    let barrier = image_barrier(
        image,
        aspect,
        base_mip_level,
        level_count,
        layer_count,
        old,
        new,
        &transition,
    );

    device.cmd_pipeline_barrier(
        cmd,
        transition.src_stage,
        transition.dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::AccessFlags as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags as S;

    fn expect(old: L, new: L, src_access: A, dst_access: A, src_stage: S, dst_stage: S) {
        let got = layout_transition(old, new)
            .unwrap_or_else(|e| panic!("{old:?} -> {new:?} should be supported: {e}"));
        assert_eq!(
            got,
            LayoutTransition {
                src_access,
                dst_access,
                src_stage,
                dst_stage,
            },
            "{old:?} -> {new:?}"
        );
    }

    #[test]
    fn upload_transitions() {
        expect(
            L::UNDEFINED,
            L::TRANSFER_DST_OPTIMAL,
            A::empty(),
            A::TRANSFER_WRITE,
            S::TOP_OF_PIPE,
            S::TRANSFER,
        );
        expect(
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            A::TRANSFER_WRITE,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        );
    }

    #[test]
    fn attachment_transitions() {
        expect(
            L::UNDEFINED,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            A::empty(),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::EARLY_FRAGMENT_TESTS,
        );
        expect(
            L::UNDEFINED,
            L::COLOR_ATTACHMENT_OPTIMAL,
            A::empty(),
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
            S::TOP_OF_PIPE,
            S::COLOR_ATTACHMENT_OUTPUT,
        );
        expect(
            L::TRANSFER_DST_OPTIMAL,
            L::COLOR_ATTACHMENT_OPTIMAL,
            A::TRANSFER_WRITE,
            A::COLOR_ATTACHMENT_WRITE,
            S::TRANSFER,
            S::COLOR_ATTACHMENT_OUTPUT,
        );
        expect(
            L::COLOR_ATTACHMENT_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            A::COLOR_ATTACHMENT_WRITE,
            A::SHADER_READ,
            S::COLOR_ATTACHMENT_OUTPUT,
            S::FRAGMENT_SHADER,
        );
        expect(
            L::SHADER_READ_ONLY_OPTIMAL,
            L::COLOR_ATTACHMENT_OPTIMAL,
            A::SHADER_READ,
            A::COLOR_ATTACHMENT_WRITE,
            S::FRAGMENT_SHADER,
            S::COLOR_ATTACHMENT_OUTPUT,
        );
    }

    #[test]
    fn presentation_and_sampling_from_undefined() {
        expect(
            L::UNDEFINED,
            L::PRESENT_SRC_KHR,
            A::empty(),
            A::empty(),
            S::TOP_OF_PIPE,
            S::BOTTOM_OF_PIPE,
        );
        expect(
            L::UNDEFINED,
            L::SHADER_READ_ONLY_OPTIMAL,
            A::empty(),
            A::SHADER_READ,
            S::TOP_OF_PIPE,
            S::FRAGMENT_SHADER,
        );
    }

    #[test]
    fn mip_chain_transitions() {
        expect(
            L::TRANSFER_DST_OPTIMAL,
            L::TRANSFER_SRC_OPTIMAL,
            A::TRANSFER_WRITE,
            A::TRANSFER_READ,
            S::TRANSFER,
            S::TRANSFER,
        );
        expect(
            L::TRANSFER_SRC_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            A::TRANSFER_READ,
            A::SHADER_READ,
            S::TRANSFER,
            S::FRAGMENT_SHADER,
        );
    }

    #[test]
    fn unlisted_pairs_are_rejected() {
        for (old, new) in [
            (L::PRESENT_SRC_KHR, L::TRANSFER_DST_OPTIMAL),
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR),
            (L::UNDEFINED, L::UNDEFINED),
            (L::GENERAL, L::SHADER_READ_ONLY_OPTIMAL),
            (L::TRANSFER_SRC_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
        ] {
            match layout_transition(old, new) {
                Err(GpuError::UnsupportedLayoutTransition { old: o, new: n }) => {
                    assert_eq!((o, n), (old, new));
                }
                other => panic!("{old:?} -> {new:?} should be rejected, got {other:?}"),
            }
        }
    }

    #[test]
    fn depth_aspects() {
        assert_eq!(
            aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_mask(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert!(has_stencil_component(vk::Format::D32_SFLOAT_S8_UINT));
        assert!(!has_stencil_component(vk::Format::D32_SFLOAT));
    }

    #[test]
    fn barrier_covers_requested_mip_range() {
        let transition =
            layout_transition(L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL).unwrap();
        let barrier = image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            2,
            1,
            1,
            L::TRANSFER_DST_OPTIMAL,
            L::TRANSFER_SRC_OPTIMAL,
            &transition,
        );
        assert_eq!(barrier.subresource_range.base_mip_level, 2);
        assert_eq!(barrier.subresource_range.level_count, 1);
        assert_eq!(barrier.subresource_range.layer_count, 1);
        assert_eq!(barrier.src_access_mask, A::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access_mask, A::TRANSFER_READ);
        assert_eq!(barrier.old_layout, L::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn cube_barrier_spans_all_faces() {
        let transition =
            layout_transition(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).unwrap();
        let barrier = image_barrier(
            vk::Image::null(),
            vk::ImageAspectFlags::COLOR,
            0,
            1,
            6,
            L::UNDEFINED,
            L::TRANSFER_DST_OPTIMAL,
            &transition,
        );
        assert_eq!(barrier.subresource_range.base_array_layer, 0);
        assert_eq!(barrier.subresource_range.layer_count, 6);
    }
}
