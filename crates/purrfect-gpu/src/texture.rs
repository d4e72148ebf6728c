//! Sampled textures and render targets.

use crate::command::{mip_level_count, CommandExecutor};
use crate::context::GpuContext;
use crate::descriptors::{DescriptorLayout, DescriptorPool, DescriptorSetId};
use crate::error::{GpuError, Result, VkResultExt};
use crate::memory::{GpuBuffer, GpuImage};
use crate::transition::aspect_mask;
use ash::vk;

/// Pixel source for a texture.
#[derive(Debug, Clone, Copy)]
pub enum TextureData<'a> {
    /// 8-bit RGBA texels, tightly packed.
    Rgba8(&'a [u8]),
    /// 32-bit float RGBA texels, tightly packed (HDR sources).
    Rgba32F(&'a [f32]),
    /// No upload; the image is a render target.
    Empty,
}

impl TextureData<'_> {
    fn bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Rgba8(bytes) => Some(*bytes),
            Self::Rgba32F(floats) => Some(bytemuck::cast_slice(*floats)),
            Self::Empty => None,
        }
    }
}

/// Texture creation parameters.
#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    /// Layout the image is left in once creation finishes.
    pub target_layout: vk::ImageLayout,
    /// Generate a full mip chain from the uploaded level.
    pub mipmaps: bool,
    /// Use the device's highest usable sample count.
    pub msaa: bool,
    /// Usage on top of what uploads and sampling need.
    pub usage: vk::ImageUsageFlags,
    /// Create a sampler alongside the view.
    pub sampled: bool,
    /// Six square layers viewed as a cube.
    pub cube: bool,
    pub name: String,
}

impl TextureDesc {
    /// Sampled texture left in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn new(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            target_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            mipmaps: false,
            msaa: false,
            usage: vk::ImageUsageFlags::empty(),
            sampled: true,
            cube: false,
            name: "texture".to_string(),
        }
    }

    /// Sampled cube texture; pixel data holds the six faces back to back.
    pub fn cubemap(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            cube: true,
            name: "cubemap".to_string(),
            ..Self::new(width, height, format)
        }
    }

    /// Color render target that can later be sampled.
    pub fn color_target(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            target_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
            name: "color target".to_string(),
            ..Self::new(width, height, format)
        }
    }

    /// Depth attachment without a sampler.
    pub fn depth_target(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            target_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            sampled: false,
            name: "depth target".to_string(),
            ..Self::new(width, height, format)
        }
    }

    pub fn with_mipmaps(mut self, mipmaps: bool) -> Self {
        self.mipmaps = mipmaps;
        self
    }

    pub fn with_msaa(mut self, msaa: bool) -> Self {
        self.msaa = msaa;
        self
    }

    pub fn with_target_layout(mut self, layout: vk::ImageLayout) -> Self {
        self.target_layout = layout;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Array layers of the image: six for a cube, otherwise one.
    pub fn layer_count(&self) -> u32 {
        if self.cube {
            CUBE_FACES as u32
        } else {
            1
        }
    }
}

/// Faces in a cube image.
pub const CUBE_FACES: usize = 6;

enum FaceTexels {
    Rgba8(Vec<u8>),
    Rgba32F(Vec<f32>),
}

/// The six faces of a cube texture, collected one at a time.
///
/// Faces are stored in the order added, which is the Vulkan layer order
/// (+X, -X, +Y, -Y, +Z, -Z). Every face must share the first face's size
/// and texel type.
#[derive(Default)]
pub struct CubemapFaces {
    extent: Option<(u32, u32)>,
    count: usize,
    texels: Option<FaceTexels>,
}

impl CubemapFaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next face.
    pub fn add_face(&mut self, data: TextureData<'_>, width: u32, height: u32) -> Result<()> {
        if self.count >= CUBE_FACES {
            return Err(GpuError::InvalidState(format!(
                "Cubemap already has {CUBE_FACES} faces"
            )));
        }
        if let Some((w, h)) = self.extent {
            if (w, h) != (width, height) {
                return Err(GpuError::InvalidState(format!(
                    "Cubemap face {} is {width}x{height}, expected {w}x{h}",
                    self.count
                )));
            }
        }

        let texels = u64::from(width) * u64::from(height) * 4;
        let (given, unit) = match data {
            TextureData::Rgba8(bytes) => (bytes.len() as u64, "bytes"),
            TextureData::Rgba32F(floats) => (floats.len() as u64, "floats"),
            TextureData::Empty => {
                return Err(GpuError::InvalidState(
                    "Cubemap faces need pixel data".to_string(),
                ))
            }
        };
        if given != texels {
            return Err(GpuError::InvalidState(format!(
                "Cubemap face {} has {given} {unit}, expected {texels}",
                self.count
            )));
        }

        self.texels = match (self.texels.take(), data) {
            (None, TextureData::Rgba8(bytes)) => Some(FaceTexels::Rgba8(bytes.to_vec())),
            (None, TextureData::Rgba32F(floats)) => Some(FaceTexels::Rgba32F(floats.to_vec())),
            (Some(FaceTexels::Rgba8(mut all)), TextureData::Rgba8(bytes)) => {
                all.extend_from_slice(bytes);
                Some(FaceTexels::Rgba8(all))
            }
            (Some(FaceTexels::Rgba32F(mut all)), TextureData::Rgba32F(floats)) => {
                all.extend_from_slice(floats);
                Some(FaceTexels::Rgba32F(all))
            }
            (previous, _) => {
                self.texels = previous;
                return Err(GpuError::InvalidState(format!(
                    "Cubemap face {} mixes 8-bit and float texels",
                    self.count
                )));
            }
        };

        self.extent = Some((width, height));
        self.count += 1;
        Ok(())
    }

    pub fn face_count(&self) -> usize {
        self.count
    }

    /// Size shared by every face.
    pub fn extent(&self) -> Option<(u32, u32)> {
        self.extent
    }

    /// All six faces as one pixel source.
    pub fn data(&self) -> Result<TextureData<'_>> {
        if self.count != CUBE_FACES {
            return Err(GpuError::InvalidState(format!(
                "Cubemap has {} of {CUBE_FACES} faces",
                self.count
            )));
        }
        match &self.texels {
            Some(FaceTexels::Rgba8(bytes)) => Ok(TextureData::Rgba8(bytes)),
            Some(FaceTexels::Rgba32F(floats)) => Ok(TextureData::Rgba32F(floats)),
            None => Ok(TextureData::Empty),
        }
    }
}

/// Bytes per texel for formats that accept uploads.
pub fn texel_size(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Mip levels actually created for a description at a sample count.
///
/// Multisampled images only ever have one level.
pub fn planned_mip_levels(desc: &TextureDesc, samples: vk::SampleCountFlags) -> u32 {
    if desc.mipmaps && samples == vk::SampleCountFlags::TYPE_1 {
        mip_level_count(desc.width, desc.height)
    } else {
        1
    }
}

/// Image usage needed for a description.
pub fn planned_usage(desc: &TextureDesc, uploads: bool, mip_levels: u32) -> vk::ImageUsageFlags {
    let mut usage = desc.usage;
    if desc.sampled {
        usage |= vk::ImageUsageFlags::SAMPLED;
    }
    if uploads {
        usage |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if mip_levels > 1 {
        usage |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    usage
}

/// Check that a description and pixel source can be realised together.
pub fn validate(
    desc: &TextureDesc,
    data: &TextureData<'_>,
    samples: vk::SampleCountFlags,
) -> Result<()> {
    if desc.width == 0 || desc.height == 0 {
        return Err(GpuError::InvalidState(format!(
            "Texture '{}' has a zero extent",
            desc.name
        )));
    }
    if desc.cube {
        if desc.width != desc.height {
            return Err(GpuError::InvalidState(format!(
                "Cubemap '{}' faces must be square, got {}x{}",
                desc.name, desc.width, desc.height
            )));
        }
        if samples != vk::SampleCountFlags::TYPE_1 || desc.mipmaps {
            return Err(GpuError::InvalidState(format!(
                "Cubemap '{}' must be single-sampled with one mip level",
                desc.name
            )));
        }
    }

    let Some(bytes) = data.bytes() else {
        return Ok(());
    };

    if samples != vk::SampleCountFlags::TYPE_1 {
        return Err(GpuError::InvalidState(format!(
            "Texture '{}': multisampled images cannot be uploaded",
            desc.name
        )));
    }
    if desc.mipmaps && desc.target_layout != vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
        return Err(GpuError::InvalidState(format!(
            "Texture '{}': mip generation ends in SHADER_READ_ONLY_OPTIMAL, not {:?}",
            desc.name, desc.target_layout
        )));
    }

    let texel = texel_size(desc.format).ok_or(GpuError::UnsupportedFormat {
        format: desc.format,
        feature: "pixel uploads",
    })?;
    let expected =
        u64::from(desc.width) * u64::from(desc.height) * texel * u64::from(desc.layer_count());
    if bytes.len() as u64 != expected {
        return Err(GpuError::InvalidState(format!(
            "Texture '{}' expects {} bytes of pixel data, got {}",
            desc.name,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

/// Image, view and optional sampler created together.
pub struct GpuTexture {
    image: GpuImage,
    view: vk::ImageView,
    sampler: Option<vk::Sampler>,
    layout: vk::ImageLayout,
    descriptor: Option<DescriptorSetId>,
}

impl GpuTexture {
    /// Create a texture, uploading `data` through a staging buffer when given.
    ///
    /// With pixel data the image goes `UNDEFINED -> TRANSFER_DST`, receives
    /// the copy, then either gets its mip chain generated or is moved to the
    /// target layout. Without pixel data it moves straight from `UNDEFINED`
    /// to the target layout.
    pub fn new(
        gpu: &GpuContext,
        executor: &mut CommandExecutor,
        desc: &TextureDesc,
        data: TextureData<'_>,
    ) -> Result<Self> {
        let samples = if desc.msaa {
            gpu.capabilities().max_msaa_samples
        } else {
            vk::SampleCountFlags::TYPE_1
        };
        validate(desc, &data, samples)?;

        let mip_levels = planned_mip_levels(desc, samples);
        let usage = planned_usage(desc, data.bytes().is_some(), mip_levels);

        let flags = if desc.cube {
            vk::ImageCreateFlags::CUBE_COMPATIBLE
        } else {
            vk::ImageCreateFlags::empty()
        };
        let image_info = vk::ImageCreateInfo::default()
            .flags(flags)
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(mip_levels)
            .array_layers(desc.layer_count())
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut image = gpu.create_image(&image_info, &desc.name)?;

        let prepared = match data.bytes() {
            Some(bytes) => upload(gpu, executor, &image, desc, bytes),
            None if desc.target_layout != vk::ImageLayout::UNDEFINED => executor
                .transition_image_layout(
                    image.image,
                    desc.format,
                    vk::ImageLayout::UNDEFINED,
                    desc.target_layout,
                    mip_levels,
                    desc.layer_count(),
                ),
            None => Ok(()),
        };
        if let Err(e) = prepared {
            gpu.free_image(&mut image)?;
            return Err(e);
        }

        let view = match unsafe { create_view(gpu.device(), &image, desc.cube) } {
            Ok(view) => view,
            Err(e) => {
                gpu.free_image(&mut image)?;
                return Err(e);
            }
        };
        let sampler = if desc.sampled {
            match unsafe { create_sampler(gpu.device(), mip_levels) } {
                Ok(sampler) => Some(sampler),
                Err(e) => {
                    unsafe { gpu.device().destroy_image_view(view, None) };
                    gpu.free_image(&mut image)?;
                    return Err(e);
                }
            }
        } else {
            None
        };

        tracing::debug!(
            "Created texture '{}' {}x{}x{} {:?} ({} mips, {:?})",
            desc.name,
            desc.width,
            desc.height,
            desc.layer_count(),
            desc.format,
            mip_levels,
            samples
        );

        Ok(Self {
            image,
            view,
            sampler,
            layout: desc.target_layout,
            descriptor: None,
        })
    }

    /// Opaque white 1x1 texture used when a material has no image bound.
    pub fn placeholder(gpu: &GpuContext, executor: &mut CommandExecutor) -> Result<Self> {
        let desc = TextureDesc::new(1, 1, vk::Format::R8G8B8A8_SRGB).named("placeholder");
        Self::new(gpu, executor, &desc, TextureData::Rgba8(&[255, 255, 255, 255]))
    }

    /// Upload six collected faces as a sampled cube texture.
    pub fn cubemap(
        gpu: &GpuContext,
        executor: &mut CommandExecutor,
        format: vk::Format,
        faces: &CubemapFaces,
    ) -> Result<Self> {
        let data = faces.data()?;
        let (width, height) = faces.extent().unwrap_or_default();
        let desc = TextureDesc::cubemap(width, height, format);
        Self::new(gpu, executor, &desc, data)
    }

    /// Allocate a descriptor set from `pool` with this texture written at
    /// binding 0, and remember it.
    pub fn register_descriptor(
        &mut self,
        device: &ash::Device,
        pool: &mut DescriptorPool,
        layout: &DescriptorLayout,
    ) -> Result<DescriptorSetId> {
        let sampler = self.sampler.ok_or_else(|| {
            GpuError::InvalidState("Texture has no sampler to register".to_string())
        })?;

        let id = pool.allocate(device, layout)?;
        pool.write_image(device, id, 0, self.view, sampler, self.layout)?;
        self.descriptor = Some(id);
        Ok(id)
    }

    pub fn image(&self) -> vk::Image {
        self.image.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn sampler(&self) -> Option<vk::Sampler> {
        self.sampler
    }

    pub fn format(&self) -> vk::Format {
        self.image.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.image.extent.width,
            height: self.image.extent.height,
        }
    }

    pub fn mip_levels(&self) -> u32 {
        self.image.mip_levels
    }

    pub fn layers(&self) -> u32 {
        self.image.array_layers
    }

    pub fn samples(&self) -> vk::SampleCountFlags {
        self.image.samples
    }

    /// Layout the image was left in after creation.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Descriptor set registered for this texture, if any.
    pub fn descriptor(&self) -> Option<DescriptorSetId> {
        self.descriptor
    }

    /// Destroy sampler, view and image.
    ///
    /// A registered descriptor set stays in its pool.
    ///
    /// # Safety
    /// No submitted command buffer may still reference the texture.
    pub unsafe fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        if let Some(sampler) = self.sampler.take() {
            gpu.device().destroy_sampler(sampler, None);
        }
        gpu.device().destroy_image_view(self.view, None);
        self.view = vk::ImageView::null();
        gpu.free_image(&mut self.image)
    }
}

fn upload(
    gpu: &GpuContext,
    executor: &mut CommandExecutor,
    image: &GpuImage,
    desc: &TextureDesc,
    bytes: &[u8],
) -> Result<()> {
    let mut staging = gpu.create_buffer(
        bytes.len() as u64,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        "texture staging",
    )?;

    let result = record_upload(gpu, executor, image, desc, &mut staging, bytes);
    gpu.free_buffer(&mut staging)?;
    result
}

fn record_upload(
    gpu: &GpuContext,
    executor: &mut CommandExecutor,
    image: &GpuImage,
    desc: &TextureDesc,
    staging: &mut GpuBuffer,
    bytes: &[u8],
) -> Result<()> {
    staging.map()?.set_data(bytes)?;

    executor.transition_image_layout(
        image.image,
        desc.format,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        image.mip_levels,
        image.array_layers,
    )?;
    executor.copy_buffer_to_image(
        staging.buffer,
        image.image,
        desc.width,
        desc.height,
        image.array_layers,
    )?;

    if image.mip_levels > 1 {
        executor.generate_mipmaps(
            gpu,
            image.image,
            desc.format,
            desc.width,
            desc.height,
            image.mip_levels,
        )
    } else {
        executor.transition_image_layout(
            image.image,
            desc.format,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            desc.target_layout,
            1,
            image.array_layers,
        )
    }
}

unsafe fn create_view(device: &ash::Device, image: &GpuImage, cube: bool) -> Result<vk::ImageView> {
    let view_type = if cube {
        vk::ImageViewType::CUBE
    } else {
        vk::ImageViewType::TYPE_2D
    };
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image.image)
        .view_type(view_type)
        .format(image.format)
        .subresource_range(
            vk::ImageSubresourceRange::default()
                .aspect_mask(aspect_mask(image.format))
                .base_mip_level(0)
                .level_count(image.mip_levels)
                .base_array_layer(0)
                .layer_count(image.array_layers),
        );

    device
        .create_image_view(&view_info, None)
        .call("vkCreateImageView")
}

unsafe fn create_sampler(device: &ash::Device, mip_levels: u32) -> Result<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(false)
        .max_anisotropy(1.0)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .min_lod(0.0)
        .max_lod(mip_levels as f32);

    device
        .create_sampler(&sampler_info, None)
        .call("vkCreateSampler")
}
