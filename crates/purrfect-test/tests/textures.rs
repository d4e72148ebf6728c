use ash::vk;
use purrfect_gpu::{CubemapFaces, GpuError, GpuTexture, TextureData, TextureDesc, CUBE_FACES};
use purrfect_test::{solid_rgba, HeadlessGpu};

#[test]
#[ignore = "requires a Vulkan device"]
fn mipmapped_upload_fills_every_level() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let texels = solid_rgba(4, 4, [40, 80, 120, 255]);
    let desc = TextureDesc::new(4, 4, vk::Format::R8G8B8A8_UNORM).with_mipmaps(true);

    let (ctx, executor) = gpu.split();
    let mut texture = GpuTexture::new(ctx, executor, &desc, TextureData::Rgba8(&texels)).unwrap();
    assert_eq!(texture.mip_levels(), 3);
    assert_eq!(texture.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    for level in 0..3 {
        let image = gpu.read_texture(&texture, level).unwrap();
        let size = 4 >> level;
        assert_eq!(image.dimensions(), (size, size));
        for pixel in image.pixels() {
            for (got, want) in pixel.0.iter().zip([40u8, 80, 120, 255]) {
                assert!(got.abs_diff(want) <= 1, "level {level}: {:?}", pixel.0);
            }
        }
    }

    unsafe { texture.destroy(gpu.gpu()) }.unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn placeholder_is_opaque_white() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let (ctx, executor) = gpu.split();
    let mut texture = GpuTexture::placeholder(ctx, executor).unwrap();

    assert_eq!(texture.extent(), vk::Extent2D { width: 1, height: 1 });
    let image = gpu.read_texture(&texture, 0).unwrap();
    assert_eq!(image.get_pixel(0, 0).0, [255, 255, 255, 255]);

    unsafe { texture.destroy(gpu.gpu()) }.unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn render_target_skips_upload() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let desc = TextureDesc::color_target(64, 32, vk::Format::R8G8B8A8_UNORM);

    let (ctx, executor) = gpu.split();
    let mut texture = GpuTexture::new(ctx, executor, &desc, TextureData::Empty).unwrap();
    assert_eq!(texture.layout(), vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(texture.mip_levels(), 1);
    assert!(texture.sampler().is_some());

    unsafe { texture.destroy(gpu.gpu()) }.unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn transitions_without_a_chain() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let desc = TextureDesc::color_target(16, 16, vk::Format::R8G8B8A8_UNORM)
        .with_target_layout(vk::ImageLayout::UNDEFINED);
    let (ctx, executor) = gpu.split();
    let mut texture = GpuTexture::new(ctx, executor, &desc, TextureData::Empty).unwrap();

    let image = texture.image();
    let format = texture.format();
    let executor = gpu.executor();
    executor
        .transition_image_layout(
            image,
            format,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            1,
            1,
        )
        .unwrap();
    executor
        .transition_image_layout(
            image,
            format,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            1,
            1,
        )
        .unwrap();

    let err = executor
        .transition_image_layout(
            image,
            format,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
            1,
            1,
        )
        .unwrap_err();
    assert!(matches!(err, GpuError::UnsupportedLayoutTransition { .. }));

    unsafe { texture.destroy(gpu.gpu()) }.unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn depth_target_uses_a_supported_format() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let format = gpu.gpu().depth_format().unwrap();
    let desc = TextureDesc::depth_target(32, 32, format);

    let (ctx, executor) = gpu.split();
    let mut texture = GpuTexture::new(ctx, executor, &desc, TextureData::Empty).unwrap();
    assert!(texture.sampler().is_none());
    assert_eq!(
        texture.layout(),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    );

    unsafe { texture.destroy(gpu.gpu()) }.unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn cubemap_faces_land_in_their_layers() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let colors: [[u8; 4]; CUBE_FACES] = [
        [255, 0, 0, 255],
        [0, 255, 0, 255],
        [0, 0, 255, 255],
        [255, 255, 0, 255],
        [0, 255, 255, 255],
        [255, 0, 255, 255],
    ];
    let mut faces = CubemapFaces::new();
    for color in colors {
        faces
            .add_face(TextureData::Rgba8(&solid_rgba(8, 8, color)), 8, 8)
            .unwrap();
    }

    let (ctx, executor) = gpu.split();
    let mut cube =
        GpuTexture::cubemap(ctx, executor, vk::Format::R8G8B8A8_UNORM, &faces).unwrap();
    assert_eq!(cube.layers(), 6);
    assert_eq!(cube.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    assert!(cube.sampler().is_some());

    for (layer, color) in colors.iter().enumerate() {
        let image = gpu.read_texture_layer(&cube, 0, layer as u32).unwrap();
        assert_eq!(image.dimensions(), (8, 8));
        assert!(
            image.pixels().all(|p| p.0 == *color),
            "layer {layer} should be {color:?}"
        );
    }
    assert!(gpu.read_texture_layer(&cube, 0, 6).is_err());

    unsafe { cube.destroy(gpu.gpu()) }.unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn cubemap_with_missing_faces_is_refused() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let mut faces = CubemapFaces::new();
    faces
        .add_face(TextureData::Rgba8(&solid_rgba(4, 4, [0; 4])), 4, 4)
        .unwrap();

    let (ctx, executor) = gpu.split();
    let err = GpuTexture::cubemap(ctx, executor, vk::Format::R8G8B8A8_UNORM, &faces)
        .err()
        .unwrap();
    assert!(matches!(err, GpuError::InvalidState(_)));
}
