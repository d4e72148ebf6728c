use ash::vk;
use purrfect_gpu::mesh::upload_buffer;
use purrfect_gpu::GpuError;
use purrfect_test::HeadlessGpu;

#[test]
#[ignore = "requires a Vulkan device"]
fn host_buffer_round_trip() {
    let gpu = HeadlessGpu::new().unwrap();
    let data: Vec<u32> = (0..64).collect();

    let mut buffer = gpu
        .host_buffer(256, vk::BufferUsageFlags::UNIFORM_BUFFER, "round trip")
        .unwrap();
    buffer.map().unwrap().set_data(&data).unwrap();

    let mapping = buffer.map().unwrap();
    let read: &[u32] = bytemuck::cast_slice(mapping.read());
    assert_eq!(read, data.as_slice());
    drop(mapping);

    gpu.gpu().free_buffer(&mut buffer).unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn staged_upload_lands_in_device_memory() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let data: Vec<f32> = (0..32).map(|i| i as f32 * 0.5).collect();

    let (ctx, executor) = gpu.split();
    let mut buffer = upload_buffer(
        ctx,
        executor,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_SRC,
        &data,
        "staged",
    )
    .unwrap();
    assert!(!buffer.is_host_visible());

    let bytes = gpu.download(&buffer).unwrap();
    assert_eq!(bytemuck::pod_collect_to_vec::<u8, f32>(&bytes), data);

    gpu.gpu().free_buffer(&mut buffer).unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn set_data_rejects_wrong_size() {
    let gpu = HeadlessGpu::new().unwrap();
    let mut buffer = gpu
        .host_buffer(16, vk::BufferUsageFlags::UNIFORM_BUFFER, "sized")
        .unwrap();

    let err = buffer.map().unwrap().set_data(&[0u8; 8]).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));

    gpu.gpu().free_buffer(&mut buffer).unwrap();
}

#[test]
#[ignore = "requires a Vulkan device"]
fn copy_between_unequal_buffers_is_rejected() {
    let mut gpu = HeadlessGpu::new().unwrap();
    let mut src = gpu
        .host_buffer(64, vk::BufferUsageFlags::TRANSFER_SRC, "src")
        .unwrap();
    let mut dst = gpu
        .host_buffer(32, vk::BufferUsageFlags::TRANSFER_DST, "dst")
        .unwrap();

    let err = dst.copy_from(gpu.executor(), &src).unwrap_err();
    assert!(matches!(err, GpuError::InvalidState(_)));

    gpu.gpu().free_buffer(&mut src).unwrap();
    gpu.gpu().free_buffer(&mut dst).unwrap();
}
