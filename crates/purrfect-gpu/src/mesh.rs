//! Mesh upload and drawing for scene objects.

use crate::command::CommandExecutor;
use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::GpuBuffer;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3};
use std::mem::{offset_of, size_of};

/// Vertex layout shared by every mesh.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: Vec3,
    pub color: Vec3,
    pub uv: Vec2,
    pub normal: Vec3,
}

impl MeshVertex {
    pub fn new(position: Vec3, color: Vec3, uv: Vec2, normal: Vec3) -> Self {
        Self {
            position,
            color,
            uv,
            normal,
        }
    }

    pub fn binding_descriptions() -> Vec<vk::VertexInputBindingDescription> {
        vec![vk::VertexInputBindingDescription {
            binding: 0,
            stride: size_of::<Self>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }]
    }

    pub fn attribute_descriptions() -> Vec<vk::VertexInputAttributeDescription> {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, color)),
            attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
            attribute(3, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
        ]
    }
}

/// Per-object push constants: model and normal matrix.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ModelPush {
    pub model: Mat4,
    pub normal: Mat4,
}

impl ModelPush {
    /// The normal matrix is the inverse transpose of `model`.
    pub fn new(model: Mat4) -> Self {
        Self {
            model,
            normal: model.inverse().transpose(),
        }
    }

    /// Push-constant range pipelines drawing meshes must declare.
    pub fn range() -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX,
            offset: 0,
            size: size_of::<Self>() as u32,
        }
    }
}

/// Upload `data` into a new device-local buffer through a staging buffer.
pub fn upload_buffer<T: Pod>(
    gpu: &GpuContext,
    executor: &mut CommandExecutor,
    usage: vk::BufferUsageFlags,
    data: &[T],
    name: &str,
) -> Result<GpuBuffer> {
    let size = std::mem::size_of_val(data) as u64;
    if size == 0 {
        return Err(GpuError::InvalidState(format!("{name}: nothing to upload")));
    }

    let mut staging = gpu.create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        &format!("{name} staging"),
    )?;

    let result = stage_into_device_local(gpu, executor, &mut staging, usage, data, name);
    gpu.free_buffer(&mut staging)?;
    result
}

fn stage_into_device_local<T: Pod>(
    gpu: &GpuContext,
    executor: &mut CommandExecutor,
    staging: &mut GpuBuffer,
    usage: vk::BufferUsageFlags,
    data: &[T],
    name: &str,
) -> Result<GpuBuffer> {
    staging.map()?.set_data(data)?;

    let mut buffer = gpu.create_buffer(
        staging.size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
        name,
    )?;
    if let Err(e) = buffer.copy_from(executor, staging) {
        gpu.free_buffer(&mut buffer)?;
        return Err(e);
    }
    Ok(buffer)
}

/// Vertex and index buffers of one uploaded mesh.
pub struct Mesh {
    vertices: GpuBuffer,
    indices: GpuBuffer,
    index_count: u32,
}

impl Mesh {
    /// Upload vertex and index data into device-local memory.
    pub fn upload(
        gpu: &GpuContext,
        executor: &mut CommandExecutor,
        vertices: &[MeshVertex],
        indices: &[u32],
    ) -> Result<Self> {
        let mut vertex_buffer = upload_buffer(
            gpu,
            executor,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vertices,
            "mesh vertices",
        )?;
        let index_buffer = match upload_buffer(
            gpu,
            executor,
            vk::BufferUsageFlags::INDEX_BUFFER,
            indices,
            "mesh indices",
        ) {
            Ok(buffer) => buffer,
            Err(e) => {
                gpu.free_buffer(&mut vertex_buffer)?;
                return Err(e);
            }
        };

        tracing::debug!(
            "Mesh uploaded: {} vertices, {} indices",
            vertices.len(),
            indices.len()
        );

        Ok(Self {
            vertices: vertex_buffer,
            indices: index_buffer,
            index_count: indices.len() as u32,
        })
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.vertices.handle()
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.indices.handle()
    }

    /// Push `model` and record an indexed draw of the whole mesh.
    ///
    /// # Safety
    /// `cmd` must be recording with a pipeline bound whose layout is
    /// `layout` and declares [`ModelPush::range`].
    pub unsafe fn draw(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        model: Mat4,
    ) {
        let push = ModelPush::new(model);
        device.cmd_push_constants(
            cmd,
            layout,
            vk::ShaderStageFlags::VERTEX,
            0,
            bytemuck::bytes_of(&push),
        );
        device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertices.handle()], &[0]);
        device.cmd_bind_index_buffer(cmd, self.indices.handle(), 0, vk::IndexType::UINT32);
        device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
    }

    /// Free both buffers.
    ///
    /// # Safety
    /// No pending command buffer may reference the mesh.
    pub unsafe fn destroy(&mut self, gpu: &GpuContext) -> Result<()> {
        gpu.free_buffer(&mut self.vertices)?;
        gpu.free_buffer(&mut self.indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(size_of::<MeshVertex>(), 44);
        let attributes = MeshVertex::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 32]);
        assert_eq!(attributes[2].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(MeshVertex::binding_descriptions()[0].stride, 44);
    }

    #[test]
    fn push_constants_fit_guaranteed_minimum() {
        let range = ModelPush::range();
        assert_eq!(range.size, 128);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn normal_matrix_of_uniform_scale_keeps_direction() {
        let push = ModelPush::new(Mat4::from_scale(Vec3::splat(2.0)));
        let n = push.normal.transform_vector3(Vec3::Y).normalize();
        assert!((n - Vec3::Y).length() < 1e-6);
    }

    #[test]
    fn normal_matrix_of_translation_is_identity_for_vectors() {
        let push = ModelPush::new(Mat4::from_translation(Vec3::new(3.0, -1.0, 8.0)));
        let n = push.normal.transform_vector3(Vec3::X);
        assert!((n - Vec3::X).length() < 1e-6);
    }
}
