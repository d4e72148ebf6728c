//! Descriptor set management.
//!
//! Layouts are built once and never change. A [`DescriptorPool`] is a fixed
//! arena: its capacity is declared up front and it never grows. Sets
//! allocated from it are addressed by [`DescriptorSetId`] and remember the
//! layout bindings they were created against, so writes can be checked.

use crate::error::{GpuError, Result, VkResultExt};
use ash::vk;

/// Descriptor set index conventions shared by every pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SetSlot {
    /// Camera / global uniforms.
    Global = 0,
    /// Material textures.
    Material = 1,
    /// Lights and other storage data.
    Lights = 2,
}

impl SetSlot {
    pub fn index(self) -> u32 {
        self as u32
    }
}

/// One binding of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

/// Descriptor set layout builder.
#[derive(Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<LayoutBinding>,
}

impl DescriptorLayoutBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            descriptor_type,
            count,
            stage_flags,
        });
        self
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
            stage_flags,
        )
    }

    /// Bindings added so far.
    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<DescriptorLayout> {
        let raw: Vec<vk::DescriptorSetLayoutBinding<'_>> = self
            .bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stage_flags)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&raw);
        let handle = device
            .create_descriptor_set_layout(&layout_info, None)
            .call("vkCreateDescriptorSetLayout")?;

        Ok(DescriptorLayout {
            handle,
            bindings: self.bindings,
        })
    }
}

/// Single combined image sampler at binding 0, read by the fragment stage.
pub fn texture_layout() -> DescriptorLayoutBuilder {
    DescriptorLayoutBuilder::new().sampled_image(0, vk::ShaderStageFlags::FRAGMENT)
}

/// Number of texture bindings in a material set.
pub const MATERIAL_TEXTURE_COUNT: u32 = 5;

/// Combined image samplers at bindings `0..5`, read by the fragment stage.
pub fn material_layout() -> DescriptorLayoutBuilder {
    (0..MATERIAL_TEXTURE_COUNT).fold(DescriptorLayoutBuilder::new(), |builder, binding| {
        builder.sampled_image(binding, vk::ShaderStageFlags::FRAGMENT)
    })
}

/// A built descriptor set layout and its binding list.
pub struct DescriptorLayout {
    handle: vk::DescriptorSetLayout,
    bindings: Vec<LayoutBinding>,
}

impl DescriptorLayout {
    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }

    /// Destroy the layout.
    ///
    /// # Safety
    /// No pipeline layout or pending allocation may still use it.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_set_layout(self.handle, None);
    }
}

/// Capacity bookkeeping for a descriptor pool.
///
/// Mirrors the declared pool sizes so exhaustion is reported before the
/// driver is asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolBudget {
    max_sets: u32,
    sets_in_use: u32,
    remaining: Vec<(vk::DescriptorType, u32)>,
}

impl PoolBudget {
    pub fn new(max_sets: u32, sizes: &[(vk::DescriptorType, u32)]) -> Self {
        let mut remaining: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for &(ty, count) in sizes {
            match remaining.iter_mut().find(|(t, _)| *t == ty) {
                Some((_, total)) => *total += count,
                None => remaining.push((ty, count)),
            }
        }
        Self {
            max_sets,
            sets_in_use: 0,
            remaining,
        }
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    pub fn sets_in_use(&self) -> u32 {
        self.sets_in_use
    }

    /// Descriptors of `ty` still available.
    pub fn remaining(&self, ty: vk::DescriptorType) -> u32 {
        self.remaining
            .iter()
            .find(|(t, _)| *t == ty)
            .map_or(0, |(_, count)| *count)
    }

    /// Reserve room for one set with the given bindings.
    pub fn reserve(&mut self, bindings: &[LayoutBinding]) -> Result<()> {
        if self.sets_in_use >= self.max_sets {
            return Err(GpuError::PoolExhausted(format!(
                "all {} sets allocated",
                self.max_sets
            )));
        }
        let needed = demand(bindings);
        for &(ty, count) in &needed {
            let available = self.remaining(ty);
            if available < count {
                return Err(GpuError::PoolExhausted(format!(
                    "{ty:?}: need {count}, {available} left"
                )));
            }
        }

        for (ty, count) in needed {
            if let Some((_, left)) = self.remaining.iter_mut().find(|(t, _)| *t == ty) {
                *left -= count;
            }
        }
        self.sets_in_use += 1;
        Ok(())
    }

    /// Drop all capacity; every later reservation fails.
    pub fn clear(&mut self) {
        self.max_sets = 0;
        self.sets_in_use = 0;
        self.remaining.clear();
    }

    /// Return a set's descriptors to the budget.
    pub fn release(&mut self, bindings: &[LayoutBinding]) {
        debug_assert!(self.sets_in_use > 0, "released more sets than reserved");
        self.sets_in_use = self.sets_in_use.saturating_sub(1);
        for binding in bindings {
            if let Some((_, count)) = self
                .remaining
                .iter_mut()
                .find(|(t, _)| *t == binding.descriptor_type)
            {
                *count += binding.count;
            }
        }
    }
}

/// Total descriptors per type requested by a binding list.
fn demand(bindings: &[LayoutBinding]) -> Vec<(vk::DescriptorType, u32)> {
    let mut totals: Vec<(vk::DescriptorType, u32)> = Vec::new();
    for binding in bindings {
        match totals.iter_mut().find(|(t, _)| *t == binding.descriptor_type) {
            Some((_, total)) => *total += binding.count,
            None => totals.push((binding.descriptor_type, binding.count)),
        }
    }
    totals
}

/// Index of a set inside its [`DescriptorPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetId(u32);

struct AllocatedSet {
    set: vk::DescriptorSet,
    bindings: Vec<LayoutBinding>,
}

/// Fixed-capacity descriptor pool with a registry of its sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
    budget: PoolBudget,
    sets: Vec<Option<AllocatedSet>>,
}

impl DescriptorPool {
    /// Create a pool for at most `max_sets` sets drawing from `sizes`.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        sizes: &[(vk::DescriptorType, u32)],
    ) -> Result<Self> {
        let pool_sizes: Vec<vk::DescriptorPoolSize> = sizes
            .iter()
            .map(|&(ty, descriptor_count)| vk::DescriptorPoolSize {
                ty,
                descriptor_count,
            })
            .collect();

        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device
            .create_descriptor_pool(&create_info, None)
            .call("vkCreateDescriptorPool")?;

        tracing::info!("Descriptor pool created: {} sets, {:?}", max_sets, sizes);

        Ok(Self {
            pool,
            budget: PoolBudget::new(max_sets, sizes),
            sets: Vec::new(),
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    pub fn budget(&self) -> &PoolBudget {
        &self.budget
    }

    /// Number of live sets.
    pub fn allocated(&self) -> usize {
        self.sets.iter().filter(|s| s.is_some()).count()
    }

    /// Allocate one set against `layout`.
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout: &DescriptorLayout,
    ) -> Result<DescriptorSetId> {
        self.budget.reserve(layout.bindings())?;

        let layouts = [layout.handle()];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let set = match unsafe { device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(result) => {
                self.budget.release(layout.bindings());
                return Err(match result {
                    vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                        GpuError::PoolExhausted(result.to_string())
                    }
                    other => GpuError::Call {
                        call: "vkAllocateDescriptorSets",
                        result: other,
                    },
                });
            }
        };

        let entry = Some(AllocatedSet {
            set,
            bindings: layout.bindings().to_vec(),
        });
        let index = match self.sets.iter().position(Option::is_none) {
            Some(free) => {
                self.sets[free] = entry;
                free
            }
            None => {
                self.sets.push(entry);
                self.sets.len() - 1
            }
        };

        Ok(DescriptorSetId(index as u32))
    }

    fn entry(&self, id: DescriptorSetId) -> Result<&AllocatedSet> {
        self.sets
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown descriptor set {id:?}")))
    }

    /// Raw handle of a live set.
    pub fn get(&self, id: DescriptorSetId) -> Option<vk::DescriptorSet> {
        self.entry(id).ok().map(|entry| entry.set)
    }

    fn binding_type(
        &self,
        id: DescriptorSetId,
        binding: u32,
    ) -> Result<(vk::DescriptorSet, vk::DescriptorType)> {
        let entry = self.entry(id)?;
        let ty = entry
            .bindings
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.descriptor_type)
            .ok_or_else(|| GpuError::InvalidState(format!("Set {id:?} has no binding {binding}")))?;
        Ok((entry.set, ty))
    }

    /// Point a buffer binding at `buffer[offset..offset + range]`.
    pub fn write_buffer(
        &self,
        device: &ash::Device,
        id: DescriptorSetId,
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        let (set, ty) = self.binding_type(id, binding)?;
        if !matches!(
            ty,
            vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER
        ) {
            return Err(GpuError::InvalidState(format!(
                "Binding {binding} is {ty:?}, not a buffer"
            )));
        }

        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer)
            .offset(offset)
            .range(range);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(std::slice::from_ref(&buffer_info));

        unsafe { device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Point an image binding at a view (and sampler for combined bindings).
    pub fn write_image(
        &self,
        device: &ash::Device,
        id: DescriptorSetId,
        binding: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) -> Result<()> {
        let (set, ty) = self.binding_type(id, binding)?;
        if !matches!(
            ty,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                | vk::DescriptorType::SAMPLED_IMAGE
                | vk::DescriptorType::STORAGE_IMAGE
        ) {
            return Err(GpuError::InvalidState(format!(
                "Binding {binding} is {ty:?}, not an image"
            )));
        }

        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .sampler(sampler)
            .image_layout(layout);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .image_info(std::slice::from_ref(&image_info));

        unsafe { device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Record binding set `id` at `slot` of a graphics pipeline layout.
    pub fn bind(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        slot: SetSlot,
        id: DescriptorSetId,
    ) -> Result<()> {
        let set = self.entry(id)?.set;
        unsafe {
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                slot.index(),
                &[set],
                &[],
            );
        }
        Ok(())
    }

    /// Return a set to the pool.
    ///
    /// # Safety
    /// No pending command buffer may reference the set.
    pub unsafe fn free(&mut self, device: &ash::Device, id: DescriptorSetId) -> Result<()> {
        let entry = self
            .sets
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| GpuError::InvalidState(format!("Unknown descriptor set {id:?}")))?;

        device
            .free_descriptor_sets(self.pool, &[entry.set])
            .call("vkFreeDescriptorSets")?;
        self.budget.release(&entry.bindings);
        Ok(())
    }

    /// Destroy the pool and every set in it.
    ///
    /// # Safety
    /// The pool must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
        self.pool = vk::DescriptorPool::null();
        self.sets.clear();
        self.budget.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CIS: vk::DescriptorType = vk::DescriptorType::COMBINED_IMAGE_SAMPLER;
    const UBO: vk::DescriptorType = vk::DescriptorType::UNIFORM_BUFFER;

    #[test]
    fn set_slots_follow_binding_convention() {
        assert_eq!(SetSlot::Global.index(), 0);
        assert_eq!(SetSlot::Material.index(), 1);
        assert_eq!(SetSlot::Lights.index(), 2);
    }

    #[test]
    fn material_layout_has_five_fragment_samplers() {
        let builder = material_layout();
        let bindings = builder.bindings();
        assert_eq!(bindings.len(), 5);
        for (i, binding) in bindings.iter().enumerate() {
            assert_eq!(binding.binding, i as u32);
            assert_eq!(binding.descriptor_type, CIS);
            assert_eq!(binding.stage_flags, vk::ShaderStageFlags::FRAGMENT);
        }
        assert_eq!(texture_layout().bindings().len(), 1);
    }

    #[test]
    fn budget_refuses_sets_beyond_capacity() {
        let layout = texture_layout();
        let mut budget = PoolBudget::new(2, &[(CIS, 16)]);
        budget.reserve(layout.bindings()).unwrap();
        budget.reserve(layout.bindings()).unwrap();
        let err = budget.reserve(layout.bindings()).unwrap_err();
        assert!(matches!(err, GpuError::PoolExhausted(_)));
        assert_eq!(budget.sets_in_use(), 2);
        assert_eq!(budget.remaining(CIS), 14);
    }

    #[test]
    fn budget_refuses_missing_descriptor_types() {
        let layout =
            DescriptorLayoutBuilder::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX);
        let mut budget = PoolBudget::new(8, &[(CIS, 8)]);
        assert!(matches!(
            budget.reserve(layout.bindings()),
            Err(GpuError::PoolExhausted(_))
        ));
        assert_eq!(budget.sets_in_use(), 0);
    }

    #[test]
    fn budget_is_all_or_nothing_per_set() {
        let material = material_layout();
        let mut budget = PoolBudget::new(8, &[(CIS, 7)]);
        budget.reserve(material.bindings()).unwrap();
        assert_eq!(budget.remaining(CIS), 2);
        assert!(budget.reserve(material.bindings()).is_err());
        assert_eq!(budget.remaining(CIS), 2);
    }

    #[test]
    fn release_returns_descriptors() {
        let layout = DescriptorLayoutBuilder::new()
            .uniform_buffer(0, vk::ShaderStageFlags::VERTEX)
            .sampled_image(1, vk::ShaderStageFlags::FRAGMENT);
        let mut budget = PoolBudget::new(1, &[(UBO, 1), (CIS, 1)]);
        budget.reserve(layout.bindings()).unwrap();
        assert!(budget.reserve(layout.bindings()).is_err());
        budget.release(layout.bindings());
        assert_eq!(budget.remaining(UBO), 1);
        assert_eq!(budget.remaining(CIS), 1);
        budget.reserve(layout.bindings()).unwrap();
    }

    #[test]
    fn duplicate_pool_sizes_accumulate() {
        let budget = PoolBudget::new(4, &[(CIS, 3), (UBO, 2), (CIS, 5)]);
        assert_eq!(budget.remaining(CIS), 8);
        assert_eq!(budget.remaining(UBO), 2);
        assert_eq!(budget.remaining(vk::DescriptorType::STORAGE_BUFFER), 0);
    }

    #[test]
    fn cleared_budget_has_no_capacity() {
        let layout = texture_layout();
        let mut budget = PoolBudget::new(4, &[(CIS, 4)]);
        budget.reserve(layout.bindings()).unwrap();
        budget.clear();
        assert_eq!(budget.sets_in_use(), 0);
        assert_eq!(budget.max_sets(), 0);
        assert_eq!(budget.remaining(CIS), 0);
        assert!(matches!(
            budget.reserve(layout.bindings()),
            Err(GpuError::PoolExhausted(_))
        ));
    }
}
