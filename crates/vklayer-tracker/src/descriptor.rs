//! Descriptor set layouts, descriptor pools and sets, descriptor updates,
//! and binding sets on a command buffer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use ash::vk;
use ash::vk::Handle;
use dashmap::DashMap;
use tracing::debug;
use vklayer_core::{DiagnosticCode, ObjectType, ValidationError};

use crate::context::ValidationContext;

#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub descriptor_count: u32,
    pub stage_flags: vk::ShaderStageFlags,
    pub immutable_samplers: Vec<vk::Sampler>,
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorSetLayoutCreateInfo {
    pub flags: vk::DescriptorSetLayoutCreateFlags,
    pub bindings: Vec<DescriptorSetLayoutBinding>,
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorPoolCreateInfo {
    pub flags: vk::DescriptorPoolCreateFlags,
    pub max_sets: u32,
    pub pool_sizes: Vec<vk::DescriptorPoolSize>,
}

/// A write update. `s_type` tags the record and must be
/// `WRITE_DESCRIPTOR_SET`; the payload vector matching
/// `descriptor_type` is read.
#[derive(Debug, Clone)]
pub struct WriteDescriptorSet {
    pub s_type: vk::StructureType,
    pub dst_set: vk::DescriptorSet,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_count: u32,
    pub descriptor_type: vk::DescriptorType,
    pub image_info: Vec<vk::DescriptorImageInfo>,
    pub buffer_info: Vec<vk::DescriptorBufferInfo>,
    pub texel_buffer_view: Vec<vk::BufferView>,
}

impl Default for WriteDescriptorSet {
    fn default() -> Self {
        Self {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: vk::DescriptorSet::null(),
            dst_binding: 0,
            dst_array_element: 0,
            descriptor_count: 0,
            descriptor_type: vk::DescriptorType::SAMPLER,
            image_info: Vec::new(),
            buffer_info: Vec::new(),
            texel_buffer_view: Vec::new(),
        }
    }
}

/// A copy update, tagged `COPY_DESCRIPTOR_SET`.
#[derive(Debug, Clone)]
pub struct CopyDescriptorSet {
    pub s_type: vk::StructureType,
    pub src_set: vk::DescriptorSet,
    pub src_binding: u32,
    pub src_array_element: u32,
    pub dst_set: vk::DescriptorSet,
    pub dst_binding: u32,
    pub dst_array_element: u32,
    pub descriptor_count: u32,
}

impl Default for CopyDescriptorSet {
    fn default() -> Self {
        Self {
            s_type: vk::StructureType::COPY_DESCRIPTOR_SET,
            src_set: vk::DescriptorSet::null(),
            src_binding: 0,
            src_array_element: 0,
            dst_set: vk::DescriptorSet::null(),
            dst_binding: 0,
            dst_array_element: 0,
            descriptor_count: 0,
        }
    }
}

/// Decoded update record.
enum DescriptorUpdate<'a> {
    Write(&'a WriteDescriptorSet),
    Copy(&'a CopyDescriptorSet),
}

impl<'a> DescriptorUpdate<'a> {
    fn from_write(write: &'a WriteDescriptorSet) -> Result<Self, vk::StructureType> {
        match write.s_type {
            vk::StructureType::WRITE_DESCRIPTOR_SET => Ok(DescriptorUpdate::Write(write)),
            other => Err(other),
        }
    }

    fn from_copy(copy: &'a CopyDescriptorSet) -> Result<Self, vk::StructureType> {
        match copy.s_type {
            vk::StructureType::COPY_DESCRIPTOR_SET => Ok(DescriptorUpdate::Copy(copy)),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct LayoutBinding {
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub immutable_samplers: bool,
}

#[derive(Debug)]
pub(crate) struct SetLayoutNode {
    pub bindings: BTreeMap<u32, LayoutBinding>,
}

impl SetLayoutNode {
    fn type_counts(&self) -> HashMap<vk::DescriptorType, u64> {
        let mut counts = HashMap::new();
        for binding in self.bindings.values() {
            *counts.entry(binding.descriptor_type).or_insert(0) += u64::from(binding.count);
        }
        counts
    }

    fn descriptor_total(&self) -> u64 {
        self.bindings.values().map(|b| u64::from(b.count)).sum()
    }

    fn dynamic_count(&self) -> u64 {
        self.bindings
            .values()
            .filter(|b| {
                matches!(
                    b.descriptor_type,
                    vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC
                        | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                )
            })
            .map(|b| u64::from(b.count))
            .sum()
    }
}

#[derive(Debug)]
pub(crate) struct PoolNode {
    pub flags: vk::DescriptorPoolCreateFlags,
    pub max_sets: u32,
    /// Per-type totals, widened so summed pool sizes cannot wrap.
    pub capacity: HashMap<vk::DescriptorType, u64>,
    pub remaining: HashMap<vk::DescriptorType, u64>,
    pub sets: HashSet<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct SetNode {
    pub pool: u64,
    pub layout: Arc<SetLayoutNode>,
    pub updated: bool,
}

#[derive(Default)]
pub(crate) struct DescriptorTracker {
    pub set_layouts: DashMap<u64, Arc<SetLayoutNode>>,
    pub pools: DashMap<u64, PoolNode>,
    pub sets: DashMap<u64, SetNode>,
}

/// `VK_DESCRIPTOR_TYPE_*` spelling of a descriptor type.
fn type_name(descriptor_type: vk::DescriptorType) -> String {
    format!("VK_DESCRIPTOR_TYPE_{:?}", descriptor_type)
}

fn sorted_types(counts: &HashMap<vk::DescriptorType, u64>) -> Vec<(vk::DescriptorType, u64)> {
    let mut entries: Vec<_> = counts.iter().map(|(t, n)| (*t, *n)).collect();
    entries.sort_by_key(|(t, _)| t.as_raw());
    entries
}

impl ValidationContext {
    // ── Set layouts ─────────────────────────────────────────────

    pub fn create_descriptor_set_layout(
        &self,
        info: &DescriptorSetLayoutCreateInfo,
    ) -> Result<vk::DescriptorSetLayout, ValidationError> {
        const LOCATION: &str = "vkCreateDescriptorSetLayout";
        let mut bindings = BTreeMap::new();
        for (index, binding) in info.bindings.iter().enumerate() {
            if bindings.contains_key(&binding.binding) {
                return Err(self.error(
                    DiagnosticCode::DuplicateLayoutBinding,
                    ObjectType::Device,
                    self.device().as_raw(),
                    LOCATION,
                    format!(
                        "vkCreateDescriptorSetLayout(): pBindings[{}] has duplicated binding number ({})",
                        index, binding.binding
                    ),
                ));
            }
            for &sampler in &binding.immutable_samplers {
                self.check_handle(sampler, ObjectType::Sampler, LOCATION)?;
            }
            bindings.insert(
                binding.binding,
                LayoutBinding {
                    descriptor_type: binding.descriptor_type,
                    count: binding.descriptor_count,
                    immutable_samplers: !binding.immutable_samplers.is_empty(),
                },
            );
        }
        let layout: vk::DescriptorSetLayout = self.create_handle(ObjectType::DescriptorSetLayout);
        self.descriptors
            .set_layouts
            .insert(layout.as_raw(), Arc::new(SetLayoutNode { bindings }));
        Ok(layout)
    }

    pub fn destroy_descriptor_set_layout(
        &self,
        layout: vk::DescriptorSetLayout,
    ) -> Result<(), ValidationError> {
        if layout == vk::DescriptorSetLayout::null() {
            return Ok(());
        }
        let raw = self.check_handle(
            layout,
            ObjectType::DescriptorSetLayout,
            "vkDestroyDescriptorSetLayout",
        )?;
        // Sets and pipeline layouts keep their own reference to the node.
        self.descriptors.set_layouts.remove(&raw);
        self.retire_handle(raw, ObjectType::DescriptorSetLayout);
        Ok(())
    }

    // ── Pools and sets ──────────────────────────────────────────

    pub fn create_descriptor_pool(
        &self,
        info: &DescriptorPoolCreateInfo,
    ) -> Result<vk::DescriptorPool, ValidationError> {
        if info.max_sets == 0 {
            return Err(self.error(
                DiagnosticCode::InvalidParameter,
                ObjectType::Device,
                self.device().as_raw(),
                "vkCreateDescriptorPool",
                "vkCreateDescriptorPool(): maxSets must be greater than 0".to_string(),
            ));
        }
        let mut capacity = HashMap::new();
        for size in &info.pool_sizes {
            *capacity.entry(size.ty).or_insert(0) += u64::from(size.descriptor_count);
        }
        let pool: vk::DescriptorPool = self.create_handle(ObjectType::DescriptorPool);
        self.descriptors.pools.insert(
            pool.as_raw(),
            PoolNode {
                flags: info.flags,
                max_sets: info.max_sets,
                remaining: capacity.clone(),
                capacity,
                sets: HashSet::new(),
            },
        );
        Ok(pool)
    }

    /// Release every set of a pool and restore its capacity.
    fn release_pool_sets(&self, pool: u64) {
        let sets = match self.descriptors.pools.get_mut(&pool) {
            Some(mut node) => {
                node.remaining = node.capacity.clone();
                std::mem::take(&mut node.sets)
            }
            None => return,
        };
        for set in sets {
            self.descriptors.sets.remove(&set);
            self.retire_handle(set, ObjectType::DescriptorSet);
        }
    }

    pub fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), ValidationError> {
        if pool == vk::DescriptorPool::null() {
            return Ok(());
        }
        let raw = self.check_handle(pool, ObjectType::DescriptorPool, "vkDestroyDescriptorPool")?;
        self.release_pool_sets(raw);
        self.descriptors.pools.remove(&raw);
        self.retire_handle(raw, ObjectType::DescriptorPool);
        Ok(())
    }

    pub fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkResetDescriptorPool";
        let raw = pool.as_raw();
        let known = self.registry().validate(raw, ObjectType::DescriptorPool).is_valid()
            && self.descriptors.pools.contains_key(&raw);
        if !known {
            return Err(self.error(
                DiagnosticCode::InvalidDescriptorPool,
                ObjectType::DescriptorPool,
                raw,
                LOCATION,
                format!(
                    "Unable to find pool node for pool 0x{:x} specified in vkResetDescriptorPool() call",
                    raw
                ),
            ));
        }
        self.release_pool_sets(raw);
        Ok(())
    }

    /// Allocate one set per layout. Either every set is allocated or none.
    pub fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>, ValidationError> {
        const LOCATION: &str = "vkAllocateDescriptorSets";
        let pool_raw = self.check_handle(pool, ObjectType::DescriptorPool, LOCATION)?;
        let mut layouts = Vec::with_capacity(set_layouts.len());
        for &layout in set_layouts {
            layouts.push(self.lookup(
                &self.descriptors.set_layouts,
                layout,
                ObjectType::DescriptorSetLayout,
                LOCATION,
            )?);
        }

        let mut needed: HashMap<vk::DescriptorType, u64> = HashMap::new();
        for layout in &layouts {
            for (ty, count) in layout.type_counts() {
                *needed.entry(ty).or_insert(0) += count;
            }
        }
        let requested = layouts.len() as u32;

        let outcome = match self.descriptors.pools.get_mut(&pool_raw) {
            None => Err((
                DiagnosticCode::InvalidDescriptorPool,
                format!("Unable to find pool node for pool 0x{:x}", pool_raw),
            )),
            Some(mut node) => {
                let sets_left = node.max_sets.saturating_sub(node.sets.len() as u32);
                let shortfall = sorted_types(&needed).into_iter().find(|(ty, count)| {
                    node.remaining.get(ty).copied().unwrap_or(0) < *count
                });
                if sets_left < requested {
                    Err((
                        DiagnosticCode::DescriptorPoolEmpty,
                        format!(
                            "Unable to allocate {} descriptorSets from pool 0x{:x}. This pool only has {} descriptorSets remaining.",
                            requested, pool_raw, sets_left
                        ),
                    ))
                } else if let Some((ty, count)) = shortfall {
                    Err((
                        DiagnosticCode::DescriptorPoolEmpty,
                        format!(
                            "Unable to allocate {} descriptors of type {} from pool 0x{:x}. This pool only has {} descriptors of this type remaining.",
                            count,
                            type_name(ty),
                            pool_raw,
                            node.remaining.get(&ty).copied().unwrap_or(0)
                        ),
                    ))
                } else {
                    for (ty, count) in &needed {
                        if let Some(left) = node.remaining.get_mut(ty) {
                            *left -= count;
                        }
                    }
                    Ok(())
                }
            }
        };
        outcome.map_err(|(code, message)| {
            self.error(code, ObjectType::DescriptorPool, pool_raw, LOCATION, message)
        })?;

        let sets: Vec<vk::DescriptorSet> = layouts
            .into_iter()
            .map(|layout| {
                let set: vk::DescriptorSet = self.create_handle(ObjectType::DescriptorSet);
                self.descriptors.sets.insert(
                    set.as_raw(),
                    SetNode {
                        pool: pool_raw,
                        layout,
                        updated: false,
                    },
                );
                set
            })
            .collect();
        if let Some(mut node) = self.descriptors.pools.get_mut(&pool_raw) {
            node.sets.extend(sets.iter().map(|s| s.as_raw()));
        }
        debug!(
            pool = format_args!("0x{:x}", pool_raw),
            count = sets.len(),
            "descriptor sets allocated"
        );
        Ok(sets)
    }

    pub fn free_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        sets: &[vk::DescriptorSet],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkFreeDescriptorSets";
        let pool_raw = self.check_handle(pool, ObjectType::DescriptorPool, LOCATION)?;
        let flags = self
            .descriptors
            .pools
            .get(&pool_raw)
            .map(|node| node.flags)
            .unwrap_or_default();
        if !flags.contains(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET) {
            return Err(self.error(
                DiagnosticCode::FreeFromNonFreePool,
                ObjectType::DescriptorPool,
                pool_raw,
                LOCATION,
                "It is invalid to call vkFreeDescriptorSets() with a pool created without setting VK_DESCRIPTOR_POOL_CREATE_FREE_DESCRIPTOR_SET_BIT.".to_string(),
            ));
        }

        let mut freed = Vec::with_capacity(sets.len());
        for &set in sets {
            if set == vk::DescriptorSet::null() {
                continue;
            }
            let node = self.lookup(&self.descriptors.sets, set, ObjectType::DescriptorSet, LOCATION)?;
            if node.pool != pool_raw {
                return Err(self.error(
                    DiagnosticCode::InvalidParameter,
                    ObjectType::DescriptorSet,
                    set.as_raw(),
                    LOCATION,
                    format!(
                        "vkFreeDescriptorSets(): descriptor set 0x{:x} was not allocated from pool 0x{:x}",
                        set.as_raw(),
                        pool_raw
                    ),
                ));
            }
            freed.push((set.as_raw(), node.layout));
        }

        if let Some(mut node) = self.descriptors.pools.get_mut(&pool_raw) {
            for (set, layout) in &freed {
                node.sets.remove(set);
                for (ty, count) in layout.type_counts() {
                    *node.remaining.entry(ty).or_insert(0) += count;
                }
            }
        }
        for (set, _) in freed {
            self.descriptors.sets.remove(&set);
            self.retire_handle(set, ObjectType::DescriptorSet);
        }
        Ok(())
    }

    // ── Updates ─────────────────────────────────────────────────

    /// Apply writes then copies. Everything is validated before any set is
    /// marked updated.
    pub fn update_descriptor_sets(
        &self,
        writes: &[WriteDescriptorSet],
        copies: &[CopyDescriptorSet],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkUpdateDescriptorSets";
        let decoded = writes
            .iter()
            .map(DescriptorUpdate::from_write)
            .chain(copies.iter().map(DescriptorUpdate::from_copy));

        let mut touched = Vec::new();
        for update in decoded {
            let update = update.map_err(|tag| {
                self.error(
                    DiagnosticCode::InvalidUpdateStruct,
                    ObjectType::Device,
                    self.device().as_raw(),
                    LOCATION,
                    format!(
                        "Unexpected UPDATE struct of type {:?} in vkUpdateDescriptorSets() struct tree",
                        tag
                    ),
                )
            })?;
            let target = match update {
                DescriptorUpdate::Write(write) => self.validate_write(write)?,
                DescriptorUpdate::Copy(copy) => self.validate_copy(copy)?,
            };
            touched.push(target);
        }

        for set in touched {
            if let Some(mut node) = self.descriptors.sets.get_mut(&set) {
                node.updated = true;
            }
        }
        Ok(())
    }

    /// Binding of `set` covering `[first, first + count)`, checked in that
    /// order: binding exists, range in bounds.
    fn update_target(
        &self,
        set_raw: u64,
        node: &SetNode,
        binding: u32,
        first: u32,
        count: u32,
        update_kind: &str,
    ) -> Result<LayoutBinding, ValidationError> {
        const LOCATION: &str = "vkUpdateDescriptorSets";
        let Some(layout_binding) = node.layout.bindings.get(&binding).copied() else {
            return Err(self.error(
                DiagnosticCode::UpdateBindingMissing,
                ObjectType::DescriptorSet,
                set_raw,
                LOCATION,
                format!(
                    "Descriptor Set 0x{:x} does not have binding to match update binding {} for update type {}!",
                    set_raw, binding, update_kind
                ),
            ));
        };
        if u64::from(first) + u64::from(count) > u64::from(layout_binding.count) {
            return Err(self.error(
                DiagnosticCode::DescriptorUpdateOutOfBounds,
                ObjectType::DescriptorSet,
                set_raw,
                LOCATION,
                format!(
                    "Descriptor update type of {} is out of bounds for matching binding {} in Layout w/ {} descriptors (update covers elements {} through {})",
                    update_kind,
                    binding,
                    layout_binding.count,
                    first,
                    u64::from(first) + u64::from(count)
                ),
            ));
        }
        Ok(layout_binding)
    }

    fn validate_write(&self, write: &WriteDescriptorSet) -> Result<u64, ValidationError> {
        const LOCATION: &str = "vkUpdateDescriptorSets";
        const KIND: &str = "VK_STRUCTURE_TYPE_WRITE_DESCRIPTOR_SET";
        let node = self.lookup(
            &self.descriptors.sets,
            write.dst_set,
            ObjectType::DescriptorSet,
            LOCATION,
        )?;
        let set_raw = write.dst_set.as_raw();
        let binding = self.update_target(
            set_raw,
            &node,
            write.dst_binding,
            write.dst_array_element,
            write.descriptor_count,
            KIND,
        )?;
        if binding.descriptor_type != write.descriptor_type {
            return Err(self.error(
                DiagnosticCode::DescriptorTypeMismatch,
                ObjectType::DescriptorSet,
                set_raw,
                LOCATION,
                format!(
                    "Descriptor update type of {} has descriptor type {} that does not match overlapping binding descriptor type of {}!",
                    KIND,
                    type_name(write.descriptor_type),
                    type_name(binding.descriptor_type)
                ),
            ));
        }
        self.validate_write_payload(set_raw, write, binding.immutable_samplers)?;
        Ok(set_raw)
    }

    fn validate_write_payload(
        &self,
        set_raw: u64,
        write: &WriteDescriptorSet,
        immutable_samplers: bool,
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkUpdateDescriptorSets";
        let count = write.descriptor_count as usize;
        let short = |field: &str, len: usize| {
            Err(self.error(
                DiagnosticCode::InvalidParameter,
                ObjectType::DescriptorSet,
                set_raw,
                LOCATION,
                format!(
                    "vkUpdateDescriptorSets(): {} has {} entries but descriptorCount is {}",
                    field, len, count
                ),
            ))
        };
        let bad_handle = |what: &str, raw: u64| {
            self.error(
                DiagnosticCode::InvalidDescriptorHandle,
                ObjectType::DescriptorSet,
                set_raw,
                LOCATION,
                format!("Attempt to update descriptor with invalid {} 0x{:x}", what, raw),
            )
        };
        let live = |raw: u64, ty: ObjectType| self.registry().validate(raw, ty).is_valid();

        match write.descriptor_type {
            vk::DescriptorType::SAMPLER
            | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            | vk::DescriptorType::SAMPLED_IMAGE
            | vk::DescriptorType::STORAGE_IMAGE
            | vk::DescriptorType::INPUT_ATTACHMENT => {
                if write.image_info.len() < count {
                    return short("pImageInfo", write.image_info.len());
                }
                let uses_sampler = matches!(
                    write.descriptor_type,
                    vk::DescriptorType::SAMPLER | vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                ) && !immutable_samplers;
                let uses_view = write.descriptor_type != vk::DescriptorType::SAMPLER;
                for info in &write.image_info[..count] {
                    if uses_sampler && !live(info.sampler.as_raw(), ObjectType::Sampler) {
                        return Err(bad_handle("sampler", info.sampler.as_raw()));
                    }
                    if uses_view && !live(info.image_view.as_raw(), ObjectType::ImageView) {
                        return Err(bad_handle("imageView", info.image_view.as_raw()));
                    }
                }
            }
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                if write.texel_buffer_view.len() < count {
                    return short("pTexelBufferView", write.texel_buffer_view.len());
                }
                for &view in &write.texel_buffer_view[..count] {
                    let view_node = self.lookup(
                        &self.memory.buffer_views,
                        view,
                        ObjectType::BufferView,
                        LOCATION,
                    )?;
                    if !live(view_node.buffer, ObjectType::Buffer) {
                        return Err(self.error(
                            DiagnosticCode::InvalidDescriptorHandle,
                            ObjectType::DescriptorSet,
                            set_raw,
                            LOCATION,
                            format!(
                                "Attempt to update descriptor with bufferView 0x{:x} whose buffer 0x{:x} has been destroyed",
                                view.as_raw(),
                                view_node.buffer
                            ),
                        ));
                    }
                }
            }
            _ => {
                if write.buffer_info.len() < count {
                    return short("pBufferInfo", write.buffer_info.len());
                }
                for info in &write.buffer_info[..count] {
                    self.check_handle(info.buffer, ObjectType::Buffer, LOCATION)?;
                }
            }
        }
        Ok(())
    }

    fn validate_copy(&self, copy: &CopyDescriptorSet) -> Result<u64, ValidationError> {
        const LOCATION: &str = "vkUpdateDescriptorSets";
        const KIND: &str = "VK_STRUCTURE_TYPE_COPY_DESCRIPTOR_SET";
        let src = self.lookup(
            &self.descriptors.sets,
            copy.src_set,
            ObjectType::DescriptorSet,
            LOCATION,
        )?;
        let dst = self.lookup(
            &self.descriptors.sets,
            copy.dst_set,
            ObjectType::DescriptorSet,
            LOCATION,
        )?;
        let src_binding = self.update_target(
            copy.src_set.as_raw(),
            &src,
            copy.src_binding,
            copy.src_array_element,
            copy.descriptor_count,
            KIND,
        )?;
        let dst_raw = copy.dst_set.as_raw();
        let dst_binding = self.update_target(
            dst_raw,
            &dst,
            copy.dst_binding,
            copy.dst_array_element,
            copy.descriptor_count,
            KIND,
        )?;
        if src_binding.descriptor_type != dst_binding.descriptor_type {
            return Err(self.error(
                DiagnosticCode::DescriptorTypeMismatch,
                ObjectType::DescriptorSet,
                dst_raw,
                LOCATION,
                format!(
                    "Copy descriptor update has src binding descriptor type {} that does not match overlapping dest binding descriptor type of {}!",
                    type_name(src_binding.descriptor_type),
                    type_name(dst_binding.descriptor_type)
                ),
            ));
        }
        Ok(dst_raw)
    }

    // ── Binding ─────────────────────────────────────────────────

    pub fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        _bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: &[vk::DescriptorSet],
        dynamic_offsets: &[u32],
    ) -> Result<(), ValidationError> {
        const LOCATION: &str = "vkCmdBindDescriptorSets";
        self.record(command_buffer, LOCATION, |_, state| {
            let raw = command_buffer.as_raw();
            let layout_node = self.lookup(
                &self.pipelines.layouts,
                layout,
                ObjectType::PipelineLayout,
                LOCATION,
            )?;
            let end = first_set as usize + sets.len();
            if end > layout_node.set_layouts.len() {
                return Err(self.error(
                    DiagnosticCode::DescriptorSetIndexOutOfRange,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "descriptorSet #{} being bound is greater than the number of sets ({}) in pipeline layout 0x{:x}",
                        end.saturating_sub(1),
                        layout_node.set_layouts.len(),
                        layout.as_raw()
                    ),
                ));
            }

            let mut nodes = Vec::with_capacity(sets.len());
            for &set in sets {
                let node = self.lookup(&self.descriptors.sets, set, ObjectType::DescriptorSet, LOCATION)?;
                nodes.push((set.as_raw(), node));
            }
            let dynamic: u64 = nodes.iter().map(|(_, n)| n.layout.dynamic_count()).sum();
            if dynamic != dynamic_offsets.len() as u64 {
                return Err(self.error(
                    DiagnosticCode::InvalidParameter,
                    ObjectType::CommandBuffer,
                    raw,
                    LOCATION,
                    format!(
                        "vkCmdBindDescriptorSets(): {} dynamic offsets supplied for {} dynamic descriptors",
                        dynamic_offsets.len(),
                        dynamic
                    ),
                ));
            }

            for (index, (set_raw, node)) in (first_set..).zip(nodes) {
                if !node.updated && node.layout.descriptor_total() > 0 {
                    self.warn(
                        DiagnosticCode::DescriptorSetNotUpdated,
                        ObjectType::DescriptorSet,
                        set_raw,
                        LOCATION,
                        format!(
                            "DS 0x{:x} bound but it was never updated. You may want to either update it or not bind it.",
                            set_raw
                        ),
                    );
                }
                state.bound_sets.insert(index, set_raw);
            }
            Ok(())
        })
    }
}
