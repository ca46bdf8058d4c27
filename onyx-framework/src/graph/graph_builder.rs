use super::*;
use fnv::FnvHashMap;
use onyx_api::{OnyxBufferDef, OnyxBufferHandle, OnyxError, OnyxTextureDef, OnyxTextureHandle};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RenderGraphAllocationStrategy {
    /// One physical allocation per resource; alias chains share a single allocation
    Dedicated,
    /// Transients packed into shared heaps by lifetime. Falls back to Dedicated when the
    /// device cannot place resources at explicit offsets.
    HeapPacked,
}

#[derive(Clone, Debug)]
pub struct RenderGraphBuilderOptions {
    /// Allow transients with disjoint lifetimes to share physical memory: alias chains on
    /// the dedicated path, time-shared byte ranges on the heap-packed path
    pub enable_resource_aliasing: bool,
    pub enable_node_reordering: bool,
    pub allocation_strategy: RenderGraphAllocationStrategy,
}

impl Default for RenderGraphBuilderOptions {
    fn default() -> Self {
        RenderGraphBuilderOptions {
            enable_resource_aliasing: true,
            enable_node_reordering: true,
            allocation_strategy: RenderGraphAllocationStrategy::HeapPacked,
        }
    }
}

/// A transient physical object parked across reset so identical declarations next frame can
/// revive it instead of re-allocating
#[derive(Debug)]
pub(super) enum RetainedResource {
    Buffer {
        def: OnyxBufferDef,
        buffer: OnyxBufferHandle,
        state: OnyxResourceState,
    },
    Image {
        def: OnyxTextureDef,
        texture: OnyxTextureHandle,
        state: OnyxResourceState,
    },
}

/// Builds and runs a graph of passes and the resources they read and write.
///
/// Per frame: declare nodes and edges, `compile` with the frame's output resources,
/// `execute`, then `reset`. The builder is exclusively owned by one thread; nothing in it is
/// safe for concurrent mutation.
pub struct RenderGraphBuilder {
    pub(super) options: RenderGraphBuilderOptions,

    pub(super) nodes: Vec<RenderGraphNode>,
    pub(super) node_lookup: FnvHashMap<String, RenderGraphNodeId>,
    pub(super) executors: FnvHashMap<RenderGraphNodeId, Box<dyn RenderGraphNodeExecutor>>,

    pub(super) usages: Vec<RenderGraphResourceUsage>,
    pub(super) buffers: Vec<RenderGraphBufferResource>,
    pub(super) buffer_lookup: FnvHashMap<String, usize>,
    pub(super) images: Vec<RenderGraphImageResource>,
    pub(super) image_lookup: FnvHashMap<String, usize>,

    pub(super) scheduled_nodes: Vec<RenderGraphNodeId>,
    /// Position of each node in the scheduled order, None for culled nodes
    pub(super) node_schedule_index: Vec<Option<usize>>,
    pub(super) heaps: Vec<onyx_api::OnyxMemoryHeapId>,
    pub(super) retained: FnvHashMap<String, RetainedResource>,

    /// Latched by a declaration the versioning scheme can no longer represent, surfaced by
    /// the next compile
    pub(super) declare_error: Option<OnyxError>,
    pub(super) compiled: bool,
}

impl Default for RenderGraphBuilder {
    fn default() -> Self {
        RenderGraphBuilder::new(Default::default())
    }
}

impl RenderGraphBuilder {
    pub fn new(options: RenderGraphBuilderOptions) -> Self {
        RenderGraphBuilder {
            options,
            nodes: Default::default(),
            node_lookup: Default::default(),
            executors: Default::default(),
            usages: Default::default(),
            buffers: Default::default(),
            buffer_lookup: Default::default(),
            images: Default::default(),
            image_lookup: Default::default(),
            scheduled_nodes: Default::default(),
            node_schedule_index: Default::default(),
            heaps: Default::default(),
            retained: Default::default(),
            declare_error: None,
            compiled: false,
        }
    }

    //
    // Nodes
    //

    pub fn add_node(
        &mut self,
        name: &str,
    ) -> RenderGraphNodeId {
        debug_assert!(
            !self.node_lookup.contains_key(name),
            "node {} declared twice",
            name
        );
        let node_id = RenderGraphNodeId(self.nodes.len());
        self.nodes.push(RenderGraphNode::new(node_id, name));
        self.node_lookup.insert(name.to_string(), node_id);
        node_id
    }

    pub fn find_node(
        &self,
        name: &str,
    ) -> Option<RenderGraphNodeId> {
        self.node_lookup.get(name).copied()
    }

    pub fn node(
        &self,
        node_id: RenderGraphNodeId,
    ) -> &RenderGraphNode {
        &self.nodes[node_id.0]
    }

    pub fn set_node_executor<T: RenderGraphNodeExecutor + 'static>(
        &mut self,
        node_id: RenderGraphNodeId,
        executor: T,
    ) {
        self.executors.insert(node_id, Box::new(executor));
    }

    /// The node order produced by the last compile
    pub fn scheduled_nodes(&self) -> &[RenderGraphNodeId] {
        &self.scheduled_nodes
    }

    //
    // Buffer declarations
    //

    pub fn read_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        debug_assert!(buffer.is_buffer());
        self.read_buffer_index(node_id, buffer.index, state, stages)
    }

    pub fn read_buffer_by_name(
        &mut self,
        node_id: RenderGraphNodeId,
        name: &str,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> OnyxResult<RenderGraphResourceRef> {
        let index = *self
            .buffer_lookup
            .get(name)
            .ok_or_else(|| OnyxError::UnresolvedResource(name.to_string()))?;
        Ok(self.read_buffer_index(node_id, index, state, stages))
    }

    pub fn read_external_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        external: &RenderGraphExternalBuffer,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        let index = self.register_external_buffer(external);
        self.read_buffer_index(node_id, index, state, stages)
    }

    pub fn write_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        debug_assert!(buffer.is_buffer());
        debug_assert_eq!(
            buffer.generation.write_count,
            self.buffers[buffer.index].generation.write_count,
            "writing {} through a stale handle",
            self.buffers[buffer.index].name
        );
        self.write_buffer_index(node_id, buffer.index, state, stages, None)
    }

    /// Create-or-find a buffer by name and write it
    pub fn write_buffer_by_name(
        &mut self,
        node_id: RenderGraphNodeId,
        name: &str,
        def: &OnyxBufferDef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        let index = self.find_or_create_buffer(name, def);
        self.write_buffer_index(node_id, index, state, stages, None)
    }

    pub fn write_external_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        external: &RenderGraphExternalBuffer,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        let index = self.register_external_buffer(external);
        self.write_buffer_index(node_id, index, state, stages, None)
    }

    /// Write a buffer into a specific output slot of the node. Writing a slot that is
    /// already occupied retires the previous edge's bookkeeping first, so a pass can
    /// redirect an output without re-declaring the node.
    pub fn write_buffer_slot(
        &mut self,
        node_id: RenderGraphNodeId,
        slot: usize,
        buffer: RenderGraphResourceRef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        debug_assert!(buffer.is_buffer());
        self.write_buffer_index(node_id, buffer.index, state, stages, Some(slot))
    }

    //
    // Image declarations
    //

    pub fn read_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        debug_assert!(image.is_image());
        self.read_image_index(node_id, image.index, state, stages)
    }

    pub fn read_image_by_name(
        &mut self,
        node_id: RenderGraphNodeId,
        name: &str,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> OnyxResult<RenderGraphResourceRef> {
        let index = *self
            .image_lookup
            .get(name)
            .ok_or_else(|| OnyxError::UnresolvedResource(name.to_string()))?;
        Ok(self.read_image_index(node_id, index, state, stages))
    }

    pub fn read_external_image(
        &mut self,
        node_id: RenderGraphNodeId,
        external: &RenderGraphExternalImage,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        let index = self.register_external_image(external);
        self.read_image_index(node_id, index, state, stages)
    }

    pub fn write_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        debug_assert!(image.is_image());
        debug_assert_eq!(
            image.generation.write_count,
            self.images[image.index].generation.write_count,
            "writing {} through a stale handle",
            self.images[image.index].name
        );
        self.write_image_index(node_id, image.index, state, stages, None)
    }

    /// Create-or-find an image by name and write it
    pub fn write_image_by_name(
        &mut self,
        node_id: RenderGraphNodeId,
        name: &str,
        def: &OnyxTextureDef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        let index = self.find_or_create_image(name, def);
        self.write_image_index(node_id, index, state, stages, None)
    }

    pub fn write_external_image(
        &mut self,
        node_id: RenderGraphNodeId,
        external: &RenderGraphExternalImage,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        let index = self.register_external_image(external);
        self.write_image_index(node_id, index, state, stages, None)
    }

    pub fn write_image_slot(
        &mut self,
        node_id: RenderGraphNodeId,
        slot: usize,
        image: RenderGraphResourceRef,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        debug_assert!(image.is_image());
        self.write_image_index(node_id, image.index, state, stages, Some(slot))
    }

    //
    // History (previous-frame) images
    //

    /// Read the previous frame's contents of `image`. Creates the shadow record on first
    /// use; the shadow and the main image swap physical storage once per execute.
    pub fn read_history_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        debug_assert!(image.is_image());
        let shadow = self.find_or_create_history_shadow(image.index);
        self.read_image_index(node_id, shadow, OnyxResourceState::SHADER_RESOURCE, stages)
    }

    pub fn read_history_image_by_name(
        &mut self,
        node_id: RenderGraphNodeId,
        name: &str,
        stages: OnyxPipelineStageFlags,
    ) -> OnyxResult<RenderGraphResourceRef> {
        let index = *self
            .image_lookup
            .get(name)
            .ok_or_else(|| OnyxError::UnresolvedResource(name.to_string()))?;
        let shadow = self.find_or_create_history_shadow(index);
        Ok(self.read_image_index(node_id, shadow, OnyxResourceState::SHADER_RESOURCE, stages))
    }

    //
    // Typed sugar over the primitives
    //

    pub fn transfer_read_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.read_buffer(
            node_id,
            buffer,
            OnyxResourceState::COPY_SRC,
            OnyxPipelineStageFlags::TRANSFER,
        )
    }

    pub fn transfer_write_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.write_buffer(
            node_id,
            buffer,
            OnyxResourceState::COPY_DST,
            OnyxPipelineStageFlags::TRANSFER,
        )
    }

    pub fn read_vertex_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.read_buffer(
            node_id,
            buffer,
            OnyxResourceState::VERTEX_AND_CONSTANT_BUFFER,
            OnyxPipelineStageFlags::VERTEX_INPUT,
        )
    }

    pub fn read_index_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.read_buffer(
            node_id,
            buffer,
            OnyxResourceState::INDEX_BUFFER,
            OnyxPipelineStageFlags::VERTEX_INPUT,
        )
    }

    pub fn read_indirect_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.read_buffer(
            node_id,
            buffer,
            OnyxResourceState::INDIRECT_ARGUMENT,
            OnyxPipelineStageFlags::DRAW_INDIRECT,
        )
    }

    pub fn read_uniform_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        self.read_buffer(
            node_id,
            buffer,
            OnyxResourceState::VERTEX_AND_CONSTANT_BUFFER,
            stages,
        )
    }

    pub fn read_storage_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        self.read_buffer(node_id, buffer, OnyxResourceState::UNORDERED_ACCESS, stages)
    }

    pub fn write_storage_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        self.write_buffer(node_id, buffer, OnyxResourceState::UNORDERED_ACCESS, stages)
    }

    pub fn read_acceleration_input_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.read_buffer(
            node_id,
            buffer,
            OnyxResourceState::ACCELERATION_STRUCTURE_READ,
            OnyxPipelineStageFlags::ACCELERATION_STRUCTURE_BUILD,
        )
    }

    pub fn write_acceleration_structure_buffer(
        &mut self,
        node_id: RenderGraphNodeId,
        buffer: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.write_buffer(
            node_id,
            buffer,
            OnyxResourceState::ACCELERATION_STRUCTURE_WRITE,
            OnyxPipelineStageFlags::ACCELERATION_STRUCTURE_BUILD,
        )
    }

    pub fn transfer_read_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.read_image(
            node_id,
            image,
            OnyxResourceState::COPY_SRC,
            OnyxPipelineStageFlags::TRANSFER,
        )
    }

    pub fn transfer_write_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.write_image(
            node_id,
            image,
            OnyxResourceState::COPY_DST,
            OnyxPipelineStageFlags::TRANSFER,
        )
    }

    pub fn sample_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        self.read_image(node_id, image, OnyxResourceState::SHADER_RESOURCE, stages)
    }

    pub fn read_storage_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        self.read_image(node_id, image, OnyxResourceState::UNORDERED_ACCESS, stages)
    }

    pub fn write_storage_image(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        self.write_image(node_id, image, OnyxResourceState::UNORDERED_ACCESS, stages)
    }

    pub fn color_attachment(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.write_image(
            node_id,
            image,
            OnyxResourceState::RENDER_TARGET,
            OnyxPipelineStageFlags::COLOR_ATTACHMENT,
        )
    }

    pub fn depth_attachment(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.write_image(
            node_id,
            image,
            OnyxResourceState::DEPTH_WRITE,
            OnyxPipelineStageFlags::DEPTH_ATTACHMENT,
        )
    }

    pub fn read_depth_attachment(
        &mut self,
        node_id: RenderGraphNodeId,
        image: RenderGraphResourceRef,
    ) -> RenderGraphResourceRef {
        self.read_image(
            node_id,
            image,
            OnyxResourceState::DEPTH_READ,
            OnyxPipelineStageFlags::DEPTH_ATTACHMENT,
        )
    }

    //
    // Executor-phase accessors
    //

    /// Look up the physical record behind a read handle. Valid only while the handle's
    /// generation matches the table, otherwise the resource was rewritten since the handle
    /// was obtained.
    pub fn get_read_buffer(
        &self,
        buffer: RenderGraphResourceRef,
    ) -> OnyxResult<&RenderGraphBufferResource> {
        debug_assert!(buffer.is_buffer());
        let resource = &self.buffers[buffer.index];
        if buffer.generation.write_count != resource.generation.write_count {
            return Err(OnyxError::StaleHandle {
                resource: resource.name.clone(),
                expected_write_count: resource.generation.write_count,
                actual_write_count: buffer.generation.write_count,
            });
        }
        Ok(resource)
    }

    pub fn get_write_buffer(
        &self,
        buffer: RenderGraphResourceRef,
    ) -> OnyxResult<&RenderGraphBufferResource> {
        self.get_read_buffer(buffer)
    }

    pub fn get_read_image(
        &self,
        image: RenderGraphResourceRef,
    ) -> OnyxResult<&RenderGraphImageResource> {
        debug_assert!(image.is_image());
        let resource = &self.images[image.index];
        if image.generation.write_count != resource.generation.write_count {
            return Err(OnyxError::StaleHandle {
                resource: resource.name.clone(),
                expected_write_count: resource.generation.write_count,
                actual_write_count: image.generation.write_count,
            });
        }
        Ok(resource)
    }

    pub fn get_write_image(
        &self,
        image: RenderGraphResourceRef,
    ) -> OnyxResult<&RenderGraphImageResource> {
        self.get_read_image(image)
    }

    //
    // Internals
    //

    fn latch_overflow(
        &mut self,
        name: &str,
    ) {
        if self.declare_error.is_none() {
            self.declare_error = Some(OnyxError::SchedulingInvariantViolation(format!(
                "generation counter overflow on resource {}",
                name
            )));
        }
    }

    pub(super) fn find_or_create_buffer(
        &mut self,
        name: &str,
        def: &OnyxBufferDef,
    ) -> usize {
        def.verify();
        // A redeclare under the same name adopts the new def; the last declaration wins
        if let Some(&index) = self.buffer_lookup.get(name) {
            self.buffers[index].def = def.clone();
            return index;
        }
        let index = self.buffers.len();
        self.buffers
            .push(RenderGraphBufferResource::new(name, def.clone()));
        self.buffer_lookup.insert(name.to_string(), index);
        index
    }

    pub(super) fn find_or_create_image(
        &mut self,
        name: &str,
        def: &OnyxTextureDef,
    ) -> usize {
        def.verify();
        if let Some(&index) = self.image_lookup.get(name) {
            self.images[index].def = def.clone();
            return index;
        }
        let index = self.images.len();
        self.images
            .push(RenderGraphImageResource::new(name, def.clone()));
        self.image_lookup.insert(name.to_string(), index);
        index
    }

    fn register_external_buffer(
        &mut self,
        external: &RenderGraphExternalBuffer,
    ) -> usize {
        let index = self.find_or_create_buffer(&external.name, &external.def);
        let resource = &mut self.buffers[index];
        if !resource.external {
            resource.external = true;
            resource.current_state = external.initial_state;
        }
        resource.buffer = Some(external.buffer);
        index
    }

    fn register_external_image(
        &mut self,
        external: &RenderGraphExternalImage,
    ) -> usize {
        let index = self.find_or_create_image(&external.name, &external.def);
        let resource = &mut self.images[index];
        if !resource.external {
            resource.external = true;
            resource.current_state = external.initial_state;
        }
        resource.texture = Some(external.texture);
        index
    }

    fn find_or_create_history_shadow(
        &mut self,
        main_index: usize,
    ) -> usize {
        if let Some(shadow) = self.images[main_index].history_index {
            return shadow;
        }
        debug_assert!(
            !self.images[main_index].external,
            "external image {} cannot have frame history",
            self.images[main_index].name
        );
        let shadow_name = format!("{} [Previous]", self.images[main_index].name);
        let def = self.images[main_index].def.clone();
        let shadow = self.find_or_create_image(&shadow_name, &def);
        self.images[main_index].history_index = Some(shadow);
        self.images[shadow].history_of = Some(main_index);
        shadow
    }

    fn read_buffer_index(
        &mut self,
        node_id: RenderGraphNodeId,
        index: usize,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        if !self.buffers[index].generation.bump_read() {
            let name = self.buffers[index].name.clone();
            self.latch_overflow(&name);
        }
        let generation = self.buffers[index].generation;
        let reference = RenderGraphResourceRef {
            resource_type: RenderGraphResourceType::Buffer,
            index,
            generation,
        };
        let usage_id = RenderGraphUsageId(self.usages.len());
        self.usages.push(RenderGraphResourceUsage {
            node: node_id,
            resource: reference,
            is_write: false,
            state,
            stages,
            next_use: None,
        });
        self.nodes[node_id.0].inputs.push(usage_id);
        self.buffers[index].read_in.push(usage_id);
        reference
    }

    fn read_image_index(
        &mut self,
        node_id: RenderGraphNodeId,
        index: usize,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) -> RenderGraphResourceRef {
        if !self.images[index].generation.bump_read() {
            let name = self.images[index].name.clone();
            self.latch_overflow(&name);
        }
        let generation = self.images[index].generation;
        let reference = RenderGraphResourceRef {
            resource_type: RenderGraphResourceType::Image,
            index,
            generation,
        };
        let usage_id = RenderGraphUsageId(self.usages.len());
        self.usages.push(RenderGraphResourceUsage {
            node: node_id,
            resource: reference,
            is_write: false,
            state,
            stages,
            next_use: None,
        });
        self.nodes[node_id.0].inputs.push(usage_id);
        self.images[index].read_in.push(usage_id);
        reference
    }

    fn write_buffer_index(
        &mut self,
        node_id: RenderGraphNodeId,
        index: usize,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
        slot: Option<usize>,
    ) -> RenderGraphResourceRef {
        let reuse = slot.and_then(|s| self.retire_output_slot(node_id, s));

        // The edge snapshots the generation the write consumed, the returned handle carries
        // the generation it produced
        let consumed = self.buffers[index].generation;
        if !self.buffers[index].generation.bump_write() {
            let name = self.buffers[index].name.clone();
            self.latch_overflow(&name);
        }
        let usage = RenderGraphResourceUsage {
            node: node_id,
            resource: RenderGraphResourceRef {
                resource_type: RenderGraphResourceType::Buffer,
                index,
                generation: consumed,
            },
            is_write: true,
            state,
            stages,
            next_use: None,
        };
        let usage_id = self.install_output_usage(node_id, usage, slot, reuse);
        self.buffers[index].written_in.push(usage_id);
        RenderGraphResourceRef {
            resource_type: RenderGraphResourceType::Buffer,
            index,
            generation: self.buffers[index].generation,
        }
    }

    fn write_image_index(
        &mut self,
        node_id: RenderGraphNodeId,
        index: usize,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
        slot: Option<usize>,
    ) -> RenderGraphResourceRef {
        let reuse = slot.and_then(|s| self.retire_output_slot(node_id, s));

        let consumed = self.images[index].generation;
        if !self.images[index].generation.bump_write() {
            let name = self.images[index].name.clone();
            self.latch_overflow(&name);
        }
        let usage = RenderGraphResourceUsage {
            node: node_id,
            resource: RenderGraphResourceRef {
                resource_type: RenderGraphResourceType::Image,
                index,
                generation: consumed,
            },
            is_write: true,
            state,
            stages,
            next_use: None,
        };
        let usage_id = self.install_output_usage(node_id, usage, slot, reuse);
        self.images[index].written_in.push(usage_id);
        RenderGraphResourceRef {
            resource_type: RenderGraphResourceType::Image,
            index,
            generation: self.images[index].generation,
        }
    }

    /// Undo the bookkeeping of the write edge currently occupying `slot`, returning its
    /// arena entry for reuse. Only the latest write to a resource can be retired.
    fn retire_output_slot(
        &mut self,
        node_id: RenderGraphNodeId,
        slot: usize,
    ) -> Option<RenderGraphUsageId> {
        if slot >= self.nodes[node_id.0].outputs.len() {
            return None;
        }
        let usage_id = self.nodes[node_id.0].outputs[slot];
        let old = self.usages[usage_id.0].clone();
        debug_assert!(old.is_write);
        match old.resource.resource_type {
            RenderGraphResourceType::Buffer => {
                let resource = &mut self.buffers[old.resource.index];
                // A saturated counter cannot identify the latest write; the latched
                // overflow error fails the next compile regardless
                debug_assert!(
                    old.resource
                        .generation
                        .write_count
                        .checked_add(1)
                        .map_or(true, |produced| produced == resource.generation.write_count),
                    "replacing output slot {} of node {} would orphan a later write of {}",
                    slot,
                    self.nodes[node_id.0].name,
                    resource.name
                );
                resource.generation.retire_write();
                resource.written_in.retain(|&u| u != usage_id);
            }
            RenderGraphResourceType::Image => {
                let resource = &mut self.images[old.resource.index];
                debug_assert!(
                    old.resource
                        .generation
                        .write_count
                        .checked_add(1)
                        .map_or(true, |produced| produced == resource.generation.write_count),
                    "replacing output slot {} of node {} would orphan a later write of {}",
                    slot,
                    self.nodes[node_id.0].name,
                    resource.name
                );
                resource.generation.retire_write();
                resource.written_in.retain(|&u| u != usage_id);
            }
        }
        Some(usage_id)
    }

    fn install_output_usage(
        &mut self,
        node_id: RenderGraphNodeId,
        usage: RenderGraphResourceUsage,
        slot: Option<usize>,
        reuse: Option<RenderGraphUsageId>,
    ) -> RenderGraphUsageId {
        match reuse {
            Some(usage_id) => {
                self.usages[usage_id.0] = usage;
                usage_id
            }
            None => {
                let usage_id = RenderGraphUsageId(self.usages.len());
                self.usages.push(usage);
                let outputs = &mut self.nodes[node_id.0].outputs;
                match slot {
                    Some(s) => {
                        debug_assert_eq!(s, outputs.len(), "output slots must be declared in order");
                        outputs.push(usage_id);
                    }
                    None => outputs.push(usage_id),
                }
                usage_id
            }
        }
    }
}
