use super::*;
use fnv::FnvHashMap;
use onyx_api::{
    pipeline_stages_for_state, OnyxBarrierResource, OnyxDeviceContext, OnyxError,
    OnyxResourceBarrier,
};

type PhysicalKey = (RenderGraphResourceType, usize);

impl RenderGraphBuilder {
    /// Run the compiled plan: swap history pairs, then walk the scheduled nodes in order,
    /// inserting one coalesced barrier batch per node before invoking its executor.
    pub fn execute(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
    ) -> OnyxResult<()> {
        profiling::scope!("render_graph_execute");

        if !self.compiled {
            return Err(OnyxError::SchedulingInvariantViolation(
                "execute called before compile".to_string(),
            ));
        }

        self.swap_history_images();

        // Generations are replayed node by node as execution progresses, so the accessor
        // staleness checks see the counts as they stood when each node was declared
        for buffer in &mut self.buffers {
            buffer.generation = Default::default();
        }
        for image in &mut self.images {
            image.generation = Default::default();
        }

        self.build_linked_use_lists();

        let mut executors = std::mem::take(&mut self.executors);
        let result = self.run_scheduled_nodes(device, &mut executors);
        for (node_id, executor) in self.executors.drain() {
            executors.insert(node_id, executor);
        }
        self.executors = executors;
        result
    }

    fn run_scheduled_nodes(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
        executors: &mut FnvHashMap<RenderGraphNodeId, Box<dyn RenderGraphNodeExecutor>>,
    ) -> OnyxResult<()> {
        let scheduled = self.scheduled_nodes.clone();
        for node_id in scheduled {
            log::trace!("executing node {}", self.nodes[node_id.0].name);
            self.replay_node_generations(node_id);
            self.insert_node_barriers(device, node_id)?;
            if let Some(executor) = executors.get_mut(&node_id) {
                executor.execute(self, device)?;
            }
            #[cfg(debug_assertions)]
            self.check_node_resource_states(node_id);
        }
        Ok(())
    }

    /// Swap each history pair's physical storage. Runs exactly once per execute, before any
    /// node sees a resource, so no partial-swap state is ever observable.
    fn swap_history_images(&mut self) {
        for index in 0..self.images.len() {
            let shadow = match self.images[index].history_index {
                Some(shadow) => shadow,
                None => continue,
            };
            debug_assert_ne!(index, shadow);
            let (first, second) = if index < shadow {
                let (head, tail) = self.images.split_at_mut(shadow);
                (&mut head[index], &mut tail[0])
            } else {
                let (head, tail) = self.images.split_at_mut(index);
                (&mut tail[0], &mut head[shadow])
            };
            std::mem::swap(&mut first.texture, &mut second.texture);
            std::mem::swap(&mut first.placed, &mut second.placed);
            std::mem::swap(&mut first.current_state, &mut second.current_state);
            std::mem::swap(&mut first.used_stages, &mut second.used_stages);
            log::trace!("swapped history pair {} / {}", first.name, second.name);
        }
    }

    fn replay_node_generations(
        &mut self,
        node_id: RenderGraphNodeId,
    ) {
        for usage_index in 0..self.nodes[node_id.0].inputs.len() {
            let reference = self.usages[self.nodes[node_id.0].inputs[usage_index].0].resource;
            let _ = match reference.resource_type {
                RenderGraphResourceType::Buffer => {
                    self.buffers[reference.index].generation.bump_read()
                }
                RenderGraphResourceType::Image => {
                    self.images[reference.index].generation.bump_read()
                }
            };
        }
        for usage_index in 0..self.nodes[node_id.0].outputs.len() {
            let reference = self.usages[self.nodes[node_id.0].outputs[usage_index].0].resource;
            let _ = match reference.resource_type {
                RenderGraphResourceType::Buffer => {
                    self.buffers[reference.index].generation.bump_write()
                }
                RenderGraphResourceType::Image => {
                    self.images[reference.index].generation.bump_write()
                }
            };
        }
    }

    /// Chain every scheduled edge touching the same physical storage into a forward list.
    /// Alias chain members share one key so their lists stitch together automatically; a
    /// history pair's tail is linked to its shadow's head so barrier stage widening can see
    /// across the frame boundary.
    fn build_linked_use_lists(&mut self) {
        for usage in &mut self.usages {
            usage.next_use = None;
        }

        let mut first_use: FnvHashMap<PhysicalKey, RenderGraphUsageId> = Default::default();
        let mut last_use: FnvHashMap<PhysicalKey, RenderGraphUsageId> = Default::default();

        for position in 0..self.scheduled_nodes.len() {
            let node_id = self.scheduled_nodes[position];
            let edges: Vec<RenderGraphUsageId> = self.nodes[node_id.0]
                .inputs
                .iter()
                .chain(self.nodes[node_id.0].outputs.iter())
                .copied()
                .collect();
            for usage_id in edges {
                let key = self.physical_key(&self.usages[usage_id.0].resource);
                if let Some(previous) = last_use.insert(key, usage_id) {
                    self.usages[previous.0].next_use = Some(usage_id);
                } else {
                    first_use.insert(key, usage_id);
                }
            }
        }

        for index in 0..self.images.len() {
            if let Some(shadow) = self.images[index].history_index {
                let main_key = (RenderGraphResourceType::Image, self.image_root(index));
                let shadow_key = (RenderGraphResourceType::Image, self.image_root(shadow));
                if let (Some(&tail), Some(&head)) =
                    (last_use.get(&main_key), first_use.get(&shadow_key))
                {
                    self.usages[tail.0].next_use = Some(head);
                }
            }
        }
    }

    fn insert_node_barriers(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
        node_id: RenderGraphNodeId,
    ) -> OnyxResult<()> {
        let edges: Vec<RenderGraphUsageId> = self.nodes[node_id.0]
            .inputs
            .iter()
            .chain(self.nodes[node_id.0].outputs.iter())
            .copied()
            .collect();

        let mut barriers: Vec<OnyxResourceBarrier> = Vec::new();
        let mut src_stages = OnyxPipelineStageFlags::NONE;
        let mut dst_stages = OnyxPipelineStageFlags::NONE;

        for usage_id in edges {
            let usage = self.usages[usage_id.0].clone();
            let key = self.physical_key(&usage.resource);
            let (current_state, used_stages) = self.tracked_state(key);

            // A run of uses in the same state needs no barrier, it only widens the source
            // stages of the next transition. Write hazard states always re-barrier.
            if current_state == usage.state && !usage.state.is_write_hazard() {
                self.merge_used_stages(key, usage.stages);
                continue;
            }

            let physical = match self.physical_barrier_resource(key) {
                Some(physical) => physical,
                None => {
                    return Err(OnyxError::BarrierConflict(format!(
                        "{} needs a transition to {:?} but has no physical allocation",
                        self.resource_name(&usage.resource),
                        usage.state
                    )));
                }
            };

            // Widen the destination stages across the same-state run that follows, so the
            // merged reads above are covered by this one barrier
            let mut widened_dst = usage.stages;
            let mut next = usage.next_use;
            while let Some(next_id) = next {
                let next_usage = &self.usages[next_id.0];
                if next_usage.state != usage.state || next_usage.state.is_write_hazard() {
                    break;
                }
                widened_dst |= next_usage.stages;
                next = next_usage.next_use;
            }
            dst_stages |= widened_dst;
            src_stages |= if used_stages != OnyxPipelineStageFlags::NONE {
                used_stages
            } else {
                pipeline_stages_for_state(current_state)
            };
            barriers.push(OnyxResourceBarrier {
                resource: physical,
                src_state: current_state,
                dst_state: usage.state,
            });

            if current_state == OnyxResourceState::UNDEFINED {
                self.discard_overlapping(
                    &usage.resource,
                    &mut barriers,
                    &mut src_stages,
                    &mut dst_stages,
                );
            }

            self.set_tracked_state(key, usage.state, usage.stages);
        }

        if !barriers.is_empty() {
            device.insert_barriers(src_stages, dst_stages, &barriers)?;
        }
        Ok(())
    }

    /// A resource leaving the undefined state is taking over bytes other packed resources
    /// may have used. Force every known overlap into the discarded state in the same batch;
    /// its contents must never be assumed valid again.
    fn discard_overlapping(
        &mut self,
        resource: &RenderGraphResourceRef,
        barriers: &mut Vec<OnyxResourceBarrier>,
        src_stages: &mut OnyxPipelineStageFlags,
        dst_stages: &mut OnyxPipelineStageFlags,
    ) {
        let overlaps = match resource.resource_type {
            RenderGraphResourceType::Buffer => {
                self.buffers[resource.index].overlaps_with.clone()
            }
            RenderGraphResourceType::Image => self.images[resource.index].overlaps_with.clone(),
        };
        for key in overlaps {
            let (state, used_stages) = self.tracked_state(key);
            if state == OnyxResourceState::UNDEFINED || state == OnyxResourceState::DISCARDED {
                continue;
            }
            let physical = match self.physical_barrier_resource(key) {
                Some(physical) => physical,
                None => continue,
            };
            log::trace!(
                "discarding {} overlapped by {}",
                self.physical_name(key),
                self.resource_name(resource)
            );
            *src_stages |= if used_stages != OnyxPipelineStageFlags::NONE {
                used_stages
            } else {
                pipeline_stages_for_state(state)
            };
            *dst_stages |= pipeline_stages_for_state(state);
            barriers.push(OnyxResourceBarrier {
                resource: physical,
                src_state: state,
                dst_state: OnyxResourceState::DISCARDED,
            });
            self.set_tracked_state(key, OnyxResourceState::DISCARDED, OnyxPipelineStageFlags::NONE);
        }
    }

    #[cfg(debug_assertions)]
    fn check_node_resource_states(
        &self,
        node_id: RenderGraphNodeId,
    ) {
        // Per physical resource, only the last edge of the node reflects the state it was
        // left in
        let mut expected: FnvHashMap<PhysicalKey, OnyxResourceState> = Default::default();
        for usage_id in self.nodes[node_id.0]
            .inputs
            .iter()
            .chain(self.nodes[node_id.0].outputs.iter())
        {
            let usage = &self.usages[usage_id.0];
            expected.insert(self.physical_key(&usage.resource), usage.state);
        }
        for (key, state) in expected {
            let (current_state, _) = self.tracked_state(key);
            debug_assert_eq!(
                current_state,
                state,
                "node {} left {} in {:?}, declared {:?}",
                self.nodes[node_id.0].name,
                self.physical_name(key),
                current_state,
                state
            );
        }
    }

    //
    // Teardown
    //

    /// Drop the frame's nodes and edges and park or free its physical objects. External
    /// handles are returned untouched; transient dedicated objects go to the retained cache
    /// so identical declarations next frame revive them; placed objects and their heaps are
    /// freed.
    pub fn reset(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
    ) {
        profiling::scope!("render_graph_reset");

        for index in 0..self.buffers.len() {
            let handle = self.buffers[index].buffer.take();
            if self.buffers[index].external || self.buffers[index].alias_of.is_some() {
                continue;
            }
            if let Some(handle) = handle {
                if self.buffers[index].placed {
                    device.destroy_buffer(handle);
                } else {
                    let name = self.buffers[index].name.clone();
                    let retained = RetainedResource::Buffer {
                        def: self.buffers[index].def.clone(),
                        buffer: handle,
                        state: self.buffers[index].current_state,
                    };
                    match self.retained.insert(name, retained) {
                        Some(RetainedResource::Buffer { buffer, .. }) => {
                            device.destroy_buffer(buffer)
                        }
                        Some(RetainedResource::Image { texture, .. }) => {
                            device.destroy_texture(texture)
                        }
                        None => {}
                    }
                }
            }
        }

        for index in 0..self.images.len() {
            let handle = self.images[index].texture.take();
            if self.images[index].external || self.images[index].alias_of.is_some() {
                continue;
            }
            if let Some(handle) = handle {
                if self.images[index].placed {
                    device.destroy_texture(handle);
                } else {
                    let name = self.images[index].name.clone();
                    let retained = RetainedResource::Image {
                        def: self.images[index].def.clone(),
                        texture: handle,
                        state: self.images[index].current_state,
                    };
                    match self.retained.insert(name, retained) {
                        Some(RetainedResource::Buffer { buffer, .. }) => {
                            device.destroy_buffer(buffer)
                        }
                        Some(RetainedResource::Image { texture, .. }) => {
                            device.destroy_texture(texture)
                        }
                        None => {}
                    }
                }
            }
        }

        for heap in self.heaps.drain(..) {
            device.free_heap(heap);
        }

        self.nodes.clear();
        self.node_lookup.clear();
        self.executors.clear();
        self.usages.clear();
        self.buffers.clear();
        self.buffer_lookup.clear();
        self.images.clear();
        self.image_lookup.clear();
        self.scheduled_nodes.clear();
        self.node_schedule_index.clear();
        self.declare_error = None;
        self.compiled = false;
    }

    /// Reset and additionally free everything in the retained cache. Call before dropping
    /// the builder; nothing else releases the parked objects.
    pub fn destroy(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
    ) {
        self.reset(device);
        for (_, retained) in self.retained.drain() {
            match retained {
                RetainedResource::Buffer { buffer, .. } => device.destroy_buffer(buffer),
                RetainedResource::Image { texture, .. } => device.destroy_texture(texture),
            }
        }
    }

    //
    // Physical state tracking
    //

    fn buffer_root(
        &self,
        index: usize,
    ) -> usize {
        self.buffers[index].alias_of.unwrap_or(index)
    }

    fn image_root(
        &self,
        index: usize,
    ) -> usize {
        self.images[index].alias_of.unwrap_or(index)
    }

    fn physical_key(
        &self,
        resource: &RenderGraphResourceRef,
    ) -> PhysicalKey {
        match resource.resource_type {
            RenderGraphResourceType::Buffer => {
                (RenderGraphResourceType::Buffer, self.buffer_root(resource.index))
            }
            RenderGraphResourceType::Image => {
                (RenderGraphResourceType::Image, self.image_root(resource.index))
            }
        }
    }

    fn tracked_state(
        &self,
        key: PhysicalKey,
    ) -> (OnyxResourceState, OnyxPipelineStageFlags) {
        match key.0 {
            RenderGraphResourceType::Buffer => {
                let buffer = &self.buffers[key.1];
                (buffer.current_state, buffer.used_stages)
            }
            RenderGraphResourceType::Image => {
                let image = &self.images[key.1];
                (image.current_state, image.used_stages)
            }
        }
    }

    fn set_tracked_state(
        &mut self,
        key: PhysicalKey,
        state: OnyxResourceState,
        stages: OnyxPipelineStageFlags,
    ) {
        match key.0 {
            RenderGraphResourceType::Buffer => {
                self.buffers[key.1].current_state = state;
                self.buffers[key.1].used_stages = stages;
            }
            RenderGraphResourceType::Image => {
                self.images[key.1].current_state = state;
                self.images[key.1].used_stages = stages;
            }
        }
    }

    fn merge_used_stages(
        &mut self,
        key: PhysicalKey,
        stages: OnyxPipelineStageFlags,
    ) {
        match key.0 {
            RenderGraphResourceType::Buffer => self.buffers[key.1].used_stages |= stages,
            RenderGraphResourceType::Image => self.images[key.1].used_stages |= stages,
        }
    }

    fn physical_barrier_resource(
        &self,
        key: PhysicalKey,
    ) -> Option<OnyxBarrierResource> {
        match key.0 {
            RenderGraphResourceType::Buffer => {
                self.buffers[key.1].buffer.map(OnyxBarrierResource::Buffer)
            }
            RenderGraphResourceType::Image => {
                self.images[key.1].texture.map(OnyxBarrierResource::Texture)
            }
        }
    }

    fn physical_name(
        &self,
        key: PhysicalKey,
    ) -> &str {
        match key.0 {
            RenderGraphResourceType::Buffer => &self.buffers[key.1].name,
            RenderGraphResourceType::Image => &self.images[key.1].name,
        }
    }
}
