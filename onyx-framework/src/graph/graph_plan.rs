use super::*;
use fnv::{FnvHashMap, FnvHashSet};
use onyx_api::{resource_type_for_state, OnyxDeviceContext, OnyxError, OnyxMemoryRequirements};
use std::collections::BTreeMap;

#[derive(Clone, Copy, PartialEq, Eq)]
enum TraversalMark {
    Unvisited,
    OnStack,
    Done,
}

/// One resource to pack into a shared heap
struct HeapPlacement {
    resource_type: RenderGraphResourceType,
    index: usize,
    size: u64,
    alignment: u64,
    first_node: usize,
    last_node: usize,
    offset: u64,
}

fn round_up_to_alignment(
    value: u64,
    alignment: u64,
) -> u64 {
    if alignment <= 1 {
        return value;
    }
    ((value + alignment - 1) / alignment) * alignment
}

impl RenderGraphBuilder {
    /// Turn this frame's declarations into an executable plan: schedule the nodes reachable
    /// from `outputs`, drop everything else, compute resource lifetimes, alias and allocate
    /// physical storage.
    ///
    /// An empty `outputs` list is the degenerate mode: every declared node runs in
    /// declaration order and nothing is culled.
    pub fn compile(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
        outputs: &[RenderGraphResourceRef],
    ) -> OnyxResult<()> {
        profiling::scope!("render_graph_compile");

        if let Some(error) = self.declare_error.take() {
            return Err(error);
        }

        self.schedule_nodes(outputs)?;
        self.compute_lifetimes();
        self.propagate_usage_flags();

        let use_heaps = match self.options.allocation_strategy {
            RenderGraphAllocationStrategy::Dedicated => false,
            RenderGraphAllocationStrategy::HeapPacked => {
                if device.supports_placed_memory() {
                    true
                } else {
                    log::debug!("placed memory not supported, using dedicated allocations");
                    false
                }
            }
        };

        if use_heaps {
            self.allocate_heap_packed(device)?;
        } else {
            if self.options.enable_resource_aliasing {
                self.build_aliases();
            }
            self.allocate_dedicated(device)?;
        }

        let aliased_count = self.buffers.iter().filter(|b| b.alias_of.is_some()).count()
            + self.images.iter().filter(|i| i.alias_of.is_some()).count();
        log::info!(
            "render graph compiled: {} of {} nodes scheduled, {} buffers, {} images, {} aliased, {} heaps",
            self.scheduled_nodes.len(),
            self.nodes.len(),
            self.buffers.len(),
            self.images.len(),
            aliased_count,
            self.heaps.len()
        );

        self.compiled = true;
        Ok(())
    }

    //
    // Scheduling
    //

    fn schedule_nodes(
        &mut self,
        outputs: &[RenderGraphResourceRef],
    ) -> OnyxResult<()> {
        self.scheduled_nodes.clear();
        self.node_schedule_index = vec![None; self.nodes.len()];

        if outputs.is_empty() {
            self.scheduled_nodes = self.nodes.iter().map(|n| n.id).collect();
            for (position, node_id) in self.scheduled_nodes.iter().enumerate() {
                self.node_schedule_index[node_id.0] = Some(position);
            }
            return Ok(());
        }

        let mut roots = self.find_output_producers(outputs)?;
        self.pin_history_producers(&mut roots);
        self.compute_node_dependencies();
        let order = self.traverse_dependencies(&roots)?;
        let mut scheduled = self.cull_dead_nodes(order, &roots);

        if self.options.enable_node_reordering && scheduled.len() > 2 {
            scheduled = self.reorder_nodes(scheduled);
        }

        for (position, node_id) in scheduled.iter().enumerate() {
            self.node_schedule_index[node_id.0] = Some(position);
            log::trace!("scheduled [{}] {}", position, self.nodes[node_id.0].name);
        }
        self.scheduled_nodes = scheduled;
        Ok(())
    }

    /// The node holding the most recent write edge of each output resource
    fn find_output_producers(
        &self,
        outputs: &[RenderGraphResourceRef],
    ) -> OnyxResult<Vec<RenderGraphNodeId>> {
        let mut roots = Vec::new();
        for output in outputs {
            let write_count = match output.resource_type {
                RenderGraphResourceType::Buffer => {
                    self.buffers[output.index].generation.write_count
                }
                RenderGraphResourceType::Image => self.images[output.index].generation.write_count,
            };
            let producer = self
                .find_previous_writer(output, write_count)
                .map(|usage_id| self.usages[usage_id.0].node);
            match producer {
                Some(node_id) => {
                    if !roots.contains(&node_id) {
                        roots.push(node_id);
                    }
                }
                None => {
                    return Err(OnyxError::StringError(format!(
                        "output resource {} has no writer",
                        self.resource_name(output)
                    )));
                }
            }
        }
        Ok(roots)
    }

    /// A read of an image's previous-frame contents pins this frame's producer of the main
    /// image, even when nothing in the current frame consumes it. Without this the culling
    /// pass would starve the history pair.
    fn pin_history_producers(
        &self,
        roots: &mut Vec<RenderGraphNodeId>,
    ) {
        for index in 0..self.images.len() {
            let shadow = match self.images[index].history_index {
                Some(shadow) => shadow,
                None => continue,
            };
            if self.images[shadow].read_in.is_empty() {
                continue;
            }
            let reference = RenderGraphResourceRef {
                resource_type: RenderGraphResourceType::Image,
                index,
                generation: self.images[index].generation,
            };
            if let Some(writer) =
                self.find_previous_writer(&reference, self.images[index].generation.write_count)
            {
                let node_id = self.usages[writer.0].node;
                if !roots.contains(&node_id) {
                    roots.push(node_id);
                }
            }
        }
    }

    /// The write edge that produced generation `write_count`, i.e. the one that consumed
    /// `write_count - 1`
    fn find_previous_writer(
        &self,
        resource: &RenderGraphResourceRef,
        write_count: u8,
    ) -> Option<RenderGraphUsageId> {
        if write_count == 0 {
            return None;
        }
        self.resource_written_in(resource)
            .iter()
            .copied()
            .find(|&usage_id| {
                self.usages[usage_id.0].resource.generation.write_count == write_count - 1
            })
    }

    /// All read edges observing generation `write_count`
    fn find_readers(
        &self,
        resource: &RenderGraphResourceRef,
        write_count: u8,
    ) -> Vec<RenderGraphUsageId> {
        self.resource_read_in(resource)
            .iter()
            .copied()
            .filter(|&usage_id| {
                self.usages[usage_id.0].resource.generation.write_count == write_count
            })
            .collect()
    }

    fn compute_node_dependencies(&mut self) {
        for node_index in 0..self.nodes.len() {
            let mut depends_on = Vec::new();

            // A read depends on the write that produced the generation it observes
            for input_index in 0..self.nodes[node_index].inputs.len() {
                let usage = self.usages[self.nodes[node_index].inputs[input_index].0].clone();
                if let Some(writer) =
                    self.find_previous_writer(&usage.resource, usage.resource.generation.write_count)
                {
                    let writer_node = self.usages[writer.0].node;
                    if writer_node.0 != node_index && !depends_on.contains(&writer_node) {
                        depends_on.push(writer_node);
                    }
                }
            }

            // A write must come after every reader of the generation it replaces. When
            // there are no readers it still depends on the previous writer, which keeps
            // writer chains ordered even without an observer (aliasing safety).
            for output_index in 0..self.nodes[node_index].outputs.len() {
                let usage = self.usages[self.nodes[node_index].outputs[output_index].0].clone();
                let consumed = usage.resource.generation.write_count;
                let readers = self.find_readers(&usage.resource, consumed);
                let mut found_reader = false;
                for reader in readers {
                    let reader_node = self.usages[reader.0].node;
                    if reader_node.0 != node_index {
                        found_reader = true;
                        if !depends_on.contains(&reader_node) {
                            depends_on.push(reader_node);
                        }
                    }
                }
                if !found_reader {
                    if let Some(writer) = self.find_previous_writer(&usage.resource, consumed) {
                        let writer_node = self.usages[writer.0].node;
                        if writer_node.0 != node_index && !depends_on.contains(&writer_node) {
                            depends_on.push(writer_node);
                        }
                    }
                }
            }

            self.nodes[node_index].depends_on = depends_on;
        }
    }

    /// Depth-first post-order from the output producers. The post-order visits every
    /// dependency before its dependent, so the result is a valid topological order.
    fn traverse_dependencies(
        &self,
        roots: &[RenderGraphNodeId],
    ) -> OnyxResult<Vec<RenderGraphNodeId>> {
        let mut marks = vec![TraversalMark::Unvisited; self.nodes.len()];
        let mut order = Vec::new();

        for &root in roots {
            if marks[root.0] == TraversalMark::Done {
                continue;
            }
            let mut stack: Vec<(RenderGraphNodeId, usize)> = vec![(root, 0)];
            marks[root.0] = TraversalMark::OnStack;

            while let Some(&mut (node_id, ref mut cursor)) = stack.last_mut() {
                let depends_on = &self.nodes[node_id.0].depends_on;
                if *cursor < depends_on.len() {
                    let dep = depends_on[*cursor];
                    *cursor += 1;
                    match marks[dep.0] {
                        TraversalMark::Unvisited => {
                            marks[dep.0] = TraversalMark::OnStack;
                            stack.push((dep, 0));
                        }
                        TraversalMark::OnStack => {
                            return Err(OnyxError::SchedulingInvariantViolation(format!(
                                "dependency cycle between {} and {}",
                                self.nodes[node_id.0].name, self.nodes[dep.0].name
                            )));
                        }
                        TraversalMark::Done => {}
                    }
                } else {
                    marks[node_id.0] = TraversalMark::Done;
                    order.push(node_id);
                    stack.pop();
                }
            }
        }
        Ok(order)
    }

    /// Backward liveness walk. A node survives only if it produces a declared output or an
    /// already-kept node consumes one of its outputs, either by reading the generation it
    /// produced or by writing over it.
    fn cull_dead_nodes(
        &self,
        order: Vec<RenderGraphNodeId>,
        roots: &[RenderGraphNodeId],
    ) -> Vec<RenderGraphNodeId> {
        let mut keep = vec![false; self.nodes.len()];
        for &root in roots {
            keep[root.0] = true;
        }

        for &node_id in order.iter().rev() {
            if keep[node_id.0] {
                continue;
            }
            let mut live = false;
            'outputs: for &usage_id in &self.nodes[node_id.0].outputs {
                let usage = &self.usages[usage_id.0];
                let produced = usage.resource.generation.write_count + 1;
                for &reader in self.resource_read_in(&usage.resource) {
                    let reader_usage = &self.usages[reader.0];
                    if reader_usage.resource.generation.write_count == produced
                        && keep[reader_usage.node.0]
                    {
                        live = true;
                        break 'outputs;
                    }
                }
                for &writer in self.resource_written_in(&usage.resource) {
                    let writer_usage = &self.usages[writer.0];
                    if writer_usage.resource.generation.write_count == produced
                        && keep[writer_usage.node.0]
                    {
                        live = true;
                        break 'outputs;
                    }
                }
            }
            if live {
                keep[node_id.0] = true;
            } else {
                log::debug!("culling dead node {}", self.nodes[node_id.0].name);
            }
        }

        order.into_iter().filter(|n| keep[n.0]).collect()
    }

    /// Greedy list scheduling: repeatedly pick the candidate whose execution can overlap the
    /// longest run of already-scheduled trailing nodes. Best-effort; changes parallelism
    /// hints, not semantics.
    fn reorder_nodes(
        &self,
        scheduled: Vec<RenderGraphNodeId>,
    ) -> Vec<RenderGraphNodeId> {
        let closures = self.transitive_dependencies(&scheduled);

        let mut remaining = scheduled;
        let mut remaining_set: FnvHashSet<RenderGraphNodeId> = remaining.iter().copied().collect();
        let mut result = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut best: Option<(usize, usize)> = None;
            for (candidate_index, &candidate) in remaining.iter().enumerate() {
                let closure = &closures[&candidate];
                if closure.iter().any(|dep| remaining_set.contains(dep)) {
                    continue;
                }
                if self.output_observed_by_remaining(candidate, &remaining_set) {
                    continue;
                }
                let score = result
                    .iter()
                    .rev()
                    .take_while(|scheduled_node| !closure.contains(*scheduled_node))
                    .count();
                match best {
                    Some((_, best_score)) if score <= best_score => {}
                    _ => best = Some((candidate_index, score)),
                }
            }

            let pick = best.map(|(index, _)| index).unwrap_or(0);
            let node_id = remaining.remove(pick);
            remaining_set.remove(&node_id);
            result.push(node_id);
        }
        result
    }

    fn transitive_dependencies(
        &self,
        scheduled: &[RenderGraphNodeId],
    ) -> FnvHashMap<RenderGraphNodeId, FnvHashSet<RenderGraphNodeId>> {
        let mut closures: FnvHashMap<RenderGraphNodeId, FnvHashSet<RenderGraphNodeId>> =
            Default::default();
        // Scheduled order is topological, so dependency closures are already complete when
        // a dependent node needs them
        for &node_id in scheduled {
            let mut closure = FnvHashSet::default();
            for &dep in &self.nodes[node_id.0].depends_on {
                closure.insert(dep);
                if let Some(dep_closure) = closures.get(&dep) {
                    closure.extend(dep_closure.iter().copied());
                }
            }
            closures.insert(node_id, closure);
        }
        closures
    }

    /// True if some still-unscheduled node reads one of `node_id`'s output resources at the
    /// generation the output replaced or older. Scheduling the writer first would let it
    /// clobber data those readers still need.
    fn output_observed_by_remaining(
        &self,
        node_id: RenderGraphNodeId,
        remaining: &FnvHashSet<RenderGraphNodeId>,
    ) -> bool {
        for &usage_id in &self.nodes[node_id.0].outputs {
            let usage = &self.usages[usage_id.0];
            let consumed = usage.resource.generation.write_count;
            for &reader in self.resource_read_in(&usage.resource) {
                let reader_usage = &self.usages[reader.0];
                if reader_usage.node != node_id
                    && reader_usage.resource.generation.write_count <= consumed
                    && remaining.contains(&reader_usage.node)
                {
                    return true;
                }
            }
        }
        false
    }

    //
    // Lifetimes, aliasing, allocation
    //

    fn compute_lifetimes(&mut self) {
        for buffer in &mut self.buffers {
            buffer.lifetime = Default::default();
            buffer.alias_of = None;
            buffer.overlaps_with.clear();
        }
        for image in &mut self.images {
            image.lifetime = Default::default();
            image.alias_of = None;
            image.overlaps_with.clear();
        }

        for (position, &node_id) in self.scheduled_nodes.iter().enumerate() {
            for usage_index in 0..self.nodes[node_id.0].inputs.len() {
                let usage_id = self.nodes[node_id.0].inputs[usage_index];
                let reference = self.usages[usage_id.0].resource;
                match reference.resource_type {
                    RenderGraphResourceType::Buffer => {
                        self.buffers[reference.index].lifetime.add_read(position)
                    }
                    RenderGraphResourceType::Image => {
                        self.images[reference.index].lifetime.add_read(position)
                    }
                }
            }
            for usage_index in 0..self.nodes[node_id.0].outputs.len() {
                let usage_id = self.nodes[node_id.0].outputs[usage_index];
                let reference = self.usages[usage_id.0].resource;
                match reference.resource_type {
                    RenderGraphResourceType::Buffer => {
                        self.buffers[reference.index].lifetime.add_write(position)
                    }
                    RenderGraphResourceType::Image => {
                        self.images[reference.index].lifetime.add_write(position)
                    }
                }
            }
        }
    }

    /// OR into each resource's def the usage bits implied by the states its scheduled edges
    /// declared, so allocation creates objects usable everywhere they are consumed
    fn propagate_usage_flags(&mut self) {
        for usage_index in 0..self.usages.len() {
            let usage = &self.usages[usage_index];
            if self.node_schedule_index[usage.node.0].is_none() {
                continue;
            }
            let bits = resource_type_for_state(usage.state);
            let reference = usage.resource;
            match reference.resource_type {
                RenderGraphResourceType::Buffer => {
                    self.buffers[reference.index].def.resource_type |= bits;
                }
                RenderGraphResourceType::Image => {
                    self.images[reference.index].def.resource_type |= bits;
                }
            }
        }
    }

    /// Chain transients with identical defs and pairwise-disjoint lifetimes onto shared
    /// physical storage. A chain has one owning root; members adopt its allocation.
    fn build_aliases(&mut self) {
        for candidate in 1..self.buffers.len() {
            if !self.buffer_can_alias(candidate) {
                continue;
            }
            for root in 0..candidate {
                if !self.buffer_can_alias(root) || self.buffers[root].alias_of.is_some() {
                    continue;
                }
                if self.buffers[root].def != self.buffers[candidate].def {
                    continue;
                }
                let disjoint_with_chain = (0..candidate)
                    .filter(|&member| member == root || self.buffers[member].alias_of == Some(root))
                    .all(|member| {
                        self.buffers[member]
                            .lifetime
                            .disjoint_with(&self.buffers[candidate].lifetime)
                    });
                if disjoint_with_chain {
                    log::debug!(
                        "aliasing buffer {} onto {}",
                        self.buffers[candidate].name,
                        self.buffers[root].name
                    );
                    self.buffers[candidate].alias_of = Some(root);
                    break;
                }
            }
        }

        for candidate in 1..self.images.len() {
            if !self.image_can_alias(candidate) {
                continue;
            }
            for root in 0..candidate {
                if !self.image_can_alias(root) || self.images[root].alias_of.is_some() {
                    continue;
                }
                if self.images[root].def != self.images[candidate].def {
                    continue;
                }
                let disjoint_with_chain = (0..candidate)
                    .filter(|&member| member == root || self.images[member].alias_of == Some(root))
                    .all(|member| {
                        self.images[member]
                            .lifetime
                            .disjoint_with(&self.images[candidate].lifetime)
                    });
                if disjoint_with_chain {
                    log::debug!(
                        "aliasing image {} onto {}",
                        self.images[candidate].name,
                        self.images[root].name
                    );
                    self.images[candidate].alias_of = Some(root);
                    break;
                }
            }
        }
    }

    fn buffer_can_alias(
        &self,
        index: usize,
    ) -> bool {
        let buffer = &self.buffers[index];
        !buffer.external && buffer.lifetime.is_used()
    }

    fn image_can_alias(
        &self,
        index: usize,
    ) -> bool {
        let image = &self.images[index];
        !image.external && !image.is_history_pair_member() && image.lifetime.is_used()
    }

    fn allocate_dedicated(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
    ) -> OnyxResult<()> {
        for index in 0..self.buffers.len() {
            if self.buffers[index].external
                || !self.buffers[index].lifetime.is_used()
                || self.buffers[index].alias_of.is_some()
            {
                continue;
            }
            self.allocate_dedicated_buffer(device, index)?;
        }
        // Alias members share the chain root's allocation
        for index in 0..self.buffers.len() {
            if let Some(root) = self.buffers[index].alias_of {
                self.buffers[index].buffer = self.buffers[root].buffer;
                self.buffers[index].placed = self.buffers[root].placed;
            }
        }

        for index in 0..self.images.len() {
            if self.images[index].external
                || !self.images[index].lifetime.is_used()
                || self.images[index].alias_of.is_some()
            {
                continue;
            }
            self.allocate_dedicated_image(device, index)?;
        }
        for index in 0..self.images.len() {
            if let Some(root) = self.images[index].alias_of {
                self.images[index].texture = self.images[root].texture;
                self.images[index].placed = self.images[root].placed;
            }
        }
        Ok(())
    }

    fn allocate_dedicated_buffer(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
        index: usize,
    ) -> OnyxResult<()> {
        let name = self.buffers[index].name.clone();
        let def = self.buffers[index].def.clone();

        match self.retained.remove(&name) {
            Some(RetainedResource::Buffer {
                def: retained_def,
                buffer,
                state,
            }) => {
                if retained_def == def {
                    log::trace!("reviving retained buffer {}", name);
                    self.buffers[index].buffer = Some(buffer);
                    self.buffers[index].current_state = state;
                    self.buffers[index].placed = false;
                    return Ok(());
                }
                device.destroy_buffer(buffer);
            }
            Some(RetainedResource::Image { texture, .. }) => {
                device.destroy_texture(texture);
            }
            None => {}
        }

        let handle = match device.create_buffer(&name, &def) {
            Ok(handle) => handle,
            // One retry, pool-style device allocators can grow between attempts
            Err(_) => device.create_buffer(&name, &def).map_err(|error| {
                OnyxError::AllocationFailure(format!("buffer {}: {}", name, error))
            })?,
        };
        log::trace!("allocated buffer {} ({} bytes)", name, def.size);
        self.buffers[index].buffer = Some(handle);
        self.buffers[index].current_state = OnyxResourceState::UNDEFINED;
        self.buffers[index].placed = false;
        Ok(())
    }

    fn allocate_dedicated_image(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
        index: usize,
    ) -> OnyxResult<()> {
        let name = self.images[index].name.clone();
        let def = self.images[index].def.clone();

        match self.retained.remove(&name) {
            Some(RetainedResource::Image {
                def: retained_def,
                texture,
                state,
            }) => {
                if retained_def == def {
                    log::trace!("reviving retained image {}", name);
                    self.images[index].texture = Some(texture);
                    self.images[index].current_state = state;
                    self.images[index].placed = false;
                    return Ok(());
                }
                device.destroy_texture(texture);
            }
            Some(RetainedResource::Buffer { buffer, .. }) => {
                device.destroy_buffer(buffer);
            }
            None => {}
        }

        let handle = match device.create_texture(&name, &def) {
            Ok(handle) => handle,
            Err(_) => device.create_texture(&name, &def).map_err(|error| {
                OnyxError::AllocationFailure(format!("image {}: {}", name, error))
            })?,
        };
        log::trace!(
            "allocated image {} ({}x{})",
            name,
            def.extents.width,
            def.extents.height
        );
        self.images[index].texture = Some(handle);
        self.images[index].current_state = OnyxResourceState::UNDEFINED;
        self.images[index].placed = false;
        Ok(())
    }

    /// Pack transients into shared heaps: per memory type, visit resources
    /// longest-lifetime-first and give each the high-water-mark offset across its lifetime,
    /// a 1-D interval coloring done with a sweep instead of an explicit graph.
    fn allocate_heap_packed(
        &mut self,
        device: &mut dyn OnyxDeviceContext,
    ) -> OnyxResult<()> {
        // History pairs keep dedicated storage so their contents survive reset, which
        // releases every heap
        for index in 0..self.images.len() {
            if self.images[index].is_history_pair_member()
                && !self.images[index].external
                && self.images[index].lifetime.is_used()
            {
                self.allocate_dedicated_image(device, index)?;
            }
        }

        let mut groups: BTreeMap<u32, Vec<HeapPlacement>> = BTreeMap::new();

        for index in 0..self.buffers.len() {
            let buffer = &self.buffers[index];
            if buffer.external || !buffer.lifetime.is_used() {
                continue;
            }
            let requirements = device.buffer_memory_requirements(&buffer.def)?;
            Self::push_placement(
                &mut groups,
                RenderGraphResourceType::Buffer,
                index,
                requirements,
                &buffer.lifetime,
            );
        }
        for index in 0..self.images.len() {
            let image = &self.images[index];
            if image.external || image.is_history_pair_member() || !image.lifetime.is_used() {
                continue;
            }
            let requirements = device.texture_memory_requirements(&image.def)?;
            Self::push_placement(
                &mut groups,
                RenderGraphResourceType::Image,
                index,
                requirements,
                &image.lifetime,
            );
        }

        let node_count = self.scheduled_nodes.len().max(1);
        for (memory_type, mut group) in groups {
            group.sort_by(|a, b| {
                let a_len = a.last_node - a.first_node;
                let b_len = b.last_node - b.first_node;
                b_len
                    .cmp(&a_len)
                    .then(a.resource_type.cmp_key().cmp(&b.resource_type.cmp_key()))
                    .then(a.index.cmp(&b.index))
            });

            let mut heap_tops = vec![0u64; node_count];
            for placement in &mut group {
                // With aliasing disabled a resource claims the whole frame, so byte
                // ranges never time-share
                let (first_node, last_node) = if self.options.enable_resource_aliasing {
                    (placement.first_node, placement.last_node)
                } else {
                    (0, node_count - 1)
                };
                let watermark = heap_tops[first_node..=last_node]
                    .iter()
                    .copied()
                    .max()
                    .unwrap_or(0);
                let offset = round_up_to_alignment(watermark, placement.alignment);
                placement.offset = offset;
                for top in &mut heap_tops[first_node..=last_node] {
                    *top = offset + placement.size;
                }
            }

            let heap_size = heap_tops.iter().copied().max().unwrap_or(0);
            if heap_size == 0 {
                continue;
            }
            let heap = match device.allocate_heap(heap_size, memory_type) {
                Ok(heap) => heap,
                Err(_) => device.allocate_heap(heap_size, memory_type).map_err(|error| {
                    OnyxError::AllocationFailure(format!(
                        "memory heap ({} bytes, type {}): {}",
                        heap_size, memory_type, error
                    ))
                })?,
            };
            log::debug!(
                "memory heap type {}: {} bytes, {} resources",
                memory_type,
                heap_size,
                group.len()
            );
            self.heaps.push(heap);

            for placement in &group {
                let name = self.placement_name(placement).to_string();
                // A previously retained dedicated object with this name is obsolete now
                // that the resource lives in a heap
                match self.retained.remove(&name) {
                    Some(RetainedResource::Buffer { buffer, .. }) => device.destroy_buffer(buffer),
                    Some(RetainedResource::Image { texture, .. }) => {
                        device.destroy_texture(texture)
                    }
                    None => {}
                }
                match placement.resource_type {
                    RenderGraphResourceType::Buffer => {
                        let def = self.buffers[placement.index].def.clone();
                        let handle =
                            device.create_placed_buffer(&name, &def, heap, placement.offset)?;
                        let buffer = &mut self.buffers[placement.index];
                        buffer.buffer = Some(handle);
                        buffer.placed = true;
                        buffer.current_state = OnyxResourceState::UNDEFINED;
                    }
                    RenderGraphResourceType::Image => {
                        let def = self.images[placement.index].def.clone();
                        let handle =
                            device.create_placed_texture(&name, &def, heap, placement.offset)?;
                        let image = &mut self.images[placement.index];
                        image.texture = Some(handle);
                        image.placed = true;
                        image.current_state = OnyxResourceState::UNDEFINED;
                    }
                }
            }

            self.record_heap_overlaps(&group);
        }
        Ok(())
    }

    fn push_placement(
        groups: &mut BTreeMap<u32, Vec<HeapPlacement>>,
        resource_type: RenderGraphResourceType,
        index: usize,
        requirements: OnyxMemoryRequirements,
        lifetime: &RenderGraphNodeRange,
    ) {
        groups
            .entry(requirements.memory_type_index)
            .or_insert_with(Vec::new)
            .push(HeapPlacement {
                resource_type,
                index,
                size: requirements.size,
                alignment: requirements.alignment,
                first_node: lifetime.first_used_node().unwrap_or(0),
                last_node: lifetime.last_used_node().unwrap_or(0),
                offset: 0,
            });
    }

    fn placement_name(
        &self,
        placement: &HeapPlacement,
    ) -> &str {
        match placement.resource_type {
            RenderGraphResourceType::Buffer => &self.buffers[placement.index].name,
            RenderGraphResourceType::Image => &self.images[placement.index].name,
        }
    }

    /// Remember which packed resources share bytes, so transitions out of undefined can
    /// discard the previous occupants
    fn record_heap_overlaps(
        &mut self,
        group: &[HeapPlacement],
    ) {
        for a in 0..group.len() {
            for b in (a + 1)..group.len() {
                let first = &group[a];
                let second = &group[b];
                let ranges_intersect = first.offset < second.offset + second.size
                    && second.offset < first.offset + first.size;
                if !ranges_intersect {
                    continue;
                }
                debug_assert!(
                    self.placement_lifetime(first)
                        .disjoint_with(self.placement_lifetime(second)),
                    "heap packer placed {} and {} on overlapping bytes with overlapping lifetimes",
                    self.placement_name(first),
                    self.placement_name(second)
                );
                self.push_overlap(first, second);
                self.push_overlap(second, first);
            }
        }
    }

    fn placement_lifetime(
        &self,
        placement: &HeapPlacement,
    ) -> &RenderGraphNodeRange {
        match placement.resource_type {
            RenderGraphResourceType::Buffer => &self.buffers[placement.index].lifetime,
            RenderGraphResourceType::Image => &self.images[placement.index].lifetime,
        }
    }

    fn push_overlap(
        &mut self,
        on: &HeapPlacement,
        other: &HeapPlacement,
    ) {
        let entry = (other.resource_type, other.index);
        match on.resource_type {
            RenderGraphResourceType::Buffer => {
                self.buffers[on.index].overlaps_with.push(entry)
            }
            RenderGraphResourceType::Image => self.images[on.index].overlaps_with.push(entry),
        }
    }

    //
    // Shared lookups
    //

    pub(super) fn resource_written_in(
        &self,
        resource: &RenderGraphResourceRef,
    ) -> &[RenderGraphUsageId] {
        match resource.resource_type {
            RenderGraphResourceType::Buffer => &self.buffers[resource.index].written_in,
            RenderGraphResourceType::Image => &self.images[resource.index].written_in,
        }
    }

    pub(super) fn resource_read_in(
        &self,
        resource: &RenderGraphResourceRef,
    ) -> &[RenderGraphUsageId] {
        match resource.resource_type {
            RenderGraphResourceType::Buffer => &self.buffers[resource.index].read_in,
            RenderGraphResourceType::Image => &self.images[resource.index].read_in,
        }
    }

    pub(super) fn resource_name(
        &self,
        resource: &RenderGraphResourceRef,
    ) -> &str {
        match resource.resource_type {
            RenderGraphResourceType::Buffer => &self.buffers[resource.index].name,
            RenderGraphResourceType::Image => &self.images[resource.index].name,
        }
    }
}

impl RenderGraphResourceType {
    fn cmp_key(self) -> u8 {
        match self {
            RenderGraphResourceType::Buffer => 0,
            RenderGraphResourceType::Image => 1,
        }
    }
}
