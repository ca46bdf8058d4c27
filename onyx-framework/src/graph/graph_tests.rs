use super::*;
use onyx_api::*;
use std::cell::RefCell;
use std::rc::Rc;

fn begin_test() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Trace)
        .try_init();
}

struct RecordedPlacement {
    name: String,
    heap: OnyxMemoryHeapId,
    offset: u64,
    size: u64,
}

struct RecordedBarrierBatch {
    src_stages: OnyxPipelineStageFlags,
    dst_stages: OnyxPipelineStageFlags,
    barriers: Vec<OnyxResourceBarrier>,
}

/// Records every device call so scheduling, aliasing, and barrier batching are assertable
/// without a GPU
#[derive(Default)]
struct TestDeviceContext {
    next_handle: u64,
    supports_placed: bool,
    /// Number of upcoming create calls that report out-of-memory
    create_failures_remaining: u32,
    created_buffers: Vec<String>,
    created_textures: Vec<String>,
    destroyed_buffers: Vec<OnyxBufferHandle>,
    destroyed_textures: Vec<OnyxTextureHandle>,
    heap_allocs: Vec<(u64, u32)>,
    freed_heaps: Vec<OnyxMemoryHeapId>,
    placements: Vec<RecordedPlacement>,
    barrier_batches: Vec<RecordedBarrierBatch>,
}

impl TestDeviceContext {
    fn with_placed_memory() -> Self {
        TestDeviceContext {
            supports_placed: true,
            ..Default::default()
        }
    }

    fn next(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn take_create_failure(&mut self) -> bool {
        if self.create_failures_remaining > 0 {
            self.create_failures_remaining -= 1;
            return true;
        }
        false
    }

    fn texture_size(def: &OnyxTextureDef) -> u64 {
        def.extents.width as u64
            * def.extents.height as u64
            * def.extents.depth as u64
            * def.layer_count as u64
            * def.format.block_size()
    }

    fn batches_touching(
        &self,
        physical: OnyxBarrierResource,
    ) -> Vec<&RecordedBarrierBatch> {
        self.barrier_batches
            .iter()
            .filter(|batch| batch.barriers.iter().any(|b| b.resource == physical))
            .collect()
    }
}

impl OnyxDeviceContext for TestDeviceContext {
    fn create_buffer(
        &mut self,
        name: &str,
        _buffer_def: &OnyxBufferDef,
    ) -> OnyxResult<OnyxBufferHandle> {
        if self.take_create_failure() {
            return Err(OnyxError::StringError("device out of memory".to_string()));
        }
        self.created_buffers.push(name.to_string());
        Ok(OnyxBufferHandle(self.next()))
    }

    fn create_texture(
        &mut self,
        name: &str,
        _texture_def: &OnyxTextureDef,
    ) -> OnyxResult<OnyxTextureHandle> {
        if self.take_create_failure() {
            return Err(OnyxError::StringError("device out of memory".to_string()));
        }
        self.created_textures.push(name.to_string());
        Ok(OnyxTextureHandle(self.next()))
    }

    fn destroy_buffer(
        &mut self,
        buffer: OnyxBufferHandle,
    ) {
        self.destroyed_buffers.push(buffer);
    }

    fn destroy_texture(
        &mut self,
        texture: OnyxTextureHandle,
    ) {
        self.destroyed_textures.push(texture);
    }

    fn supports_placed_memory(&self) -> bool {
        self.supports_placed
    }

    fn buffer_memory_requirements(
        &mut self,
        buffer_def: &OnyxBufferDef,
    ) -> OnyxResult<OnyxMemoryRequirements> {
        Ok(OnyxMemoryRequirements {
            size: buffer_def.size,
            alignment: 256,
            memory_type_index: 0,
        })
    }

    fn texture_memory_requirements(
        &mut self,
        texture_def: &OnyxTextureDef,
    ) -> OnyxResult<OnyxMemoryRequirements> {
        Ok(OnyxMemoryRequirements {
            size: Self::texture_size(texture_def),
            alignment: 256,
            memory_type_index: 1,
        })
    }

    fn allocate_heap(
        &mut self,
        size: u64,
        memory_type_index: u32,
    ) -> OnyxResult<OnyxMemoryHeapId> {
        self.heap_allocs.push((size, memory_type_index));
        Ok(OnyxMemoryHeapId(self.next()))
    }

    fn free_heap(
        &mut self,
        heap: OnyxMemoryHeapId,
    ) {
        self.freed_heaps.push(heap);
    }

    fn create_placed_buffer(
        &mut self,
        name: &str,
        buffer_def: &OnyxBufferDef,
        heap: OnyxMemoryHeapId,
        offset: u64,
    ) -> OnyxResult<OnyxBufferHandle> {
        self.placements.push(RecordedPlacement {
            name: name.to_string(),
            heap,
            offset,
            size: buffer_def.size,
        });
        Ok(OnyxBufferHandle(self.next()))
    }

    fn create_placed_texture(
        &mut self,
        name: &str,
        texture_def: &OnyxTextureDef,
        heap: OnyxMemoryHeapId,
        offset: u64,
    ) -> OnyxResult<OnyxTextureHandle> {
        self.placements.push(RecordedPlacement {
            name: name.to_string(),
            heap,
            offset,
            size: Self::texture_size(texture_def),
        });
        Ok(OnyxTextureHandle(self.next()))
    }

    fn insert_barriers(
        &mut self,
        src_stages: OnyxPipelineStageFlags,
        dst_stages: OnyxPipelineStageFlags,
        barriers: &[OnyxResourceBarrier],
    ) -> OnyxResult<()> {
        self.barrier_batches.push(RecordedBarrierBatch {
            src_stages,
            dst_stages,
            barriers: barriers.to_vec(),
        });
        Ok(())
    }
}

fn buffer_def(size: u64) -> OnyxBufferDef {
    OnyxBufferDef {
        size,
        resource_type: OnyxResourceType::BUFFER,
        memory_usage: OnyxMemoryUsage::GpuOnly,
    }
}

fn color_def(
    width: u32,
    height: u32,
) -> OnyxTextureDef {
    OnyxTextureDef {
        extents: OnyxExtents3D {
            width,
            height,
            depth: 1,
        },
        format: OnyxFormat::R8G8B8A8Unorm,
        ..Default::default()
    }
}

fn depth_def(
    width: u32,
    height: u32,
) -> OnyxTextureDef {
    OnyxTextureDef {
        extents: OnyxExtents3D {
            width,
            height,
            depth: 1,
        },
        format: OnyxFormat::D32Float,
        ..Default::default()
    }
}

/// Dedicated allocation, stable declaration order. Most tests assert against exact node
/// positions and lifetimes, which reordering would perturb.
fn dedicated_options() -> RenderGraphBuilderOptions {
    RenderGraphBuilderOptions {
        enable_resource_aliasing: true,
        enable_node_reordering: false,
        allocation_strategy: RenderGraphAllocationStrategy::Dedicated,
    }
}

fn heap_options() -> RenderGraphBuilderOptions {
    RenderGraphBuilderOptions {
        enable_resource_aliasing: true,
        enable_node_reordering: false,
        allocation_strategy: RenderGraphAllocationStrategy::HeapPacked,
    }
}

fn scheduled_names(graph: &RenderGraphBuilder) -> Vec<String> {
    graph
        .scheduled_nodes()
        .iter()
        .map(|&n| graph.node(n).name().to_string())
        .collect()
}

fn position(
    graph: &RenderGraphBuilder,
    node: RenderGraphNodeId,
) -> usize {
    graph
        .scheduled_nodes()
        .iter()
        .position(|&n| n == node)
        .unwrap()
}

#[test]
fn culling_drops_unreachable_nodes() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let upload = graph.add_node("upload");
    let x = graph.write_buffer_by_name(
        upload,
        "X",
        &buffer_def(1024),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    let tonemap = graph.add_node("tonemap");
    graph.read_buffer(
        tonemap,
        x,
        OnyxResourceState::SHADER_RESOURCE,
        OnyxPipelineStageFlags::FRAGMENT_SHADER,
    );
    let y = graph.write_image_by_name(
        tonemap,
        "Y",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let unrelated = graph.add_node("unrelated");
    graph.write_buffer_by_name(
        unrelated,
        "Z",
        &buffer_def(16),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    graph.compile(&mut device, &[y]).unwrap();
    assert_eq!(graph.scheduled_nodes(), &[upload, tonemap]);
}

#[test]
fn schedule_is_topological() {
    begin_test();
    let mut device = TestDeviceContext::default();
    // Reordering on: it may regroup independent nodes but never break dependencies
    let mut graph = RenderGraphBuilder::new(RenderGraphBuilderOptions {
        allocation_strategy: RenderGraphAllocationStrategy::Dedicated,
        ..Default::default()
    });

    let a = graph.add_node("gbuffer");
    let i1 = graph.write_image_by_name(
        a,
        "albedo",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );
    let i2 = graph.write_image_by_name(
        a,
        "normals",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let b = graph.add_node("ssao");
    graph.sample_image(b, i2, OnyxPipelineStageFlags::COMPUTE_SHADER);
    let o1 = graph.write_image_by_name(
        b,
        "ao",
        &color_def(32, 32),
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    let c = graph.add_node("decals");
    graph.sample_image(c, i1, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let o2 = graph.write_image_by_name(
        c,
        "decals_out",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let d = graph.add_node("lighting");
    graph.sample_image(d, o1, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    graph.sample_image(d, o2, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let lit = graph.write_image_by_name(
        d,
        "lit",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    graph.compile(&mut device, &[lit]).unwrap();

    assert_eq!(graph.scheduled_nodes().len(), 4);
    assert!(position(&graph, a) < position(&graph, b));
    assert!(position(&graph, a) < position(&graph, c));
    assert!(position(&graph, b) < position(&graph, d));
    assert!(position(&graph, c) < position(&graph, d));
}

#[test]
fn readerless_writer_chain_is_kept() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let clear = graph.add_node("clear");
    let h1 = graph.write_buffer_by_name(
        clear,
        "counters",
        &buffer_def(256),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    // Writes over the previous contents without ever reading them
    let fill = graph.add_node("fill");
    let h2 = graph.write_buffer(
        fill,
        h1,
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    graph.compile(&mut device, &[h2]).unwrap();
    assert_eq!(graph.scheduled_nodes(), &[clear, fill]);
}

#[test]
fn disjoint_lifetimes_alias() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let n0 = graph.add_node("a_writer");
    let a = graph.write_image_by_name(
        n0,
        "A",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n1 = graph.add_node("mid");
    graph.sample_image(n1, a, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let mid = graph.write_image_by_name(
        n1,
        "mid",
        &color_def(32, 32),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n2 = graph.add_node("b_writer");
    graph.sample_image(n2, mid, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let b = graph.write_image_by_name(
        n2,
        "B",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n3 = graph.add_node("final");
    graph.sample_image(n3, b, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let out = graph.write_image_by_name(
        n3,
        "out",
        &color_def(32, 32),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    graph.compile(&mut device, &[out]).unwrap();

    let index_a = graph.image_lookup["A"];
    let index_b = graph.image_lookup["B"];
    // A lives over nodes [0,1], B over [2,3]: same shape, disjoint, so B adopts A's storage
    assert_eq!(graph.images[index_b].alias_of, Some(index_a));
    assert!(graph.images[index_a].texture.is_some());
    assert_eq!(graph.images[index_a].texture, graph.images[index_b].texture);
}

#[test]
fn overlapping_lifetimes_do_not_alias() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let n0 = graph.add_node("a_writer");
    let a = graph.write_image_by_name(
        n0,
        "A",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n1 = graph.add_node("b_writer");
    let b = graph.write_image_by_name(
        n1,
        "B",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n2 = graph.add_node("combine");
    graph.sample_image(n2, a, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    graph.sample_image(n2, b, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let out = graph.write_image_by_name(
        n2,
        "out",
        &color_def(32, 32),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    graph.compile(&mut device, &[out]).unwrap();

    let index_a = graph.image_lookup["A"];
    let index_b = graph.image_lookup["B"];
    assert_eq!(graph.images[index_a].alias_of, None);
    assert_eq!(graph.images[index_b].alias_of, None);
    assert_ne!(graph.images[index_a].texture, graph.images[index_b].texture);
}

#[test]
fn stale_write_handle_rejected() {
    begin_test();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let p = graph.add_node("first_writer");
    let h1 = graph.write_buffer_by_name(
        p,
        "scratch",
        &buffer_def(1024),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    let q = graph.add_node("second_writer");
    let h2 = graph.write_buffer(
        q,
        h1,
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    assert!(matches!(
        graph.get_write_buffer(h1),
        Err(OnyxError::StaleHandle { .. })
    ));
    assert!(graph.get_write_buffer(h2).is_ok());
}

#[test]
fn unresolved_named_read() {
    begin_test();
    let mut graph = RenderGraphBuilder::default();
    let node = graph.add_node("reader");
    let result = graph.read_image_by_name(
        node,
        "missing",
        OnyxResourceState::SHADER_RESOURCE,
        OnyxPipelineStageFlags::FRAGMENT_SHADER,
    );
    assert!(matches!(result, Err(OnyxError::UnresolvedResource(_))));
}

fn declare_deferred_frame(graph: &mut RenderGraphBuilder) -> RenderGraphResourceRef {
    let shadow = graph.add_node("shadow");
    let shadow_map = graph.write_image_by_name(
        shadow,
        "shadow_map",
        &depth_def(512, 512),
        OnyxResourceState::DEPTH_WRITE,
        OnyxPipelineStageFlags::DEPTH_ATTACHMENT,
    );

    let gbuffer = graph.add_node("gbuffer");
    let albedo = graph.write_image_by_name(
        gbuffer,
        "albedo",
        &color_def(128, 128),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );
    let normals = graph.write_image_by_name(
        gbuffer,
        "normals",
        &color_def(128, 128),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let ssao = graph.add_node("ssao");
    graph.sample_image(ssao, normals, OnyxPipelineStageFlags::COMPUTE_SHADER);
    let ao = graph.write_image_by_name(
        ssao,
        "ao",
        &color_def(64, 64),
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    let lighting = graph.add_node("lighting");
    graph.sample_image(lighting, shadow_map, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    graph.sample_image(lighting, albedo, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    graph.sample_image(lighting, ao, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let lit = graph.write_image_by_name(
        lighting,
        "lit",
        &color_def(128, 128),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let post = graph.add_node("post");
    graph.sample_image(post, lit, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let final_image = graph.write_image_by_name(
        post,
        "final",
        &color_def(128, 128),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    // Never consumed, must be culled every frame
    let overlay = graph.add_node("debug_overlay");
    graph.sample_image(overlay, albedo, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    graph.write_image_by_name(
        overlay,
        "overlay",
        &color_def(128, 128),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    final_image
}

#[test]
fn deterministic_across_reset() {
    begin_test();
    let mut device = TestDeviceContext::with_placed_memory();
    let mut graph = RenderGraphBuilder::new(RenderGraphBuilderOptions::default());

    let final_image = declare_deferred_frame(&mut graph);
    graph.compile(&mut device, &[final_image]).unwrap();
    let first_schedule = scheduled_names(&graph);
    let first_placements: Vec<(String, u64)> = device
        .placements
        .iter()
        .map(|p| (p.name.clone(), p.offset))
        .collect();
    graph.execute(&mut device).unwrap();
    graph.reset(&mut device);

    let final_image = declare_deferred_frame(&mut graph);
    graph.compile(&mut device, &[final_image]).unwrap();
    let second_schedule = scheduled_names(&graph);
    let second_placements: Vec<(String, u64)> = device.placements
        [first_placements.len()..]
        .iter()
        .map(|p| (p.name.clone(), p.offset))
        .collect();

    assert_eq!(first_schedule, second_schedule);
    assert!(!first_schedule.contains(&"debug_overlay".to_string()));
    assert_eq!(first_placements, second_placements);
}

#[test]
fn history_pair_swaps_once_per_execute() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let accum = graph.add_node("accum");
    graph.write_image_by_name(
        accum,
        "color",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let taa = graph.add_node("taa");
    graph
        .read_history_image_by_name(taa, "color", OnyxPipelineStageFlags::FRAGMENT_SHADER)
        .unwrap();
    let out = graph.write_image_by_name(
        taa,
        "out",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    graph.compile(&mut device, &[out]).unwrap();

    // The history read alone keeps the accumulation pass alive
    assert!(graph.scheduled_nodes().contains(&accum));

    let main_index = graph.image_lookup["color"];
    let shadow_index = graph.image_lookup["color [Previous]"];
    let main_before = graph.images[main_index].texture.unwrap();
    let shadow_before = graph.images[shadow_index].texture.unwrap();
    assert_ne!(main_before, shadow_before);

    graph.execute(&mut device).unwrap();

    assert_eq!(graph.images[main_index].texture, Some(shadow_before));
    assert_eq!(graph.images[shadow_index].texture, Some(main_before));

    // Both physical objects survive the frame boundary through the retained cache
    graph.reset(&mut device);
    let created_before = device.created_textures.len();
    let out = {
        let accum = graph.add_node("accum");
        graph.write_image_by_name(
            accum,
            "color",
            &color_def(64, 64),
            OnyxResourceState::RENDER_TARGET,
            OnyxPipelineStageFlags::COLOR_ATTACHMENT,
        );
        let taa = graph.add_node("taa");
        graph
            .read_history_image_by_name(taa, "color", OnyxPipelineStageFlags::FRAGMENT_SHADER)
            .unwrap();
        graph.write_image_by_name(
            taa,
            "out",
            &color_def(64, 64),
            OnyxResourceState::RENDER_TARGET,
            OnyxPipelineStageFlags::COLOR_ATTACHMENT,
        )
    };
    graph.compile(&mut device, &[out]).unwrap();
    assert_eq!(device.created_textures.len(), created_before);

    let main_index = graph.image_lookup["color"];
    graph.execute(&mut device).unwrap();
    // Second swap returns the original storage to the main image
    assert_eq!(graph.images[main_index].texture, Some(main_before));
}

#[test]
fn read_run_merges_barriers() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let n0 = graph.add_node("draw");
    let t = graph.write_image_by_name(
        n0,
        "T",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n1 = graph.add_node("blur");
    graph.sample_image(n1, t, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let pa = graph.write_image_by_name(
        n1,
        "pa",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n2 = graph.add_node("reduce");
    graph.sample_image(n2, t, OnyxPipelineStageFlags::COMPUTE_SHADER);
    let pb = graph.write_image_by_name(
        n2,
        "pb",
        &color_def(64, 64),
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    graph.compile(&mut device, &[pa, pb]).unwrap();
    graph.execute(&mut device).unwrap();

    let t_handle = graph.images[graph.image_lookup["T"]].texture.unwrap();
    let touching = device.batches_touching(OnyxBarrierResource::Texture(t_handle));

    // One barrier into RENDER_TARGET, one into SHADER_RESOURCE; the second read rides on
    // the first transition for free
    assert_eq!(touching.len(), 2);
    let transition = touching[1]
        .barriers
        .iter()
        .find(|b| b.resource == OnyxBarrierResource::Texture(t_handle))
        .unwrap();
    assert_eq!(transition.src_state, OnyxResourceState::RENDER_TARGET);
    assert_eq!(transition.dst_state, OnyxResourceState::SHADER_RESOURCE);
    // The single transition already covers the whole read run's stages
    assert!(touching[1].dst_stages.contains(
        OnyxPipelineStageFlags::FRAGMENT_SHADER | OnyxPipelineStageFlags::COMPUTE_SHADER
    ));
}

#[test]
fn write_hazard_always_barriers() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let n0 = graph.add_node("scatter");
    let h1 = graph.write_image_by_name(
        n0,
        "particles",
        &color_def(64, 64),
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    let n1 = graph.add_node("gather");
    let h2 = graph.write_storage_image(n1, h1, OnyxPipelineStageFlags::COMPUTE_SHADER);

    graph.compile(&mut device, &[h2]).unwrap();
    graph.execute(&mut device).unwrap();

    let handle = graph.images[graph.image_lookup["particles"]].texture.unwrap();
    let touching = device.batches_touching(OnyxBarrierResource::Texture(handle));
    // Same state both times, but back-to-back storage writes still need a barrier each
    assert_eq!(touching.len(), 2);
    let second = touching[1]
        .barriers
        .iter()
        .find(|b| b.resource == OnyxBarrierResource::Texture(handle))
        .unwrap();
    assert_eq!(second.src_state, OnyxResourceState::UNORDERED_ACCESS);
    assert_eq!(second.dst_state, OnyxResourceState::UNORDERED_ACCESS);
}

#[test]
fn heap_packing_shares_memory_and_discards() {
    begin_test();
    let mut device = TestDeviceContext::with_placed_memory();
    let mut graph = RenderGraphBuilder::new(heap_options());

    let n0 = graph.add_node("draw_a");
    let a = graph.write_image_by_name(
        n0,
        "A",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n1 = graph.add_node("extract");
    graph.sample_image(n1, a, OnyxPipelineStageFlags::COMPUTE_SHADER);
    let k = graph.write_buffer_by_name(
        n1,
        "K",
        &buffer_def(1024),
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    let n2 = graph.add_node("draw_b");
    graph.read_buffer(
        n2,
        k,
        OnyxResourceState::SHADER_RESOURCE,
        OnyxPipelineStageFlags::VERTEX_SHADER,
    );
    let b = graph.write_image_by_name(
        n2,
        "B",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    let n3 = graph.add_node("present");
    graph.sample_image(n3, b, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let out = graph.write_image_by_name(
        n3,
        "OUT",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    graph.compile(&mut device, &[out]).unwrap();

    // One buffer heap, one texture heap
    assert_eq!(device.heap_allocs.len(), 2);

    let texture_size = TestDeviceContext::texture_size(&color_def(64, 64));
    let placement = |name: &str| {
        device
            .placements
            .iter()
            .find(|p| p.name == name)
            .unwrap()
    };
    // A is dead by the time B is written, so B reuses its bytes; OUT overlaps B and must
    // not share them
    assert_eq!(placement("A").offset, placement("B").offset);
    let b_range = placement("B").offset..placement("B").offset + placement("B").size;
    assert!(!b_range.contains(&placement("OUT").offset));
    let texture_heap = device
        .heap_allocs
        .iter()
        .find(|(_, memory_type)| *memory_type == 1)
        .unwrap();
    assert_eq!(texture_heap.0, 2 * texture_size);

    let a_handle = graph.images[graph.image_lookup["A"]].texture.unwrap();
    graph.execute(&mut device).unwrap();

    // When B comes out of undefined it takes over A's bytes, so the same batch pushes A
    // into the discarded state
    let discard = device
        .barrier_batches
        .iter()
        .flat_map(|batch| batch.barriers.iter())
        .find(|b| b.dst_state == OnyxResourceState::DISCARDED)
        .unwrap();
    assert_eq!(discard.resource, OnyxBarrierResource::Texture(a_handle));
    assert_eq!(discard.src_state, OnyxResourceState::SHADER_RESOURCE);

    graph.reset(&mut device);
    assert_eq!(device.freed_heaps.len(), 2);
}

#[test]
fn heap_packing_falls_back_to_dedicated() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(heap_options());

    let n0 = graph.add_node("draw");
    let a = graph.write_image_by_name(
        n0,
        "A",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );
    let n1 = graph.add_node("post");
    graph.sample_image(n1, a, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let out = graph.write_image_by_name(
        n1,
        "OUT",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    graph.compile(&mut device, &[out]).unwrap();
    assert!(device.heap_allocs.is_empty());
    assert!(device.placements.is_empty());
    assert_eq!(device.created_textures.len(), 2);
}

#[test]
fn generation_overflow_fails_compile() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let node = graph.add_node("pathological");
    let mut handle = graph.write_buffer_by_name(
        node,
        "counter",
        &buffer_def(4),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );
    for _ in 0..255 {
        handle = graph.write_buffer(
            node,
            handle,
            OnyxResourceState::COPY_DST,
            OnyxPipelineStageFlags::TRANSFER,
        );
    }

    let result = graph.compile(&mut device, &[handle]);
    assert!(matches!(
        result,
        Err(OnyxError::SchedulingInvariantViolation(_))
    ));
}

#[test]
fn empty_outputs_runs_everything() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let a = graph.add_node("a");
    graph.write_buffer_by_name(
        a,
        "A",
        &buffer_def(16),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );
    let b = graph.add_node("b");
    graph.write_buffer_by_name(
        b,
        "B",
        &buffer_def(16),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );
    let c = graph.add_node("c");
    graph.write_buffer_by_name(
        c,
        "C",
        &buffer_def(16),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    graph.compile(&mut device, &[]).unwrap();
    assert_eq!(graph.scheduled_nodes(), &[a, b, c]);
}

#[test]
fn output_slot_replace_retires_previous_write() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let producer = graph.add_node("producer");
    let b = graph.write_buffer_by_name(
        producer,
        "B",
        &buffer_def(64),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    let pass = graph.add_node("pass");
    graph.write_buffer_by_name(
        pass,
        "A",
        &buffer_def(64),
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    // The pass changes its mind and redirects slot 0 from A to B
    let redirected = graph.write_buffer_slot(
        pass,
        0,
        b,
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    let index_a = graph.buffer_lookup["A"];
    let index_b = graph.buffer_lookup["B"];
    assert_eq!(graph.buffers[index_a].generation.write_count, 0);
    assert!(graph.buffers[index_a].written_in.is_empty());
    assert_eq!(graph.buffers[index_b].generation.write_count, 2);
    assert_eq!(graph.nodes[pass.0].outputs.len(), 1);

    graph.compile(&mut device, &[redirected]).unwrap();
    assert_eq!(graph.scheduled_nodes(), &[producer, pass]);
    // A is never allocated
    assert!(graph.buffers[index_a].buffer.is_none());
}

#[test]
fn executors_run_in_scheduled_order() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());
    let ran: Rc<RefCell<Vec<&'static str>>> = Default::default();

    let upload = graph.add_node("upload");
    let staging = graph.write_buffer_by_name(
        upload,
        "staging",
        &buffer_def(4096),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    let draw = graph.add_node("draw");
    let staging_read = graph.read_buffer(
        draw,
        staging,
        OnyxResourceState::SHADER_RESOURCE,
        OnyxPipelineStageFlags::VERTEX_SHADER,
    );
    let target = graph.write_image_by_name(
        draw,
        "target",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    {
        let ran = ran.clone();
        graph.set_node_executor(
            upload,
            move |builder: &mut RenderGraphBuilder,
                  _device: &mut dyn OnyxDeviceContext|
                  -> OnyxResult<()> {
                let record = builder.get_write_buffer(staging)?;
                assert!(record.buffer().is_some());
                ran.borrow_mut().push("upload");
                Ok(())
            },
        );
    }
    {
        let ran = ran.clone();
        graph.set_node_executor(
            draw,
            move |builder: &mut RenderGraphBuilder,
                  _device: &mut dyn OnyxDeviceContext|
                  -> OnyxResult<()> {
                let record = builder.get_read_buffer(staging_read)?;
                assert!(record.buffer().is_some());
                ran.borrow_mut().push("draw");
                Ok(())
            },
        );
    }

    graph.compile(&mut device, &[target]).unwrap();
    graph.execute(&mut device).unwrap();
    assert_eq!(*ran.borrow(), vec!["upload", "draw"]);
}

#[test]
fn named_redeclare_takes_latest_def() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let first = graph.add_node("first_writer");
    graph.write_buffer_by_name(
        first,
        "grown",
        &buffer_def(64),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    // Same name, bigger size: the later declaration must win
    let second = graph.add_node("second_writer");
    let handle = graph.write_buffer_by_name(
        second,
        "grown",
        &buffer_def(128),
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    let index = graph.buffer_lookup["grown"];
    assert_eq!(graph.buffers[index].def.size, 128);

    graph.compile(&mut device, &[handle]).unwrap();
    assert_eq!(graph.buffers[index].def.size, 128);
}

#[test]
fn transient_allocation_failure_recovers() {
    begin_test();
    let mut device = TestDeviceContext::default();
    device.create_failures_remaining = 1;
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let upload = graph.add_node("upload");
    let handle = graph.write_buffer_by_name(
        upload,
        "staging",
        &buffer_def(4096),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    // One out-of-memory response is absorbed by the allocation retry
    graph.compile(&mut device, &[handle]).unwrap();
    assert_eq!(device.create_failures_remaining, 0);
    assert_eq!(device.created_buffers, vec!["staging".to_string()]);
    assert!(graph.buffers[graph.buffer_lookup["staging"]].buffer.is_some());
}

#[test]
fn persistent_allocation_failure_fails_compile() {
    begin_test();
    let mut device = TestDeviceContext::default();
    device.create_failures_remaining = u32::MAX;
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let upload = graph.add_node("upload");
    let handle = graph.write_buffer_by_name(
        upload,
        "staging",
        &buffer_def(4096),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );

    let result = graph.compile(&mut device, &[handle]);
    assert!(matches!(result, Err(OnyxError::AllocationFailure(_))));
    assert!(device.created_buffers.is_empty());
}

#[test]
fn slot_replace_on_saturated_counter() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::new(dedicated_options());

    let filler = graph.add_node("filler");
    let mut handle = graph.write_buffer_by_name(
        filler,
        "counter",
        &buffer_def(4),
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );
    for _ in 0..254 {
        handle = graph.write_buffer(
            filler,
            handle,
            OnyxResourceState::COPY_DST,
            OnyxPipelineStageFlags::TRANSFER,
        );
    }

    // The counter is pinned at the ceiling; this write latches the overflow error
    let last = graph.add_node("last");
    let stale = graph.write_buffer(
        last,
        handle,
        OnyxResourceState::COPY_DST,
        OnyxPipelineStageFlags::TRANSFER,
    );
    // Redirecting the slot must not panic on the saturated bookkeeping
    let replaced = graph.write_buffer_slot(
        last,
        0,
        stale,
        OnyxResourceState::UNORDERED_ACCESS,
        OnyxPipelineStageFlags::COMPUTE_SHADER,
    );

    let result = graph.compile(&mut device, &[replaced]);
    assert!(matches!(
        result,
        Err(OnyxError::SchedulingInvariantViolation(_))
    ));
}

#[test]
fn heap_packing_respects_aliasing_toggle() {
    begin_test();
    let mut device = TestDeviceContext::with_placed_memory();
    let mut graph = RenderGraphBuilder::new(RenderGraphBuilderOptions {
        enable_resource_aliasing: false,
        enable_node_reordering: false,
        allocation_strategy: RenderGraphAllocationStrategy::HeapPacked,
    });

    let n0 = graph.add_node("draw_a");
    let a = graph.write_image_by_name(
        n0,
        "A",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );
    let n1 = graph.add_node("draw_b");
    graph.sample_image(n1, a, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let b = graph.write_image_by_name(
        n1,
        "B",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );
    let n2 = graph.add_node("present");
    graph.sample_image(n2, b, OnyxPipelineStageFlags::FRAGMENT_SHADER);
    let out = graph.write_image_by_name(
        n2,
        "OUT",
        &color_def(64, 64),
        OnyxResourceState::RENDER_TARGET,
        OnyxPipelineStageFlags::COLOR_ATTACHMENT,
    );

    graph.compile(&mut device, &[out]).unwrap();

    // A is dead before OUT is written, but with aliasing off nothing time-shares: the
    // heap holds all three side by side
    let texture_size = TestDeviceContext::texture_size(&color_def(64, 64));
    assert_eq!(device.heap_allocs.len(), 1);
    assert_eq!(device.heap_allocs[0].0, 3 * texture_size);
    for i in 0..device.placements.len() {
        for j in (i + 1)..device.placements.len() {
            let first = &device.placements[i];
            let second = &device.placements[j];
            assert!(
                first.offset + first.size <= second.offset
                    || second.offset + second.size <= first.offset,
                "{} and {} share bytes",
                first.name,
                second.name
            );
        }
    }

    graph.execute(&mut device).unwrap();
    assert!(device
        .barrier_batches
        .iter()
        .flat_map(|batch| batch.barriers.iter())
        .all(|barrier| barrier.dst_state != OnyxResourceState::DISCARDED));
}

#[test]
fn execute_requires_compile() {
    begin_test();
    let mut device = TestDeviceContext::default();
    let mut graph = RenderGraphBuilder::default();
    assert!(matches!(
        graph.execute(&mut device),
        Err(OnyxError::SchedulingInvariantViolation(_))
    ));
}
