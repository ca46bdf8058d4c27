use crate::error::OnyxResult;
use crate::types::*;

/// Opaque handle to a device buffer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OnyxBufferHandle(pub u64);

/// Opaque handle to a device texture
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OnyxTextureHandle(pub u64);

/// Opaque handle to a device memory heap
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OnyxMemoryHeapId(pub u64);

/// Memory needed to place a resource into a heap
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct OnyxMemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    /// Index of the memory type the resource must be placed in. Resources can only share a
    /// heap when their memory type matches.
    pub memory_type_index: u32,
}

/// A resource either transitions from one state to another or, for aliased memory, is marked
/// discarded so a barrier can hand its memory to the incoming resource.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OnyxBarrierResource {
    Buffer(OnyxBufferHandle),
    Texture(OnyxTextureHandle),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OnyxResourceBarrier {
    pub resource: OnyxBarrierResource,
    pub src_state: OnyxResourceState,
    pub dst_state: OnyxResourceState,
}

/// The device operations the frame graph needs. Backends implement this once; the graph never
/// talks to a graphics API directly.
pub trait OnyxDeviceContext {
    fn create_buffer(
        &mut self,
        name: &str,
        buffer_def: &OnyxBufferDef,
    ) -> OnyxResult<OnyxBufferHandle>;

    fn create_texture(
        &mut self,
        name: &str,
        texture_def: &OnyxTextureDef,
    ) -> OnyxResult<OnyxTextureHandle>;

    fn destroy_buffer(
        &mut self,
        buffer: OnyxBufferHandle,
    );

    fn destroy_texture(
        &mut self,
        texture: OnyxTextureHandle,
    );

    /// True if the backend can place multiple resources into one heap at explicit offsets. When
    /// false the graph falls back to one dedicated allocation per resource.
    fn supports_placed_memory(&self) -> bool {
        false
    }

    fn buffer_memory_requirements(
        &mut self,
        buffer_def: &OnyxBufferDef,
    ) -> OnyxResult<OnyxMemoryRequirements>;

    fn texture_memory_requirements(
        &mut self,
        texture_def: &OnyxTextureDef,
    ) -> OnyxResult<OnyxMemoryRequirements>;

    fn allocate_heap(
        &mut self,
        size: u64,
        memory_type_index: u32,
    ) -> OnyxResult<OnyxMemoryHeapId>;

    fn free_heap(
        &mut self,
        heap: OnyxMemoryHeapId,
    );

    fn create_placed_buffer(
        &mut self,
        name: &str,
        buffer_def: &OnyxBufferDef,
        heap: OnyxMemoryHeapId,
        offset: u64,
    ) -> OnyxResult<OnyxBufferHandle>;

    fn create_placed_texture(
        &mut self,
        name: &str,
        texture_def: &OnyxTextureDef,
        heap: OnyxMemoryHeapId,
        offset: u64,
    ) -> OnyxResult<OnyxTextureHandle>;

    /// Record one batch of barriers, all sharing the given stage masks
    fn insert_barriers(
        &mut self,
        src_stages: OnyxPipelineStageFlags,
        dst_stages: OnyxPipelineStageFlags,
        barriers: &[OnyxResourceBarrier],
    ) -> OnyxResult<()>;
}
