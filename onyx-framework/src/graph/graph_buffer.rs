use super::*;
use onyx_api::{OnyxBufferDef, OnyxBufferHandle};

/// A caller-owned buffer the graph may read or write but never frees. The def is a snapshot
/// used for usage validation only.
#[derive(Clone, Debug)]
pub struct RenderGraphExternalBuffer {
    pub name: String,
    pub buffer: OnyxBufferHandle,
    pub def: OnyxBufferDef,
    /// State the buffer is in when the frame begins
    pub initial_state: OnyxResourceState,
}

/// Table record for one logical buffer. Transient buffers get their physical allocation
/// during compile and lose it again at reset; external buffers borrow a caller-owned handle.
#[derive(Debug)]
pub struct RenderGraphBufferResource {
    pub(super) name: String,
    pub(super) external: bool,
    pub(super) def: OnyxBufferDef,
    pub(super) generation: RenderGraphGeneration,
    pub(super) written_in: Vec<RenderGraphUsageId>,
    pub(super) read_in: Vec<RenderGraphUsageId>,
    pub(super) lifetime: RenderGraphNodeRange,
    /// Root of the alias chain this buffer shares a physical allocation with
    pub(super) alias_of: Option<usize>,
    /// Resources whose heap-packed byte ranges intersect this one's
    pub(super) overlaps_with: Vec<(RenderGraphResourceType, usize)>,
    pub(super) buffer: Option<OnyxBufferHandle>,
    /// True when the buffer was placed into a shared heap rather than allocated dedicated
    pub(super) placed: bool,
    pub(super) current_state: OnyxResourceState,
    pub(super) used_stages: OnyxPipelineStageFlags,
}

impl RenderGraphBufferResource {
    pub(super) fn new(
        name: &str,
        def: OnyxBufferDef,
    ) -> Self {
        RenderGraphBufferResource {
            name: name.to_string(),
            external: false,
            def,
            generation: Default::default(),
            written_in: Default::default(),
            read_in: Default::default(),
            lifetime: Default::default(),
            alias_of: None,
            overlaps_with: Default::default(),
            buffer: None,
            placed: false,
            current_state: OnyxResourceState::UNDEFINED,
            used_stages: OnyxPipelineStageFlags::NONE,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn def(&self) -> &OnyxBufferDef {
        &self.def
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    /// The physical buffer, present between compile and reset
    pub fn buffer(&self) -> Option<OnyxBufferHandle> {
        self.buffer
    }

    pub fn lifetime(&self) -> &RenderGraphNodeRange {
        &self.lifetime
    }

    pub fn alias_of(&self) -> Option<usize> {
        self.alias_of
    }
}
