use super::*;
use onyx_api::{OnyxTextureDef, OnyxTextureHandle};

/// A caller-owned image (typically the swapchain image) the graph may read or write but
/// never frees.
#[derive(Clone, Debug)]
pub struct RenderGraphExternalImage {
    pub name: String,
    pub texture: OnyxTextureHandle,
    pub def: OnyxTextureDef,
    /// State the image is in when the frame begins
    pub initial_state: OnyxResourceState,
}

/// Table record for one logical image.
///
/// An image that is read through `read_history_image` gets a shadow record holding the
/// previous frame's contents; `history_index` points from the main image to its shadow and
/// `history_of` points back. The two records swap physical handles once per execute.
#[derive(Debug)]
pub struct RenderGraphImageResource {
    pub(super) name: String,
    pub(super) external: bool,
    pub(super) def: OnyxTextureDef,
    pub(super) generation: RenderGraphGeneration,
    pub(super) written_in: Vec<RenderGraphUsageId>,
    pub(super) read_in: Vec<RenderGraphUsageId>,
    pub(super) lifetime: RenderGraphNodeRange,
    pub(super) alias_of: Option<usize>,
    /// Resources whose heap-packed byte ranges intersect this one's
    pub(super) overlaps_with: Vec<(RenderGraphResourceType, usize)>,
    /// Set on a shadow record: the index of the image this is the previous-frame copy of
    pub(super) history_of: Option<usize>,
    /// Set on a main record: the index of its previous-frame shadow
    pub(super) history_index: Option<usize>,
    pub(super) texture: Option<OnyxTextureHandle>,
    pub(super) placed: bool,
    pub(super) current_state: OnyxResourceState,
    pub(super) used_stages: OnyxPipelineStageFlags,
}

impl RenderGraphImageResource {
    pub(super) fn new(
        name: &str,
        def: OnyxTextureDef,
    ) -> Self {
        RenderGraphImageResource {
            name: name.to_string(),
            external: false,
            def,
            generation: Default::default(),
            written_in: Default::default(),
            read_in: Default::default(),
            lifetime: Default::default(),
            alias_of: None,
            overlaps_with: Default::default(),
            history_of: None,
            history_index: None,
            texture: None,
            placed: false,
            current_state: OnyxResourceState::UNDEFINED,
            used_stages: OnyxPipelineStageFlags::NONE,
        }
    }

    pub(super) fn is_history_pair_member(&self) -> bool {
        self.history_of.is_some() || self.history_index.is_some()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn def(&self) -> &OnyxTextureDef {
        &self.def
    }

    pub fn is_external(&self) -> bool {
        self.external
    }

    /// The physical texture, present between compile and reset
    pub fn texture(&self) -> Option<OnyxTextureHandle> {
        self.texture
    }

    pub fn lifetime(&self) -> &RenderGraphNodeRange {
        &self.lifetime
    }

    pub fn alias_of(&self) -> Option<usize> {
        self.alias_of
    }
}
