use super::*;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RenderGraphNodeId(pub(super) usize);

/// A pass in the graph: a name plus ordered input and output edges. The dependency set is
/// scratch state filled in by compile.
#[derive(Debug)]
pub struct RenderGraphNode {
    pub(super) id: RenderGraphNodeId,
    pub(super) name: String,
    pub(super) inputs: Vec<RenderGraphUsageId>,
    pub(super) outputs: Vec<RenderGraphUsageId>,
    pub(super) depends_on: Vec<RenderGraphNodeId>,
}

impl RenderGraphNode {
    pub(super) fn new(
        id: RenderGraphNodeId,
        name: &str,
    ) -> Self {
        RenderGraphNode {
            id,
            name: name.to_string(),
            inputs: Default::default(),
            outputs: Default::default(),
            depends_on: Default::default(),
        }
    }

    pub fn id(&self) -> RenderGraphNodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The body of a pass. Executors run in scheduled order during execute and may only touch
/// resources their node declared, through the builder's get accessors.
pub trait RenderGraphNodeExecutor {
    fn execute(
        &mut self,
        builder: &mut RenderGraphBuilder,
        device: &mut dyn OnyxDeviceContext,
    ) -> OnyxResult<()>;
}

impl<T> RenderGraphNodeExecutor for T
where
    T: FnMut(&mut RenderGraphBuilder, &mut dyn OnyxDeviceContext) -> OnyxResult<()>,
{
    fn execute(
        &mut self,
        builder: &mut RenderGraphBuilder,
        device: &mut dyn OnyxDeviceContext,
    ) -> OnyxResult<()> {
        (self)(builder, device)
    }
}
