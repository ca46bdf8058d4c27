pub use onyx_api::{OnyxDeviceContext, OnyxPipelineStageFlags, OnyxResourceState, OnyxResult};

mod graph_builder;
pub use graph_builder::RenderGraphAllocationStrategy;
pub use graph_builder::RenderGraphBuilder;
pub use graph_builder::RenderGraphBuilderOptions;
use graph_builder::*;

mod graph_resource;
pub use graph_resource::RenderGraphGeneration;
pub use graph_resource::RenderGraphNodeRange;
pub use graph_resource::RenderGraphResourceRef;
pub use graph_resource::RenderGraphResourceType;
pub use graph_resource::RenderGraphUsageId;
use graph_resource::*;

mod graph_buffer;
pub use graph_buffer::RenderGraphBufferResource;
pub use graph_buffer::RenderGraphExternalBuffer;

mod graph_image;
pub use graph_image::RenderGraphExternalImage;
pub use graph_image::RenderGraphImageResource;

mod graph_node;
pub use graph_node::RenderGraphNode;
pub use graph_node::RenderGraphNodeExecutor;
pub use graph_node::RenderGraphNodeId;

mod graph_plan;

mod graph_execute;

#[cfg(test)]
mod graph_tests;
