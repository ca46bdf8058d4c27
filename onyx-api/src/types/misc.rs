bitflags::bitflags! {
    /// The current state of a resource. When an operation is performed that references a resource,
    /// it must be in the correct state. Resources are moved between states using barriers.
    pub struct OnyxResourceState: u32 {
        const UNDEFINED = 0;
        const VERTEX_AND_CONSTANT_BUFFER = 0x1;
        const INDEX_BUFFER = 0x2;
        /// Similar to vulkan's COLOR_ATTACHMENT_OPTIMAL image layout
        const RENDER_TARGET = 0x4;
        const UNORDERED_ACCESS = 0x8;
        /// Similar to vulkan's DEPTH_STENCIL_ATTACHMENT_OPTIMAL image layout
        const DEPTH_WRITE = 0x10;
        const DEPTH_READ = 0x20;
        /// Similar to vulkan's SHADER_READ_ONLY_OPTIMAL image layout
        const SHADER_RESOURCE = 0x40;
        const INDIRECT_ARGUMENT = 0x80;
        /// Similar to vulkan's TRANSFER_DST_OPTIMAL image layout
        const COPY_DST = 0x100;
        /// Similar to vulkan's TRANSFER_SRC_OPTIMAL image layout
        const COPY_SRC = 0x200;
        /// Read as input to an acceleration structure build
        const ACCELERATION_STRUCTURE_READ = 0x400;
        /// Written as output of an acceleration structure build
        const ACCELERATION_STRUCTURE_WRITE = 0x800;
        /// Similar to vulkan's PRESENT_SRC_KHR image layout
        const PRESENT = 0x1000;
        /// The resource's memory is being taken over by another resource aliased onto the
        /// same allocation. Contents are no longer meaningful.
        const DISCARDED = 0x2000;
    }
}

impl OnyxResourceState {
    /// States that write through caches the GPU cannot implicitly order. Back-to-back uses in
    /// one of these states always need a fresh barrier even when the state does not change.
    pub fn is_write_hazard(self) -> bool {
        self == OnyxResourceState::UNORDERED_ACCESS
            || self == OnyxResourceState::COPY_DST
            || self == OnyxResourceState::ACCELERATION_STRUCTURE_WRITE
    }
}

bitflags::bitflags! {
    /// Pipeline stages that will touch a resource, used to scope barriers. Similar to
    /// VkPipelineStageFlagBits
    #[derive(Default)]
    pub struct OnyxPipelineStageFlags: u32 {
        const NONE = 0;
        const DRAW_INDIRECT = 0x1;
        const VERTEX_INPUT = 0x2;
        const VERTEX_SHADER = 0x4;
        const FRAGMENT_SHADER = 0x8;
        const COLOR_ATTACHMENT = 0x10;
        const DEPTH_ATTACHMENT = 0x20;
        const COMPUTE_SHADER = 0x40;
        const TRANSFER = 0x80;
        const ACCELERATION_STRUCTURE_BUILD = 0x100;
        const ALL = 0x1FF;
    }
}

/// The stages a resource in the given state can be consumed from. Used when a transition's
/// source is only known by the state the resource was left in.
pub fn pipeline_stages_for_state(state: OnyxResourceState) -> OnyxPipelineStageFlags {
    match state {
        OnyxResourceState::VERTEX_AND_CONSTANT_BUFFER => {
            OnyxPipelineStageFlags::VERTEX_SHADER
                | OnyxPipelineStageFlags::FRAGMENT_SHADER
                | OnyxPipelineStageFlags::COMPUTE_SHADER
        }
        OnyxResourceState::INDEX_BUFFER => OnyxPipelineStageFlags::VERTEX_INPUT,
        OnyxResourceState::RENDER_TARGET => OnyxPipelineStageFlags::COLOR_ATTACHMENT,
        OnyxResourceState::UNORDERED_ACCESS => OnyxPipelineStageFlags::COMPUTE_SHADER,
        OnyxResourceState::DEPTH_WRITE | OnyxResourceState::DEPTH_READ => {
            OnyxPipelineStageFlags::DEPTH_ATTACHMENT
        }
        OnyxResourceState::SHADER_RESOURCE => {
            OnyxPipelineStageFlags::VERTEX_SHADER
                | OnyxPipelineStageFlags::FRAGMENT_SHADER
                | OnyxPipelineStageFlags::COMPUTE_SHADER
        }
        OnyxResourceState::INDIRECT_ARGUMENT => OnyxPipelineStageFlags::DRAW_INDIRECT,
        OnyxResourceState::COPY_DST | OnyxResourceState::COPY_SRC => {
            OnyxPipelineStageFlags::TRANSFER
        }
        OnyxResourceState::ACCELERATION_STRUCTURE_READ
        | OnyxResourceState::ACCELERATION_STRUCTURE_WRITE => {
            OnyxPipelineStageFlags::ACCELERATION_STRUCTURE_BUILD
        }
        _ => OnyxPipelineStageFlags::NONE,
    }
}

bitflags::bitflags! {
    /// Indicates how a resource will be used. In some cases, multiple flags are allowed.
    #[derive(Default)]
    pub struct OnyxResourceType: u32 {
        const UNDEFINED = 0;
        /// Similar to vulkan SAMPLED image usage flag
        const TEXTURE = 1<<0;
        /// Similar to vulkan STORAGE image usage flag
        const TEXTURE_READ_WRITE = 1<<1;
        const BUFFER = 1<<2;
        const BUFFER_READ_WRITE = 1<<3;
        const UNIFORM_BUFFER = 1<<4;
        const VERTEX_BUFFER = 1<<5;
        const INDEX_BUFFER = 1<<6;
        const INDIRECT_BUFFER = 1<<7;
        const TRANSFER_SRC = 1<<8;
        const TRANSFER_DST = 1<<9;
        const ACCELERATION_STRUCTURE_INPUT = 1<<10;
        const ACCELERATION_STRUCTURE = 1<<11;
        /// A color attachment in a renderpass
        const RENDER_TARGET_COLOR = 1<<12;
        /// A depth/stencil attachment in a renderpass
        const RENDER_TARGET_DEPTH_STENCIL = 1<<13;
    }
}

/// The usage flag a resource must carry to be usable in the given state. The graph ORs this
/// into a resource's def for every declared use before allocating it.
pub fn resource_type_for_state(state: OnyxResourceState) -> OnyxResourceType {
    match state {
        OnyxResourceState::VERTEX_AND_CONSTANT_BUFFER => OnyxResourceType::UNIFORM_BUFFER,
        OnyxResourceState::INDEX_BUFFER => OnyxResourceType::INDEX_BUFFER,
        OnyxResourceState::RENDER_TARGET => OnyxResourceType::RENDER_TARGET_COLOR,
        OnyxResourceState::UNORDERED_ACCESS => {
            OnyxResourceType::TEXTURE_READ_WRITE | OnyxResourceType::BUFFER_READ_WRITE
        }
        OnyxResourceState::DEPTH_WRITE | OnyxResourceState::DEPTH_READ => {
            OnyxResourceType::RENDER_TARGET_DEPTH_STENCIL
        }
        OnyxResourceState::SHADER_RESOURCE => OnyxResourceType::TEXTURE | OnyxResourceType::BUFFER,
        OnyxResourceState::INDIRECT_ARGUMENT => OnyxResourceType::INDIRECT_BUFFER,
        OnyxResourceState::COPY_DST => OnyxResourceType::TRANSFER_DST,
        OnyxResourceState::COPY_SRC => OnyxResourceType::TRANSFER_SRC,
        OnyxResourceState::ACCELERATION_STRUCTURE_READ => {
            OnyxResourceType::ACCELERATION_STRUCTURE_INPUT
        }
        OnyxResourceState::ACCELERATION_STRUCTURE_WRITE => OnyxResourceType::ACCELERATION_STRUCTURE,
        _ => OnyxResourceType::UNDEFINED,
    }
}

/// A 3d size for textures. depth is 1 for 2d images
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct OnyxExtents3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

/// Number of MSAA samples to use. 1xMSAA and 4xMSAA are most broadly supported
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OnyxSampleCount {
    SampleCount1,
    SampleCount2,
    SampleCount4,
    SampleCount8,
}

impl Default for OnyxSampleCount {
    fn default() -> Self {
        OnyxSampleCount::SampleCount1
    }
}

/// Texture formats the graph knows how to describe. Only a working subset of what real
/// backends expose.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OnyxFormat {
    Undefined,
    R8Unorm,
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Srgb,
    R16G16B16A16Float,
    R32G32B32A32Float,
    R32Uint,
    R32Float,
    D16Unorm,
    D32Float,
    D24UnormS8Uint,
}

impl Default for OnyxFormat {
    fn default() -> Self {
        OnyxFormat::Undefined
    }
}

impl OnyxFormat {
    pub fn is_depth(self) -> bool {
        match self {
            OnyxFormat::D16Unorm | OnyxFormat::D32Float | OnyxFormat::D24UnormS8Uint => true,
            _ => false,
        }
    }

    /// Bytes per pixel, used for memory estimates in allocation reports
    pub fn block_size(self) -> u64 {
        match self {
            OnyxFormat::Undefined => 0,
            OnyxFormat::R8Unorm => 1,
            OnyxFormat::D16Unorm => 2,
            OnyxFormat::R8G8B8A8Unorm
            | OnyxFormat::R8G8B8A8Srgb
            | OnyxFormat::B8G8R8A8Srgb
            | OnyxFormat::R32Uint
            | OnyxFormat::R32Float
            | OnyxFormat::D32Float
            | OnyxFormat::D24UnormS8Uint => 4,
            OnyxFormat::R16G16B16A16Float => 8,
            OnyxFormat::R32G32B32A32Float => 16,
        }
    }
}

/// Indicates how the memory will be accessed and affects where in memory it needs to be allocated.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum OnyxMemoryUsage {
    /// The memory is only accessed by the GPU
    GpuOnly,
    /// The memory is written by the CPU and read by the GPU
    CpuToGpu,
    /// The memory is written by the GPU and read by the CPU
    GpuToCpu,
}

impl Default for OnyxMemoryUsage {
    fn default() -> Self {
        OnyxMemoryUsage::GpuOnly
    }
}
