use crate::types::misc::*;

/// Used to create a buffer
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OnyxBufferDef {
    /// Size of the buffer in bytes
    pub size: u64,
    /// Specifies how the buffer will be used (vertex data, uniform data, etc.)
    pub resource_type: OnyxResourceType,
    /// Memory that the buffer will be placed into
    pub memory_usage: OnyxMemoryUsage,
}

impl Default for OnyxBufferDef {
    fn default() -> Self {
        OnyxBufferDef {
            size: 0,
            resource_type: OnyxResourceType::UNDEFINED,
            memory_usage: OnyxMemoryUsage::GpuOnly,
        }
    }
}

impl OnyxBufferDef {
    pub fn verify(&self) {
        assert_ne!(self.size, 0);
    }
}

/// Used to create an image
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OnyxTextureDef {
    pub extents: OnyxExtents3D,
    pub format: OnyxFormat,
    /// Number of mip levels, at least 1
    pub mip_count: u32,
    /// Number of array layers, at least 1
    pub layer_count: u32,
    pub sample_count: OnyxSampleCount,
    /// Specifies how the image will be used (sampled, storage, attachment, etc.)
    pub resource_type: OnyxResourceType,
}

impl Default for OnyxTextureDef {
    fn default() -> Self {
        OnyxTextureDef {
            extents: OnyxExtents3D {
                width: 0,
                height: 0,
                depth: 0,
            },
            format: OnyxFormat::Undefined,
            mip_count: 1,
            layer_count: 1,
            sample_count: OnyxSampleCount::SampleCount1,
            resource_type: OnyxResourceType::TEXTURE,
        }
    }
}

impl OnyxTextureDef {
    pub fn verify(&self) {
        assert!(self.extents.width > 0);
        assert!(self.extents.height > 0);
        assert!(self.extents.depth > 0);
        assert!(self.mip_count > 0);
        assert!(self.layer_count > 0);
        assert_ne!(self.format, OnyxFormat::Undefined);
    }
}
