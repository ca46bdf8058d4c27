//! Backend-agnostic types for GPU resources and the device operations the frame graph drives.
//!
//! Nothing in this crate talks to a graphics API. Backends implement
//! [`OnyxDeviceContext`] and the higher-level crates only ever see these types.

pub use device_context::*;
pub use error::*;
pub use types::*;

mod device_context;
mod error;
mod types;
