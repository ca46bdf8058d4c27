//! Frame graph for scheduling GPU work.
//!
//! Passes declare the buffers and images they read and write through a
//! [`graph::RenderGraphBuilder`]; the builder infers execution order from those declarations,
//! drops passes nothing depends on, aliases transients whose lifetimes never overlap onto
//! shared memory, and inserts the minimal barriers between passes. See the `graph` module
//! for the full per-frame lifecycle.

pub use onyx_api::{OnyxError, OnyxResult};

pub mod graph;
