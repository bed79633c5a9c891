//! Services built on top of the core components.
//!
//! This module contains the pipeline assembly and upstream dispatch.

pub mod components;
pub mod upstream;

// Re-export commonly used types
pub use components::Components;
pub use upstream::{UpstreamClient, UpstreamResponse};
