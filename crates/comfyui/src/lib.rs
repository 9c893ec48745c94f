//! ComfyUI REST and WebSocket client.
//!
//! Covers what a headshot render needs: loading and patching an API-format
//! workflow, submitting it, following execution over WebSocket, and
//! downloading the images it saved.

pub mod api;
pub mod client;
pub mod messages;
pub mod runner;
pub mod workflow;

pub use api::{ComfyUIApi, ComfyUIApiError};
pub use runner::{OutputImage, RunError, WorkflowRunner};
pub use workflow::{Workflow, WorkflowError};
