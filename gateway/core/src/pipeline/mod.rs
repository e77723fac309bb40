//! Pipeline
//!
//! - [`execution`]: per-request stage tracking
//! - [`orchestrator`]: the object that owns every component and runs requests

pub mod execution;
pub mod orchestrator;

pub use execution::{PipelineExecution, Stage};
pub use orchestrator::{GatewayResponse, PipelineOrchestrator, RouteInfo, SystemStatus};
