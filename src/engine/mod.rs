// Pipeline engine: planning, supervision, progress watching, stage
// orchestration around the external encoder.

pub mod cleanup;
pub mod commands;
pub mod filters;
pub mod planner;
pub mod probe;
pub mod progress;
pub mod registry;
pub mod stages;
pub mod supervisor;
pub mod watchdog;

pub use cleanup::CleanupPolicy;
pub use planner::{Job, PlanRequest, SourceGroup};
pub use probe::SourceInfo;
pub use registry::{ChildStatus, InterpPass, Registry, StageParams};
pub use stages::Orchestrator;
pub use watchdog::Watchdog;
