//! On-demand partition creation

mod orchestrator;
mod spawn;
mod worker;

pub use orchestrator::{CreationOrchestrator, CreationOutcome, CreationState};
pub use spawn::plan_spawn;
pub use worker::{BgWorkerPool, CreationRequest, CreationResponse};
