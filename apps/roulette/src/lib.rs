pub mod cli;
pub mod logging;
pub mod media;
pub mod orchestrator;
pub mod preflight;
pub mod session;
pub mod signaling;
pub mod ui;

pub use orchestrator::{Collaborators, Orchestrator, OrchestratorConfig, OrchestratorHandle, SessionOutcome};
