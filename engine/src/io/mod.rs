//! Side-effecting collaborators of the engine.

pub mod config;
pub mod model;
pub mod prompt;
pub mod recorder;
pub mod rest_session;
pub mod session;
pub mod task_spec;
