//! Core engine for the broadcast delivery pipeline: error taxonomy, process
//! settings, the lifecycle state machine, and the interfaces the pipeline
//! demands of its external engines (durable store, grid, message log, user
//! directory) together with in-memory backends for tests and single-node
//! deployments.

pub mod config;
pub mod directory;
pub mod error;
pub mod grid;
pub mod lifecycle;
pub mod log;
pub mod registry;
pub mod store;
pub mod throttle;

pub use config::Settings;
pub use error::{CoreError, CoreResult};
