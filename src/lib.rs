//! Orchestration core for supervised coding agents: a gated task-graph
//! executor, an event-derived progress projection, and a bounded
//! self-healing fix loop backed by a similarity-searchable fix memory.

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod fixloop;
pub mod fs;
pub mod graph;
pub mod logging;
pub mod memory;
pub mod models;
pub mod progress;
pub mod session;
pub mod tools;

pub use error::{EngineError, EngineResult, FixLoopError, GraphError};
pub use session::Session;
