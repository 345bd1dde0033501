//! CLI command implementations

pub mod diagram;
pub mod serve;
pub mod validate;
