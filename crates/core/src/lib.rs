//! Domain model shared by the sheetflow orchestrator and its front ends.

pub mod domain;
pub mod error;

pub use domain::*;
pub use error::CoreError;
