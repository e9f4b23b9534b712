pub mod build;
pub mod config;
pub mod digest;
pub mod errors;
pub mod model;
pub mod package;
pub mod queue;
pub mod run;
pub mod shortid;
pub mod storage;

pub use errors::{ReproError, Result};
