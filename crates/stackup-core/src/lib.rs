pub mod config;
pub mod driver;
pub mod error;
pub mod health;
pub mod io;
pub mod orchestrator;
pub mod paths;
pub mod phase;
pub mod plan;
pub mod prereq;
pub mod report;
pub mod rollback;
pub mod snapshot;
pub mod template;
pub mod tracker;
pub mod types;

pub use error::{Result, StackupError};
