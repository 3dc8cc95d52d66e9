pub mod config;
pub mod error;
pub mod participant;
pub mod protocol;
pub mod runtime;
pub mod storage;
pub mod transport;
pub mod types;

pub use config::{Config, IntermediaryConfig};
pub use error::{OrchestratorError, Result};
pub use types::*;
