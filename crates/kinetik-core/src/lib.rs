pub mod config;
pub mod stack;
pub mod types;

pub use config::DaemonConfig;
pub use stack::{ServiceDefinition, StackDefinition, StackError};
pub use types::*;
