/// Shared value types, errors and configuration for Lurker
pub mod config;
pub mod error;
pub mod types;

pub use config::{protocol, ConfigError, LurkerConfig};
pub use error::{LurkerError, Result};
pub use types::{Addr, Protocol, Service};
