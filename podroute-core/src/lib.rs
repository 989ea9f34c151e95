pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;

pub use config::{Config, CoordinationMode};
pub use error::{Error, Result};
