//! Application glue module
//!
//! Configuration and logging for the relay binary.

mod config;
mod logging;

pub use config::{RelayConfig, BUFFER_SIZE_ENV, CONFIG_ENV, DRAIN_ENV, STRATEGY_ENV, TERM_ENV};
pub use logging::{init_logging, LOG_ENV};
