//! Common infrastructure: configuration, structured logging, and the
//! crate's unified error type.

pub mod config;
pub mod error;
pub mod logging;

pub use config::{Config, ConfigError, Network};
pub use error::{Error, Result};
pub use logging::{
    generate_correlation_id, init_from_config, init_logging, log_reservation_event,
    log_security_event, log_signing_event, ErrorDetails, EventCategory, LogEvent, LogLevel,
    LoggingError,
};
