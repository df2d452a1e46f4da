//! Structured logging for the account subsystem.
//!
//! Provides production-ready structured logging with JSON output for log
//! aggregation, correlation IDs for request tracing, and dedicated helpers
//! for the security-sensitive events this crate produces (secret unlocks,
//! reservations, signing). Secrets are never interpolated into a log
//! line — only key ids, indices, and subaccount ids ever appear here.

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Application log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Event categories for structured logging.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// MasterSecret unlock/lock events.
    Secret,
    /// Reservation/generation events on a subaccount.
    Reservation,
    /// Transaction build/sign events.
    Signing,
    /// Security events (unlock failures, poisoned accounts).
    Security,
    /// System events (startup, shutdown).
    System,
}

/// Structured log event.
#[derive(Debug, Serialize)]
pub struct LogEvent {
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"error\": \"failed to serialize log\", \"message\": \"{}\"}}", self.message))
    }
}

/// Log a master-secret unlock attempt. Never logs password or plaintext
/// secret bytes — only the outcome and the subject's reason string.
pub fn log_security_event(event_type: &str, success: bool, details: serde_json::Value) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let event = LogEvent::new(level, EventCategory::Security, event_type)
        .with_data(serde_json::json!({ "success": success, "details": details }));

    if success {
        tracing::info!(target: "zbtc_core::security", "{}", event.to_json());
    } else {
        tracing::warn!(target: "zbtc_core::security", "{}", event.to_json());
    }
}

/// Log a reservation/generation event on a subaccount.
pub fn log_reservation_event(
    subaccount_id: &str,
    subchain: &str,
    index: u32,
    correlation_id: &str,
) {
    let event = LogEvent::new(
        LogLevel::Info,
        EventCategory::Reservation,
        format!("reserved index {} on {}", index, subchain),
    )
    .with_correlation_id(correlation_id)
    .with_data(serde_json::json!({
        "subaccount_id": subaccount_id,
        "subchain": subchain,
        "index": index,
    }));

    tracing::info!(target: "zbtc_core::reservation", "{}", event.to_json());
}

/// Log a transaction build/sign event.
pub fn log_signing_event(
    event_type: &str,
    txid: Option<&str>,
    input_count: usize,
    success: bool,
    error: Option<&str>,
) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Signing, event_type).with_data(serde_json::json!({
        "txid": txid,
        "input_count": input_count,
        "success": success,
    }));

    if let Some(err) = error {
        event = event.with_error("SIGNING_ERROR", err);
    }

    if success {
        tracing::info!(target: "zbtc_core::signing", "{}", event.to_json());
    } else {
        tracing::error!(target: "zbtc_core::signing", "{}", event.to_json());
    }
}

/// Initialize the logging system.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("zbtc_core={}", format!("{:?}", level).to_lowercase()))
    });

    if json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from a [`crate::common::config::Config`].
pub fn init_from_config(config: &crate::common::config::Config) -> Result<(), LoggingError> {
    let level = LogLevel::from(config.log_level.as_str());
    let json_format = config.network == crate::common::config::Network::Mainnet;
    init_logging(level, json_format)
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a unique correlation ID for request tracing.
pub fn generate_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_event_serialization() {
        let event = LogEvent::new(LogLevel::Info, EventCategory::Reservation, "test event")
            .with_correlation_id("test-123")
            .with_data(serde_json::json!({"key": "value"}));

        let json = event.to_json();
        assert!(json.contains("test event"));
        assert!(json.contains("test-123"));
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(LogLevel::from("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::from("INFO"), LogLevel::Info);
        assert_eq!(LogLevel::from("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from("unknown"), LogLevel::Info);
    }

    #[test]
    fn test_correlation_id_generation() {
        let id1 = generate_correlation_id();
        let id2 = generate_correlation_id();
        assert_ne!(id1, id2);
    }
}
