/*!
 * Logging functionality for skylink.
 *
 * This module provides tracing setup and the spans every device session
 * and operation runs under, so that log lines can be attributed to a device.
 */
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Initialize the logging system with default configuration
pub fn init() -> Result<()> {
    init_with_filter("info")
}

/// Initialize the logging system with a specific filter
///
/// # Arguments
///
/// * `filter` - The log filter string (e.g., "info", "debug", "skylink_engine=trace")
pub fn init_with_filter(filter: &str) -> Result<()> {
    init_layers(filter, true)
}

/// Initialize the logging system from the `[logging]` configuration section
pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_layers(&config.level, config.with_target)
}

fn init_layers(filter: &str, with_target: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(with_target))
        .with(filter)
        .try_init()
        .map_err(|e| Error::logging(format!("Failed to initialize logging: {}", e)))?;

    Ok(())
}

/// A type alias for a tracing span
pub type Span = tracing::Span;

/// Create a span for a device session
///
/// # Arguments
///
/// * `device` - The configured device name
/// * `driver` - The driver handling the device
pub fn session_span(device: &str, driver: &str) -> Span {
    tracing::info_span!("session", device = %device, driver = %driver)
}

/// Create a span for a single operation
pub fn operation_span(kind: &str, operation_id: &str) -> Span {
    tracing::info_span!("operation", kind = %kind, id = %operation_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // A second global subscriber in the same process is refused
        let _ = init();
        assert!(matches!(init(), Err(Error::Logging(_))));
    }

    #[test]
    fn test_spans() {
        let span = session_span("main-focuser", "frame-focuser");
        let _guard = span.enter();
        let op = operation_span("move_absolute", "op-1");
        let _op_guard = op.enter();
    }
}
