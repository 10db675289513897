/*!
 * Prelude module for skylink core.
 *
 * This module re-exports commonly used types and functions from the skylink
 * core crate to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{Id, Value};

// Re-export event types
pub use crate::event::{Event, EventBus, SharedEventBus};

// Re-export config types
pub use crate::config::{
    Config, ConfigBuilder, DeviceConfig, LoggingConfig, SessionDefaults, TransportConfig,
};

// Re-export utility functions
pub use crate::utils::{hex_dump, printable};

// Re-export logging macros
pub use tracing::{debug, error, info, trace, warn};

// Re-export core initialization
pub use crate::init;
