pub mod api;
pub mod clock;
pub mod config;
pub mod logging;
pub mod security;

pub use config::Config;

pub use api::{create_router, AppState, Backends};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use logging::{Channel, LogAnalyzer, LogEntry, LogLevel, Logger, LoggingConfig};
pub use security::{SecurityConfig, SecurityError};
