// Core infrastructure shared by the dispatcher

pub mod config;
pub mod errors;
pub mod logging;

// Re-export commonly used types
pub use config::DispatcherConfig;
pub use errors::{DispatchError, Result};
pub use logging::{init_logging, init_test_logging};
