// Core infrastructure modules
pub mod core;

// Channel dispatch: policy, clients, operations and the dispatcher itself
pub mod dispatch;

// Re-exports for convenience
pub use crate::core::config::DispatcherConfig;
pub use crate::core::errors::{DispatchError, Result};
pub use crate::core::logging::{init_logging, init_test_logging};

pub use dispatch::*;
