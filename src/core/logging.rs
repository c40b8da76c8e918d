//! Logging setup for binaries and tests embedding the dispatcher

use tracing::Level;

/// Install a fmt subscriber at `level`.
///
/// Returns false when a global subscriber was already installed, which is
/// the normal case when several tests share a process.
pub fn init_logging(level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init()
        .is_ok()
}

/// Test-friendly variant writing through the libtest capture
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_refused() {
        init_test_logging();
        assert!(!init_logging(Level::INFO));
    }
}
