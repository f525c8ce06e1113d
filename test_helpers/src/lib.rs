//! Helpers shared by the tests of this workspace.
#![warn(missing_docs)]

use std::sync::Once;

use tracing_subscriber::EnvFilter;

pub mod tracing;

static LOG_SETUP: Once = Once::new();

/// Enables logging for a test if `RUST_LOG` is set.
///
/// This is a no-op otherwise, so tests stay quiet by default.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Installs a global, env-filtered log subscriber that writes through the test harness.
///
/// Installing happens at most once per process.
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        // another harness may have installed a global subscriber already
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}
