//! Process-wide tracing setup.

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

static INIT: OnceCell<()> = OnceCell::new();

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        fmt()
            .with_env_filter(env_filter("info"))
            .with_target(false)
            .init();
    });
}

/// Subscriber for test binaries: captured output, quieter default level, and
/// tolerant of another test having installed one already.
pub fn init_test_tracing() {
    let _ = INIT.get_or_init(|| {
        let _ = fmt()
            .with_env_filter(env_filter("warn,sensorhub=debug"))
            .with_test_writer()
            .try_init();
    });
}
