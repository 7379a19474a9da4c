//! Structured logging setup (v0.1)
//!
//! One-shot tracing-subscriber installation honoring a print threshold.
//! `RUST_LOG` wins over the configured threshold when set.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber at the given threshold
/// (`error|warn|info|debug|trace`). Later calls are no-ops.
pub fn init(print_threshold: &str) {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(print_threshold));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("debug");
        init("trace");
        assert!(INSTALLED.load(Ordering::SeqCst));
    }
}
