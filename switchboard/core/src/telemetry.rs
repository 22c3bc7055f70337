//! Logging bootstrap
//!
//! The library only emits `tracing` events. Binaries and test harnesses that
//! want to see them call [`init_tracing`] once at startup.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `switchboard_core={level}`
/// when `RUST_LOG` is unset
///
/// Returns `false` when a global subscriber was already installed.
pub fn init_tracing(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("switchboard_core={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_tracing("debug");
        assert!(!init_tracing("info"));
    }
}
