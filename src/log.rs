//! Structured logging setup.
//!
//! Library code logs through the `tracing` macros; binaries and tests call
//! [`init`] or [`init_with_debug`] once to install a subscriber.
//!
//! Levels used by the crate:
//! - WARN: escalations, dropped findings, unknown severities
//! - INFO: run start/finish, aggregation summaries
//! - DEBUG: dispatches, transitions, claim attempts, gate verdicts
//! - TRACE: raw worker payloads
//!
//! Debug mode can be enabled with `CONCORD_DEBUG=1`. `RUST_LOG` takes
//! precedence over both when set.

use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::EnvFilter;

/// Environment variable that switches the default filter to `debug`.
pub const DEBUG_ENV: &str = "CONCORD_DEBUG";

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install the default subscriber at `info`.
pub fn init() {
    init_with_debug(false);
}

/// Install the default subscriber, optionally at `debug`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_enabled)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "concord=debug"
    } else {
        "concord=info"
    }
}
