//! streamwarden-core: Core library for streamwarden
//!
//! This crate keeps an unattended media capture/encode pipeline alive on a
//! kiosk device. The pipeline itself is an external black box; streamwarden
//! converts its noisy health signals and OS resource telemetry into a
//! bounded, non-flapping sequence of recovery actions, with an independent
//! out-of-process watchdog as a second, coarser recovery layer.
//!
//! # Architecture
//!
//! ```text
//! EngineHandle ──► HealthSampler ──► StatusStore ──► HTTP surface
//!                       │                 ▲
//!                       ▼                 │
//!               RecoverySupervisor ───────┘
//!                       │
//!                       ▼ (nudge / reclaim / deliberate exit)
//!
//! separate process:  EscalationWatchdog ──► AlertDispatcher
//! ```
//!
//! # Modules
//!
//! - `engine`: media-engine boundary (state queries, pipeline nudges)
//! - `event_window`: trailing time-window event tally
//! - `health`: health snapshots, error events, the periodic sampler
//! - `status_store`: bounded, concurrently readable snapshot/event history
//! - `supervisor`: the in-process escalation ladder
//! - `reclaim`: artifact trimming, log rotation
//! - `sysprobe`: OS resource readings (/proc, statvfs)
//! - `watchdog`: the out-of-process escalation watchdog
//! - `alerts`: dedup/cooldown-gated alert fan-out (webhook, e-mail)
//! - `http`: read-only health/status endpoints
//! - `runtime`: the monitor's periodic task and shutdown plumbing
//! - `config`: typed configuration with validated defaults
//! - `logging`: tracing setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod alerts;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_window;
pub mod health;
pub mod http;
pub mod logging;
pub mod reclaim;
pub mod runtime;
pub mod status_store;
pub mod supervisor;
pub mod sysprobe;
pub mod watchdog;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Distinguished exit status used for scheduled full-process restarts.
///
/// The OS service supervisor is configured to restart on any non-zero exit;
/// this code marks the exit as a deliberate supervision hand-off rather than
/// a crash. It must never be caught or remapped in-process.
pub const RESTART_EXIT_CODE: i32 = 86;

/// Current wall-clock time as epoch milliseconds.
pub(crate) fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_millis()).ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn restart_exit_code_is_nonzero() {
        assert_ne!(RESTART_EXIT_CODE, 0);
    }
}
