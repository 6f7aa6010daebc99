//! Tracing setup
//!
//! Log level comes from `RUST_LOG` (default `info`). Pretty output for
//! terminals, JSON lines for log collectors.

use chrono::NaiveDate;
use tracing::Span;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber
///
/// Returns `false` when a subscriber is already installed, so tests may
/// call it repeatedly.
pub fn init_tracing(json: bool) -> bool {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let base = fmt::layer()
        .with_target(true)
        .with_line_number(true)
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.pretty())
            .try_init()
            .is_ok()
    }
}

/// Span covering one simulated delivery day
pub fn day_span(run_id: &uuid::Uuid, date: NaiveDate) -> Span {
    tracing::info_span!("day", run_id = %run_id, date = %date)
}

/// Span covering one agent's handling of a phase
pub fn agent_span(agent_id: &str, phase: &'static str) -> Span {
    tracing::debug_span!("agent", agent = %agent_id, phase = phase)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        init_tracing(false);
        assert!(!init_tracing(true));
    }
}
