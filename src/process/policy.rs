use crate::config::ProcessSpec;
use std::time::Duration;

/// Ceiling on computed backoff delays (5 minutes)
pub const MAX_RESTART_DELAY: Duration = Duration::from_secs(300);

/// Outcome of consulting the restart policy after an exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after waiting out the given delay
    RestartAfter(Duration),
    /// Stop retrying; the app is terminally stopped
    GiveUp,
}

/// Decide whether and when to restart an app that just exited.
///
/// `rapid_failures` is the consecutive count of exits below min_uptime,
/// already updated for the exit being decided on.
///
/// A clean (code 0) exit of an autorestart app is restarted like a crash:
/// continuous services are expected to run forever, so any exit is a
/// deviation, not a success terminal state.
pub fn decide(spec: &ProcessSpec, rapid_failures: u32) -> RestartDecision {
    if !spec.autorestart {
        return RestartDecision::GiveUp;
    }

    if let Some(max) = spec.max_restarts {
        if rapid_failures > max {
            return RestartDecision::GiveUp;
        }
    }

    RestartDecision::RestartAfter(restart_delay(spec, rapid_failures))
}

/// Compute the delay before the next launch attempt.
///
/// With a backoff factor configured the delay grows per consecutive rapid
/// failure: `base * factor^(failures - 1)`, so the first retry always waits
/// the base delay. A healthy run resets the streak and therefore the delay.
pub fn restart_delay(spec: &ProcessSpec, rapid_failures: u32) -> Duration {
    let base = spec.restart_delay_ms;

    let delay_ms = match spec.backoff_factor {
        Some(factor) => {
            let exponent = rapid_failures.saturating_sub(1);
            base.saturating_mul((factor as u64).saturating_pow(exponent))
        }
        None => base,
    };

    Duration::from_millis(delay_ms).min(MAX_RESTART_DELAY)
}
