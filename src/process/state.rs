use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Lifecycle status of one managed app
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleStatus {
    Stopped,
    Starting,
    Running,
    Restarting,
    Crashed,
    /// max_restarts exceeded; no further automatic restart
    PermanentlyFailed,
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleStatus::Stopped => write!(f, "stopped"),
            LifecycleStatus::Starting => write!(f, "starting"),
            LifecycleStatus::Running => write!(f, "running"),
            LifecycleStatus::Restarting => write!(f, "restarting"),
            LifecycleStatus::Crashed => write!(f, "crashed"),
            LifecycleStatus::PermanentlyFailed => write!(f, "failed"),
        }
    }
}

/// Why a restart was requested from outside the supervisor loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// Resident memory exceeded max_memory_restart
    MemoryLimit,
    /// Operator-issued restart
    Operator,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::MemoryLimit => write!(f, "memory-limit"),
            RestartReason::Operator => write!(f, "operator"),
        }
    }
}

/// Mutable per-app runtime state, owned exclusively by the app's
/// supervisor loop. Everyone else sees it through `StateSnapshot`.
#[derive(Debug)]
pub struct RuntimeState {
    pub status: LifecycleStatus,
    /// Consecutive exits below min_uptime
    pub rapid_failures: u32,
    /// Total launches since the supervisor started, first launch included
    pub launches: u32,
    pub last_start: Option<Instant>,
    pub last_exit_code: Option<i32>,
    pub pid: Option<u32>,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            status: LifecycleStatus::Stopped,
            rapid_failures: 0,
            launches: 0,
            last_start: None,
            last_exit_code: None,
            pid: None,
        }
    }

    pub fn record_launch(&mut self, pid: u32) {
        self.launches += 1;
        self.last_start = Some(Instant::now());
        self.pid = Some(pid);
        self.status = LifecycleStatus::Running;
    }

    /// Account for an exit: reset the failure streak if the run reached
    /// min_uptime, otherwise count it as a rapid failure.
    pub fn record_exit(&mut self, exit_code: Option<i32>, min_uptime: Duration) {
        let uptime = self
            .last_start
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO);

        if uptime >= min_uptime {
            self.rapid_failures = 0;
        } else {
            self.rapid_failures += 1;
        }

        self.last_exit_code = exit_code;
        self.pid = None;
    }

    /// Account for an exit caused by a requested restart or shutdown.
    /// These are policy-triggered, not crashes, so the failure streak
    /// is left untouched.
    pub fn record_exit_uncounted(&mut self, exit_code: Option<i32>) {
        self.last_exit_code = exit_code;
        self.pid = None;
    }

    pub fn snapshot(&self, name: &str) -> StateSnapshot {
        StateSnapshot {
            name: name.to_string(),
            status: self.status,
            pid: self.pid,
            rapid_failures: self.rapid_failures,
            launches: self.launches,
            last_exit_code: self.last_exit_code,
        }
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of an app's runtime state, published through a watch
/// channel after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    pub name: String,
    pub status: LifecycleStatus,
    pub pid: Option<u32>,
    pub rapid_failures: u32,
    pub launches: u32,
    pub last_exit_code: Option<i32>,
}

impl StateSnapshot {
    pub fn initial(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: LifecycleStatus::Stopped,
            pid: None,
            rapid_failures: 0,
            launches: 0,
            last_exit_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rapid_failure_counting() {
        let mut state = RuntimeState::new();
        state.record_launch(100);
        assert_eq!(state.status, LifecycleStatus::Running);
        assert_eq!(state.launches, 1);

        // Exit immediately: well below a 1h min_uptime
        state.record_exit(Some(1), Duration::from_secs(3600));
        assert_eq!(state.rapid_failures, 1);
        assert_eq!(state.last_exit_code, Some(1));
        assert_eq!(state.pid, None);

        state.record_launch(101);
        state.record_exit(Some(1), Duration::from_secs(3600));
        assert_eq!(state.rapid_failures, 2);
    }

    #[test]
    fn test_streak_resets_after_min_uptime() {
        let mut state = RuntimeState::new();
        state.rapid_failures = 5;
        state.record_launch(100);

        // min_uptime of zero: any uptime counts as a successful start
        state.record_exit(Some(0), Duration::ZERO);
        assert_eq!(state.rapid_failures, 0);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let mut state = RuntimeState::new();
        state.record_launch(42);

        let snap = state.snapshot("app");
        assert_eq!(snap.name, "app");
        assert_eq!(snap.status, LifecycleStatus::Running);
        assert_eq!(snap.pid, Some(42));
        assert_eq!(snap.launches, 1);
    }
}
