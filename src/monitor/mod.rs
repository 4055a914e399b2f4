use crate::process::state::{LifecycleStatus, RestartReason};
use crate::process::supervisor::AppHandle;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Default memory poll interval
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically samples resident memory of live children that declare
/// `max_memory_restart` and requests a restart when the threshold is
/// exceeded.
///
/// The monitor never mutates runtime state: breaching the limit sends a
/// Restart command to the app's own supervisor loop, and that path is
/// exempt from the failure streak.
pub struct ResourceMonitor {
    system: System,
    apps: Vec<AppHandle>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl ResourceMonitor {
    /// Build a monitor over the subset of apps with a memory threshold
    pub fn new(
        handles: &[AppHandle],
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let apps: Vec<AppHandle> = handles
            .iter()
            .filter(|h| h.spec().max_memory_restart.is_some())
            .cloned()
            .collect();

        Self {
            system: System::new(),
            apps,
            poll_interval,
            shutdown,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub async fn run(mut self) {
        if self.apps.is_empty() {
            return;
        }

        info!(
            "Resource monitor started ({} app(s), every {:?})",
            self.apps.len(),
            self.poll_interval
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would sample before anything is running
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => self.poll_once().await,
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        debug!("Resource monitor shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One sampling pass over every live child with a threshold
    pub async fn poll_once(&mut self) {
        let targets: Vec<(AppHandle, u32, u64)> = self
            .apps
            .iter()
            .filter_map(|h| {
                let snapshot = h.snapshot();
                if snapshot.status != LifecycleStatus::Running {
                    return None;
                }
                let pid = snapshot.pid?;
                let limit = h.spec().max_memory_restart?;
                Some((h.clone(), pid, limit))
            })
            .collect();

        if targets.is_empty() {
            return;
        }

        let pids: Vec<Pid> = targets.iter().map(|(_, pid, _)| Pid::from_u32(*pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&pids),
            true,
            ProcessRefreshKind::everything(),
        );

        for (handle, pid, limit) in targets {
            let Some(process) = self.system.process(Pid::from_u32(pid)) else {
                // Exited between snapshot and sample; its loop will notice
                continue;
            };

            let resident = process.memory();
            if resident > limit {
                warn!(
                    app = %handle.name(),
                    pid,
                    resident,
                    limit,
                    "Memory limit exceeded, requesting restart"
                );
                if let Err(e) = handle.restart(RestartReason::MemoryLimit).await {
                    warn!(app = %handle.name(), "Restart request failed: {}", e);
                }
            }
        }
    }

    /// Sample resident memory of one PID (used by tests)
    pub fn sample_memory(&mut self, pid: u32) -> Option<u64> {
        let sys_pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::everything(),
        );
        self.system.process(sys_pid).map(|p| p.memory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_sample_memory_of_live_process() {
        let (_tx, rx) = watch::channel(false);
        let mut monitor = ResourceMonitor::new(&[], DEFAULT_POLL_INTERVAL, rx);

        let mut child = Command::new("/bin/sleep")
            .arg("5")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");

        let resident = monitor.sample_memory(pid);
        assert!(resident.is_some());
        assert!(resident.unwrap() > 0);

        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn test_sample_memory_of_dead_process() {
        let (_tx, rx) = watch::channel(false);
        let mut monitor = ResourceMonitor::new(&[], DEFAULT_POLL_INTERVAL, rx);

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .expect("Failed to spawn process");
        let pid = child.id().expect("Failed to get PID");
        let _ = child.wait().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(monitor.sample_memory(pid), None);
    }
}
