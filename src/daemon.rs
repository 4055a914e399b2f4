use crate::config::SpecRegistry;
use crate::cron::CronScheduler;
use crate::error::{Result, VigilError};
use crate::logs::LogRouter;
use crate::monitor::{ResourceMonitor, DEFAULT_POLL_INTERVAL};
use crate::process::state::StateSnapshot;
use crate::process::supervisor::{spawn_app_loop, AppHandle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Supervisor-wide options (per-app policy lives in each ProcessSpec)
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Default directory for per-app log files
    pub log_dir: PathBuf,
    /// Resource monitor poll interval
    pub memory_poll_interval: Duration,
    /// Hard cap on global shutdown; children that ignore both their stop
    /// signal and SIGKILL accounting beyond this are abandoned
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/tmp/vigil_logs"),
            memory_poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// The supervisor: one loop task per app plus the cron scheduler and the
/// resource monitor, all fed from an immutable spec registry.
pub struct Supervisor {
    handles: Vec<AppHandle>,
    loop_tasks: Vec<JoinHandle<()>>,
    aux_tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    options: SupervisorOptions,
}

impl Supervisor {
    /// Load the registry and spawn every component. Continuous apps start
    /// immediately; cron-mode apps wait for their first scheduled firing.
    pub fn launch(registry: SpecRegistry, options: SupervisorOptions) -> Result<Self> {
        if registry.is_empty() {
            return Err(VigilError::ConfigError(
                "No apps to supervise".to_string(),
            ));
        }

        let router = Arc::new(LogRouter::new(options.log_dir.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut handles = Vec::with_capacity(registry.len());
        let mut loop_tasks = Vec::with_capacity(registry.len());

        for spec in registry.iter() {
            let (handle, task) =
                spawn_app_loop(Arc::clone(spec), Arc::clone(&router), shutdown_rx.clone());
            handles.push(handle);
            loop_tasks.push(task);
        }

        info!("Supervising {} app(s)", handles.len());

        let mut aux_tasks = Vec::new();

        let scheduler = CronScheduler::new(&handles, shutdown_rx.clone())?;
        if !scheduler.is_empty() {
            aux_tasks.push(tokio::spawn(scheduler.run()));
        }

        let monitor = ResourceMonitor::new(&handles, options.memory_poll_interval, shutdown_rx);
        if !monitor.is_empty() {
            aux_tasks.push(tokio::spawn(monitor.run()));
        }

        Ok(Self {
            handles,
            loop_tasks,
            aux_tasks,
            shutdown_tx,
            options,
        })
    }

    /// Control surface for one app
    pub fn app(&self, name: &str) -> Option<&AppHandle> {
        self.handles.iter().find(|h| h.name() == name)
    }

    pub fn apps(&self) -> &[AppHandle] {
        &self.handles
    }

    /// Current status of every app
    pub fn status(&self) -> Vec<StateSnapshot> {
        self.handles.iter().map(|h| h.snapshot()).collect()
    }

    /// Propagate shutdown to every loop and wait until all children have
    /// been accounted for (exited or force-killed), bounded by the hard
    /// shutdown timeout.
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down supervisor");
        let _ = self.shutdown_tx.send(true);

        let join_all = async {
            for task in self.loop_tasks {
                if let Err(e) = task.await {
                    error!("Supervisor loop task panicked: {}", e);
                }
            }
            for task in self.aux_tasks {
                let _ = task.await;
            }
        };

        match tokio::time::timeout(self.options.shutdown_timeout, join_all).await {
            Ok(()) => {
                info!("Supervisor shutdown complete");
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Shutdown did not complete within {:?}",
                    self.options.shutdown_timeout
                );
                Err(VigilError::ShutdownTimeout("supervisor".to_string()))
            }
        }
    }

    /// Run until SIGINT or SIGTERM, then shut down gracefully
    pub async fn run_until_signal(self) -> Result<()> {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .map_err(|e| VigilError::SignalError(format!("SIGTERM handler: {}", e)))?;
        let mut sigint =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
                .map_err(|e| VigilError::SignalError(format!("SIGINT handler: {}", e)))?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }

        self.shutdown().await
    }
}
