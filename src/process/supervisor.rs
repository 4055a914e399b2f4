use crate::config::ProcessSpec;
use crate::error::{Result, VigilError};
use crate::logs::LogRouter;
use crate::process::policy::{self, RestartDecision};
use crate::process::spawner::{spawn_child, SPAWN_FAILURE_CODE};
use crate::process::state::{LifecycleStatus, RestartReason, RuntimeState, StateSnapshot};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Commands accepted by an app's supervisor loop.
///
/// The loop owns its RuntimeState exclusively; the scheduler, resource
/// monitor and operator surface only ever request transitions through
/// these messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppCommand {
    /// Launch the app if it is currently stopped
    Start,
    /// Gracefully stop; no automatic restart afterwards
    Stop,
    /// Force a restart of a running process; never counts as a crash
    Restart(RestartReason),
}

/// External control surface for one supervised app
#[derive(Clone)]
pub struct AppHandle {
    spec: Arc<ProcessSpec>,
    commands: mpsc::Sender<AppCommand>,
    state: watch::Receiver<StateSnapshot>,
}

impl AppHandle {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &Arc<ProcessSpec> {
        &self.spec
    }

    /// Latest published runtime state
    pub fn snapshot(&self) -> StateSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.state.clone()
    }

    pub async fn start(&self) -> Result<()> {
        self.send(AppCommand::Start).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.send(AppCommand::Stop).await
    }

    pub async fn restart(&self, reason: RestartReason) -> Result<()> {
        self.send(AppCommand::Restart(reason)).await
    }

    /// Block until the app reaches the given status, bounded by `timeout`
    pub async fn wait_for_status(
        &self,
        status: LifecycleStatus,
        timeout: Duration,
    ) -> Result<StateSnapshot> {
        let mut rx = self.state.clone();
        let waiter = async {
            loop {
                if rx.borrow().status == status {
                    return rx.borrow().clone();
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };

        match tokio::time::timeout(timeout, waiter).await {
            Ok(snapshot) if snapshot.status == status => Ok(snapshot),
            _ => Err(VigilError::InvalidAppState(
                self.spec.name.clone(),
                format!("did not reach {} within {:?}", status, timeout),
            )),
        }
    }

    async fn send(&self, cmd: AppCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| VigilError::ShuttingDown)
    }
}

/// Spawn the supervisor loop for one app.
///
/// Continuous apps launch immediately; cron-mode apps stay Stopped until
/// the scheduler fires their first Start.
pub fn spawn_app_loop(
    spec: Arc<ProcessSpec>,
    router: Arc<LogRouter>,
    shutdown: watch::Receiver<bool>,
) -> (AppHandle, JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(16);
    let (state_tx, state_rx) = watch::channel(StateSnapshot::initial(&spec.name));

    let handle = AppHandle {
        spec: Arc::clone(&spec),
        commands: cmd_tx,
        state: state_rx,
    };

    let sup = SupervisorLoop {
        spec,
        state: RuntimeState::new(),
        router,
        commands: cmd_rx,
        publish: state_tx,
        shutdown,
    };

    let task = tokio::spawn(sup.run());
    (handle, task)
}

/// What the loop does next after handling an event
enum Action {
    Launch,
    LaunchAfter(Duration),
    Idle,
    Exit,
}

/// Why supervision of a live child ended
enum ExitCause {
    /// The process exited on its own
    Exited,
    /// A Restart command terminated it
    Requested(RestartReason),
    /// A Stop command terminated it
    Stopped,
    /// Global shutdown terminated it
    Shutdown,
}

/// One control unit per managed app: owns the child handle and the app's
/// RuntimeState, and is the only place either is mutated.
struct SupervisorLoop {
    spec: Arc<ProcessSpec>,
    state: RuntimeState,
    router: Arc<LogRouter>,
    commands: mpsc::Receiver<AppCommand>,
    publish: watch::Sender<StateSnapshot>,
    shutdown: watch::Receiver<bool>,
}

impl SupervisorLoop {
    async fn run(mut self) {
        let mut action = if self.spec.is_cron() {
            debug!(app = %self.spec.name, "Cron-mode app waiting for first scheduled firing");
            Action::Idle
        } else {
            Action::Launch
        };

        loop {
            action = match action {
                Action::Launch => self.run_cycle().await,
                Action::LaunchAfter(delay) => self.wait_restart_delay(delay).await,
                Action::Idle => self.idle().await,
                Action::Exit => break,
            };
        }

        debug!(app = %self.spec.name, "Supervisor loop terminated");
    }

    /// Launch the child and supervise it until it is gone, then decide
    /// what happens next.
    async fn run_cycle(&mut self) -> Action {
        self.state.status = LifecycleStatus::Starting;
        self.publish_state();

        let mut spawned = match spawn_child(&self.spec) {
            Ok(spawned) => spawned,
            Err(e) => {
                // Synthetic crash: a consistently failing launch must still
                // respect max_restarts instead of busy-looping.
                error!(app = %self.spec.name, "Spawn failed: {}", e);
                self.state.launches += 1;
                self.state.last_start = Some(std::time::Instant::now());
                return self.handle_exit(Some(SPAWN_FAILURE_CODE), ExitCause::Exited);
            }
        };

        if let Err(e) = self.router.attach(&self.spec, &mut spawned.child).await {
            warn!(app = %self.spec.name, "Log capture unavailable: {}", e);
        }

        self.state.record_launch(spawned.pid);
        self.publish_state();
        info!(app = %self.spec.name, pid = spawned.pid, "Started");

        let (code, cause) = self.supervise_child(spawned.child).await;
        self.handle_exit(code, cause)
    }

    /// Watch a live child for exit, restart/stop requests, and global
    /// shutdown. Returns once the OS process is gone.
    async fn supervise_child(&mut self, mut child: Child) -> (Option<i32>, ExitCause) {
        loop {
            tokio::select! {
                status = child.wait() => {
                    let code = match status {
                        Ok(status) => status.code(),
                        Err(e) => {
                            error!(app = %self.spec.name, "Wait failed: {}", e);
                            None
                        }
                    };
                    return (code, ExitCause::Exited);
                }
                cmd = self.commands.recv() => match cmd {
                    Some(AppCommand::Restart(reason)) => {
                        info!(app = %self.spec.name, %reason, "Restart requested");
                        let code = self.terminate(&mut child).await;
                        return (code, ExitCause::Requested(reason));
                    }
                    Some(AppCommand::Stop) => {
                        info!(app = %self.spec.name, "Stop requested");
                        let code = self.terminate(&mut child).await;
                        return (code, ExitCause::Stopped);
                    }
                    Some(AppCommand::Start) => {
                        debug!(app = %self.spec.name, "Already running, Start ignored");
                    }
                    // Control surface gone: behave like a shutdown
                    None => {
                        let code = self.terminate(&mut child).await;
                        return (code, ExitCause::Shutdown);
                    }
                },
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        let code = self.terminate(&mut child).await;
                        return (code, ExitCause::Shutdown);
                    }
                }
            }
        }
    }

    /// Exit accounting and the restart decision
    fn handle_exit(&mut self, code: Option<i32>, cause: ExitCause) -> Action {
        match cause {
            ExitCause::Requested(reason) => {
                // Policy-triggered restart: exempt from the failure streak
                self.state.record_exit_uncounted(code);
                self.state.status = LifecycleStatus::Restarting;
                self.publish_state();
                info!(app = %self.spec.name, %reason, "Relaunching after requested restart");
                Action::Launch
            }
            ExitCause::Stopped => {
                self.state.record_exit_uncounted(code);
                self.state.status = LifecycleStatus::Stopped;
                self.publish_state();
                Action::Idle
            }
            ExitCause::Shutdown => {
                self.state.record_exit_uncounted(code);
                self.state.status = LifecycleStatus::Stopped;
                self.publish_state();
                Action::Exit
            }
            ExitCause::Exited => {
                self.state.record_exit(code, self.spec.min_uptime());
                self.state.status = if code == Some(0) {
                    LifecycleStatus::Stopped
                } else {
                    LifecycleStatus::Crashed
                };
                self.publish_state();
                info!(
                    app = %self.spec.name,
                    code = ?code,
                    rapid_failures = self.state.rapid_failures,
                    "Exited"
                );

                if self.spec.is_cron() {
                    // The scheduler owns the next launch
                    self.state.status = LifecycleStatus::Stopped;
                    self.publish_state();
                    return Action::Idle;
                }

                match policy::decide(&self.spec, self.state.rapid_failures) {
                    RestartDecision::RestartAfter(delay) => {
                        self.state.status = LifecycleStatus::Restarting;
                        self.publish_state();
                        debug!(app = %self.spec.name, ?delay, "Restarting after delay");
                        Action::LaunchAfter(delay)
                    }
                    RestartDecision::GiveUp => {
                        if self.spec.autorestart {
                            error!(
                                app = %self.spec.name,
                                "Restart limit exceeded, giving up"
                            );
                            self.state.status = LifecycleStatus::PermanentlyFailed;
                        } else {
                            // One-shot app finished; success path, not failure
                            self.state.status = LifecycleStatus::Stopped;
                        }
                        self.publish_state();
                        Action::Idle
                    }
                }
            }
        }
    }

    /// Wait out the computed restart delay without blocking other loops.
    /// Stop cancels the pending restart; shutdown aborts it.
    async fn wait_restart_delay(&mut self, delay: Duration) -> Action {
        if delay.is_zero() {
            return Action::Launch;
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Action::Launch,
                cmd = self.commands.recv() => match cmd {
                    Some(AppCommand::Stop) => {
                        self.state.status = LifecycleStatus::Stopped;
                        self.publish_state();
                        return Action::Idle;
                    }
                    Some(AppCommand::Start) => return Action::Launch,
                    Some(AppCommand::Restart(_)) => {
                        debug!(app = %self.spec.name, "Restart already pending");
                    }
                    None => return self.exit_idle(),
                },
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        return self.exit_idle();
                    }
                }
            }
        }
    }

    /// Park a stopped app until a command or shutdown arrives
    async fn idle(&mut self) -> Action {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(AppCommand::Start) => {
                        // A fresh operator/scheduler launch starts a clean streak
                        self.state.rapid_failures = 0;
                        return Action::Launch;
                    }
                    Some(AppCommand::Stop) => {
                        debug!(app = %self.spec.name, "Already stopped");
                    }
                    Some(AppCommand::Restart(reason)) => {
                        warn!(
                            app = %self.spec.name,
                            %reason,
                            "Restart requested but app is not running, ignoring"
                        );
                    }
                    None => return self.exit_idle(),
                },
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        return self.exit_idle();
                    }
                }
            }
        }
    }

    fn exit_idle(&mut self) -> Action {
        if self.state.status != LifecycleStatus::PermanentlyFailed {
            self.state.status = LifecycleStatus::Stopped;
            self.publish_state();
        }
        Action::Exit
    }

    /// Graceful termination: stop signal, kill_timeout grace window,
    /// SIGKILL escalation. Returns the child's exit code once it is gone.
    async fn terminate(&mut self, child: &mut Child) -> Option<i32> {
        let pid = match child.id() {
            Some(pid) => pid,
            // Already exited; just reap it
            None => return child.wait().await.ok().and_then(|s| s.code()),
        };

        let sig = parse_signal(&self.spec.stop_signal).unwrap_or(Signal::SIGTERM);
        if let Err(e) = signal::kill(Pid::from_raw(pid as i32), sig) {
            warn!(app = %self.spec.name, pid, "Failed to signal: {}", e);
        }

        match tokio::time::timeout(self.spec.kill_timeout(), child.wait()).await {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                error!(app = %self.spec.name, "Wait failed during stop: {}", e);
                None
            }
            Err(_) => {
                warn!(
                    app = %self.spec.name,
                    pid,
                    timeout_ms = self.spec.kill_timeout_ms,
                    "Ignored {} within kill timeout, sending SIGKILL",
                    self.spec.stop_signal
                );
                if let Err(e) = child.kill().await {
                    error!(app = %self.spec.name, "SIGKILL failed: {}", e);
                }
                None
            }
        }
    }

    fn publish_state(&self) {
        let _ = self.publish.send(self.state.snapshot(&self.spec.name));
    }
}

/// Map a configured signal name to a nix signal
pub fn parse_signal(signal_name: &str) -> Result<Signal> {
    match signal_name {
        "SIGTERM" => Ok(Signal::SIGTERM),
        "SIGINT" => Ok(Signal::SIGINT),
        "SIGQUIT" => Ok(Signal::SIGQUIT),
        "SIGKILL" => Ok(Signal::SIGKILL),
        "SIGHUP" => Ok(Signal::SIGHUP),
        "SIGUSR1" => Ok(Signal::SIGUSR1),
        "SIGUSR2" => Ok(Signal::SIGUSR2),
        _ => Err(VigilError::SignalError(format!(
            "Invalid signal name: {}",
            signal_name
        ))),
    }
}
