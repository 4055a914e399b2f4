use crate::config::ProcessSpec;
use crate::error::{Result, VigilError};
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Synthetic exit code recorded when the spawn itself fails
/// (executable missing, permission denied). Matches the shell's
/// command-not-found convention.
pub const SPAWN_FAILURE_CODE: i32 = 127;

/// Handle and metadata for a freshly spawned child
#[derive(Debug)]
pub struct SpawnedChild {
    pub child: Child,
    pub pid: u32,
}

/// Spawn one child process according to its spec.
///
/// With an interpreter configured the script becomes the interpreter's
/// first argument; otherwise the script is executed directly. Environment
/// overrides are applied on top of the inherited environment, so later
/// entries win. Both output streams are captured as pipes for the log
/// router.
pub fn spawn_child(spec: &ProcessSpec) -> Result<SpawnedChild> {
    let mut command = match spec.interpreter {
        Some(ref interpreter) => {
            let mut cmd = Command::new(interpreter);
            cmd.arg(&spec.script);
            cmd
        }
        None => Command::new(&spec.script),
    };

    command.args(&spec.args);

    if let Some(ref cwd) = spec.cwd {
        command.current_dir(cwd);
    }

    for (key, value) in &spec.env {
        command.env(key, value);
    }

    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    let child = command
        .spawn()
        .map_err(|e| VigilError::SpawnError(format!("Failed to spawn '{}': {}", spec.name, e)))?;

    let pid = child.id().ok_or_else(|| {
        VigilError::SpawnError(format!("Failed to get PID for '{}'", spec.name))
    })?;

    Ok(SpawnedChild { child, pid })
}
