use crate::config::ProcessSpec;
use crate::error::Result;
use crate::logs::sink::{LogSink, DEFAULT_LOG_DATE_FORMAT};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

/// Routes a child's output streams to their configured destinations.
///
/// One router is created per supervisor, holding only the default log
/// directory; per-app paths come from the spec. Capture tasks run until
/// the child closes its pipes, so they drain naturally on every exit.
pub struct LogRouter {
    log_dir: PathBuf,
}

impl LogRouter {
    pub fn new(log_dir: PathBuf) -> Self {
        Self { log_dir }
    }

    pub fn stdout_path(&self, spec: &ProcessSpec) -> PathBuf {
        spec.out_file
            .clone()
            .unwrap_or_else(|| self.log_dir.join(format!("{}-out.log", spec.name)))
    }

    pub fn stderr_path(&self, spec: &ProcessSpec) -> PathBuf {
        spec.err_file
            .clone()
            .unwrap_or_else(|| self.log_dir.join(format!("{}-err.log", spec.name)))
    }

    /// Attach capture tasks to a freshly spawned child.
    ///
    /// Merged mode interleaves both streams into the stdout destination as
    /// `<timestamp> <out|err> <line>`; separate mode appends raw lines to
    /// each stream's own file.
    pub async fn attach(&self, spec: &ProcessSpec, child: &mut Child) -> Result<Vec<JoinHandle<()>>> {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let mut tasks = Vec::with_capacity(2);

        if spec.merge_logs {
            let sink = Arc::new(Mutex::new(LogSink::open(&self.stdout_path(spec)).await?));
            let date_format = spec
                .log_date_format
                .clone()
                .unwrap_or_else(|| DEFAULT_LOG_DATE_FORMAT.to_string());

            if let Some(stdout) = stdout {
                tasks.push(capture_merged(
                    spec.name.clone(),
                    stdout,
                    "out",
                    Arc::clone(&sink),
                    date_format.clone(),
                ));
            }
            if let Some(stderr) = stderr {
                tasks.push(capture_merged(
                    spec.name.clone(),
                    stderr,
                    "err",
                    sink,
                    date_format,
                ));
            }
        } else {
            if let Some(stdout) = stdout {
                let sink = LogSink::open(&self.stdout_path(spec)).await?;
                tasks.push(capture_raw(spec.name.clone(), stdout, sink));
            }
            if let Some(stderr) = stderr {
                let sink = LogSink::open(&self.stderr_path(spec)).await?;
                tasks.push(capture_raw(spec.name.clone(), stderr, sink));
            }
        }

        Ok(tasks)
    }
}

fn capture_raw<R>(app: String, stream: R, mut sink: LogSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = sink.write_raw_line(&line).await {
                        warn!(app = %app, "Dropping log line: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(app = %app, "Log stream read failed: {}", e);
                    break;
                }
            }
        }
    })
}

fn capture_merged<R>(
    app: String,
    stream: R,
    tag: &'static str,
    sink: Arc<Mutex<LogSink>>,
    date_format: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let mut sink = sink.lock().await;
                    if let Err(e) = sink.write_tagged_line(&date_format, tag, &line).await {
                        warn!(app = %app, "Dropping log line: {}", e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(app = %app, "Log stream read failed: {}", e);
                    break;
                }
            }
        }
    })
}
