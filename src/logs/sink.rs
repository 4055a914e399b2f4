use crate::error::{Result, VigilError};
use chrono::Local;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tokio::fs::File as TokioFile;
use tokio::io::AsyncWriteExt;

/// Default timestamp format for merged log entries
pub const DEFAULT_LOG_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Append-only destination for one log file.
///
/// Every write is a whole line issued as a single `write_all`, so a process
/// restart (which reopens the sink in append mode, landing at end-of-file)
/// can never corrupt a partial line.
pub struct LogSink {
    path: PathBuf,
    file: TokioFile,
}

impl LogSink {
    /// Open (or create) the destination in append mode
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                VigilError::LogError(format!("Failed to create log directory: {}", e))
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                VigilError::LogFileError(format!("Failed to open {}: {}", path.display(), e))
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: TokioFile::from_std(file),
        })
    }

    /// Append one raw line (separate-file mode)
    pub async fn write_raw_line(&mut self, line: &str) -> Result<()> {
        let mut entry = String::with_capacity(line.len() + 1);
        entry.push_str(line);
        entry.push('\n');
        self.append(entry.as_bytes()).await
    }

    /// Append one `<timestamp> <stream-tag> <line>` entry (merged mode)
    pub async fn write_tagged_line(
        &mut self,
        date_format: &str,
        tag: &str,
        line: &str,
    ) -> Result<()> {
        let timestamp = Local::now().format(date_format).to_string();
        let mut entry = String::with_capacity(timestamp.len() + tag.len() + line.len() + 3);
        entry.push_str(&timestamp);
        entry.push(' ');
        entry.push_str(tag);
        entry.push(' ');
        entry.push_str(line);
        entry.push('\n');
        self.append(entry.as_bytes()).await
    }

    async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file.write_all(bytes).await.map_err(|e| {
            VigilError::LogError(format!("Failed to write {}: {}", self.path.display(), e))
        })?;
        self.file.flush().await.map_err(|e| {
            VigilError::LogError(format!("Failed to flush {}: {}", self.path.display(), e))
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_raw_lines() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-out.log");

        let mut sink = LogSink::open(&path).await.unwrap();
        sink.write_raw_line("first").await.unwrap();
        sink.write_raw_line("second").await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "first\nsecond\n");
    }

    #[tokio::test]
    async fn test_tagged_lines_have_timestamp_and_tag() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app.log");

        let mut sink = LogSink::open(&path).await.unwrap();
        sink.write_tagged_line(DEFAULT_LOG_DATE_FORMAT, "err", "boom")
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let line = content.lines().next().unwrap();
        assert!(line.ends_with(" err boom"));
        // Timestamp prefix: "YYYY-MM-DD HH:MM:SS.mmm"
        assert!(line.len() > "err boom".len() + 20);
    }

    #[tokio::test]
    async fn test_reopen_appends_at_end() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("app-out.log");

        {
            let mut sink = LogSink::open(&path).await.unwrap();
            sink.write_raw_line("before restart").await.unwrap();
        }
        {
            let mut sink = LogSink::open(&path).await.unwrap();
            sink.write_raw_line("after restart").await.unwrap();
        }

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "before restart\nafter restart\n");
    }

    #[tokio::test]
    async fn test_creates_parent_directory() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/app-out.log");

        let mut sink = LogSink::open(&path).await.unwrap();
        sink.write_raw_line("hello").await.unwrap();
        assert!(path.exists());
    }
}
