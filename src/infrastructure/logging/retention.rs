//! Removal of log files past their retention period.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct LogRetention {
    retention_days: u32,
}

impl LogRetention {
    pub const fn new(retention_days: u32) -> Self {
        Self { retention_days }
    }

    /// Delete `*.log*` files in `log_dir` not modified within the retention
    /// period. Returns the number of files deleted.
    pub async fn cleanup_old_logs(&self, log_dir: impl AsRef<Path>) -> Result<usize> {
        let log_dir = log_dir.as_ref();

        if !log_dir.exists() {
            debug!(path = %log_dir.display(), "log directory does not exist");
            return Ok(0);
        }

        let cutoff = Utc::now() - Duration::days(i64::from(self.retention_days));
        let mut deleted_count = 0;

        let mut entries = tokio::fs::read_dir(log_dir)
            .await
            .context("failed to read log directory")?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read directory entry")?
        {
            let path = entry.path();
            let is_log = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| name.contains(".log"));
            if !is_log {
                continue;
            }

            let modified = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .context("failed to get file modification time")?;
            let modified_dt: DateTime<Utc> = modified.into();

            if modified_dt < cutoff {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to delete old log file");
                    continue;
                }
                deleted_count += 1;
            }
        }

        if deleted_count > 0 {
            info!(count = deleted_count, "cleaned up old log files");
        }
        Ok(deleted_count)
    }
}
