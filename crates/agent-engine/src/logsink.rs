//! Append-only per-job log file under the shared directory.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Sink for one job's container output, at
/// `<shared_dir>/jobs/<job_id>/logs/<job_id>.log`.
///
/// The file is created (directories included) at open time, so it exists
/// even for containers that never produce output. Chunks are decoded as
/// UTF-8 with replacement and flushed after every write so the log is
/// tail-able while the job runs.
pub(crate) struct JobLogSink {
    path: PathBuf,
    file: File,
}

impl JobLogSink {
    pub(crate) async fn open(shared_dir: &Path, job_id: &str) -> std::io::Result<Self> {
        let dir = shared_dir.join("jobs").join(job_id).join("logs");
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{job_id}.log"));
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        Ok(Self { path, file })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        let text = String::from_utf8_lossy(chunk);
        self.file.write_all(text.as_bytes()).await?;
        self.file.flush().await
    }
}

#[cfg(test)]
#[path = "logsink_tests.rs"]
mod tests;
