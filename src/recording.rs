//! Newline-delimited JSON persistence for raw serial reads.
//!
//! One JSON object per line, `{"time","type","data"}`. Stroke pulses are
//! never written; they arrive often enough to swamp a recording without
//! carrying replayable information. Replay timing itself lives in the
//! driver; this module owns the file format.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocol::{FrameKind, RawRead};

/// File name used when a recording is started without an explicit name
pub const DEFAULT_RECORDING_NAME: &str = "recording";

/// Extension given to recording files
pub const RECORDING_EXTENSION: &str = "ndjson";

/// Resolve the file path for a named recording inside the data directory
#[must_use]
pub fn recording_path(data_dir: &Path, name: Option<&str>) -> PathBuf {
    let name = name.unwrap_or(DEFAULT_RECORDING_NAME);
    data_dir.join(format!("{name}.{RECORDING_EXTENSION}"))
}

/// A running recording subscription
///
/// Owns the background task that drains a `reads$` subscription into the
/// file. Dropping the handle without [`Recorder::stop`] aborts the task; a
/// partially written file stays valid because every read is flushed as its
/// own line.
#[derive(Debug)]
pub struct Recorder {
    path: PathBuf,
    task: JoinHandle<()>,
}

impl Recorder {
    /// Start appending non-pulse reads from `reads` to the file at `path`
    ///
    /// An existing file is truncated first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::GatewayError::Io`] if the data directory cannot be
    /// created or the file cannot be opened for writing.
    pub async fn start(path: PathBuf, mut reads: broadcast::Receiver<RawRead>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(&path).await?;
        info!("recording to {}", path.display());

        let task_path = path.clone();
        let task = tokio::spawn(async move {
            loop {
                match reads.recv().await {
                    Ok(read) => {
                        if read.kind == FrameKind::Pulse {
                            continue;
                        }
                        let line = match serde_json::to_string(&read) {
                            Ok(line) => line,
                            Err(e) => {
                                warn!("dropping unencodable read: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            warn!("recording write failed, stopping: {e}");
                            break;
                        }
                        if let Err(e) = file.write_all(b"\n").await {
                            warn!("recording write failed, stopping: {e}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("recording lagged, {missed} reads lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("reads stream completed, recording ends");
                        break;
                    }
                }
            }
            let _ = file.flush().await;
            debug!("recorder task for {} finished", task_path.display());
        });

        Ok(Self { path, task })
    }

    /// Path of the file being written
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detach the subscription and stop writing
    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        info!("recording to {} stopped", self.path.display());
    }
}

/// Load a recording back into memory, one raw read per line
///
/// Blank lines are skipped; a line that does not parse aborts the load.
///
/// # Errors
///
/// Returns [`crate::GatewayError::Io`] if the file cannot be read and
/// [`crate::GatewayError::Recording`] if a line is not a valid read object.
pub async fn load(path: &Path) -> Result<Vec<RawRead>> {
    let contents = fs::read_to_string(path).await?;
    let mut reads = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        reads.push(serde_json::from_str::<RawRead>(line)?);
    }
    debug!("loaded {} reads from {}", reads.len(), path.display());
    Ok(reads)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(time: i64, kind: FrameKind, data: &str) -> RawRead {
        RawRead {
            time,
            kind,
            data: data.to_string(),
        }
    }

    #[test]
    fn test_recording_path() {
        let dir = PathBuf::from("/var/lib/rowgate");
        assert_eq!(
            recording_path(&dir, Some("morning")),
            PathBuf::from("/var/lib/rowgate/morning.ndjson")
        );
        assert_eq!(
            recording_path(&dir, None),
            PathBuf::from("/var/lib/rowgate/recording.ndjson")
        );
    }

    #[tokio::test]
    async fn test_record_filters_pulses_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = recording_path(dir.path(), Some("test"));
        let (tx, rx) = broadcast::channel(32);

        let recorder = Recorder::start(path.clone(), rx).await.unwrap();

        tx.send(read(1_000, FrameKind::HardwareType, "_WR_S4.2")).unwrap();
        tx.send(read(1_050, FrameKind::Pulse, "P05")).unwrap();
        tx.send(read(1_200, FrameKind::Datapoint, "IDS1A912")).unwrap();
        tx.send(read(1_450, FrameKind::Other, "OK")).unwrap();

        // give the writer task a chance to drain before detaching
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        recorder.stop().await;

        let reads = load(&path).await.unwrap();
        assert_eq!(
            reads,
            vec![
                read(1_000, FrameKind::HardwareType, "_WR_S4.2"),
                read(1_200, FrameKind::Datapoint, "IDS1A912"),
                read(1_450, FrameKind::Other, "OK"),
            ]
        );
    }

    #[tokio::test]
    async fn test_record_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = recording_path(dir.path(), Some("test"));
        fs::write(&path, "{\"time\":1,\"type\":\"other\",\"data\":\"stale\"}\n")
            .await
            .unwrap();

        let (tx, rx) = broadcast::channel(8);
        let recorder = Recorder::start(path.clone(), rx).await.unwrap();
        tx.send(read(2_000, FrameKind::Other, "fresh")).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        recorder.stop().await;

        let reads = load(&path).await.unwrap();
        assert_eq!(reads, vec![read(2_000, FrameKind::Other, "fresh")]);
    }

    #[tokio::test]
    async fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.ndjson");
        fs::write(&path, "not json\n").await.unwrap();
        assert!(load(&path).await.is_err());
    }
}
