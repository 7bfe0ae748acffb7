//! End-of-run synchronization: a process-group barrier, or marker files on a shared
//! filesystem for launchers whose collectives time out during long coordinator work.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::config::FinalizationMode;
use crate::distributed::ProcessGroup;
use crate::error::{Error, ErrorDetails};

const MARKER_SUFFIX: &str = "metric_eval_done.txt";
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct CompletionMarkers {
    dir: PathBuf,
    rank: usize,
    world_size: usize,
}

fn file_io_error(path: &Path, e: &std::io::Error) -> Error {
    Error::new(ErrorDetails::FileIo {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

impl CompletionMarkers {
    pub fn new(dir: impl Into<PathBuf>, rank: usize, world_size: usize) -> Self {
        Self {
            dir: dir.into(),
            rank,
            world_size,
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.dir.join(format!("rank{}_{MARKER_SUFFIX}", self.rank))
    }

    /// Removes this rank's marker left over from an earlier run.
    pub async fn clear_stale(&self) -> Result<(), Error> {
        let path = self.marker_path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stale completion marker");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(file_io_error(&path, &e)),
        }
    }

    pub async fn mark_done(&self) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| file_io_error(&self.dir, &e))?;
        let path = self.marker_path();
        tokio::fs::write(&path, format!("rank {} eval done", self.rank))
            .await
            .map_err(|e| file_io_error(&path, &e))
    }

    /// Number of marker files currently in the directory.
    pub async fn count_done(&self) -> Result<usize, Error> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| file_io_error(&self.dir, &e))?;
        let mut count = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| file_io_error(&self.dir, &e))?
        {
            if entry.file_name().to_string_lossy().ends_with(MARKER_SUFFIX) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Polls until every rank has written its marker. There is no timeout.
    pub async fn wait_for_all(&self) -> Result<(), Error> {
        loop {
            let done = self.count_done().await?;
            if done >= self.world_size {
                return Ok(());
            }
            debug!(done, world_size = self.world_size, "Waiting for other ranks");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Blocks until every rank has finished its part of the run.
#[instrument(skip_all, fields(?mode, rank = group.rank()))]
pub async fn finalize(
    mode: FinalizationMode,
    group: &dyn ProcessGroup,
    output_path: Option<&Path>,
) -> Result<(), Error> {
    match (mode, output_path) {
        (FinalizationMode::MarkerFiles, Some(dir)) => {
            let markers = CompletionMarkers::new(dir, group.rank(), group.world_size());
            markers.mark_done().await?;
            markers.wait_for_all().await?;
            info!("All ranks finished");
            Ok(())
        }
        (FinalizationMode::MarkerFiles, None) => Err(Error::new(ErrorDetails::Config {
            message: "marker file finalization requires an output path".to_string(),
        })),
        (FinalizationMode::Collective, _) => {
            if group.world_size() > 1 {
                group.barrier().await?;
            }
            Ok(())
        }
    }
}
