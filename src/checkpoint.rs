//! Resume points for archives that stopped partway through.

use crate::config::CHECKPOINT_VERSION;
use crate::stats::IngestionStats;
use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// Upper bound on a decoded checkpoint; guards against garbage length prefixes.
const MAX_CHECKPOINT_BYTES: u64 = 64 * 1024;

/// The archive a checkpoint was written for. Any difference makes it stale.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ArchiveStamp {
    pub path: String,
    /// Modification time in whole seconds.
    pub mtime: u64,
    pub kind: String,
}

impl ArchiveStamp {
    pub fn of(input_path: &Path, kind: &str) -> Result<Self> {
        let mtime = fs::metadata(input_path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Cannot stat archive {}", input_path.display()))?
            .duration_since(SystemTime::UNIX_EPOCH)
            .context("Archive modified before the epoch")?
            .as_secs();
        Ok(Self {
            path: input_path.to_string_lossy().into_owned(),
            mtime,
            kind: kind.to_string(),
        })
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Checkpoint {
    pub version: u32,
    pub archive: ArchiveStamp,
    /// Input lines whose records are all committed.
    pub lines_committed: u64,
    pub stats: IngestionStats,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_CHECKPOINT_BYTES)
}

impl Checkpoint {
    /// `Ok(None)` when the file is missing or does not decode.
    fn read(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Cannot read {}", path.display())),
        };
        match codec().deserialize(&bytes) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring undecodable checkpoint");
                Ok(None)
            }
        }
    }

    /// Writes beside `path` and renames, so readers never see a partial file.
    fn write(&self, path: &Path) -> Result<()> {
        let bytes = codec().serialize(self).context("Cannot encode checkpoint")?;
        let tmp = path.with_extension("checkpoint.tmp");
        fs::write(&tmp, bytes).with_context(|| format!("Cannot write {}", tmp.display()))?;
        fs::rename(&tmp, path).with_context(|| format!("Cannot replace {}", path.display()))
    }
}

/// `<checkpoint_dir>/<archive file name>.checkpoint`
pub fn checkpoint_path(checkpoint_dir: &Path, input_path: &Path) -> PathBuf {
    let name = input_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "archive".to_string());
    checkpoint_dir.join(format!("{name}.checkpoint"))
}

/// Loads the checkpoint for `input_path` if it still describes that archive.
pub fn load_if_valid(input_path: &Path, checkpoint_dir: &Path, kind: &str) -> Result<Option<Checkpoint>> {
    let path = checkpoint_path(checkpoint_dir, input_path);
    let Some(checkpoint) = Checkpoint::read(&path)? else {
        return Ok(None);
    };
    if checkpoint.version != CHECKPOINT_VERSION {
        debug!(found = checkpoint.version, "Ignoring checkpoint from another format");
        return Ok(None);
    }
    if checkpoint.archive != ArchiveStamp::of(input_path, kind)? {
        info!(path = %path.display(), "Starting over, archive differs from its checkpoint");
        return Ok(None);
    }
    Ok(Some(checkpoint))
}

/// Saves progress of one archive every `interval` committed batches.
pub struct CheckpointManager {
    path: PathBuf,
    stamp: ArchiveStamp,
    interval: u32,
    pending: u32,
}

impl CheckpointManager {
    pub fn new(input_path: &Path, checkpoint_dir: &Path, kind: &str, interval: u32) -> Result<Self> {
        Ok(Self {
            path: checkpoint_path(checkpoint_dir, input_path),
            stamp: ArchiveStamp::of(input_path, kind)?,
            interval: interval.max(1),
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Counts a committed batch; returns whether this one was saved.
    pub fn maybe_save(&mut self, lines_committed: u64, stats: &IngestionStats) -> Result<bool> {
        self.pending += 1;
        if self.pending < self.interval {
            return Ok(false);
        }
        self.save(lines_committed, stats)?;
        self.pending = 0;
        Ok(true)
    }

    pub fn save(&self, lines_committed: u64, stats: &IngestionStats) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;
        }
        Checkpoint {
            version: CHECKPOINT_VERSION,
            archive: self.stamp.clone(),
            lines_committed,
            stats: stats.clone(),
        }
        .write(&self.path)?;
        debug!(lines = lines_committed, "Checkpoint written");
        Ok(())
    }

    /// Removes the checkpoint once its archive is fully ingested.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(e).with_context(|| format!("Cannot remove {}", self.path.display()))
            }
            _ => Ok(()),
        }
    }
}
