// crates/core/src/checkpoint.rs
//
// Checkpoint persistence and resume resolution. Checkpoints are JSON
// payloads, optionally zstd-compressed, written under OUTPUT_DIR with a
// `last_checkpoint` marker file naming the most recent one.
//
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::DetConfig;

const LAST_CHECKPOINT_MARKER: &str = "last_checkpoint";
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Iteration number of a `model_{iter}.ckpt` filename, if it is one.
fn checkpoint_iteration(name: &str) -> Option<u64> {
    name.strip_prefix("model_")?
        .strip_suffix(".ckpt")?
        .parse()
        .ok()
}

/// The persisted training state: iteration counter plus run bookkeeping.
/// Model parameters proper are owned by the external model collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointState {
    pub run_id: String,
    pub iteration: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub driver_version: String,
    /// YAML snapshot of the frozen config at save time.
    pub config_snapshot: String,
    pub samples_seen: u64,
    pub bytes_read: u64,
}

/// Where `resume_or_load` got its state from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadedFrom {
    /// Latest checkpoint in the output directory (training continues).
    Latest(PathBuf),
    /// Explicitly configured weights path (fresh iteration counter).
    Weights(PathBuf),
    /// No prior state; start from scratch.
    Fresh,
}

/// Saves and restores checkpoints for one output directory.
pub struct Checkpointer {
    dir: PathBuf,
    compress: bool,
    compression_level: i32,
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer")
            .field("dir", &self.dir)
            .field("compress", &self.compress)
            .finish()
    }
}

impl Checkpointer {
    pub fn new(dir: &Path, compress: bool) -> Self {
        Self {
            dir: dir.to_path_buf(),
            compress,
            compression_level: 3,
        }
    }

    pub fn from_config(cfg: &DetConfig) -> Self {
        Self::new(Path::new(&cfg.output_dir), cfg.solver.checkpoint_compression)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write a checkpoint file and update the `last_checkpoint` marker.
    pub fn save(&self, state: &CheckpointState) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create output directory {:?}", self.dir))?;

        let json = serde_json::to_vec_pretty(state).context("Failed to serialize checkpoint")?;
        let uncompressed = json.len();
        let payload = if self.compress {
            let compressed = zstd::encode_all(json.as_slice(), self.compression_level)
                .context("Failed to compress checkpoint with zstd")?;
            Bytes::from(compressed)
        } else {
            Bytes::from(json)
        };

        let file_name = format!("model_{:07}.ckpt", state.iteration);
        let path = self.dir.join(&file_name);
        std::fs::write(&path, &payload)
            .with_context(|| format!("Failed to write checkpoint {:?}", path))?;
        std::fs::write(self.dir.join(LAST_CHECKPOINT_MARKER), &file_name)
            .context("Failed to update last_checkpoint marker")?;

        info!(
            iteration = state.iteration,
            path = %path.display(),
            bytes = payload.len(),
            uncompressed,
            "checkpoint written"
        );
        Ok(path)
    }

    /// Read a checkpoint file, transparently decompressing zstd payloads.
    pub fn load(&self, path: &Path) -> Result<CheckpointState> {
        let raw = std::fs::read(path)
            .with_context(|| format!("Failed to read checkpoint {:?}", path))?;
        let json = if raw.starts_with(&ZSTD_MAGIC) {
            zstd::decode_all(raw.as_slice())
                .with_context(|| format!("Failed to decompress checkpoint {:?}", path))?
        } else {
            raw
        };
        serde_json::from_slice(&json)
            .with_context(|| format!("Checkpoint {:?} is not a valid vitdet checkpoint", path))
    }

    /// Path of the most recent checkpoint, if any. The marker file is
    /// authoritative; a directory scan covers a missing or stale marker.
    pub fn latest(&self) -> Result<Option<PathBuf>> {
        let marker = self.dir.join(LAST_CHECKPOINT_MARKER);
        if marker.is_file() {
            let name = std::fs::read_to_string(&marker)
                .with_context(|| format!("Failed to read {:?}", marker))?;
            let path = self.dir.join(name.trim());
            if path.is_file() {
                return Ok(Some(path));
            }
            debug!(marker = %marker.display(), "stale last_checkpoint marker, falling back to scan");
        }

        if !self.dir.is_dir() {
            return Ok(None);
        }
        let mut newest: Option<(u64, PathBuf)> = None;
        for entry in std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to list output directory {:?}", self.dir))?
        {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            // Compare by parsed iteration; long runs outgrow the zero
            // padding, where lexical order stops being numeric.
            if let Some(iteration) = checkpoint_iteration(name) {
                if newest.as_ref().map_or(true, |(best, _)| iteration > *best) {
                    newest = Some((iteration, path));
                }
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    pub fn has_checkpoint(&self) -> bool {
        matches!(self.latest(), Ok(Some(_)))
    }

    /// Training-path resolution: prefer resuming from the latest checkpoint,
    /// fall back to configured initial weights, else start fresh.
    pub fn resume_or_load(
        &self,
        weights: Option<&Path>,
        resume: bool,
    ) -> Result<(LoadedFrom, Option<CheckpointState>)> {
        if resume {
            if let Some(path) = self.latest()? {
                let state = self.load(&path)?;
                return Ok((LoadedFrom::Latest(path), Some(state)));
            }
        }
        if let Some(weights) = weights {
            let state = self.load(weights)?;
            return Ok((LoadedFrom::Weights(weights.to_path_buf()), Some(state)));
        }
        Ok((LoadedFrom::Fresh, None))
    }

    /// Evaluation-path resolution: an explicit weights path wins, otherwise
    /// the latest checkpoint when resuming; with neither, evaluation cannot
    /// proceed and this is a missing-weights error.
    pub fn load_for_eval(
        &self,
        weights: Option<&Path>,
        resume: bool,
    ) -> Result<(LoadedFrom, CheckpointState)> {
        if let Some(weights) = weights {
            let state = self.load(weights)?;
            return Ok((LoadedFrom::Weights(weights.to_path_buf()), state));
        }
        if resume {
            if let Some(path) = self.latest()? {
                let state = self.load(&path)?;
                return Ok((LoadedFrom::Latest(path), state));
            }
        }
        bail!(
            "No model weights to evaluate: set MODEL.WEIGHTS or pass --resume with a prior checkpoint in {:?}",
            self.dir
        )
    }
}

impl CheckpointState {
    pub fn new(run_id: &str, iteration: u64, cfg: &DetConfig) -> Result<Self> {
        Ok(Self {
            run_id: run_id.to_string(),
            iteration,
            timestamp: chrono::Utc::now(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            config_snapshot: cfg.to_yaml()?,
            samples_seen: 0,
            bytes_read: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(iteration: u64) -> CheckpointState {
        CheckpointState {
            run_id: "test-run".to_string(),
            iteration,
            timestamp: chrono::Utc::now(),
            driver_version: "0.0.0".to_string(),
            config_snapshot: String::new(),
            samples_seen: iteration * 16,
            bytes_read: iteration * 1024,
        }
    }

    #[test]
    fn test_save_latest_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), false);

        ckpt.save(&state(100)).unwrap();
        ckpt.save(&state(200)).unwrap();

        let latest = ckpt.latest().unwrap().unwrap();
        assert!(latest.ends_with("model_0000200.ckpt"));
        let loaded = ckpt.load(&latest).unwrap();
        assert_eq!(loaded.iteration, 200);
        assert_eq!(loaded.samples_seen, 3200);
    }

    #[test]
    fn test_compressed_checkpoints_load_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let path = Checkpointer::new(dir.path(), true).save(&state(5)).unwrap();

        // A non-compressing checkpointer still reads the zstd payload.
        let loaded = Checkpointer::new(dir.path(), false).load(&path).unwrap();
        assert_eq!(loaded.iteration, 5);
    }

    #[test]
    fn test_scan_covers_missing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), false);
        ckpt.save(&state(7)).unwrap();
        ckpt.save(&state(12)).unwrap();
        std::fs::remove_file(dir.path().join(LAST_CHECKPOINT_MARKER)).unwrap();

        let latest = ckpt.latest().unwrap().unwrap();
        assert!(latest.ends_with("model_0000012.ckpt"));
    }

    #[test]
    fn test_scan_orders_numerically_past_padding_width() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), false);
        // 10_000_000 outgrows the 7-digit padding and sorts before
        // model_9999999.ckpt lexically.
        ckpt.save(&state(10_000_000)).unwrap();
        ckpt.save(&state(9_999_999)).unwrap();
        std::fs::remove_file(dir.path().join(LAST_CHECKPOINT_MARKER)).unwrap();

        let latest = ckpt.latest().unwrap().unwrap();
        assert!(latest.ends_with("model_10000000.ckpt"));
    }

    #[test]
    fn test_training_resume_prefers_latest_over_weights() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), false);
        let weights_path = ckpt.save(&state(10)).unwrap();
        ckpt.save(&state(50)).unwrap();

        let (from, state) = ckpt.resume_or_load(Some(&weights_path), true).unwrap();
        assert!(matches!(from, LoadedFrom::Latest(_)));
        assert_eq!(state.unwrap().iteration, 50);

        let (from, state) = ckpt.resume_or_load(Some(&weights_path), false).unwrap();
        assert_eq!(from, LoadedFrom::Weights(weights_path));
        assert_eq!(state.unwrap().iteration, 10);
    }

    #[test]
    fn test_fresh_start_without_weights_or_resume() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), false);
        let (from, state) = ckpt.resume_or_load(None, true).unwrap();
        assert_eq!(from, LoadedFrom::Fresh);
        assert!(state.is_none());
    }

    #[test]
    fn test_eval_without_weights_is_missing_weights_error() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), false);
        let err = ckpt.load_for_eval(None, true).unwrap_err();
        assert!(err.to_string().contains("No model weights"));
    }

    #[test]
    fn test_eval_prefers_explicit_weights_over_latest() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = Checkpointer::new(dir.path(), false);
        let weights_path = ckpt.save(&state(10)).unwrap();
        ckpt.save(&state(50)).unwrap();

        let (from, state) = ckpt.load_for_eval(Some(&weights_path), true).unwrap();
        assert_eq!(from, LoadedFrom::Weights(weights_path));
        assert_eq!(state.iteration, 10);
    }

    #[test]
    fn test_corrupt_checkpoint_fails_at_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model_0000001.ckpt");
        std::fs::write(&path, b"not json").unwrap();
        let err = Checkpointer::new(dir.path(), false).load(&path).unwrap_err();
        assert!(err.to_string().contains("not a valid vitdet checkpoint"));
    }
}
