// crates/core/src/hooks.rs
//
// Trainer lifecycle hooks. The checkpoint hook is the only built-in; the
// trait seam exists so periodic side effects stay out of the training loop.
//
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::checkpoint::{Checkpointer, CheckpointState};
use crate::config::DetConfig;

/// Counters the hooks observe after each step.
#[derive(Debug, Clone)]
pub struct TrainState {
    pub run_id: String,
    pub iteration: u64,
    pub samples_seen: u64,
    pub bytes_read: u64,
}

#[async_trait]
pub trait TrainerHook: Send {
    async fn after_step(&mut self, _state: &TrainState) -> Result<()> {
        Ok(())
    }
    async fn after_epoch(&mut self, _epoch: u64, _state: &TrainState) -> Result<()> {
        Ok(())
    }
    async fn finalize(&mut self, _state: &TrainState) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Box<dyn TrainerHook>>,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("hook_count", &self.hooks.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Box<dyn TrainerHook>) {
        self.hooks.push(hook);
    }

    pub async fn after_step(&mut self, state: &TrainState) -> Result<()> {
        for hook in self.hooks.iter_mut() {
            hook.after_step(state).await?;
        }
        Ok(())
    }

    pub async fn after_epoch(&mut self, epoch: u64, state: &TrainState) -> Result<()> {
        for hook in self.hooks.iter_mut() {
            hook.after_epoch(epoch, state).await?;
        }
        Ok(())
    }

    pub async fn finalize(&mut self, state: &TrainState) -> Result<()> {
        for hook in self.hooks.iter_mut() {
            hook.finalize(state).await?;
        }
        Ok(())
    }
}

/// Writes a checkpoint every `period` iterations and at finalize.
pub struct CheckpointHook {
    checkpointer: Checkpointer,
    config_snapshot: String,
    period: u64,
    last_saved: Option<u64>,
}

impl CheckpointHook {
    pub fn new(cfg: &DetConfig) -> Result<Self> {
        Ok(Self {
            checkpointer: Checkpointer::from_config(cfg),
            config_snapshot: cfg.to_yaml()?,
            period: cfg.solver.checkpoint_period.max(1),
            last_saved: None,
        })
    }

    fn save(&mut self, state: &TrainState) -> Result<()> {
        if self.last_saved == Some(state.iteration) {
            return Ok(());
        }
        let payload = CheckpointState {
            run_id: state.run_id.clone(),
            iteration: state.iteration,
            timestamp: chrono::Utc::now(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            config_snapshot: self.config_snapshot.clone(),
            samples_seen: state.samples_seen,
            bytes_read: state.bytes_read,
        };
        self.checkpointer.save(&payload)?;
        self.last_saved = Some(state.iteration);
        Ok(())
    }
}

#[async_trait]
impl TrainerHook for CheckpointHook {
    async fn after_step(&mut self, state: &TrainState) -> Result<()> {
        if state.iteration > 0 && state.iteration % self.period == 0 {
            debug!(iteration = state.iteration, "periodic checkpoint");
            self.save(state)?;
        }
        Ok(())
    }

    async fn finalize(&mut self, state: &TrainState) -> Result<()> {
        self.save(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    fn test_config(output_dir: &std::path::Path) -> DetConfig {
        ConfigBuilder::defaults()
            .unwrap()
            .with_vit_defaults()
            .unwrap()
            .set_datasets("data_train", "data_val")
            .merge_overrides(&[
                "OUTPUT_DIR".to_string(),
                output_dir.to_string_lossy().into_owned(),
                "SOLVER.CHECKPOINT_PERIOD".to_string(),
                "10".to_string(),
            ])
            .unwrap()
            .freeze()
            .unwrap()
    }

    fn state_at(iteration: u64) -> TrainState {
        TrainState {
            run_id: "hook-test".to_string(),
            iteration,
            samples_seen: iteration * 2,
            bytes_read: iteration * 100,
        }
    }

    #[tokio::test]
    async fn test_checkpoint_hook_fires_on_period() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut hooks = HookRegistry::new();
        hooks.push(Box::new(CheckpointHook::new(&cfg).unwrap()));

        for iter in 1..=25u64 {
            hooks.after_step(&state_at(iter)).await.unwrap();
        }
        hooks.finalize(&state_at(25)).await.unwrap();

        let ckpt = Checkpointer::from_config(&cfg);
        let latest = ckpt.latest().unwrap().unwrap();
        assert!(latest.ends_with("model_0000025.ckpt"));
        assert!(dir.path().join("model_0000010.ckpt").is_file());
        assert!(dir.path().join("model_0000020.ckpt").is_file());
    }

    #[tokio::test]
    async fn test_finalize_does_not_duplicate_period_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let mut hook = CheckpointHook::new(&cfg).unwrap();

        hook.after_step(&state_at(10)).await.unwrap();
        hook.finalize(&state_at(10)).await.unwrap();

        let count = std::fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(".ckpt")
            })
            .count();
        assert_eq!(count, 1);
    }
}
