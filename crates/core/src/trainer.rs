// crates/core/src/trainer.rs
//
// The training loop. Model forward/backward is an external collaborator,
// represented by a configurable simulated compute step; batch streaming,
// iteration accounting, checkpoint cadence and resume are real.
//
use anyhow::{ensure, Context, Result};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use crate::checkpoint::{Checkpointer, LoadedFrom};
use crate::config::DetConfig;
use crate::hooks::{CheckpointHook, HookRegistry, TrainState};
use crate::metrics::Metrics;
use crate::registry::DatasetRegistry;
use vitdet_data::{BatchLoader, DetectionDataset, LoaderConfig};

const LOG_PERIOD: u64 = 20;

#[derive(Debug)]
pub struct Trainer {
    cfg: DetConfig,
    loader: BatchLoader,
    checkpointer: Checkpointer,
    hooks: HookRegistry,
    run_id: String,
    start_iter: u64,
    samples_seen: u64,
    bytes_read: u64,
    metrics: Metrics,
}

impl Trainer {
    /// Bind a trainer to a frozen config and the registered train dataset.
    ///
    /// Only the main process gets the checkpoint hook; in multi-rank runs
    /// rank 0 is the sole writer of the output directory.
    pub fn new(cfg: &DetConfig, registry: &DatasetRegistry, is_main_process: bool) -> Result<Self> {
        let name = cfg
            .datasets
            .train
            .first()
            .context("DATASETS.TRAIN names no dataset")?;
        let record = registry.get(name)?;
        let dataset = Arc::new(DetectionDataset::load(
            &record.annotation_json,
            &record.image_root,
        )?);
        ensure!(
            !dataset.is_empty(),
            "Training dataset '{}' contains no images",
            name
        );
        info!(
            dataset = name.as_str(),
            images = dataset.len(),
            annotations = dataset.num_annotations(),
            "train dataset loaded"
        );

        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: cfg.solver.ims_per_batch,
                shuffle: cfg.dataloader.shuffle,
                seed: cfg.seed,
                read_concurrency: cfg.dataloader.num_workers.max(1),
            },
        );

        let mut hooks = HookRegistry::new();
        if is_main_process {
            hooks.push(Box::new(CheckpointHook::new(cfg)?));
        }

        Ok(Self {
            cfg: cfg.clone(),
            loader,
            checkpointer: Checkpointer::from_config(cfg),
            hooks,
            run_id: Uuid::new_v4().to_string(),
            start_iter: 0,
            samples_seen: 0,
            bytes_read: 0,
            metrics: Metrics::new(),
        })
    }

    pub fn start_iteration(&self) -> u64 {
        self.start_iter
    }

    /// Resolve the starting iteration: latest checkpoint when resuming,
    /// configured initial weights otherwise, else iteration zero.
    pub fn resume_or_load(&mut self, resume: bool) -> Result<()> {
        let weights = self.cfg.weights().map(PathBuf::from);
        let (from, state) = self
            .checkpointer
            .resume_or_load(weights.as_deref(), resume)?;
        match (from, state) {
            (LoadedFrom::Latest(path), Some(state)) => {
                // The stored counter is the number of completed iterations;
                // training picks up at the next one.
                self.start_iter = state.iteration;
                self.samples_seen = state.samples_seen;
                self.bytes_read = state.bytes_read;
                self.run_id = state.run_id.clone();
                info!(
                    checkpoint = %path.display(),
                    iteration = state.iteration,
                    "resumed from checkpoint"
                );
            }
            (LoadedFrom::Weights(path), Some(state)) => {
                // Initial weights seed the model only; iteration restarts.
                self.start_iter = 0;
                info!(
                    weights = %path.display(),
                    source_iteration = state.iteration,
                    "initialized from weights"
                );
            }
            _ => {
                self.start_iter = 0;
                info!("starting from scratch");
            }
        }
        Ok(())
    }

    fn train_state(&self, iteration: u64) -> TrainState {
        TrainState {
            run_id: self.run_id.clone(),
            iteration,
            samples_seen: self.samples_seen,
            bytes_read: self.bytes_read,
        }
    }

    /// Run the loop from the resolved start iteration to SOLVER.MAX_ITER.
    pub async fn train(&mut self) -> Result<Metrics> {
        let max_iter = self.cfg.solver.max_iter;
        if self.start_iter >= max_iter {
            info!(
                start_iter = self.start_iter,
                max_iter, "nothing to do, training already complete"
            );
            return Ok(self.metrics.clone());
        }

        let compute_time = self.cfg.solver.computation_time;
        let dataset_len = (self.loader.dataset().len() as u64).max(1);
        let batch_size = self.cfg.solver.ims_per_batch.max(1) as u64;
        let mut epoch = self.samples_seen / dataset_len;
        // Batches already consumed from the in-progress epoch. A resumed
        // run skips them so its sample schedule matches an uninterrupted
        // one; mid-epoch batches are always full, so the division is exact.
        let mut skip_batches = ((self.samples_seen % dataset_len) / batch_size) as usize;
        let mut iteration = self.start_iter;
        let run_start = Instant::now();
        info!(
            start_iter = iteration,
            max_iter, epoch, run_id = self.run_id.as_str(), "training started"
        );

        'train: loop {
            let stream = self.loader.stream_from(epoch, skip_batches);
            futures::pin_mut!(stream);
            let mut fetch_start = Instant::now();

            while let Some(batch) = stream.next().await {
                let batch = batch.context("Failed to load training batch")?;
                let data_time = fetch_start.elapsed();

                // Forward/backward stand-in.
                if compute_time > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(compute_time)).await;
                }

                iteration += 1;
                self.samples_seen += batch.len() as u64;
                self.bytes_read += batch.total_bytes();
                self.metrics.record_iteration(
                    data_time,
                    fetch_start.elapsed(),
                    batch.len() as u64,
                    batch.total_bytes(),
                );

                let state = self.train_state(iteration);
                self.hooks.after_step(&state).await?;

                if iteration % LOG_PERIOD == 0 {
                    info!(
                        iteration,
                        max_iter,
                        epoch,
                        samples = self.samples_seen,
                        data_time = ?data_time,
                        "train step"
                    );
                }
                if iteration >= max_iter {
                    break 'train;
                }
                fetch_start = Instant::now();
            }

            let state = self.train_state(iteration);
            self.hooks.after_epoch(epoch, &state).await?;
            epoch += 1;
            skip_batches = 0;
        }

        let state = self.train_state(iteration);
        self.hooks.finalize(&state).await?;
        self.metrics.record_total_time(run_start.elapsed());
        self.metrics.log_summary("train");
        info!(iteration, "✅ training completed");
        Ok(self.metrics.clone())
    }
}
