// crates/core/src/evaluation.rs
//
// Evaluation-only path: resolve weights, then drive the data pipeline over
// the validation dataset and report a metric → score mapping. The mAP
// evaluator proper is an external collaborator; the metrics here cover the
// dataset and the pipeline feeding it.
//
use anyhow::{Context, Result};
use futures::StreamExt;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::checkpoint::Checkpointer;
use crate::config::DetConfig;
use crate::registry::DatasetRegistry;
use vitdet_data::{BatchLoader, DetectionDataset, LoaderConfig};

/// Metric name → score, ordered for stable reporting.
pub type EvalResults = BTreeMap<String, f64>;

pub struct Evaluator {
    cfg: DetConfig,
    dataset: Arc<DetectionDataset>,
    loader: BatchLoader,
    checkpointer: Checkpointer,
}

impl Evaluator {
    pub fn new(cfg: &DetConfig, registry: &DatasetRegistry) -> Result<Self> {
        let name = cfg
            .datasets
            .test
            .first()
            .context("DATASETS.TEST names no dataset")?;
        let record = registry.get(name)?;
        let dataset = Arc::new(DetectionDataset::load(
            &record.annotation_json,
            &record.image_root,
        )?);
        info!(
            dataset = name.as_str(),
            images = dataset.len(),
            annotations = dataset.num_annotations(),
            "validation dataset loaded"
        );

        // Evaluation order is fixed regardless of DATALOADER.SHUFFLE.
        let loader = BatchLoader::new(
            Arc::clone(&dataset),
            LoaderConfig {
                batch_size: cfg.solver.ims_per_batch,
                shuffle: false,
                seed: cfg.seed,
                read_concurrency: cfg.dataloader.num_workers.max(1),
            },
        );

        Ok(Self {
            cfg: cfg.clone(),
            dataset,
            loader,
            checkpointer: Checkpointer::from_config(cfg),
        })
    }

    /// Load weights (explicit path first, latest checkpoint when resuming,
    /// else a missing-weights error) and run one pass over the dataset.
    pub async fn run(&self, resume: bool) -> Result<EvalResults> {
        let weights = self.cfg.weights().map(PathBuf::from);
        let (from, state) = self.checkpointer.load_for_eval(weights.as_deref(), resume)?;
        info!(loaded_from = ?from, iteration = state.iteration, "evaluation weights loaded");

        let start = Instant::now();
        let mut samples = 0u64;
        let mut bytes_read = 0u64;

        let stream = self.loader.stream(0);
        futures::pin_mut!(stream);
        while let Some(batch) = stream.next().await {
            let batch = batch.context("Failed to load evaluation batch")?;
            samples += batch.len() as u64;
            bytes_read += batch.total_bytes();
        }
        let elapsed = start.elapsed().as_secs_f64();

        let mut results = EvalResults::new();
        results.insert("images".to_string(), self.dataset.len() as f64);
        results.insert(
            "annotations".to_string(),
            self.dataset.num_annotations() as f64,
        );
        results.insert(
            "categories".to_string(),
            self.dataset.categories().len() as f64,
        );
        results.insert("boxes_per_image".to_string(), self.dataset.boxes_per_image());
        results.insert("bytes_read".to_string(), bytes_read as f64);
        results.insert(
            "samples_per_sec".to_string(),
            if elapsed > 0.0 {
                samples as f64 / elapsed
            } else {
                0.0
            },
        );
        results.insert(
            "checkpoint_iteration".to_string(),
            state.iteration as f64,
        );

        for (metric, score) in &results {
            info!(metric = metric.as_str(), score, "eval result");
        }
        info!("✅ evaluation completed");
        Ok(results)
    }
}
