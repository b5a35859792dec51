// crates/core/src/config/det_config.rs
//
// The frozen detector configuration. Built once by ConfigBuilder, then
// read-only for the rest of the process.
//
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Hierarchical detector configuration.
///
/// YAML keys use the upper-case convention of detection config files
/// (`MODEL`, `SOLVER.BASE_LR`, ...). There is no mutation API: a value of
/// this type only exists as the output of [`ConfigBuilder::freeze`]
/// (crate::ConfigBuilder::freeze), which is what makes the frozen-snapshot
/// contract hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct DetConfig {
    pub model: ModelCfg,
    pub datasets: DatasetsCfg,
    pub dataloader: DataLoaderCfg,
    pub solver: SolverCfg,
    pub test: TestCfg,
    pub output_dir: String,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct ModelCfg {
    pub device: String,
    /// Path to initial weights (a prior checkpoint). Empty string means none.
    pub weights: String,
    pub num_classes: u32,
    pub vit: VitCfg,
}

/// ViT backbone shape. Zeroed in the global defaults; the model-family
/// defaults layer fills these in before the config file is merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct VitCfg {
    pub name: String,
    pub patch_size: u32,
    pub embed_dim: u32,
    pub depth: u32,
    pub num_heads: u32,
    pub drop_path_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct DatasetsCfg {
    pub train: Vec<String>,
    pub test: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct DataLoaderCfg {
    pub num_workers: usize,
    pub shuffle: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct SolverCfg {
    pub base_lr: f64,
    pub max_iter: u64,
    pub ims_per_batch: usize,
    pub checkpoint_period: u64,
    pub checkpoint_compression: bool,
    /// Simulated per-iteration compute time in seconds; the real forward and
    /// backward passes are an external collaborator.
    pub computation_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", deny_unknown_fields, default)]
pub struct TestCfg {
    pub eval_period: u64,
}

impl Default for DetConfig {
    fn default() -> Self {
        Self {
            model: ModelCfg::default(),
            datasets: DatasetsCfg::default(),
            dataloader: DataLoaderCfg::default(),
            solver: SolverCfg::default(),
            test: TestCfg::default(),
            output_dir: "./output".to_string(),
            seed: 42,
        }
    }
}

impl Default for ModelCfg {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            weights: String::new(),
            num_classes: 80,
            vit: VitCfg::default(),
        }
    }
}

impl Default for VitCfg {
    fn default() -> Self {
        Self {
            name: String::new(),
            patch_size: 0,
            embed_dim: 0,
            depth: 0,
            num_heads: 0,
            drop_path_rate: 0.0,
        }
    }
}

impl Default for DatasetsCfg {
    fn default() -> Self {
        Self {
            train: Vec::new(),
            test: Vec::new(),
        }
    }
}

impl Default for DataLoaderCfg {
    fn default() -> Self {
        Self {
            num_workers: 4,
            shuffle: true,
        }
    }
}

impl Default for SolverCfg {
    fn default() -> Self {
        Self {
            base_lr: 0.02,
            max_iter: 90_000,
            ims_per_batch: 16,
            checkpoint_period: 5_000,
            checkpoint_compression: false,
            computation_time: 0.0,
        }
    }
}

impl Default for TestCfg {
    fn default() -> Self {
        Self { eval_period: 5_000 }
    }
}

impl DetConfig {
    /// Initial weights path, if configured.
    pub fn weights(&self) -> Option<&str> {
        if self.model.weights.is_empty() {
            None
        } else {
            Some(&self.model.weights)
        }
    }

    /// Serialize the frozen config back to YAML (for the output-dir snapshot).
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| anyhow::anyhow!("Failed to serialize config: {}", e))
    }

    /// Invariants checked at freeze time.
    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(self.solver.max_iter > 0, "SOLVER.MAX_ITER must be positive");
        ensure!(
            self.solver.ims_per_batch > 0,
            "SOLVER.IMS_PER_BATCH must be positive"
        );
        ensure!(
            !self.datasets.train.is_empty(),
            "DATASETS.TRAIN must name at least one registered dataset"
        );
        ensure!(
            !self.datasets.test.is_empty(),
            "DATASETS.TEST must name at least one registered dataset"
        );
        ensure!(
            self.model.vit.embed_dim > 0 && self.model.vit.num_heads > 0,
            "MODEL.VIT is incomplete; model-family defaults were not applied"
        );
        ensure!(
            self.model.vit.embed_dim % self.model.vit.num_heads == 0,
            "MODEL.VIT.EMBED_DIM {} is not divisible by NUM_HEADS {}",
            self.model.vit.embed_dim,
            self.model.vit.num_heads
        );
        Ok(())
    }
}
