//! Core library for vitdet ─ config composition, dataset registry, checkpoint
//! resume and the train/eval dispatch that drives the detector workload.

pub mod checkpoint;
pub mod config;
pub mod evaluation;
pub mod hooks;
pub mod launch;
pub mod metrics;
pub mod registry;
pub mod trainer;

pub use checkpoint::{Checkpointer, CheckpointState, LoadedFrom};
pub use config::{ConfigBuilder, DetConfig};
pub use evaluation::Evaluator;
pub use launch::{launch, LaunchConfig, WorkerContext};
pub use metrics::Metrics;
pub use registry::{DatasetRecord, DatasetRegistry};
pub use trainer::Trainer;
