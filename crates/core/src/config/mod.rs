// crates/core/src/config/mod.rs
pub mod builder;
pub mod det_config;

pub use builder::ConfigBuilder;
pub use det_config::{
    DataLoaderCfg, DatasetsCfg, DetConfig, ModelCfg, SolverCfg, TestCfg, VitCfg,
};
