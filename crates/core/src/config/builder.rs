// crates/core/src/config/builder.rs
//
// Layered config composition: defaults < model-family defaults < file <
// dataset names < CLI overrides, then freeze. Last write wins at every layer.
//
use anyhow::{anyhow, bail, Context, Result};
use serde_yaml::{Mapping, Value};
use std::path::Path;

use super::det_config::DetConfig;

/// ViT model-family defaults, applied on top of the global defaults the way
/// a detection config stack layers architecture-specific keys before the
/// user's config file is read.
const VIT_DEFAULTS: &str = r#"
MODEL:
  VIT:
    NAME: vit_base_patch16
    PATCH_SIZE: 16
    EMBED_DIM: 768
    DEPTH: 12
    NUM_HEADS: 12
    DROP_PATH_RATE: 0.1
"#;

/// Ordered-patch builder producing a frozen [`DetConfig`].
///
/// The working document is a YAML tree; nothing is typed until
/// [`freeze`](Self::freeze), so later layers can override any earlier key.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    doc: Value,
}

impl ConfigBuilder {
    /// Start from the global defaults.
    pub fn defaults() -> Result<Self> {
        let doc = serde_yaml::to_value(DetConfig::default())
            .map_err(|e| anyhow!("Failed to build default config document: {}", e))?;
        Ok(Self { doc })
    }

    /// Apply the ViT model-family defaults.
    pub fn with_vit_defaults(mut self) -> Result<Self> {
        let patch: Value = serde_yaml::from_str(VIT_DEFAULTS)
            .map_err(|e| anyhow!("Invalid model-family defaults: {}", e))?;
        deep_merge(&mut self.doc, patch);
        Ok(self)
    }

    /// Merge a YAML config file on top of the current document.
    pub fn merge_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let patch: Value = serde_yaml::from_str(&text)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        if !matches!(patch, Value::Mapping(_)) {
            bail!("Config file {:?} is not a YAML mapping", path);
        }
        deep_merge(&mut self.doc, patch);
        Ok(self)
    }

    /// Pin the train/validation dataset names into the document.
    pub fn set_datasets(mut self, train: &str, test: &str) -> Self {
        set_path(
            &mut self.doc,
            "DATASETS.TRAIN",
            Value::Sequence(vec![Value::String(train.to_string())]),
        );
        set_path(
            &mut self.doc,
            "DATASETS.TEST",
            Value::Sequence(vec![Value::String(test.to_string())]),
        );
        self
    }

    /// Merge trailing CLI `KEY.PATH value` pairs, e.g.
    /// `["SOLVER.BASE_LR", "0.001", "MODEL.DEVICE", "cuda"]`.
    pub fn merge_overrides(mut self, opts: &[String]) -> Result<Self> {
        if opts.len() % 2 != 0 {
            bail!(
                "Config overrides must come in KEY VALUE pairs, got {} items: {:?}",
                opts.len(),
                opts
            );
        }
        for pair in opts.chunks(2) {
            let (key, raw) = (&pair[0], &pair[1]);
            let value: Value = serde_yaml::from_str(raw)
                .with_context(|| format!("Invalid override value {:?} for key {}", raw, key))?;
            set_path(&mut self.doc, key, value);
        }
        Ok(self)
    }

    /// Freeze: deserialize the merged document into the typed config and
    /// validate it. Unknown keys (including mistyped override paths) are
    /// rejected here.
    pub fn freeze(self) -> Result<DetConfig> {
        let cfg: DetConfig = serde_yaml::from_value(self.doc)
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Recursively merge `patch` into `base`; non-mapping values replace.
fn deep_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base_map), Value::Mapping(patch_map)) => {
            for (k, v) in patch_map {
                match base_map.get_mut(&k) {
                    Some(slot) => deep_merge(slot, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

/// Set a dotted path like `SOLVER.BASE_LR`, creating mappings as needed.
fn set_path(doc: &mut Value, dotted: &str, value: Value) {
    let mut node = doc;
    let mut segments = dotted.split('.').peekable();
    while let Some(seg) = segments.next() {
        let key = Value::String(seg.to_string());
        if !matches!(node, Value::Mapping(_)) {
            *node = Value::Mapping(Mapping::new());
        }
        let map = match node {
            Value::Mapping(m) => m,
            _ => unreachable!(),
        };
        if segments.peek().is_none() {
            map.insert(key, value);
            return;
        }
        node = map.entry(key).or_insert_with(|| Value::Mapping(Mapping::new()));
    }
}
