//! COCO-format dataset handling for vitdet ─ annotation parsing and batch loading.

pub mod coco;
pub mod loader;

pub use coco::{CocoAnnotation, CocoCategory, CocoDataset, CocoImage, DetectionDataset, GtBox, Sample};
pub use loader::{Batch, BatchLoader, LoadedSample, LoaderConfig};
