// crates/data/src/loader.rs
//
// Async batch loader over a DetectionDataset.
//
use anyhow::{Context, Result};
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::coco::DetectionDataset;

/// Loader knobs, filled in from the driver's DATALOADER config section.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
    /// Concurrent image reads per batch.
    pub read_concurrency: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            seed: 0,
            read_concurrency: num_cpus::get(),
        }
    }
}

/// One loaded image plus what the metrics layer needs to know about it.
#[derive(Debug, Clone)]
pub struct LoadedSample {
    pub image_id: u64,
    pub data: Bytes,
    pub num_boxes: usize,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub samples: Vec<LoadedSample>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.samples.iter().map(|s| s.data.len() as u64).sum()
    }
}

/// Streams batches of image bytes from a detection dataset.
///
/// Each epoch gets its own shuffle order (seed + epoch), so a resumed run
/// that replays the same epoch sees the same order.
#[derive(Debug)]
pub struct BatchLoader {
    dataset: Arc<DetectionDataset>,
    cfg: LoaderConfig,
}

impl BatchLoader {
    pub fn new(dataset: Arc<DetectionDataset>, cfg: LoaderConfig) -> Self {
        Self { dataset, cfg }
    }

    pub fn dataset(&self) -> &DetectionDataset {
        &self.dataset
    }

    /// Index order for one epoch.
    fn epoch_order(&self, epoch: u64) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.cfg.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.cfg.seed.wrapping_add(epoch));
            indices.shuffle(&mut rng);
        }
        indices
    }

    /// Stream the batches of one epoch.
    pub fn stream(&self, epoch: u64) -> impl Stream<Item = Result<Batch>> + '_ {
        self.stream_from(epoch, 0)
    }

    /// Stream one epoch starting after `skip_batches` already-consumed
    /// batches, so a resumed run re-joins the epoch order where it left off.
    pub fn stream_from(
        &self,
        epoch: u64,
        skip_batches: usize,
    ) -> impl Stream<Item = Result<Batch>> + '_ {
        let order = self.epoch_order(epoch);
        let batch_size = self.cfg.batch_size.max(1);
        let semaphore = Arc::new(Semaphore::new(self.cfg.read_concurrency.max(1)));

        try_stream! {
            debug!(epoch, samples = order.len(), batch_size, skip_batches, "starting epoch stream");
            for chunk in order.chunks(batch_size).skip(skip_batches) {
                let mut reads = Vec::with_capacity(chunk.len());
                for &idx in chunk {
                    let sample = self.dataset.samples()[idx].clone();
                    let semaphore = Arc::clone(&semaphore);
                    reads.push(tokio::spawn(async move {
                        let _permit = semaphore
                            .acquire()
                            .await
                            .context("Image read limiter closed")?;
                        let data = tokio::fs::read(&sample.image_path)
                            .await
                            .with_context(|| {
                                format!("Failed to read image {:?}", sample.image_path)
                            })?;
                        Ok::<LoadedSample, anyhow::Error>(LoadedSample {
                            image_id: sample.image_id,
                            data: Bytes::from(data),
                            num_boxes: sample.boxes.len(),
                        })
                    }));
                }

                let mut samples = Vec::with_capacity(reads.len());
                for handle in reads {
                    let loaded = handle.await.context("Image read task panicked")??;
                    samples.push(loaded);
                }
                yield Batch { samples };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coco::CocoDataset;
    use futures::StreamExt;
    use std::path::Path;

    fn fixture(dir: &Path, images: usize) -> Arc<DetectionDataset> {
        let mut imgs = Vec::new();
        for i in 0..images {
            let name = format!("img_{i}.jpg");
            std::fs::write(dir.join(&name), vec![i as u8; 16 + i]).unwrap();
            imgs.push(serde_json::json!({
                "id": i as u64 + 1,
                "file_name": name,
                "width": 4,
                "height": 4
            }));
        }
        let coco: CocoDataset = serde_json::from_value(serde_json::json!({
            "images": imgs,
            "annotations": [
                {"id": 1, "image_id": 1, "category_id": 1, "bbox": [0, 0, 1, 1]}
            ],
            "categories": [{"id": 1, "name": "thing"}]
        }))
        .unwrap();
        Arc::new(DetectionDataset::from_coco(coco, dir).unwrap())
    }

    #[tokio::test]
    async fn test_stream_covers_every_sample_once() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = fixture(dir.path(), 5);
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: 2,
                shuffle: false,
                ..Default::default()
            },
        );

        let stream = loader.stream(0);
        futures::pin_mut!(stream);
        let mut seen = Vec::new();
        while let Some(batch) = stream.next().await {
            let batch = batch.unwrap();
            assert!(batch.len() <= 2);
            assert!(batch.total_bytes() > 0);
            seen.extend(batch.samples.iter().map(|s| s.image_id));
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_stream_from_skips_consumed_batches() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = fixture(dir.path(), 5);
        let loader = BatchLoader::new(
            dataset,
            LoaderConfig {
                batch_size: 2,
                shuffle: false,
                ..Default::default()
            },
        );

        let stream = loader.stream_from(0, 1);
        futures::pin_mut!(stream);
        let mut seen = Vec::new();
        while let Some(batch) = stream.next().await {
            seen.extend(batch.unwrap().samples.iter().map(|s| s.image_id));
        }
        // First batch [1, 2] was consumed before the resume point.
        assert_eq!(seen, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_shuffle_is_deterministic_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = fixture(dir.path(), 8);
        let cfg = LoaderConfig {
            batch_size: 8,
            shuffle: true,
            seed: 7,
            ..Default::default()
        };
        let loader = BatchLoader::new(dataset, cfg);

        let a = loader.epoch_order(3);
        let b = loader.epoch_order(3);
        let c = loader.epoch_order(4);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn test_missing_image_file_fails_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = fixture(dir.path(), 2);
        std::fs::remove_file(dir.path().join("img_1.jpg")).unwrap();

        let loader = BatchLoader::new(dataset, LoaderConfig::default());
        let stream = loader.stream(0);
        futures::pin_mut!(stream);

        let mut failed = false;
        while let Some(batch) = stream.next().await {
            if let Err(e) = batch {
                assert!(e.to_string().contains("Failed to read image"));
                failed = true;
                break;
            }
        }
        assert!(failed);
    }
}
