// crates/data/src/coco.rs
//
// COCO instances schema and the join against an image directory.
//
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A parsed COCO-format annotation file (instances schema).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoDataset {
    #[serde(default)]
    pub images: Vec<CocoImage>,
    #[serde(default)]
    pub annotations: Vec<CocoAnnotation>,
    #[serde(default)]
    pub categories: Vec<CocoCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoImage {
    pub id: u64,
    pub file_name: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoAnnotation {
    pub id: u64,
    pub image_id: u64,
    pub category_id: u64,
    /// `[x, y, width, height]` in absolute pixels.
    pub bbox: [f64; 4],
    #[serde(default)]
    pub area: f64,
    #[serde(default)]
    pub iscrowd: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CocoCategory {
    pub id: u64,
    pub name: String,
}

impl CocoDataset {
    /// Parse a COCO annotation file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read annotation file {:?}", path))?;
        serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse COCO annotations from {:?}", path))
    }
}

/// One ground-truth box attached to a sample.
#[derive(Debug, Clone)]
pub struct GtBox {
    pub category_id: u64,
    pub bbox: [f64; 4],
    pub iscrowd: bool,
}

/// One image with its ground-truth boxes, ready for loading.
#[derive(Debug, Clone)]
pub struct Sample {
    pub image_id: u64,
    pub image_path: PathBuf,
    pub boxes: Vec<GtBox>,
}

/// A detection dataset: COCO annotations joined against an image directory.
///
/// The join is eager and validated once; every annotation must reference a
/// known image id, and every sample path is rooted under `image_root`.
#[derive(Debug, Clone)]
pub struct DetectionDataset {
    samples: Vec<Sample>,
    categories: Vec<CocoCategory>,
    num_annotations: usize,
}

impl DetectionDataset {
    /// Join an annotation file against an image directory.
    pub fn load(annotation_json: &Path, image_root: &Path) -> Result<Self> {
        let coco = CocoDataset::from_file(annotation_json)?;
        Self::from_coco(coco, image_root)
    }

    pub fn from_coco(coco: CocoDataset, image_root: &Path) -> Result<Self> {
        let num_annotations = coco.annotations.len();

        let mut by_image: BTreeMap<u64, Vec<GtBox>> = BTreeMap::new();
        for img in &coco.images {
            by_image.insert(img.id, Vec::new());
        }
        for ann in &coco.annotations {
            let boxes = by_image.get_mut(&ann.image_id).with_context(|| {
                format!(
                    "Annotation {} references unknown image id {}",
                    ann.id, ann.image_id
                )
            })?;
            boxes.push(GtBox {
                category_id: ann.category_id,
                bbox: ann.bbox,
                iscrowd: ann.iscrowd != 0,
            });
        }

        let samples = coco
            .images
            .iter()
            .map(|img| Sample {
                image_id: img.id,
                image_path: image_root.join(&img.file_name),
                boxes: by_image.remove(&img.id).unwrap_or_default(),
            })
            .collect();

        Ok(Self {
            samples,
            categories: coco.categories,
            num_annotations,
        })
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn categories(&self) -> &[CocoCategory] {
        &self.categories
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_annotations(&self) -> usize {
        self.num_annotations
    }

    /// Mean ground-truth boxes per image.
    pub fn boxes_per_image(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.num_annotations as f64 / self.samples.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_coco() -> CocoDataset {
        serde_json::from_str(
            r#"{
                "images": [
                    {"id": 1, "file_name": "a.jpg", "width": 640, "height": 480},
                    {"id": 2, "file_name": "b.jpg", "width": 640, "height": 480}
                ],
                "annotations": [
                    {"id": 10, "image_id": 1, "category_id": 1, "bbox": [0, 0, 10, 10], "area": 100, "iscrowd": 0},
                    {"id": 11, "image_id": 1, "category_id": 2, "bbox": [5, 5, 20, 20], "area": 400, "iscrowd": 0},
                    {"id": 12, "image_id": 2, "category_id": 1, "bbox": [1, 1, 2, 2], "area": 4, "iscrowd": 1}
                ],
                "categories": [
                    {"id": 1, "name": "text"},
                    {"id": 2, "name": "figure"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_join_groups_boxes_by_image() {
        let ds = DetectionDataset::from_coco(tiny_coco(), Path::new("/data/images")).unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.num_annotations(), 3);
        assert_eq!(ds.samples()[0].boxes.len(), 2);
        assert_eq!(ds.samples()[1].boxes.len(), 1);
        assert!(ds.samples()[1].boxes[0].iscrowd);
        assert_eq!(ds.samples()[0].image_path, Path::new("/data/images/a.jpg"));
        assert!((ds.boxes_per_image() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_dangling_image_id_is_an_error() {
        let mut coco = tiny_coco();
        coco.annotations.push(CocoAnnotation {
            id: 99,
            image_id: 777,
            category_id: 1,
            bbox: [0.0, 0.0, 1.0, 1.0],
            area: 1.0,
            iscrowd: 0,
        });
        let err = DetectionDataset::from_coco(coco, Path::new("/x")).unwrap_err();
        assert!(err.to_string().contains("unknown image id 777"));
    }

    #[test]
    fn test_missing_annotation_file() {
        let err = CocoDataset::from_file("/nonexistent/instances.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read annotation file"));
    }
}
