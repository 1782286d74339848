use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::detect::backend::{Detector, ImageFrame};
use crate::{CoordinateSpace, Detection};

#[derive(Debug, Deserialize)]
struct ReplayFile {
    #[serde(default)]
    coordinate_space: CoordinateSpace,
    frames: Vec<ReplayFrame>,
}

#[derive(Debug, Deserialize)]
struct ReplayFrame {
    index: u64,
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Replays detections recorded by an upstream detector, keyed by frame index.
///
/// ```json
/// {
///   "coordinate_space": "pixels",
///   "frames": [
///     { "index": 0, "detections": [
///       { "class": "rider", "confidence": 0.91,
///         "bbox": { "x": 90.0, "y": 40.0, "width": 40.0, "height": 80.0 } }
///     ] }
///   ]
/// }
/// ```
pub struct ReplayDetector {
    space: CoordinateSpace,
    frames: BTreeMap<u64, Vec<Detection>>,
}

impl ReplayDetector {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read replay file {}: {}", path.display(), e))?;
        Self::from_json(&raw).map_err(|e| anyhow!("invalid replay file {}: {}", path.display(), e))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: ReplayFile = serde_json::from_str(raw)?;
        let mut frames = BTreeMap::new();
        for frame in file.frames {
            if frames.insert(frame.index, frame.detections).is_some() {
                return Err(anyhow!("frame {} listed twice", frame.index));
            }
        }
        Ok(Self {
            space: file.coordinate_space,
            frames,
        })
    }

    /// Recorded frame indices in ascending order.
    pub fn frame_indices(&self) -> Vec<u64> {
        self.frames.keys().copied().collect()
    }
}

impl Detector for ReplayDetector {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn coordinate_space(&self) -> CoordinateSpace {
        self.space
    }

    fn detect(&mut self, frame: &ImageFrame) -> Result<Vec<Detection>> {
        Ok(self.frames.get(&frame.index).cloned().unwrap_or_default())
    }
}
