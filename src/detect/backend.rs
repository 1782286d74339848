use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::{CoordinateSpace, Detection};

/// One decoded frame handed to a detector.
///
/// Decoding and capture live outside this crate; the core only passes frames through.
#[derive(Clone, Debug, Default)]
pub struct ImageFrame {
    /// Monotonic position in the source stream.
    pub index: u64,
    pub width: u32,
    pub height: u32,
    pixels: Vec<u8>,
    evidence: Option<PathBuf>,
}

impl ImageFrame {
    pub fn new(index: u64, width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self {
            index,
            width,
            height,
            pixels,
            evidence: None,
        }
    }

    /// Where the source image is kept, if anywhere. Attached to violation notices.
    pub fn with_evidence(mut self, path: impl Into<PathBuf>) -> Self {
        self.evidence = Some(path.into());
        self
    }

    pub fn evidence(&self) -> Option<&Path> {
        self.evidence.as_deref()
    }

    /// A frame with dimensions but no pixel payload (replay and scripted backends).
    pub fn blank(index: u64, width: u32, height: u32) -> Self {
        Self::new(index, width, height, Vec::new())
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// Detector capability.
///
/// Implementations must:
/// - Return confidences in 0..=1
/// - Report boxes in the single coordinate space returned by `coordinate_space`
/// - Return an empty list (not an error) for frames with nothing in them
///
/// An `Err` means the detector failed; callers skip the frame and carry on.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn coordinate_space(&self) -> CoordinateSpace;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &ImageFrame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
