use anyhow::{anyhow, Result};
use std::collections::VecDeque;

use crate::detect::backend::{Detector, ImageFrame};
use crate::{CoordinateSpace, Detection};

/// Scripted backend for testing. Each `detect` call pops the next scripted outcome;
/// once the script runs out every frame is empty.
pub struct ScriptedDetector {
    space: CoordinateSpace,
    script: VecDeque<std::result::Result<Vec<Detection>, String>>,
    calls: u64,
}

impl ScriptedDetector {
    pub fn new(space: CoordinateSpace) -> Self {
        Self {
            space,
            script: VecDeque::new(),
            calls: 0,
        }
    }

    pub fn then_detections(mut self, detections: Vec<Detection>) -> Self {
        self.script.push_back(Ok(detections));
        self
    }

    pub fn then_failure(mut self, message: &str) -> Self {
        self.script.push_back(Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for ScriptedDetector {
    fn default() -> Self {
        Self::new(CoordinateSpace::Pixels)
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn coordinate_space(&self) -> CoordinateSpace {
        self.space
    }

    fn detect(&mut self, frame: &ImageFrame) -> Result<Vec<Detection>> {
        self.calls += 1;
        match self.script.pop_front() {
            Some(Ok(detections)) => Ok(detections),
            Some(Err(message)) => Err(anyhow!(
                "scripted failure on frame {}: {}",
                frame.index,
                message
            )),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BoundingBox, ObjectClass};

    #[test]
    fn scripted_detector_replays_in_order() {
        let rider = Detection::new(ObjectClass::Rider, BoundingBox::new(0.0, 0.0, 4.0, 4.0), 0.9);
        let mut detector = ScriptedDetector::default()
            .then_detections(vec![rider.clone()])
            .then_failure("lens covered");
        let frame = ImageFrame::blank(0, 640, 480);

        assert_eq!(detector.detect(&frame).unwrap(), vec![rider]);
        assert!(detector.detect(&frame).is_err());
        assert!(detector.detect(&frame).unwrap().is_empty());
        assert_eq!(detector.calls(), 3);
    }
}
