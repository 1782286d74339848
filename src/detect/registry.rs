use std::collections::BTreeMap;

use anyhow::{anyhow, Result};

use super::backend::{Detector, ImageFrame};
use crate::{CoordinateSpace, Detection};

/// Named detectors with one active selection. Acts as a [`Detector`] itself by
/// delegating to the active entry.
#[derive(Default)]
pub struct DetectorRegistry {
    detectors: BTreeMap<&'static str, Box<dyn Detector>>,
    active: Option<&'static str>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first detector registered becomes active. Re-registering a name replaces it.
    pub fn register<D: Detector + 'static>(&mut self, detector: D) {
        let name = detector.name();
        if self.active.is_none() {
            self.active = Some(name);
        }
        self.detectors.insert(name, Box::new(detector));
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        let (key, _) = self
            .detectors
            .get_key_value(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))?;
        self.active = Some(*key);
        Ok(())
    }

    pub fn default_name(&self) -> Option<&str> {
        self.active
    }

    pub fn list(&self) -> Vec<String> {
        self.detectors.keys().map(|name| name.to_string()).collect()
    }

    pub fn warm_up_all(&mut self) -> Result<()> {
        for (name, detector) in self.detectors.iter_mut() {
            detector
                .warm_up()
                .map_err(|e| anyhow!("detector '{}' warm-up failed: {}", name, e))?;
        }
        Ok(())
    }

    fn active_mut(&mut self) -> Result<&mut Box<dyn Detector>> {
        let name = self.active.ok_or_else(|| anyhow!("no detector registered"))?;
        self.detectors
            .get_mut(name)
            .ok_or_else(|| anyhow!("detector '{}' not registered", name))
    }
}

impl Detector for DetectorRegistry {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn coordinate_space(&self) -> CoordinateSpace {
        self.active
            .and_then(|name| self.detectors.get(name))
            .map(|d| d.coordinate_space())
            .unwrap_or_default()
    }

    fn detect(&mut self, frame: &ImageFrame) -> Result<Vec<Detection>> {
        self.active_mut()?.detect(frame)
    }
}
