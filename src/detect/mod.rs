mod backend;
mod backends;
mod registry;

pub use backend::{Detector, ImageFrame};
pub use backends::{ReplayDetector, ScriptedDetector};
pub use registry::DetectorRegistry;
