pub mod replay;
pub mod stub;

pub use replay::ReplayDetector;
pub use stub::ScriptedDetector;
