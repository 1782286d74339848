//! Rider Safety Enforcement Core
//!
//! This crate turns per-frame object detections into adjudicated traffic violations and
//! delivers owner notices for them.
//!
//! # Architecture
//!
//! Frames flow through a fixed pipeline:
//!
//! 1. **Detector** (external capability): image to raw detections.
//! 2. **Suppressor**: per-class non-maximum suppression over raw detections.
//! 3. **Rules**: pluggable violation rules (no helmet, triple riding, missing plate).
//! 4. **Ledger**: violations are recorded before any notice is sent.
//! 5. **Dispatcher**: bounded, retrying notice delivery through a `Transport`.
//!
//! # Module Structure
//!
//! - `detect`: Detector capability, backends, registry
//! - `suppress`: non-maximum suppression
//! - `rules`: association rules and the rule set
//! - `notify`: job state machine, dispatcher worker, notice templates
//! - `transport`: Transport capability and implementations
//! - `storage`: Ledger, owner registry and job archive (SQLite + in-memory)
//! - `pipeline`: the `Enforcer` that wires everything together
//! - Core types: BoundingBox, Detection, Violation

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod rules;
pub mod storage;
pub mod suppress;
pub mod transport;

pub use detect::{Detector, DetectorRegistry, ImageFrame, ReplayDetector, ScriptedDetector};
pub use error::{EnqueueError, TransportError, ValidationError};
pub use notify::{
    BatchOutcome, Clock, DeliveryReport, DispatchConfig, DispatchStats, Dispatcher, FineReceipt,
    JobId, JobStatus, NotificationJob, NotificationKind, NoticeSettings, Payload, PendingJob,
    SystemClock,
};
pub use pipeline::{Enforcer, FrameReport, PipelineSettings, SettleSummary};
pub use rules::{evaluate, AssociationRules, RuleSet, ViolationRule};
pub use storage::{
    DeadLetter, EnforcementStore, InMemoryLedger, JobArchive, Ledger, OwnerRegistry,
    SqliteLedger, StoredViolation, VehicleOwner, ViolationId,
};
pub use suppress::{iou, suppress};
pub use transport::{build_transport, LogTransport, Transport, TransportKind};

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:rider_enforcement_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- Geometry --------------------

/// Unit of bounding box coordinates. Fixed per detector instance, never mixed in one run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSpace {
    /// 0..1 relative to frame width/height
    Normalized,
    #[default]
    Pixels,
}

/// Axis-aligned box anchored at its top-left corner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn area(&self) -> f32 {
        if self.width <= 0.0 || self.height <= 0.0 {
            return 0.0;
        }
        self.width * self.height
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    /// Area shared with `other`; zero when the boxes do not overlap.
    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    pub fn contains_point(&self, (px, py): (f32, f32)) -> bool {
        px >= self.x && px <= self.x + self.width && py >= self.y && py <= self.y + self.height
    }

    /// Euclidean distance between the two box centers.
    pub fn center_distance(&self, other: &BoundingBox) -> f32 {
        let (ax, ay) = self.center();
        let (bx, by) = other.center();
        ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt()
    }
}

// -------------------- Detections --------------------

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ObjectClass {
    Rider,
    Helmet,
    Motorcycle,
    LicensePlate,
    Other(String),
}

impl ObjectClass {
    /// Map a detector label onto a class. Unknown labels are carried as `Other`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "rider" | "person" | "no_helmet" => ObjectClass::Rider,
            "helmet" => ObjectClass::Helmet,
            "motorcycle" | "motorbike" => ObjectClass::Motorcycle,
            "license_plate" | "plate" => ObjectClass::LicensePlate,
            other => ObjectClass::Other(other.to_string()),
        }
    }
}

impl From<String> for ObjectClass {
    fn from(label: String) -> Self {
        ObjectClass::from_label(&label)
    }
}

impl From<ObjectClass> for String {
    fn from(class: ObjectClass) -> Self {
        class.to_string()
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectClass::Rider => f.write_str("rider"),
            ObjectClass::Helmet => f.write_str("helmet"),
            ObjectClass::Motorcycle => f.write_str("motorcycle"),
            ObjectClass::LicensePlate => f.write_str("license_plate"),
            ObjectClass::Other(label) => f.write_str(label),
        }
    }
}

/// A single detector output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: ObjectClass,
    /// 0..=1
    pub confidence: f32,
    /// Plate text read upstream (OCR is not part of this crate). Only meaningful for plates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plate_text: Option<String>,
}

impl Detection {
    pub fn new(class: ObjectClass, bbox: BoundingBox, confidence: f32) -> Self {
        Self {
            bbox,
            class,
            confidence,
            plate_text: None,
        }
    }

    pub fn with_plate_text(mut self, text: impl Into<String>) -> Self {
        self.plate_text = Some(text.into());
        self
    }

    /// Reject non-finite geometry, negative sizes and out-of-range confidence.
    pub fn validate(&self, index: usize) -> std::result::Result<(), ValidationError> {
        if !self.bbox.is_finite() {
            return Err(ValidationError::new(
                index,
                &self.class,
                "bounding box has non-finite coordinates",
            ));
        }
        if self.bbox.width < 0.0 || self.bbox.height < 0.0 {
            return Err(ValidationError::new(
                index,
                &self.class,
                "bounding box has negative size",
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(ValidationError::new(
                index,
                &self.class,
                format!("confidence {} outside 0..=1", self.confidence),
            ));
        }
        Ok(())
    }
}

/// Validate a whole detection list, failing on the first offending entry.
pub fn validate_detections(detections: &[Detection]) -> std::result::Result<(), ValidationError> {
    detections
        .iter()
        .enumerate()
        .try_for_each(|(index, det)| det.validate(index))
}

// -------------------- Violation Catalog --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    NoHelmet,
    TripleRiding,
    NoLicensePlate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Medium,
    High,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 3] = [
        ViolationKind::NoHelmet,
        ViolationKind::TripleRiding,
        ViolationKind::NoLicensePlate,
    ];

    pub fn code(self) -> &'static str {
        match self {
            ViolationKind::NoHelmet => "VIO001",
            ViolationKind::TripleRiding => "VIO002",
            ViolationKind::NoLicensePlate => "VIO003",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ViolationKind::NoHelmet => "Riding without helmet",
            ViolationKind::TripleRiding => "Triple riding on motorcycle",
            ViolationKind::NoLicensePlate => "Missing or unreadable license plate",
        }
    }

    /// Fine in cents.
    pub fn fine_amount_cents(self) -> u64 {
        match self {
            ViolationKind::NoHelmet => 10_000,
            ViolationKind::TripleRiding => 15_000,
            ViolationKind::NoLicensePlate => 20_000,
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ViolationKind::TripleRiding => Severity::Medium,
            _ => Severity::High,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::NoHelmet => "NO_HELMET",
            ViolationKind::TripleRiding => "TRIPLE_RIDING",
            ViolationKind::NoLicensePlate => "NO_LICENSE_PLATE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Medium => "medium",
            Severity::High => "high",
        })
    }
}

// -------------------- Violations --------------------

/// An adjudicated violation. A fact, not a workflow object: fields are read-only.
///
/// ```compile_fail
/// use rider_enforcement::{BoundingBox, Detection, ObjectClass, Violation, ViolationKind};
/// let rider = Detection::new(ObjectClass::Rider, BoundingBox::new(0.0, 0.0, 10.0, 10.0), 0.9);
/// let mut v = Violation::from_detection(ViolationKind::NoHelmet, &rider, 0);
/// v.confidence = 0.1;
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    kind: ViolationKind,
    confidence: f32,
    bbox: BoundingBox,
    source_detection: Detection,
    license_plate: Option<String>,
    created_at: u64,
}

impl Violation {
    /// Build a violation from the detection that triggered it.
    pub fn from_detection(kind: ViolationKind, source: &Detection, created_at: u64) -> Self {
        Self {
            kind,
            confidence: source.confidence,
            bbox: source.bbox,
            source_detection: source.clone(),
            license_plate: None,
            created_at,
        }
    }

    pub(crate) fn with_license_plate(mut self, plate: Option<String>) -> Self {
        self.license_plate = plate;
        self
    }

    pub fn kind(&self) -> ViolationKind {
        self.kind
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn bbox(&self) -> BoundingBox {
        self.bbox
    }

    pub fn source_detection(&self) -> &Detection {
        &self.source_detection
    }

    pub fn license_plate(&self) -> Option<&str> {
        self.license_plate.as_deref()
    }

    /// Seconds since epoch.
    pub fn created_at(&self) -> u64 {
        self.created_at
    }
}
