//! Violation rules over suppressed detections.
//!
//! Every rule shares one contract: detections plus [`AssociationRules`] in, violations out.
//! Rules never see each other's output, so new rules slot into a [`RuleSet`] without
//! touching existing ones.

mod license_plate;
mod no_helmet;
mod triple_riding;

use serde::{Deserialize, Serialize};
use crate::error::ValidationError;
use crate::{now_s, validate_detections, Detection, ObjectClass, Violation, ViolationKind};

pub use license_plate::NoLicensePlateRule;
pub use no_helmet::NoHelmetRule;
pub use triple_riding::TripleRidingRule;

const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_MAX_HELMET_DISTANCE: f32 = 50.0;
const DEFAULT_MAX_RIDERS_PER_MOTORCYCLE: usize = 2;
const DEFAULT_MAX_RIDER_DISTANCE: f32 = 150.0;

/// Thresholds shared by all rules. Distances are in the detector's coordinate space.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssociationRules {
    pub min_confidence: f32,
    /// A rider is compliant when a helmet center is strictly closer than this.
    pub max_helmet_distance: f32,
    pub max_riders_per_motorcycle: usize,
    /// How far a rider center may be from a motorcycle center to count as carried by it.
    pub max_rider_distance: f32,
}

impl Default for AssociationRules {
    fn default() -> Self {
        Self {
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            max_helmet_distance: DEFAULT_MAX_HELMET_DISTANCE,
            max_riders_per_motorcycle: DEFAULT_MAX_RIDERS_PER_MOTORCYCLE,
            max_rider_distance: DEFAULT_MAX_RIDER_DISTANCE,
        }
    }
}

/// A pluggable violation rule.
pub trait ViolationRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ViolationKind;

    /// Evaluate already validated detections. `observed_at` stamps every violation produced.
    fn evaluate(
        &self,
        detections: &[Detection],
        rules: &AssociationRules,
        observed_at: u64,
    ) -> Vec<Violation>;
}

/// Ordered collection of rules applied to one frame.
pub struct RuleSet {
    rules: Vec<Box<dyn ViolationRule>>,
}

impl RuleSet {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// No helmet, triple riding and missing plate, in that order.
    pub fn standard() -> Self {
        Self::empty()
            .with_rule(NoHelmetRule)
            .with_rule(TripleRidingRule)
            .with_rule(NoLicensePlateRule)
    }

    pub fn with_rule<R: ViolationRule + 'static>(mut self, rule: R) -> Self {
        self.rules.push(Box::new(rule));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    pub fn evaluate(
        &self,
        detections: &[Detection],
        rules: &AssociationRules,
    ) -> Result<Vec<Violation>, ValidationError> {
        let observed_at = now_s().unwrap_or_else(|err| {
            log::warn!("system clock unreadable ({}); violations stamped at epoch", err);
            0
        });
        self.evaluate_at(detections, rules, observed_at)
    }

    /// Run every rule, then attach plate text to the violations that can carry one.
    pub fn evaluate_at(
        &self,
        detections: &[Detection],
        rules: &AssociationRules,
        observed_at: u64,
    ) -> Result<Vec<Violation>, ValidationError> {
        validate_detections(detections)?;
        let frame = Partition::new(detections, rules.min_confidence);
        if frame.riders.is_empty() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for rule in &self.rules {
            let found = rule.evaluate(detections, rules, observed_at);
            if !found.is_empty() {
                log::debug!("rule {} produced {} violation(s)", rule.name(), found.len());
            }
            out.extend(found);
        }
        Ok(attach_plates(out, &frame, rules))
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

/// The no-helmet rule on its own.
pub fn evaluate(
    detections: &[Detection],
    rules: &AssociationRules,
) -> Result<Vec<Violation>, ValidationError> {
    RuleSet::empty()
        .with_rule(NoHelmetRule)
        .evaluate(detections, rules)
}

// -------------------- Shared association helpers --------------------

/// Detections split by class, low-confidence entries already removed.
pub(crate) struct Partition<'a> {
    pub riders: Vec<&'a Detection>,
    pub helmets: Vec<&'a Detection>,
    pub motorcycles: Vec<&'a Detection>,
    pub plates: Vec<&'a Detection>,
}

impl<'a> Partition<'a> {
    pub fn new(detections: &'a [Detection], min_confidence: f32) -> Self {
        let mut frame = Partition {
            riders: Vec::new(),
            helmets: Vec::new(),
            motorcycles: Vec::new(),
            plates: Vec::new(),
        };
        for det in detections.iter().filter(|d| d.confidence >= min_confidence) {
            match det.class {
                ObjectClass::Rider => frame.riders.push(det),
                ObjectClass::Helmet => frame.helmets.push(det),
                ObjectClass::Motorcycle => frame.motorcycles.push(det),
                ObjectClass::LicensePlate => frame.plates.push(det),
                ObjectClass::Other(_) => {}
            }
        }
        frame
    }

    /// Number of riders carried by each motorcycle (same order as `motorcycles`).
    ///
    /// Each rider goes to the nearest motorcycle within `max_rider_distance`; equal
    /// distances resolve to the earlier motorcycle.
    pub fn riders_per_motorcycle(&self, max_rider_distance: f32) -> Vec<usize> {
        let mut counts = vec![0usize; self.motorcycles.len()];
        for rider in &self.riders {
            let mut best: Option<(usize, f32)> = None;
            for (i, moto) in self.motorcycles.iter().enumerate() {
                let d = rider.bbox.center_distance(&moto.bbox);
                if d >= max_rider_distance {
                    continue;
                }
                if best.map_or(true, |(_, bd)| d < bd) {
                    best = Some((i, d));
                }
            }
            if let Some((i, _)) = best {
                counts[i] += 1;
            }
        }
        counts
    }
}

fn attach_plates(
    violations: Vec<Violation>,
    frame: &Partition<'_>,
    rules: &AssociationRules,
) -> Vec<Violation> {
    violations
        .into_iter()
        .map(|v| {
            if v.kind() == ViolationKind::NoLicensePlate {
                return v;
            }
            let bbox = v.bbox();
            let plate = frame
                .plates
                .iter()
                .filter_map(|p| p.plate_text.as_ref().map(|text| (p, text)))
                .map(|(p, text)| (p.bbox.center_distance(&bbox), text))
                .filter(|(d, _)| *d < rules.max_rider_distance)
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .map(|(_, text)| text.clone());
            v.with_license_plate(plate)
        })
        .collect()
}
