use super::{AssociationRules, Partition, ViolationRule};
use crate::{Detection, Violation, ViolationKind};

/// Flags every rider with no helmet center strictly inside `max_helmet_distance`.
///
/// This is an existence check, not an assignment: one helmet may clear several riders.
pub struct NoHelmetRule;

impl ViolationRule for NoHelmetRule {
    fn name(&self) -> &'static str {
        "no_helmet"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::NoHelmet
    }

    fn evaluate(
        &self,
        detections: &[Detection],
        rules: &AssociationRules,
        observed_at: u64,
    ) -> Vec<Violation> {
        let frame = Partition::new(detections, rules.min_confidence);
        frame
            .riders
            .iter()
            .filter(|rider| {
                !frame
                    .helmets
                    .iter()
                    .any(|helmet| rider.bbox.center_distance(&helmet.bbox) < rules.max_helmet_distance)
            })
            .map(|rider| Violation::from_detection(ViolationKind::NoHelmet, rider, observed_at))
            .collect()
    }
}
