use super::{AssociationRules, Partition, ViolationRule};
use crate::{Detection, Violation, ViolationKind};

/// Flags motorcycles carrying more than `max_riders_per_motorcycle` riders.
pub struct TripleRidingRule;

impl ViolationRule for TripleRidingRule {
    fn name(&self) -> &'static str {
        "triple_riding"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::TripleRiding
    }

    fn evaluate(
        &self,
        detections: &[Detection],
        rules: &AssociationRules,
        observed_at: u64,
    ) -> Vec<Violation> {
        let frame = Partition::new(detections, rules.min_confidence);
        let counts = frame.riders_per_motorcycle(rules.max_rider_distance);
        frame
            .motorcycles
            .iter()
            .zip(counts)
            .filter(|(_, riders)| *riders > rules.max_riders_per_motorcycle)
            .map(|(moto, riders)| {
                log::debug!("motorcycle carries {} riders", riders);
                Violation::from_detection(ViolationKind::TripleRiding, moto, observed_at)
            })
            .collect()
    }
}
