use super::{AssociationRules, Partition, ViolationRule};
use crate::{Detection, Violation, ViolationKind};

/// Flags ridden motorcycles with no license plate detection inside their box.
pub struct NoLicensePlateRule;

impl ViolationRule for NoLicensePlateRule {
    fn name(&self) -> &'static str {
        "no_license_plate"
    }

    fn kind(&self) -> ViolationKind {
        ViolationKind::NoLicensePlate
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
            .filter(|(_, riders)| *riders > 0)
            .filter(|(moto, _)| {
                !frame
                    .plates
                    .iter()
                    .any(|plate| moto.bbox.contains_point(plate.bbox.center()))
            })
            .map(|(moto, _)| {
                Violation::from_detection(ViolationKind::NoLicensePlate, moto, observed_at)
            })
            .collect()
    }
}
