use rider_enforcement::rules::{NoHelmetRule, NoLicensePlateRule, TripleRidingRule};
use rider_enforcement::{
    evaluate, AssociationRules, BoundingBox, Detection, ObjectClass, RuleSet, Violation,
    ViolationKind, ViolationRule,
};

fn centered(class: ObjectClass, cx: f32, cy: f32, w: f32, h: f32, conf: f32) -> Detection {
    Detection::new(
        class,
        BoundingBox::new(cx - w / 2.0, cy - h / 2.0, w, h),
        conf,
    )
}

#[test]
fn rider_with_helmet_close_by_is_compliant() {
    let dets = vec![
        centered(ObjectClass::Rider, 100.0, 100.0, 20.0, 20.0, 0.9),
        centered(ObjectClass::Helmet, 105.0, 105.0, 10.0, 10.0, 0.9),
    ];
    let rules = AssociationRules {
        max_helmet_distance: 50.0,
        ..AssociationRules::default()
    };
    assert!(evaluate(&dets, &rules).unwrap().is_empty());
}

#[test]
fn lone_rider_is_one_no_helmet_violation() {
    let rider = centered(ObjectClass::Rider, 100.0, 100.0, 20.0, 20.0, 0.77);
    let out = evaluate(std::slice::from_ref(&rider), &AssociationRules::default()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].kind(), ViolationKind::NoHelmet);
    assert_eq!(out[0].bbox(), rider.bbox);
    assert_eq!(out[0].confidence(), 0.77);
}

#[test]
fn three_riders_one_helmet_at_increasing_distance() {
    let dets = vec![
        centered(ObjectClass::Helmet, 500.0, 500.0, 16.0, 16.0, 0.9),
        centered(ObjectClass::Rider, 510.0, 500.0, 20.0, 20.0, 0.9),
        centered(ObjectClass::Rider, 560.0, 500.0, 20.0, 20.0, 0.9),
        centered(ObjectClass::Rider, 700.0, 500.0, 20.0, 20.0, 0.9),
    ];
    let out = evaluate(&dets, &AssociationRules::default()).unwrap();
    let centers: Vec<(f32, f32)> = out.iter().map(|v| v.bbox().center()).collect();
    assert_eq!(centers, vec![(560.0, 500.0), (700.0, 500.0)]);
}

#[test]
fn low_confidence_detections_never_surface() {
    let dets = vec![
        centered(ObjectClass::Rider, 100.0, 100.0, 20.0, 40.0, 0.59),
        centered(ObjectClass::Rider, 300.0, 100.0, 20.0, 40.0, 0.95),
        centered(ObjectClass::Rider, 320.0, 110.0, 20.0, 40.0, 0.61),
        centered(ObjectClass::Rider, 340.0, 110.0, 20.0, 40.0, 0.2),
        centered(ObjectClass::Motorcycle, 320.0, 140.0, 90.0, 50.0, 0.3),
        centered(ObjectClass::Motorcycle, 320.0, 140.0, 90.0, 50.0, 0.9),
    ];
    for threshold in [0.0, 0.3, 0.59, 0.61, 0.95, 1.0] {
        let rules = AssociationRules {
            min_confidence: threshold,
            ..AssociationRules::default()
        };
        let out = RuleSet::standard().evaluate(&dets, &rules).unwrap();
        for v in &out {
            assert!(v.confidence() >= threshold, "threshold {}: {:?}", threshold, v);
            assert!(v.source_detection().confidence >= threshold);
        }

        let eligible_riders = dets
            .iter()
            .filter(|d| d.class == ObjectClass::Rider && d.confidence >= threshold)
            .count();
        let no_helmet = out
            .iter()
            .filter(|v| v.kind() == ViolationKind::NoHelmet)
            .count();
        assert_eq!(no_helmet, eligible_riders, "threshold {}", threshold);
    }
}

#[test]
fn helmet_below_min_confidence_does_not_clear_rider() {
    let dets = vec![
        centered(ObjectClass::Rider, 100.0, 100.0, 20.0, 20.0, 0.9),
        centered(ObjectClass::Helmet, 102.0, 98.0, 10.0, 10.0, 0.4),
    ];
    assert_eq!(evaluate(&dets, &AssociationRules::default()).unwrap().len(), 1);
}

#[test]
fn triple_riding_and_missing_plate_on_one_motorcycle() {
    let dets = vec![
        centered(ObjectClass::Motorcycle, 200.0, 200.0, 120.0, 80.0, 0.92),
        centered(ObjectClass::Rider, 180.0, 170.0, 20.0, 40.0, 0.9),
        centered(ObjectClass::Rider, 200.0, 170.0, 20.0, 40.0, 0.9),
        centered(ObjectClass::Rider, 220.0, 170.0, 20.0, 40.0, 0.9),
        centered(ObjectClass::Helmet, 180.0, 150.0, 10.0, 10.0, 0.9),
        centered(ObjectClass::Helmet, 200.0, 150.0, 10.0, 10.0, 0.9),
        centered(ObjectClass::Helmet, 220.0, 150.0, 10.0, 10.0, 0.9),
    ];
    let out = RuleSet::standard()
        .evaluate(&dets, &AssociationRules::default())
        .unwrap();
    let kinds: Vec<ViolationKind> = out.iter().map(Violation::kind).collect();
    assert_eq!(
        kinds,
        vec![ViolationKind::TripleRiding, ViolationKind::NoLicensePlate]
    );
    assert_eq!(out[0].confidence(), 0.92);
}

#[test]
fn plate_inside_motorcycle_box_satisfies_plate_rule() {
    let dets = vec![
        centered(ObjectClass::Motorcycle, 200.0, 200.0, 120.0, 80.0, 0.92),
        centered(ObjectClass::Rider, 200.0, 170.0, 20.0, 40.0, 0.9),
        centered(ObjectClass::Helmet, 200.0, 150.0, 10.0, 10.0, 0.9),
        centered(ObjectClass::LicensePlate, 200.0, 230.0, 30.0, 10.0, 0.8),
    ];
    let out = NoLicensePlateRule.evaluate(&dets, &AssociationRules::default(), 0);
    assert!(out.is_empty());
}

#[test]
fn custom_rule_slots_in_next_to_standard_ones() {
    struct EveryMotorcycle;

    impl ViolationRule for EveryMotorcycle {
        fn name(&self) -> &'static str {
            "every_motorcycle"
        }

        fn kind(&self) -> ViolationKind {
            ViolationKind::TripleRiding
        }

        fn evaluate(
            &self,
            detections: &[Detection],
            _rules: &AssociationRules,
            observed_at: u64,
        ) -> Vec<Violation> {
            detections
                .iter()
                .filter(|d| d.class == ObjectClass::Motorcycle)
                .map(|d| Violation::from_detection(self.kind(), d, observed_at))
                .collect()
        }
    }

    let set = RuleSet::empty()
        .with_rule(NoHelmetRule)
        .with_rule(TripleRidingRule)
        .with_rule(EveryMotorcycle);
    assert_eq!(
        set.names(),
        vec!["no_helmet", "triple_riding", "every_motorcycle"]
    );

    let dets = vec![
        centered(ObjectClass::Motorcycle, 200.0, 200.0, 120.0, 80.0, 0.92),
        centered(ObjectClass::Rider, 200.0, 170.0, 20.0, 40.0, 0.9),
        centered(ObjectClass::Helmet, 200.0, 150.0, 10.0, 10.0, 0.9),
    ];
    let out = set.evaluate_at(&dets, &AssociationRules::default(), 42).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].created_at(), 42);
}
