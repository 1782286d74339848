//! Per-class non-maximum suppression.

use crate::error::ValidationError;
use crate::{validate_detections, BoundingBox, Detection};

/// Intersection over union. Zero-area boxes overlap nothing.
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let area_a = a.area();
    let area_b = b.area();
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }
    let inter = a.intersection(b);
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

/// Drop low-scoring detections, then greedily keep the most confident detection of each
/// overlapping same-class group.
///
/// Output is ordered by descending confidence; ties keep input order, so identical input
/// always yields identical output.
pub fn suppress(
    detections: &[Detection],
    score_threshold: f32,
    iou_threshold: f32,
) -> Result<Vec<Detection>, ValidationError> {
    validate_detections(detections)?;

    let mut order: Vec<usize> = (0..detections.len())
        .filter(|&i| detections[i].confidence >= score_threshold)
        .collect();
    // Stable sort: equal confidence keeps original index order.
    order.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .total_cmp(&detections[a].confidence)
    });

    let mut kept: Vec<usize> = Vec::with_capacity(order.len());
    for idx in order {
        let candidate = &detections[idx];
        let overlapped = kept.iter().any(|&k| {
            let winner = &detections[k];
            winner.class == candidate.class && iou(&winner.bbox, &candidate.bbox) > iou_threshold
        });
        if !overlapped {
            kept.push(idx);
        }
    }

    Ok(kept.into_iter().map(|i| detections[i].clone()).collect())
}
