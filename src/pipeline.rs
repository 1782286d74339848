//! The enforcement pipeline: detect, suppress, adjudicate, record, notify.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::time::Duration;

use crate::detect::{Detector, ImageFrame};
use crate::error::EnqueueError;
use crate::notify::templates::{self, FineReceipt, NoticeSettings};
use crate::notify::{DeliveryReport, Dispatcher, JobId, NotificationKind};
use crate::rules::{AssociationRules, RuleSet};
use crate::storage::{
    EnforcementStore, JobArchive, Ledger, OwnerRegistry, StoredViolation, ViolationId,
};
use crate::{now_s, suppress};

const DEFAULT_SCORE_THRESHOLD: f32 = 0.25;
const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub score_threshold: f32,
    pub iou_threshold: f32,
    pub rules: AssociationRules,
    pub notice: NoticeSettings,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            rules: AssociationRules::default(),
            notice: NoticeSettings::default(),
        }
    }
}

/// What happened to one frame.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub frame_index: u64,
    pub raw_detections: usize,
    pub kept_detections: usize,
    pub violations: Vec<ViolationId>,
    pub notices: Vec<JobId>,
    /// Set when the frame was dropped before adjudication.
    pub skipped: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SettleSummary {
    pub sent: usize,
    pub dead: usize,
}

pub struct Enforcer {
    detector: Box<dyn Detector>,
    store: Box<dyn EnforcementStore>,
    rules: RuleSet,
    settings: PipelineSettings,
    dispatcher: Dispatcher,
    reports: Receiver<DeliveryReport>,
}

impl Enforcer {
    /// `reports` must be the channel returned alongside `dispatcher`.
    pub fn new(
        detector: Box<dyn Detector>,
        store: Box<dyn EnforcementStore>,
        settings: PipelineSettings,
        dispatcher: Dispatcher,
        reports: Receiver<DeliveryReport>,
    ) -> Self {
        Self {
            detector,
            store,
            rules: RuleSet::standard(),
            settings,
            dispatcher,
            reports,
        }
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn store_mut(&mut self) -> &mut dyn EnforcementStore {
        self.store.as_mut()
    }

    /// Run one frame through the pipeline.
    ///
    /// Detector failures and invalid detector output skip the frame and are reported in
    /// [`FrameReport::skipped`]; only storage failures are returned as errors.
    pub fn process_frame(&mut self, frame: &ImageFrame) -> Result<FrameReport> {
        let mut report = FrameReport {
            frame_index: frame.index,
            ..FrameReport::default()
        };

        let raw = match self.detector.detect(frame) {
            Ok(raw) => raw,
            Err(err) => {
                log::warn!(
                    "detector {} failed on frame {}: {}; frame skipped",
                    self.detector.name(),
                    frame.index,
                    err
                );
                report.skipped = Some(err.to_string());
                return Ok(report);
            }
        };
        report.raw_detections = raw.len();

        let kept = match suppress(
            &raw,
            self.settings.score_threshold,
            self.settings.iou_threshold,
        ) {
            Ok(kept) => kept,
            Err(err) => {
                log::warn!("frame {} rejected: {}", frame.index, err);
                report.skipped = Some(err.to_string());
                return Ok(report);
            }
        };
        report.kept_detections = kept.len();

        let violations = match self.rules.evaluate_at(&kept, &self.settings.rules, now_s()?) {
            Ok(violations) => violations,
            Err(err) => {
                log::warn!("frame {} rejected: {}", frame.index, err);
                report.skipped = Some(err.to_string());
                return Ok(report);
            }
        };

        for violation in violations {
            let id = self.store.record_violation(&violation, frame.evidence())?;
            log::info!(
                "frame {}: recorded {} as violation {} (plate {})",
                frame.index,
                violation.kind(),
                id,
                violation.license_plate().unwrap_or("unknown")
            );
            report.violations.push(id);

            let stored = StoredViolation {
                id,
                violation,
                image_path: frame.evidence().map(|p| p.to_path_buf()),
                processed: false,
                dead_lettered: false,
            };
            if let Some(job) = self.notify_violation(&stored)? {
                report.notices.push(job);
            }
        }
        Ok(report)
    }

    /// Enqueue the owner notice for a recorded violation.
    ///
    /// Returns `None` and leaves the violation pending when there is no plate, no
    /// registered owner, or the dispatcher refuses the job.
    pub fn notify_violation(&mut self, stored: &StoredViolation) -> Result<Option<JobId>> {
        let Some(plate) = stored.violation.license_plate() else {
            log::info!("violation {} has no readable plate; left pending", stored.id);
            return Ok(None);
        };
        let Some(owner) = self.store.owner_for_plate(plate)? else {
            log::info!(
                "no registered owner for plate {}; violation {} left pending",
                plate,
                stored.id
            );
            return Ok(None);
        };

        let payload = templates::violation_notice(&self.settings.notice, stored, &owner);
        match self
            .dispatcher
            .enqueue(payload, NotificationKind::ViolationNotice)
        {
            Ok(job) => Ok(Some(job)),
            Err(EnqueueError::Duplicate { existing, .. }) => {
                log::debug!(
                    "violation {} already has notice job-{}",
                    stored.id,
                    existing
                );
                Ok(None)
            }
            Err(err) => {
                log::warn!("notice for violation {} not queued: {}", stored.id, err);
                Ok(None)
            }
        }
    }

    pub fn send_fine_receipt(&self, receipt: &FineReceipt) -> Result<JobId, EnqueueError> {
        let payload = templates::fine_receipt(&self.settings.notice, receipt);
        self.dispatcher
            .enqueue(payload, NotificationKind::FineReceipt)
    }

    /// Apply delivery reports received so far: sent notices mark their violation
    /// processed, dead jobs go to the archive and their violation is never re-notified.
    pub fn settle(&mut self) -> Result<SettleSummary> {
        apply_reports(&self.reports, self.store.as_mut())
    }

    /// Wait up to `timeout` for the dispatcher to drain, then settle.
    pub fn settle_idle(&mut self, timeout: Duration) -> Result<SettleSummary> {
        if !self.dispatcher.wait_idle(timeout) {
            log::debug!("dispatcher still busy after {:?}", timeout);
        }
        self.settle()
    }

    /// Restore jobs stashed by a previous shutdown, then enqueue notices for every
    /// violation still pending. Returns the number of jobs queued.
    ///
    /// Stashed jobs the dispatcher has no room for go back into the stash.
    pub fn resume_pending(&mut self) -> Result<usize> {
        let stashed = self.store.take_stashed_jobs()?;
        let restored = self.dispatcher.restore(stashed.clone());
        let mut deferred = Vec::new();
        for (idx, err) in &restored.rejected {
            match err {
                EnqueueError::Saturated { .. } | EnqueueError::ShutDown => {
                    deferred.push(stashed[*idx].clone())
                }
                _ => log::warn!("stashed job #{} dropped: {}", idx, err),
            }
        }
        if !deferred.is_empty() {
            let kept = self.store.stash_pending_jobs(&deferred)?;
            log::warn!("{} stashed job(s) not restored; kept for the next run", kept);
        }
        let mut queued = restored.queued.len();

        for stored in self.store.pending_violations()? {
            if self.notify_violation(&stored)?.is_some() {
                queued += 1;
            }
        }
        if queued > 0 {
            log::info!("resumed {} notice job(s)", queued);
        }
        Ok(queued)
    }

    /// Stop the dispatcher, settle what finished and stash what did not.
    /// Returns the number of stashed jobs.
    pub fn shutdown(self) -> Result<usize> {
        let Enforcer {
            mut store,
            dispatcher,
            reports,
            ..
        } = self;
        let pending = dispatcher.shutdown();
        apply_reports(&reports, store.as_mut())?;
        let stashed = store.stash_pending_jobs(&pending)?;
        if stashed > 0 {
            log::info!("stashed {} pending job(s) for the next run", stashed);
        }
        Ok(stashed)
    }
}

fn apply_reports(
    reports: &Receiver<DeliveryReport>,
    store: &mut dyn EnforcementStore,
) -> Result<SettleSummary> {
    let mut summary = SettleSummary::default();
    loop {
        let report = match reports.try_recv() {
            Ok(report) => report,
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        };
        match report {
            DeliveryReport::Sent(job) => {
                summary.sent += 1;
                if job.kind() != NotificationKind::ViolationNotice {
                    continue;
                }
                match job
                    .payload()
                    .idempotency_key
                    .as_deref()
                    .and_then(violation_id_from_key)
                {
                    Some(id) => store.mark_processed(id)?,
                    None => log::warn!("sent notice {} carries no violation key", job.id()),
                }
            }
            DeliveryReport::Dead { job, error } => {
                summary.dead += 1;
                store.archive_dead_letter(&job, &error.to_string())?;
                if job.kind() == NotificationKind::ViolationNotice {
                    if let Some(id) = job
                        .payload()
                        .idempotency_key
                        .as_deref()
                        .and_then(violation_id_from_key)
                    {
                        store.mark_dead_lettered(id)?;
                    }
                }
            }
        }
    }
    Ok(summary)
}

fn violation_id_from_key(key: &str) -> Option<ViolationId> {
    key.strip_prefix("violation:")?
        .parse()
        .ok()
        .map(ViolationId)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::ScriptedDetector;
    use crate::notify::DispatchConfig;
    use crate::storage::{InMemoryLedger, VehicleOwner};

    use crate::transport::LogTransport;
    use crate::{BoundingBox, Detection, ObjectClass};
    use std::sync::Arc;

    fn centered(class: ObjectClass, cx: f32, cy: f32, size: f32, conf: f32) -> Detection {
        Detection::new(
            class,
            BoundingBox::new(cx - size / 2.0, cy - size / 2.0, size, size),
            conf,
        )
    }

    fn enforcer(detector: ScriptedDetector) -> Enforcer {
        let cfg = DispatchConfig {
            retry_delays: vec![Duration::from_millis(5)],
            ..DispatchConfig::default()
        };
        let (dispatcher, reports) = Dispatcher::start(cfg, Arc::new(LogTransport::new())).unwrap();
        let mut store = InMemoryLedger::new();
        store
            .register_owner(&VehicleOwner {
                license_plate: "KA01AB1234".into(),
                owner_name: "R. Kumar".into(),
                email: "owner@example.org".into(),
                phone: None,
                address: None,
            })
            .unwrap();
        Enforcer::new(
            Box::new(detector),
            Box::new(store),
            PipelineSettings::default(),
            dispatcher,
            reports,
        )
    }

    #[test]
    fn detector_failure_skips_frame() {
        let mut enforcer = enforcer(ScriptedDetector::default().then_failure("lens covered"));
        let report = enforcer.process_frame(&ImageFrame::blank(4, 640, 480)).unwrap();
        assert_eq!(report.frame_index, 4);
        assert!(report.skipped.unwrap().contains("lens covered"));
        assert!(report.violations.is_empty());
    }

    #[test]
    fn invalid_output_skips_frame() {
        let bad = centered(ObjectClass::Rider, 100.0, 100.0, 20.0, 1.5);
        let mut enforcer = enforcer(ScriptedDetector::default().then_detections(vec![bad]));
        let report = enforcer.process_frame(&ImageFrame::blank(0, 640, 480)).unwrap();
        assert!(report.skipped.is_some());
        assert!(enforcer.store_mut().pending_violations().unwrap().is_empty());
    }

    #[test]
    fn notice_sent_marks_violation_processed() {
        let frame = vec![
            centered(ObjectClass::Rider, 100.0, 100.0, 20.0, 0.9),
            centered(ObjectClass::LicensePlate, 100.0, 150.0, 10.0, 0.8).with_plate_text("KA01AB1234"),
        ];
        let mut enforcer = enforcer(ScriptedDetector::default().then_detections(frame));
        let report = enforcer.process_frame(&ImageFrame::blank(0, 640, 480)).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.notices.len(), 1);

        let summary = enforcer.settle_idle(Duration::from_secs(5)).unwrap();
        assert_eq!(summary, SettleSummary { sent: 1, dead: 0 });
        assert!(enforcer.store_mut().pending_violations().unwrap().is_empty());
        assert_eq!(enforcer.shutdown().unwrap(), 0);
    }

    #[test]
    fn unknown_plate_stays_pending() {
        let frame = vec![
            centered(ObjectClass::Rider, 100.0, 100.0, 20.0, 0.9),
            centered(ObjectClass::LicensePlate, 100.0, 150.0, 10.0, 0.8).with_plate_text("MH12DE1433"),
        ];
        let mut enforcer = enforcer(ScriptedDetector::default().then_detections(frame));
        let report = enforcer.process_frame(&ImageFrame::blank(0, 640, 480)).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(report.notices.is_empty());
        assert_eq!(enforcer.store_mut().pending_violations().unwrap().len(), 1);
    }

    #[test]
    fn violation_key_parsing() {
        assert_eq!(violation_id_from_key("violation:42"), Some(ViolationId(42)));
        assert_eq!(violation_id_from_key("receipt:42"), None);
        assert_eq!(violation_id_from_key("violation:x"), None);
    }
}
