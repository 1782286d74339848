use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::notify::{DispatchConfig, NoticeSettings};
use crate::pipeline::PipelineSettings;
use crate::rules::AssociationRules;
use crate::transport::TransportKind;

const DEFAULT_DB_PATH: &str = "enforcement.db";
const DEFAULT_DETECTOR: &str = "replay";

#[derive(Debug, Deserialize, Default)]
struct EnforcerConfigFile {
    db_path: Option<String>,
    detector: Option<DetectorConfigFile>,
    detection: Option<DetectionConfigFile>,
    rules: Option<RulesConfigFile>,
    dispatch: Option<DispatchConfigFile>,
    notice: Option<NoticeConfigFile>,
    transport: Option<TransportConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    replay_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    score_threshold: Option<f32>,
    iou_threshold: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct RulesConfigFile {
    min_confidence: Option<f32>,
    max_helmet_distance: Option<f32>,
    max_riders_per_motorcycle: Option<usize>,
    max_rider_distance: Option<f32>,
}

#[derive(Debug, Deserialize, Default)]
struct DispatchConfigFile {
    capacity: Option<usize>,
    max_attempts: Option<u32>,
    retry_delays_ms: Option<Vec<u64>>,
    attempt_timeout_ms: Option<u64>,
    key_retention: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct NoticeConfigFile {
    sender: Option<String>,
    payment_url: Option<String>,
    payment_window_days: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct TransportConfigFile {
    kind: Option<String>,
    webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EnforcerConfig {
    pub db_path: String,
    pub detector: DetectorSettings,
    pub pipeline: PipelineSettings,
    pub dispatch: DispatchConfig,
    pub transport: TransportSettings,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Registry name of the detector backend to run.
    pub backend: String,
    pub replay_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub kind: TransportKind,
    pub webhook_url: Option<String>,
}

impl EnforcerConfig {
    /// Defaults, then the file named by `ENFORCER_CONFIG`, then `ENFORCER_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ENFORCER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EnforcerConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let detector_file = file.detector.unwrap_or_default();
        let detector = DetectorSettings {
            backend: detector_file
                .backend
                .unwrap_or_else(|| DEFAULT_DETECTOR.to_string()),
            replay_path: detector_file.replay_path,
        };

        let mut pipeline = PipelineSettings::default();
        if let Some(detection) = file.detection {
            pipeline.score_threshold = detection
                .score_threshold
                .unwrap_or(pipeline.score_threshold);
            pipeline.iou_threshold = detection.iou_threshold.unwrap_or(pipeline.iou_threshold);
        }
        if let Some(rules) = file.rules {
            let defaults = AssociationRules::default();
            pipeline.rules = AssociationRules {
                min_confidence: rules.min_confidence.unwrap_or(defaults.min_confidence),
                max_helmet_distance: rules
                    .max_helmet_distance
                    .unwrap_or(defaults.max_helmet_distance),
                max_riders_per_motorcycle: rules
                    .max_riders_per_motorcycle
                    .unwrap_or(defaults.max_riders_per_motorcycle),
                max_rider_distance: rules
                    .max_rider_distance
                    .unwrap_or(defaults.max_rider_distance),
            };
        }
        if let Some(notice) = file.notice {
            let defaults = NoticeSettings::default();
            pipeline.notice = NoticeSettings {
                sender: notice.sender.unwrap_or(defaults.sender),
                payment_url: notice.payment_url.unwrap_or(defaults.payment_url),
                payment_window_days: notice
                    .payment_window_days
                    .unwrap_or(defaults.payment_window_days),
            };
        }

        let mut dispatch = DispatchConfig::default();
        if let Some(d) = file.dispatch {
            dispatch.capacity = d.capacity.unwrap_or(dispatch.capacity);
            dispatch.max_attempts = d.max_attempts.unwrap_or(dispatch.max_attempts);
            if let Some(delays) = d.retry_delays_ms {
                dispatch.retry_delays = delays.into_iter().map(Duration::from_millis).collect();
            }
            if let Some(ms) = d.attempt_timeout_ms {
                dispatch.attempt_timeout = Duration::from_millis(ms);
            }
            dispatch.key_retention = d.key_retention.unwrap_or(dispatch.key_retention);
        }

        let transport_file = file.transport.unwrap_or_default();
        let transport = TransportSettings {
            kind: match transport_file.kind.as_deref() {
                Some(kind) => kind.parse()?,
                None => TransportKind::default(),
            },
            webhook_url: transport_file.webhook_url,
        };

        Ok(Self {
            db_path,
            detector,
            pipeline,
            dispatch,
            transport,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_nonempty("ENFORCER_DB_PATH") {
            self.db_path = path;
        }
        if let Some(backend) = env_nonempty("ENFORCER_DETECTOR") {
            self.detector.backend = backend;
        }
        if let Some(path) = env_nonempty("ENFORCER_REPLAY_PATH") {
            self.detector.replay_path = Some(PathBuf::from(path));
        }
        if let Some(kind) = env_nonempty("ENFORCER_TRANSPORT") {
            self.transport.kind = kind.parse()?;
        }
        if let Some(url) = env_nonempty("ENFORCER_WEBHOOK_URL") {
            self.transport.webhook_url = Some(url);
        }
        if let Some(value) = env_nonempty("ENFORCER_MIN_CONFIDENCE") {
            self.pipeline.rules.min_confidence = value
                .parse()
                .map_err(|_| anyhow!("ENFORCER_MIN_CONFIDENCE must be a number"))?;
        }
        if let Some(value) = env_nonempty("ENFORCER_MAX_HELMET_DISTANCE") {
            self.pipeline.rules.max_helmet_distance = value
                .parse()
                .map_err(|_| anyhow!("ENFORCER_MAX_HELMET_DISTANCE must be a number"))?;
        }
        if let Some(value) = env_nonempty("ENFORCER_MAX_ATTEMPTS") {
            self.dispatch.max_attempts = value
                .parse()
                .map_err(|_| anyhow!("ENFORCER_MAX_ATTEMPTS must be a positive integer"))?;
        }
        if let Some(value) = env_nonempty("ENFORCER_RETRY_DELAYS_MS") {
            self.dispatch.retry_delays = split_csv(&value)
                .iter()
                .map(|entry| {
                    entry.parse().map(Duration::from_millis).map_err(|_| {
                        anyhow!("ENFORCER_RETRY_DELAYS_MS must be comma separated milliseconds")
                    })
                })
                .collect::<Result<_>>()?;
        }
        if let Some(url) = env_nonempty("ENFORCER_PAYMENT_URL") {
            self.pipeline.notice.payment_url = url;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let unit = |name: &str, value: f32| -> Result<()> {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("{} must be within [0, 1], got {}", name, value));
            }
            Ok(())
        };
        unit("score_threshold", self.pipeline.score_threshold)?;
        unit("iou_threshold", self.pipeline.iou_threshold)?;
        unit("min_confidence", self.pipeline.rules.min_confidence)?;

        let rules = &self.pipeline.rules;
        let positive = |d: f32| d.is_finite() && d > 0.0;
        if !positive(rules.max_helmet_distance) || !positive(rules.max_rider_distance) {
            return Err(anyhow!("association distances must be greater than zero"));
        }
        if self.detector.backend.trim().is_empty() {
            return Err(anyhow!("detector backend must not be empty"));
        }
        self.dispatch.validate()?;
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<EnforcerConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
