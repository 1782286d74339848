//! enforcerd - rider safety enforcement daemon
//!
//! This daemon:
//! 1. Loads configuration (`ENFORCER_CONFIG` file plus `ENFORCER_*` overrides)
//! 2. Restores notice jobs stashed by the previous run and re-notifies pending violations
//! 3. Replays recorded detector output frame by frame through the pipeline
//! 4. Settles delivery reports into the ledger
//! 5. On Ctrl-C, stops the dispatcher and stashes unfinished jobs

use anyhow::{anyhow, Result};
use clap::Parser;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use rider_enforcement::config::EnforcerConfig;
use rider_enforcement::{
    build_transport, Detector, DetectorRegistry, Dispatcher, Enforcer, ImageFrame,
    ReplayDetector, ScriptedDetector, SqliteLedger, Transport,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Delay between replayed frames, in milliseconds.
    #[arg(long, default_value_t = 0)]
    frame_interval_ms: u64,
    /// Exit once every frame is processed and the dispatcher is idle.
    #[arg(long)]
    exit_when_idle: bool,
    /// Frame width reported to detectors.
    #[arg(long, default_value_t = 1280)]
    width: u32,
    /// Frame height reported to detectors.
    #[arg(long, default_value_t = 720)]
    height: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = EnforcerConfig::load()?;

    let mut registry = DetectorRegistry::new();
    let mut frame_indices = Vec::new();
    if let Some(path) = &config.detector.replay_path {
        let replay = ReplayDetector::from_path(path)?;
        frame_indices = replay.frame_indices();
        log::info!(
            "replaying {} frame(s) from {}",
            frame_indices.len(),
            path.display()
        );
        registry.register(replay);
    }
    registry.register(ScriptedDetector::default());
    registry
        .set_default(&config.detector.backend)
        .map_err(|e| anyhow!("{} (available: {:?})", e, registry.list()))?;
    registry.warm_up_all()?;
    log::info!(
        "detector {} ({:?} coordinates)",
        config.detector.backend,
        registry.coordinate_space()
    );

    let store = SqliteLedger::open(&config.db_path)?;
    let transport = build_transport(
        config.transport.kind,
        config.transport.webhook_url.as_deref(),
    )?;
    log::info!("delivering notices via {} transport", transport.name());
    let (dispatcher, reports) = Dispatcher::start(config.dispatch.clone(), transport)?;

    let mut enforcer = Enforcer::new(
        Box::new(registry),
        Box::new(store),
        config.pipeline.clone(),
        dispatcher,
        reports,
    );
    enforcer.resume_pending()?;

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let interval = Duration::from_millis(args.frame_interval_ms);
    let mut stopped = false;
    for index in frame_indices {
        let frame = ImageFrame::blank(index, args.width, args.height);
        let report = enforcer.process_frame(&frame)?;
        if !report.violations.is_empty() {
            log::info!(
                "frame {}: {} violation(s), {} notice(s) queued",
                index,
                report.violations.len(),
                report.notices.len()
            );
        }
        enforcer.settle()?;
        match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                stopped = true;
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    if !stopped {
        log::info!("replay finished; waiting for deliveries (Ctrl-C to stop)");
        loop {
            let summary = enforcer.settle_idle(Duration::from_millis(500))?;
            if summary.sent + summary.dead > 0 {
                log::info!("settled {} sent, {} dead", summary.sent, summary.dead);
            }
            let stats = enforcer.dispatcher().stats();
            if args.exit_when_idle && stats.live() == 0 {
                break;
            }
            match stop_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    log::info!("shutting down");
    let stashed = enforcer.shutdown()?;
    log::info!("stopped; {} job(s) stashed", stashed);
    Ok(())
}
