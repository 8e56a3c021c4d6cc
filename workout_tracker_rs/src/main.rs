use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use flate2::read::GzDecoder;
use serde::Deserialize;

use workout_tracker_rs::background::BridgeOutcome;
use workout_tracker_rs::{
    ActivityKind, BackgroundTaskBridge, Clock, FileStore, KeyValueStore, LocationSample, ManualClock,
    MemoryStore, RecoveryChoice, SessionController, SimulatedLocationProvider, TrackerConfig,
    TrackingEvent,
};

#[derive(Parser, Debug)]
#[command(name = "workout_tracker")]
#[command(about = "Replay a recorded GPS track through the workout tracking engine", long_about = None)]
struct Args {
    /// Recorded track (*.json or *.json.gz)
    #[arg(long)]
    track: PathBuf,

    /// Activity kind (running, walking, cycling)
    #[arg(long, default_value = "running")]
    activity: ActivityKind,

    /// JSON config; missing fields keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the split distance (metres)
    #[arg(long)]
    split_distance: Option<f64>,

    /// Override the accuracy gate (metres)
    #[arg(long)]
    max_accuracy: Option<f64>,

    /// Seconds into the track when the app goes to the background
    #[arg(long)]
    background_from: Option<f64>,

    /// Seconds into the track when the app returns to the foreground
    #[arg(long)]
    background_until: Option<f64>,

    /// Fixes per simulated OS background delivery
    #[arg(long, default_value = "5")]
    background_batch: usize,

    /// Persist state in this directory instead of memory
    #[arg(long)]
    store_dir: Option<PathBuf>,

    /// What to do with an interrupted session found in the store
    #[arg(long)]
    recover: Option<RecoveryChoice>,

    /// Write the finished session as JSON
    #[arg(long)]
    output: Option<PathBuf>,
}

/// GPS entry of the sensor logger's comparison format (seconds).
#[derive(Deserialize)]
struct LoggedFix {
    timestamp: f64,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    altitude: Option<f64>,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    accuracy: Option<f64>,
}

#[derive(Deserialize)]
struct LoggedReading {
    #[serde(default)]
    gps: Option<LoggedFix>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TrackFile {
    Samples(Vec<LocationSample>),
    Wrapped { samples: Vec<LocationSample> },
    Readings { readings: Vec<LoggedReading> },
}

impl TrackFile {
    fn into_samples(self) -> Vec<LocationSample> {
        match self {
            TrackFile::Samples(samples) | TrackFile::Wrapped { samples } => samples,
            TrackFile::Readings { readings } => readings
                .into_iter()
                .filter_map(|r| r.gps)
                .map(|fix| LocationSample {
                    latitude: fix.latitude,
                    longitude: fix.longitude,
                    altitude: fix.altitude,
                    timestamp_ms: (fix.timestamp * 1000.0).round() as i64,
                    horizontal_accuracy: fix.accuracy,
                    reported_speed: fix.speed,
                })
                .collect(),
        }
    }
}

fn load_track(path: &Path) -> Result<Vec<LocationSample>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let track: TrackFile = if path.extension().map(|e| e == "gz").unwrap_or(false) {
        serde_json::from_reader(BufReader::new(GzDecoder::new(file)))?
    } else {
        serde_json::from_reader(BufReader::new(file))?
    };
    let mut samples = track.into_samples();
    samples.sort_by_key(|s| s.timestamp_ms);
    Ok(samples)
}

fn load_config(args: &Args) -> Result<TrackerConfig> {
    let mut config = match &args.config {
        Some(path) => TrackerConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => TrackerConfig::default(),
    };
    config.record_samples = true;
    if let Some(split) = args.split_distance {
        config.splits.split_distance_m = split;
    }
    if let Some(acc) = args.max_accuracy {
        config.validator.max_accuracy_m = acc;
    }
    Ok(config)
}

struct Replay {
    controller: SessionController,
    provider: SimulatedLocationProvider,
    bridge: BackgroundTaskBridge,
    clock: Arc<ManualClock>,
    pending_batch: Vec<LocationSample>,
    batch_size: usize,
    splits: usize,
    rejected: usize,
    background_batches: usize,
}

impl Replay {
    fn flush_background(&mut self) -> Result<()> {
        if self.pending_batch.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending_batch);
        if let BridgeOutcome::Processed(stats) = self.bridge.handle_locations(&batch)? {
            log::debug!(
                "background delivery: {} accepted, {:.1} m",
                stats.accepted,
                stats.cumulative_distance_m
            );
        }
        self.background_batches += 1;
        Ok(())
    }

    fn count(&mut self, events: Vec<TrackingEvent>) {
        for event in events {
            match event {
                TrackingEvent::SplitCompleted(split) => {
                    self.splits += 1;
                    println!(
                        "  split {:>2}: {:>7.0} m  {:>6.0} s  pace {:>4.0} s",
                        split.index, split.cumulative_distance_m, split.cumulative_duration_s, split.split_pace_s
                    );
                }
                TrackingEvent::SampleRejected(_) => self.rejected += 1,
                TrackingEvent::SignalLost
                | TrackingEvent::SignalRestored
                | TrackingEvent::RecoveryTimeout
                | TrackingEvent::Discontinuity
                | TrackingEvent::DistanceFreezeDetected
                | TrackingEvent::StorageFailure(_) => println!("  event: {:?}", event),
                TrackingEvent::DistanceUpdated { .. } | TrackingEvent::BackgroundMerged { .. } => {}
            }
        }
    }

    fn feed(&mut self, sample: LocationSample, in_background: bool) -> Result<()> {
        self.clock.set(sample.timestamp_ms);
        if in_background {
            if !self.controller.is_backgrounded() {
                let events = self.controller.on_app_background();
                self.count(events);
            }
            self.pending_batch.push(sample);
            if self.pending_batch.len() >= self.batch_size {
                self.flush_background()?;
            }
            return Ok(());
        }

        if self.controller.is_backgrounded() {
            self.flush_background()?;
            let events = self.controller.on_app_foreground();
            self.count(events);
        }
        self.provider.emit(sample);
        let events = self.controller.tick();
        self.count(events);
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = load_config(&args)?;
    let samples = load_track(&args.track)?;
    let Some(first) = samples.first().map(|s| s.timestamp_ms) else {
        bail!("track {} has no GPS fixes", args.track.display());
    };

    let store: Arc<dyn KeyValueStore> = match &args.store_dir {
        Some(dir) => Arc::new(FileStore::open(dir)?),
        None => Arc::new(MemoryStore::new()),
    };
    let clock = Arc::new(ManualClock::new(first));
    let provider = SimulatedLocationProvider::granted();
    let mut controller = SessionController::new(
        config.clone(),
        Box::new(provider.clone()),
        store.clone(),
        clock.clone(),
    );

    if let Some(pending) = controller.pending_recovery()? {
        let choice = args.recover.unwrap_or(RecoveryChoice::Discard);
        println!(
            "Interrupted session {} ({:.0} m) found, applying {:?}",
            pending.session.id, pending.session.cumulative_distance_m, choice
        );
        if let Some(finalized) = controller.recover(choice)? {
            println!("  finalized at {:.1} m", finalized.cumulative_distance_m);
        }
    }
    if !controller.is_active() {
        let background = controller.start_tracking(args.activity)?;
        if !background {
            log::warn!("background task unavailable, replaying foreground only");
        }
    }

    let bridge = BackgroundTaskBridge::new(store, config.validator.clone(), config.background.clone());
    let mut replay = Replay {
        controller,
        provider,
        bridge,
        clock,
        pending_batch: Vec::new(),
        batch_size: args.background_batch.max(1),
        splits: 0,
        rejected: 0,
        background_batches: 0,
    };

    println!("Replaying {} fixes from {}", samples.len(), args.track.display());
    let window = (
        args.background_from.unwrap_or(f64::INFINITY),
        args.background_until.unwrap_or(f64::INFINITY),
    );
    for sample in samples {
        let offset_secs = (sample.timestamp_ms - first) as f64 / 1000.0;
        let in_background = offset_secs >= window.0 && offset_secs < window.1;
        replay.feed(sample, in_background)?;
    }
    replay.flush_background()?;

    let session = replay.controller.stop_tracking()?;
    let now = replay.clock.now_ms();
    println!();
    println!("Session {}", session.id);
    println!("  activity:   {}", session.activity_kind.as_str());
    println!("  distance:   {:.1} m", session.cumulative_distance_m);
    println!("  active:     {:.0} s", session.active_duration_s);
    if let Some(pace) = session.average_pace_s_per_km() {
        println!("  pace:       {}:{:02} /km", (pace / 60.0) as u64, (pace % 60.0) as u64);
    }
    println!("  elevation:  +{:.0} m / -{:.0} m", session.elevation_gain_m, session.elevation_loss_m);
    println!("  splits:     {}", replay.splits.max(session.splits.len()));
    println!("  rejected:   {}", replay.rejected);
    println!("  bg batches: {}", replay.background_batches);
    log::debug!("replay finished at {}", now);

    if let Some(path) = &args.output {
        let json = serde_json::to_string_pretty(&session)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}
