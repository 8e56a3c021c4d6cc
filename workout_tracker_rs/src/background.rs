//! Background task bridge.
//!
//! Runs inside the OS background task callback, possibly in a process where no
//! controller exists. Everything it knows comes from the store, and everything
//! it produces goes back to the store for the controller to reconcile.

use std::sync::Arc;

use crate::config::{BackgroundConfig, ValidatorConfig};
use crate::error::TrackResult;
use crate::records::{
    load_record, save_record, BackgroundAccumulatorState, SampleBuffer, SessionStateRecord,
};
use crate::storage::{KeyValueStore, BACKGROUND_STATE_KEY, SAMPLE_BUFFER_KEY, SESSION_STATE_KEY};
use crate::types::LocationSample;
use crate::validator::{SampleValidator, Validation};

#[derive(Clone, Debug, PartialEq)]
pub enum BridgeOutcome {
    /// No live session; the task fired late or after stop
    NoSession,
    Paused,
    /// Foreground heartbeat is fresh and owns accrual
    ForegroundActive,
    Processed(BridgeStats),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BridgeStats {
    pub accepted: usize,
    pub rejected: usize,
    pub warmup_dropped: usize,
    pub evicted_batches: usize,
    pub distance_added_m: f64,
    pub cumulative_distance_m: f64,
}

pub struct BackgroundTaskBridge {
    store: Arc<dyn KeyValueStore>,
    validator: SampleValidator,
    config: BackgroundConfig,
}

impl BackgroundTaskBridge {
    pub fn new(store: Arc<dyn KeyValueStore>, validator: ValidatorConfig, config: BackgroundConfig) -> Self {
        Self {
            store,
            validator: SampleValidator::new(validator),
            config,
        }
    }

    /// Load the accumulator for `session`, discarding foreign state and
    /// applying any pending handoff.
    fn load_state(&self, session: &SessionStateRecord) -> TrackResult<BackgroundAccumulatorState> {
        let stored: Option<BackgroundAccumulatorState> = load_record(&*self.store, BACKGROUND_STATE_KEY)?;
        let mut state = match stored {
            Some(state) if state.session_id == session.session_id => state,
            Some(stale) => {
                log::warn!(
                    "discarding background state of session {} (active {})",
                    stale.session_id,
                    session.session_id
                );
                BackgroundAccumulatorState::fresh(
                    &session.session_id,
                    session.epoch,
                    session.handoff_distance_m,
                    self.config.warmup_samples,
                )
            }
            None => BackgroundAccumulatorState::fresh(
                &session.session_id,
                session.epoch,
                session.handoff_distance_m,
                self.config.warmup_samples,
            ),
        };

        if state.epoch != session.epoch {
            log::info!(
                "background handoff epoch {} -> {}, foreground distance {:.1} m",
                state.epoch,
                session.epoch,
                session.handoff_distance_m
            );
            state.cumulative_distance_m = state.cumulative_distance_m.max(session.handoff_distance_m);
            state.last_accepted_point = None;
            state.warmup_remaining = self.config.warmup_samples;
            state.epoch = session.epoch;
        }
        Ok(state)
    }

    /// Handle one OS delivery of background fixes.
    pub fn handle_locations(&self, samples: &[LocationSample]) -> TrackResult<BridgeOutcome> {
        let Some(session) = load_record::<SessionStateRecord>(&*self.store, SESSION_STATE_KEY)? else {
            log::debug!("background fixes with no active session, ignoring {}", samples.len());
            return Ok(BridgeOutcome::NoSession);
        };
        if session.paused {
            return Ok(BridgeOutcome::Paused);
        }

        let mut ordered: Vec<LocationSample> = samples.to_vec();
        ordered.sort_by_key(|s| s.timestamp_ms);
        let Some(newest) = ordered.last().map(|s| s.timestamp_ms) else {
            return Ok(BridgeOutcome::Processed(BridgeStats::default()));
        };
        if session.foreground_active(newest, self.config.foreground_stale_secs) {
            return Ok(BridgeOutcome::ForegroundActive);
        }

        let mut state = self.load_state(&session)?;
        let mut stats = BridgeStats::default();
        let mut accepted = Vec::new();

        for sample in ordered {
            if state.warmup_remaining > 0 {
                state.warmup_remaining -= 1;
                stats.warmup_dropped += 1;
                continue;
            }
            let verdict = self.validator.validate(
                &sample,
                state.last_accepted_point.as_ref(),
                Some(session.start_time_ms),
            );
            match verdict {
                Validation::Accepted { distance_m, .. } => {
                    state.cumulative_distance_m += distance_m;
                    stats.distance_added_m += distance_m;
                    stats.accepted += 1;
                    state.last_accepted_point = Some(sample.clone());
                    accepted.push(sample);
                }
                Validation::Rejected(reason) => {
                    log::debug!("background fix rejected: {:?}", reason);
                    stats.rejected += 1;
                }
            }
        }

        state.sample_count += stats.accepted as u64;
        state.last_updated_ms = newest;
        save_record(&*self.store, BACKGROUND_STATE_KEY, &state)?;

        if !accepted.is_empty() {
            let mut buffer = load_record::<SampleBuffer>(&*self.store, SAMPLE_BUFFER_KEY)?
                .unwrap_or_else(SampleBuffer::new);
            stats.evicted_batches = buffer.push(&session.session_id, accepted, &self.config);
            if stats.evicted_batches > 0 {
                log::warn!("sample buffer full, evicted {} batches", stats.evicted_batches);
            }
            save_record(&*self.store, SAMPLE_BUFFER_KEY, &buffer)?;
        }

        stats.cumulative_distance_m = state.cumulative_distance_m;
        log::debug!(
            "background batch: {} accepted, {} rejected, {:.1} m total",
            stats.accepted,
            stats.rejected,
            stats.cumulative_distance_m
        );
        Ok(BridgeOutcome::Processed(stats))
    }
}
