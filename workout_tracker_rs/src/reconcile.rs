//! Foreground side of the background handoff.
//!
//! Background distance is merged by taking the maximum, never by adding, so a
//! reconciliation can run any number of times without double counting. The
//! sample buffer is drained and then cleared so each batch is seen at most once.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::error::TrackResult;
use crate::records::{load_record, BackgroundAccumulatorState, SampleBuffer};
use crate::session::SessionController;
use crate::storage::{KeyValueStore, BACKGROUND_STATE_KEY, SAMPLE_BUFFER_KEY};
use crate::types::LocationSample;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Reconciliation {
    /// Distance reported by the background, if it belonged to this session
    pub background_distance_m: Option<f64>,
    /// Set when the background distance exceeded the controller's
    pub adopted_distance_m: Option<f64>,
    /// Drained fixes newer than the last known timestamp, oldest first
    pub samples: Vec<LocationSample>,
}

pub struct ReconciliationSync {
    store: Arc<dyn KeyValueStore>,
}

impl ReconciliationSync {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn reconcile(
        &self,
        session_id: &str,
        current_distance_m: f64,
        last_known_ts: Option<i64>,
    ) -> TrackResult<Reconciliation> {
        let mut result = Reconciliation::default();

        match load_record::<BackgroundAccumulatorState>(&*self.store, BACKGROUND_STATE_KEY)? {
            Some(state) if state.session_id == session_id => {
                result.background_distance_m = Some(state.cumulative_distance_m);
                if state.cumulative_distance_m.is_finite() && state.cumulative_distance_m > current_distance_m {
                    log::info!(
                        "adopting background distance {:.1} m (controller {:.1} m)",
                        state.cumulative_distance_m,
                        current_distance_m
                    );
                    result.adopted_distance_m = Some(state.cumulative_distance_m);
                }
            }
            Some(stale) => {
                log::warn!(
                    "dropping background state for session {} (active {})",
                    stale.session_id,
                    session_id
                );
                self.store.remove(BACKGROUND_STATE_KEY)?;
            }
            None => {}
        }

        if let Some(buffer) = load_record::<SampleBuffer>(&*self.store, SAMPLE_BUFFER_KEY)? {
            let mut cutoff = last_known_ts;
            for sample in buffer.samples_for(session_id) {
                if cutoff.map_or(true, |ts| sample.timestamp_ms > ts) {
                    cutoff = Some(sample.timestamp_ms);
                    result.samples.push(sample);
                }
            }
            self.store.remove(SAMPLE_BUFFER_KEY)?;
            if !result.samples.is_empty() {
                log::debug!("drained {} background fixes", result.samples.len());
            }
        }

        Ok(result)
    }
}

/// Periodic reconciliation while a session is live. Ends when `shutdown`
/// flips to true or its sender is dropped.
pub async fn reconciliation_task(
    controller: Arc<Mutex<SessionController>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if !reconcile_locked(&controller) {
            break;
        }
    }
}

/// Returns false once the controller can no longer be locked.
fn reconcile_locked(controller: &Mutex<SessionController>) -> bool {
    let Ok(mut guard) = controller.lock() else {
        log::warn!("controller lock poisoned, stopping reconciliation");
        return false;
    };
    if guard.is_active() {
        if let Err(e) = guard.reconcile_now() {
            log::warn!("periodic reconciliation failed: {}", e);
        }
    }
    true
}
