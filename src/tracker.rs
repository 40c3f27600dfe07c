//! Periodic re-sharing of the local position.

use std::{sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::debug;

use crate::{codec::LocationSample, demo, event::unix_now_millis};

/// Supplies the device position; the host owns geolocation.
pub trait PositionSource: Send + Sync {
    /// Current fix, or `None` when no fix is available.
    fn sample(&self) -> Option<LocationSample>;
}

/// Always reports the same coordinates, stamped at sampling time.
#[derive(Debug, Clone, Copy)]
pub struct FixedPosition {
    pub lat: f64,
    pub lng: f64,
}

impl FixedPosition {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

impl PositionSource for FixedPosition {
    fn sample(&self) -> Option<LocationSample> {
        Some(LocationSample {
            lat: self.lat,
            lng: self.lng,
            timestamp: unix_now_millis(),
        })
    }
}

/// Background task sampling a [`PositionSource`] on a fixed interval.
///
/// The first tick fires immediately. A missing fix falls back to
/// [`demo::fallback_sample`]. The task stops on [`stop`](Self::stop) or when
/// the tracker is dropped.
pub struct LocationTracker {
    task: Option<JoinHandle<()>>,
}

impl LocationTracker {
    /// Spawn the sampling loop on the current tokio runtime.
    pub fn start<F>(interval: Duration, source: Arc<dyn PositionSource>, share: F) -> Self
    where
        F: Fn(LocationSample) + Send + Sync + 'static,
    {
        let period = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let sample = source.sample().unwrap_or_else(demo::fallback_sample);
                debug!(lat = sample.lat, lng = sample.lng, "position sampled");
                share(sample);
            }
        });
        Self { task: Some(task) }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop; no share runs after this returns. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("location tracker stopped");
        }
    }
}

impl Drop for LocationTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
