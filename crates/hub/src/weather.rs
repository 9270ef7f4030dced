//! Weather observations and the rate-limited poller that keeps the latest
//! snapshot in a `watch` channel for the scheduler.
//!
//! Providers sit behind the `WeatherSource` trait. The one shipped here is
//! fed by the station publishing JSON observations over MQTT.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, RwLock};
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::WeatherConfig;

/// One station observation, metric units.
///
/// `precipitation_mm` is cumulative since the station's own daily reset, so
/// consumers must difference successive values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    #[serde(with = "time::serde::timestamp")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub precipitation_mm: f64,
    #[serde(default)]
    pub wind_avg_ms: f64,
    #[serde(default)]
    pub wind_peak_ms: f64,
    pub temperature_c: f64,
    #[serde(default)]
    pub temperature_min_c: Option<f64>,
    #[serde(default)]
    pub temperature_max_c: Option<f64>,
    pub humidity_pct: f64,
    #[serde(default)]
    pub humidity_min_pct: Option<f64>,
    #[serde(default)]
    pub humidity_max_pct: Option<f64>,
    /// Mean incoming solar radiation, W/m².
    #[serde(default)]
    pub solar_radiation_wm2: Option<f64>,
    /// Station-side rain sensor, when the station has one.
    #[serde(default)]
    pub rain_sensor_active: Option<bool>,
}

/// Most recent successful fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct WeatherSnapshot {
    pub observation: WeatherObservation,
    pub fetched_at: OffsetDateTime,
}

impl WeatherSnapshot {
    /// Age of the underlying observation at `now`.
    pub fn age(&self, now: OffsetDateTime) -> time::Duration {
        now - self.observation.timestamp
    }
}

#[async_trait]
pub trait WeatherSource: Send + Sync {
    async fn fetch(&self) -> Result<WeatherObservation>;
}

// ---------------------------------------------------------------------------
// MQTT-fed source
// ---------------------------------------------------------------------------

/// Holds the last observation the station published. The MQTT loop writes,
/// the poller reads.
#[derive(Clone, Default)]
pub struct MqttWeatherSource {
    latest: Arc<RwLock<Option<WeatherObservation>>>,
}

impl MqttWeatherSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn publish(&self, obs: WeatherObservation) {
        let mut latest = self.latest.write().await;
        // Out-of-order retained messages must not roll the clock back.
        if latest
            .as_ref()
            .is_some_and(|prev| prev.timestamp > obs.timestamp)
        {
            debug!(ts = %obs.timestamp, "ignoring older observation");
            return;
        }
        *latest = Some(obs);
    }
}

#[async_trait]
impl WeatherSource for MqttWeatherSource {
    async fn fetch(&self) -> Result<WeatherObservation> {
        match self.latest.read().await.clone() {
            Some(obs) => Ok(obs),
            None => bail!("no observation received from station yet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

pub type SnapshotRx = watch::Receiver<Option<WeatherSnapshot>>;

pub struct WeatherPoller<S> {
    source: S,
    poll_interval: Duration,
    min_interval: Duration,
    timeout: Duration,
    tx: watch::Sender<Option<WeatherSnapshot>>,
    last_attempt: Option<Instant>,
}

impl<S: WeatherSource> WeatherPoller<S> {
    pub fn new(source: S, cfg: &WeatherConfig) -> (Self, SnapshotRx) {
        let (tx, rx) = watch::channel(None);
        let poller = Self {
            source,
            poll_interval: Duration::from_secs(cfg.poll_interval_sec),
            min_interval: Duration::from_secs(cfg.min_interval_sec),
            timeout: Duration::from_secs(cfg.timeout_sec),
            tx,
            last_attempt: None,
        };
        (poller, rx)
    }

    /// Fetch once, unless the previous attempt was less than the minimum
    /// interval ago. Returns true when a new snapshot was published.
    /// Failures leave the previous snapshot in place.
    pub async fn poll_once(&mut self) -> bool {
        if let Some(last) = self.last_attempt {
            if last.elapsed() < self.min_interval {
                debug!("weather poll suppressed by min interval");
                return false;
            }
        }
        self.last_attempt = Some(Instant::now());

        match timeout(self.timeout, self.source.fetch()).await {
            Ok(Ok(observation)) => {
                info!(
                    ts = %observation.timestamp,
                    rain_mm = observation.precipitation_mm,
                    wind_ms = observation.wind_avg_ms,
                    temp_c = observation.temperature_c,
                    "weather observation fetched"
                );
                self.tx.send_replace(Some(WeatherSnapshot {
                    observation,
                    fetched_at: OffsetDateTime::now_utc(),
                }));
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "weather fetch failed, keeping previous snapshot");
                false
            }
            Err(_) => {
                warn!(
                    timeout_sec = self.timeout.as_secs(),
                    "weather fetch timed out, keeping previous snapshot"
                );
                false
            }
        }
    }

    /// Poll until every snapshot receiver has gone away.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if self.tx.is_closed() {
                info!("weather poller stopping");
                return;
            }
            self.poll_once().await;
        }
    }
}

/// Dry, calm, mild observation used as a starting point in tests.
#[cfg(test)]
pub(crate) fn calm_observation(ts: OffsetDateTime) -> WeatherObservation {
    WeatherObservation {
        timestamp: ts,
        precipitation_mm: 0.0,
        wind_avg_ms: 0.0,
        wind_peak_ms: 0.0,
        temperature_c: 20.0,
        temperature_min_c: None,
        temperature_max_c: None,
        humidity_pct: 50.0,
        humidity_min_pct: None,
        humidity_max_pct: None,
        solar_radiation_wm2: None,
        rain_sensor_active: None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
