//! Weather adjustment: turns the latest observation, the rain sensor and the
//! water balance into a watering factor for the next cycle.
//!
//! Evaluation is pure. All the state it reads (`RainSensorState`,
//! `WaterBalance`) is owned and advanced by the scheduler, once per pass,
//! before the engine is consulted.

use serde::Serialize;
use time::{Date, Duration, OffsetDateTime};

use crate::config::{
    AdjustmentModel, Config, PenmanMonteithConfig, RainDeficitConfig, RainSensorConfig,
    RainSensorKind,
};
use crate::et::{self, DailyWeather, Site};
use crate::weather::{WeatherObservation, WeatherSnapshot};

/// How a run's duration was arrived at. Persisted on every run record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", content = "factor", rename_all = "snake_case")]
pub enum Adjustment {
    /// Baseline scaled by a factor in [0, 1].
    Weather(f64),
    /// Full baseline: adjustment disabled, or no usable weather.
    Unadjusted,
    /// Operator-requested run; duration given explicitly.
    Manual,
}

impl Adjustment {
    /// Build a weather adjustment, clamping into [0, 1]. A non-finite factor
    /// falls back to the full baseline.
    pub fn weather(factor: f64) -> Self {
        if factor.is_finite() {
            Adjustment::Weather(factor.clamp(0.0, 1.0))
        } else {
            Adjustment::Unadjusted
        }
    }

    pub fn factor(self) -> f64 {
        match self {
            Adjustment::Weather(f) => f,
            Adjustment::Unadjusted | Adjustment::Manual => 1.0,
        }
    }

    /// floor(baseline × factor), never outside [0, baseline].
    pub fn effective_sec(self, baseline_sec: i64) -> i64 {
        let baseline = baseline_sec.max(0);
        ((baseline as f64 * self.factor()).floor() as i64).clamp(0, baseline)
    }

    pub fn to_parts(self) -> (&'static str, Option<f64>) {
        match self {
            Adjustment::Weather(f) => ("weather", Some(f)),
            Adjustment::Unadjusted => ("unadjusted", None),
            Adjustment::Manual => ("manual", None),
        }
    }

    pub fn from_parts(kind: &str, factor: Option<f64>) -> Option<Self> {
        match kind {
            "weather" => factor.map(Adjustment::Weather),
            "unadjusted" => Some(Adjustment::Unadjusted),
            "manual" => Some(Adjustment::Manual),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Rain sensor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RainSensorState {
    kind: RainSensorKind,
    /// Software accumulation within the current window.
    pub accumulated_mm: f64,
    window_start: Option<OffsetDateTime>,
    last_cumulative_mm: Option<f64>,
    last_observed: Option<OffsetDateTime>,
    pin_active: bool,
    pin_last_active: Option<OffsetDateTime>,
}

impl RainSensorState {
    pub fn new(kind: RainSensorKind) -> Self {
        Self {
            kind,
            accumulated_mm: 0.0,
            window_start: None,
            last_cumulative_mm: None,
            last_observed: None,
            pin_active: false,
            pin_last_active: None,
        }
    }

    /// Consume an observation's cumulative precipitation. Returns the rain
    /// that fell since the previous observation; an observation already seen
    /// counts nothing. A drop in the cumulative value means the station
    /// reset its counter, so the new value is all fresh rain.
    pub fn observe_snapshot(&mut self, obs: &WeatherObservation, cfg: &RainSensorConfig) -> f64 {
        if self.last_observed.is_some_and(|t| obs.timestamp <= t) {
            return 0.0;
        }
        let total = obs.precipitation_mm.max(0.0);
        let delta = match self.last_cumulative_mm {
            Some(prev) if total >= prev => total - prev,
            _ => total,
        };
        self.last_cumulative_mm = Some(total);
        self.last_observed = Some(obs.timestamp);

        if self.kind == RainSensorKind::Software {
            self.expire(obs.timestamp, cfg);
            self.window_start.get_or_insert(obs.timestamp);
            self.accumulated_mm += delta;
        }
        delta
    }

    /// Zero the software accumulation once its window has elapsed.
    pub fn expire(&mut self, now: OffsetDateTime, cfg: &RainSensorConfig) {
        if let Some(start) = self.window_start {
            if now - start >= Duration::hours(cfg.reset_hours) {
                self.accumulated_mm = 0.0;
                self.window_start = None;
            }
        }
    }

    /// Sample the hardware pin. Hold-over counts from the sample at which
    /// the pin was first seen clear.
    pub fn observe_pin(&mut self, active: bool, now: OffsetDateTime) {
        if active || self.pin_active {
            self.pin_last_active = Some(now);
        }
        self.pin_active = active;
    }

    /// Whether the sensor currently suppresses watering.
    pub fn is_active(&self, now: OffsetDateTime, cfg: &RainSensorConfig) -> bool {
        match self.kind {
            RainSensorKind::None => false,
            RainSensorKind::Software => self.accumulated_mm >= cfg.threshold_mm,
            RainSensorKind::Hardware => {
                self.pin_active
                    || self
                        .pin_last_active
                        .is_some_and(|t| now - t < Duration::minutes(cfg.holdover_min))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Water balance
// ---------------------------------------------------------------------------

/// Running soil-moisture deficit in mm for the evapotranspiration model.
/// Zero means saturated; larger means drier.
#[derive(Debug, Clone)]
pub struct WaterBalance {
    pub deficit_mm: f64,
    day: Option<Date>,
    rain_since_roll_mm: f64,
}

impl WaterBalance {
    pub fn new(initial_deficit_mm: f64) -> Self {
        Self {
            deficit_mm: initial_deficit_mm.max(0.0),
            day: None,
            rain_since_roll_mm: 0.0,
        }
    }

    pub fn add_rain(&mut self, mm: f64) {
        self.rain_since_roll_mm += mm.max(0.0);
    }

    /// Close out the previous day on the first call for a new local date:
    /// add its ET0, subtract the rain seen since the last roll. Returns
    /// true if a roll happened.
    pub fn roll_day(&mut self, today: Date, et0_mm: f64) -> bool {
        match self.day {
            Some(d) if d >= today => return false,
            Some(_) => {
                self.deficit_mm =
                    (self.deficit_mm + et0_mm.max(0.0) - self.rain_since_roll_mm).max(0.0);
            }
            None => {}
        }
        self.day = Some(today);
        self.rain_since_roll_mm = 0.0;
        true
    }

    /// Water delivered by an adjusted run.
    pub fn credit(&mut self, applied_mm: f64) {
        self.deficit_mm = (self.deficit_mm - applied_mm.max(0.0)).max(0.0);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct AdjustmentInputs<'a> {
    pub now: OffsetDateTime,
    pub snapshot: Option<&'a WeatherSnapshot>,
    pub rain: &'a RainSensorState,
    pub balance: &'a WaterBalance,
}

#[derive(Debug, Clone)]
pub struct AdjustmentEngine {
    model: AdjustmentModel,
    rain_deficit: RainDeficitConfig,
    penman_monteith: PenmanMonteithConfig,
    rain_sensor: RainSensorConfig,
    stale_after: Duration,
    freeze_guard_c: Option<f64>,
    site: Site,
    anemometer_height_m: f64,
}

impl AdjustmentEngine {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model: cfg.adjustment.model,
            rain_deficit: cfg.adjustment.rain_deficit.clone(),
            penman_monteith: cfg.adjustment.penman_monteith.clone(),
            rain_sensor: cfg.rain_sensor.clone(),
            stale_after: Duration::minutes(cfg.weather.stale_after_min),
            freeze_guard_c: cfg.adjustment.freeze_guard_c,
            site: Site {
                latitude_deg: cfg.site.latitude,
                elevation_m: cfg.site.elevation_m,
            },
            anemometer_height_m: cfg.weather.anemometer_height_m,
        }
    }

    pub fn model(&self) -> AdjustmentModel {
        self.model
    }

    pub fn rain_sensor(&self) -> &RainSensorConfig {
        &self.rain_sensor
    }

    pub fn application_mm(&self) -> f64 {
        self.penman_monteith.application_mm
    }

    /// Starting deficit: dry enough that the first scheduled cycle waters.
    pub fn initial_deficit_mm(&self) -> f64 {
        self.penman_monteith.trigger_mm
    }

    /// The snapshot's observation if it is recent enough to act on.
    pub fn fresh<'a>(
        &self,
        snapshot: Option<&'a WeatherSnapshot>,
        now: OffsetDateTime,
    ) -> Option<&'a WeatherObservation> {
        snapshot
            .filter(|s| s.age(now) <= self.stale_after)
            .map(|s| &s.observation)
    }

    /// True when scheduled triggers should wait for warmer weather.
    pub fn freeze_hold(&self, snapshot: Option<&WeatherSnapshot>, now: OffsetDateTime) -> bool {
        match (self.freeze_guard_c, self.fresh(snapshot, now)) {
            (Some(limit), Some(obs)) => obs.temperature_c < limit,
            _ => false,
        }
    }

    /// One day of reference evapotranspiration from an observation.
    pub fn reference_et0(&self, obs: &WeatherObservation, date: Date) -> f64 {
        let day = DailyWeather {
            t_min: obs.temperature_min_c.unwrap_or(obs.temperature_c),
            t_max: obs.temperature_max_c.unwrap_or(obs.temperature_c),
            rh_min: obs.humidity_min_pct.unwrap_or(obs.humidity_pct),
            rh_max: obs.humidity_max_pct.unwrap_or(obs.humidity_pct),
            wind_2m: et::wind_at_2m(obs.wind_avg_ms, self.anemometer_height_m),
            solar_mj: obs.solar_radiation_wm2.map(et::watts_to_mj_per_day),
        };
        et::reference_et0(&day, self.site, date.ordinal())
    }

    pub fn evaluate(&self, inputs: &AdjustmentInputs<'_>) -> Adjustment {
        // Rain sensors override every model.
        if inputs.rain.is_active(inputs.now, &self.rain_sensor) {
            return Adjustment::Weather(0.0);
        }
        if self.model == AdjustmentModel::None {
            return Adjustment::Unadjusted;
        }
        let Some(obs) = self.fresh(inputs.snapshot, inputs.now) else {
            return Adjustment::Unadjusted;
        };

        match self.model {
            AdjustmentModel::None => Adjustment::Unadjusted,
            AdjustmentModel::RainDeficit => {
                let rd = &self.rain_deficit;
                let rain = if self.rain_sensor.kind == RainSensorKind::Software {
                    inputs.rain.accumulated_mm
                } else {
                    obs.precipitation_mm.max(0.0)
                };
                let wind = (obs.wind_avg_ms - rd.wind_threshold_ms).max(0.0);
                Adjustment::weather(1.0 - rain / rd.reference_loss_mm + rd.wind_coefficient * wind)
            }
            AdjustmentModel::PenmanMonteith => {
                let pm = &self.penman_monteith;
                let deficit = inputs.balance.deficit_mm;
                if deficit <= 0.0 || deficit < pm.trigger_mm {
                    Adjustment::Weather(0.0)
                } else {
                    Adjustment::weather(deficit / pm.application_mm)
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
