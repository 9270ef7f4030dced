//! TOML config file loading, validation, and seeding of the zone table.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

use crate::history::Db;
use crate::schedule::{parse_hh_mm, Zone};
use time::Time;

/// Largest zone id the hub will drive.
pub const MAX_ZONES: u8 = 32;

const MINUTES_PER_DAY: i64 = 24 * 60;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub site: SiteConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub schedules: Vec<ScheduleEntry>,
    #[serde(default)]
    pub rain_sensor: RainSensorConfig,
    #[serde(default)]
    pub adjustment: AdjustmentConfig,
    #[serde(default)]
    pub weather: WeatherConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Offset of site-local time from UTC, in minutes. Schedules use it.
    pub utc_offset_min: i32,
    pub latitude: f64,
    pub elevation_m: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            utc_offset_min: 0,
            latitude: 40.0,
            elevation_m: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub pass_interval_sec: u64,
    /// 1 = strict exclusivity (shared water pressure).
    pub max_concurrent_zones: usize,
    /// How long after its start time a trigger may still fire.
    pub catch_up_min: i64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            pass_interval_sec: 5,
            max_concurrent_zones: 1,
            catch_up_min: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: u8,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub baseline_sec: i64,
    pub valve_gpio_pin: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub zone_id: u8,
    /// Site-local "HH:MM".
    pub start: String,
    #[serde(default = "default_every_days")]
    pub every_days: u32,
    /// Active months (1-12). Empty means every month.
    #[serde(default)]
    pub months: Vec<u8>,
    /// Overrides the zone's baseline duration.
    pub duration_sec: Option<i64>,
    #[serde(default = "default_true")]
    pub weather_adjust: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RainSensorKind {
    #[default]
    None,
    Software,
    Hardware,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RainSensorConfig {
    pub kind: RainSensorKind,
    pub pin: Option<i64>,
    /// Software sensor trips once this much rain has accumulated.
    pub threshold_mm: f64,
    /// Software accumulation is zeroed after this many hours.
    pub reset_hours: i64,
    /// Hardware sensor keeps watering suppressed this long after it clears.
    pub holdover_min: i64,
}

impl Default for RainSensorConfig {
    fn default() -> Self {
        Self {
            kind: RainSensorKind::None,
            pin: None,
            threshold_mm: 6.0,
            reset_hours: 24,
            holdover_min: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentModel {
    None,
    #[default]
    RainDeficit,
    PenmanMonteith,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AdjustmentConfig {
    pub model: AdjustmentModel,
    pub rain_deficit: RainDeficitConfig,
    pub penman_monteith: PenmanMonteithConfig,
    /// Defer scheduled triggers while the observed temperature is below this.
    pub freeze_guard_c: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RainDeficitConfig {
    /// Rainfall that fully offsets a day of watering.
    pub reference_loss_mm: f64,
    pub wind_threshold_ms: f64,
    /// Factor added back per m/s of average wind above the threshold.
    pub wind_coefficient: f64,
}

impl Default for RainDeficitConfig {
    fn default() -> Self {
        Self {
            reference_loss_mm: 5.0,
            wind_threshold_ms: 3.0,
            wind_coefficient: 0.02,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PenmanMonteithConfig {
    /// Water-balance deficit at which a watering is triggered.
    pub trigger_mm: f64,
    /// Depth one full-baseline run applies.
    pub application_mm: f64,
}

impl Default for PenmanMonteithConfig {
    fn default() -> Self {
        Self {
            trigger_mm: 5.0,
            application_mm: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub station: Option<String>,
    pub poll_interval_sec: u64,
    /// Hard floor between provider calls.
    pub min_interval_sec: u64,
    pub timeout_sec: u64,
    pub stale_after_min: i64,
    pub anemometer_height_m: f64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            station: None,
            poll_interval_sec: 600,
            min_interval_sec: 300,
            timeout_sec: 30,
            stale_after_min: 180,
            anemometer_height_m: 2.0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_every_days() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_site(&mut errors);
        self.validate_controller(&mut errors);
        self.validate_zones(&mut errors);
        self.validate_schedules(&mut errors);
        self.validate_rain_sensor(&mut errors);
        self.validate_adjustment(&mut errors);
        self.validate_weather(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_site(&self, errors: &mut Vec<String>) {
        let s = &self.site;
        if !(-720..=840).contains(&s.utc_offset_min) {
            errors.push(format!(
                "site: utc_offset_min {} out of range [-720, 840]",
                s.utc_offset_min
            ));
        }
        if !(-90.0..=90.0).contains(&s.latitude) {
            errors.push(format!("site: latitude {} out of range [-90, 90]", s.latitude));
        }
    }

    fn validate_controller(&self, errors: &mut Vec<String>) {
        let c = &self.controller;
        if c.pass_interval_sec == 0 {
            errors.push("controller: pass_interval_sec must be positive".to_string());
        }
        if c.max_concurrent_zones == 0 {
            errors.push("controller: max_concurrent_zones must be at least 1".to_string());
        }
        if !(0..MINUTES_PER_DAY).contains(&c.catch_up_min) {
            errors.push(format!(
                "controller: catch_up_min must be 0..{MINUTES_PER_DAY}, got {}",
                c.catch_up_min
            ));
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<u8> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || format!("zones[{i}] (zone {})", z.zone_id);

            // ── Identity ────────────────────────────────────────
            if z.zone_id == 0 || z.zone_id > MAX_ZONES {
                errors.push(format!(
                    "{}: zone_id {} out of range [1, {MAX_ZONES}]",
                    ctx(),
                    z.zone_id
                ));
            } else if !seen_ids.insert(z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Timing ──────────────────────────────────────────
            if z.baseline_sec <= 0 {
                errors.push(format!(
                    "{}: baseline_sec must be positive, got {}",
                    ctx(),
                    z.baseline_sec
                ));
            }

            // ── GPIO pin whitelist (enabled zones only) ─────────
            if !z.enabled {
                continue;
            }
            if !VALID_GPIO_PINS.contains(&z.valve_gpio_pin) {
                errors.push(format!(
                    "{}: valve_gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    z.valve_gpio_pin
                ));
            } else if !seen_pins.insert(z.valve_gpio_pin) {
                errors.push(format!(
                    "{}: valve_gpio_pin {} is already used by another zone",
                    ctx(),
                    z.valve_gpio_pin
                ));
            }
        }
    }

    fn validate_schedules(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<u8> = self.zones.iter().map(|z| z.zone_id).collect();
        let mut seen_keys: HashSet<(u8, Time)> = HashSet::new();

        for (i, s) in self.schedules.iter().enumerate() {
            let ctx = || format!("schedules[{i}] (zone {} @ {})", s.zone_id, s.start);

            if !zone_ids.contains(&s.zone_id) {
                errors.push(format!(
                    "{}: zone_id {} does not match any defined zone",
                    ctx(),
                    s.zone_id
                ));
            }
            match parse_hh_mm(&s.start) {
                None => errors.push(format!("{}: start must be HH:MM (24-hour)", ctx())),
                Some(t) if !seen_keys.insert((s.zone_id, t)) => {
                    errors.push(format!("{}: duplicate start time for zone", ctx()));
                }
                Some(_) => {}
            }
            if s.every_days == 0 {
                errors.push(format!("{}: every_days must be at least 1", ctx()));
            }
            if let Some(m) = s.months.iter().find(|m| !(1..=12).contains(*m)) {
                errors.push(format!("{}: month {m} out of range [1, 12]", ctx()));
            }
            if let Some(d) = s.duration_sec {
                if d <= 0 {
                    errors.push(format!(
                        "{}: duration_sec must be positive, got {d}",
                        ctx()
                    ));
                }
            }
        }
    }

    fn validate_rain_sensor(&self, errors: &mut Vec<String>) {
        let r = &self.rain_sensor;
        match r.kind {
            RainSensorKind::None => {}
            RainSensorKind::Software => {
                if r.threshold_mm <= 0.0 {
                    errors.push(format!(
                        "rain_sensor: threshold_mm must be positive, got {}",
                        r.threshold_mm
                    ));
                }
                if r.reset_hours <= 0 {
                    errors.push(format!(
                        "rain_sensor: reset_hours must be positive, got {}",
                        r.reset_hours
                    ));
                }
            }
            RainSensorKind::Hardware => match r.pin {
                None => errors.push("rain_sensor: hardware sensor requires a pin".to_string()),
                Some(pin) if !VALID_GPIO_PINS.contains(&pin) => errors.push(format!(
                    "rain_sensor: pin {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                )),
                Some(pin) => {
                    let clash = self
                        .zones
                        .iter()
                        .any(|z| z.enabled && z.valve_gpio_pin == pin);
                    if clash {
                        errors.push(format!("rain_sensor: pin {pin} is already used by a zone"));
                    }
                }
            },
        }
        if r.holdover_min < 0 {
            errors.push(format!(
                "rain_sensor: holdover_min must not be negative, got {}",
                r.holdover_min
            ));
        }
    }

    fn validate_adjustment(&self, errors: &mut Vec<String>) {
        let rd = &self.adjustment.rain_deficit;
        if rd.reference_loss_mm <= 0.0 {
            errors.push(format!(
                "adjustment: reference_loss_mm must be positive, got {}",
                rd.reference_loss_mm
            ));
        }
        if rd.wind_threshold_ms < 0.0 {
            errors.push(format!(
                "adjustment: wind_threshold_ms must not be negative, got {}",
                rd.wind_threshold_ms
            ));
        }
        if rd.wind_coefficient < 0.0 {
            errors.push(format!(
                "adjustment: wind_coefficient must not be negative, got {}",
                rd.wind_coefficient
            ));
        }

        let pm = &self.adjustment.penman_monteith;
        if pm.application_mm <= 0.0 {
            errors.push(format!(
                "adjustment: application_mm must be positive, got {}",
                pm.application_mm
            ));
        }
        if pm.trigger_mm < 0.0 {
            errors.push(format!(
                "adjustment: trigger_mm must not be negative, got {}",
                pm.trigger_mm
            ));
        }
    }

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let w = &self.weather;
        if w.min_interval_sec == 0 {
            errors.push("weather: min_interval_sec must be positive".to_string());
        }
        if w.poll_interval_sec < w.min_interval_sec {
            errors.push(format!(
                "weather: poll_interval_sec ({}) is below min_interval_sec ({})",
                w.poll_interval_sec, w.min_interval_sec
            ));
        }
        if w.timeout_sec == 0 {
            errors.push("weather: timeout_sec must be positive".to_string());
        }
        if w.stale_after_min <= 0 {
            errors.push(format!(
                "weather: stale_after_min must be positive, got {}",
                w.stale_after_min
            ));
        }
        if w.anemometer_height_m <= 0.0 {
            errors.push(format!(
                "weather: anemometer_height_m must be positive, got {}",
                w.anemometer_height_m
            ));
        }
    }

    /// Zone table in ascending id order.
    pub fn zone_table(&self) -> Vec<Zone> {
        let mut zones: Vec<Zone> = self
            .zones
            .iter()
            .map(|z| Zone {
                id: z.zone_id,
                name: z.name.clone(),
                enabled: z.enabled,
                baseline_sec: z.baseline_sec,
                gpio_pin: z.valve_gpio_pin as u8,
            })
            .collect();
        zones.sort_by_key(|z| z.id);
        zones
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

/// Upsert every configured zone so run history can reference it.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for z in config.zone_table() {
        db.upsert_zone(&z)
            .await
            .with_context(|| format!("failed to upsert zone {}", z.id))?;
    }

    tracing::info!(
        zones = config.zones.len(),
        schedules = config.schedules.len(),
        model = ?config.adjustment.model,
        rain_sensor = ?config.rain_sensor.kind,
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
