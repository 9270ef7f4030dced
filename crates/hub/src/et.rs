//! FAO-56 Penman-Monteith reference evapotranspiration (ET0), daily step.
//!
//! Temperatures in °C, humidity in percent, wind in m/s, radiation in
//! MJ/m²/day, pressure in kPa, elevation in metres. Soil heat flux is taken
//! as zero, as FAO-56 recommends for daily periods.

use std::f64::consts::PI;

/// Solar constant, MJ/m²/min.
const GSC: f64 = 0.0820;
/// Stefan-Boltzmann constant, MJ/K⁴/m²/day.
const SIGMA: f64 = 4.903e-9;
/// Reference grass albedo.
const ALBEDO: f64 = 0.23;

/// Inputs for one day at one station.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DailyWeather {
    pub t_min: f64,
    pub t_max: f64,
    pub rh_min: f64,
    pub rh_max: f64,
    /// Wind speed at 2 m.
    pub wind_2m: f64,
    /// Measured incoming solar radiation; clear-sky estimate when `None`.
    pub solar_mj: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Site {
    pub latitude_deg: f64,
    pub elevation_m: f64,
}

pub fn saturation_vapour_pressure(t: f64) -> f64 {
    0.6108 * (17.27 * t / (t + 237.3)).exp()
}

/// Slope of the saturation vapour pressure curve (Δ), kPa/°C.
pub fn vapour_curve_slope(t: f64) -> f64 {
    4098.0 * saturation_vapour_pressure(t) / (t + 237.3).powi(2)
}

pub fn atmospheric_pressure(elevation_m: f64) -> f64 {
    101.3 * ((293.0 - 0.0065 * elevation_m) / 293.0).powf(5.26)
}

/// Psychrometric constant (γ), kPa/°C.
pub fn psychrometric_constant(pressure_kpa: f64) -> f64 {
    0.000665 * pressure_kpa
}

/// Convert wind measured at `height_m` to the 2 m reference height.
pub fn wind_at_2m(speed: f64, height_m: f64) -> f64 {
    if (height_m - 2.0).abs() < f64::EPSILON {
        return speed;
    }
    speed * 4.87 / (67.8 * height_m - 5.42).ln()
}

pub fn watts_to_mj_per_day(w_m2: f64) -> f64 {
    w_m2 * 0.0864
}

/// Extraterrestrial radiation (Ra) for a latitude and day of year.
pub fn extraterrestrial_radiation(latitude_deg: f64, day_of_year: u16) -> f64 {
    let phi = latitude_deg.to_radians();
    let j = day_of_year as f64;
    let dr = 1.0 + 0.033 * (2.0 * PI * j / 365.0).cos();
    let delta = 0.409 * (2.0 * PI * j / 365.0 - 1.39).sin();
    // Clamped so polar day/night does not produce NaN.
    let ws = (-phi.tan() * delta.tan()).clamp(-1.0, 1.0).acos();

    24.0 * 60.0 / PI
        * GSC
        * dr
        * (ws * phi.sin() * delta.sin() + phi.cos() * delta.cos() * ws.sin())
}

/// Clear-sky radiation (Rso).
pub fn clear_sky_radiation(ra: f64, elevation_m: f64) -> f64 {
    (0.75 + 2e-5 * elevation_m) * ra
}

/// Net longwave radiation (Rnl).
fn net_longwave(d: &DailyWeather, ea: f64, rs: f64, rso: f64) -> f64 {
    let t4 = 0.5 * ((d.t_max + 273.16).powi(4) + (d.t_min + 273.16).powi(4));
    let relative = if rso > 0.0 {
        (rs / rso).clamp(0.25, 1.0)
    } else {
        1.0
    };
    SIGMA * t4 * (0.34 - 0.14 * ea.max(0.0).sqrt()) * (1.35 * relative - 0.35)
}

/// Daily reference evapotranspiration in mm/day, never negative.
pub fn reference_et0(d: &DailyWeather, site: Site, day_of_year: u16) -> f64 {
    let t_mean = 0.5 * (d.t_min + d.t_max);
    let delta = vapour_curve_slope(t_mean);
    let gamma = psychrometric_constant(atmospheric_pressure(site.elevation_m));

    let es = 0.5 * (saturation_vapour_pressure(d.t_min) + saturation_vapour_pressure(d.t_max));
    let ea = 0.5
        * (saturation_vapour_pressure(d.t_min) * d.rh_max / 100.0
            + saturation_vapour_pressure(d.t_max) * d.rh_min / 100.0);

    let ra = extraterrestrial_radiation(site.latitude_deg, day_of_year);
    let rso = clear_sky_radiation(ra, site.elevation_m);
    let rs = d.solar_mj.unwrap_or(rso);
    let rn = (1.0 - ALBEDO) * rs - net_longwave(d, ea, rs, rso);

    let u2 = d.wind_2m.max(0.0);
    let radiation = 0.408 * delta * rn;
    let aerodynamic = gamma * 900.0 / (t_mean + 273.0) * u2 * (es - ea).max(0.0);
    let et0 = (radiation + aerodynamic) / (delta + gamma * (1.0 + 0.34 * u2));

    if et0.is_finite() {
        et0.max(0.0)
    } else {
        0.0
    }
}

// ===========================================================================
// Tests
// ===========================================================================
