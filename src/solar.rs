//! Solar Geometry
//!
//! Sun position and irradiance decomposition used by the feature builder.
//! The formulas are simplified (no atmospheric refraction, no equation of
//! time) which is adequate for ML features but not for panel tracking.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// Sun elevation angle in degrees for a UTC timestamp and location.
///
/// Negative values mean the sun is below the horizon. Solar time is
/// approximated as `hour_of_day + longitude / 15`; this crude longitudinal
/// correction is part of the trained feature definition and must stay in
/// sync with any persisted model.
pub fn sun_elevation(timestamp: i64, latitude: f64, longitude: f64) -> f64 {
    let dt: DateTime<Utc> = DateTime::from_timestamp(timestamp, 0).unwrap_or_default();

    let day_of_year = dt.ordinal() as f64;

    // Solar declination, simplified seasonal model
    let declination = -23.45 * (360.0 / 365.0 * (day_of_year + 10.0)).to_radians().cos();

    let hour = f64::from(dt.hour()) + f64::from(dt.minute()) / 60.0;
    let solar_time = hour + longitude / 15.0;
    let hour_angle = 15.0 * (solar_time - 12.0);

    let lat_rad = latitude.to_radians();
    let dec_rad = declination.to_radians();
    let ha_rad = hour_angle.to_radians();

    let sin_elevation = lat_rad.sin() * dec_rad.sin() + lat_rad.cos() * dec_rad.cos() * ha_rad.cos();

    // Clamp to [-1, 1] to avoid NaN from asin
    sin_elevation.clamp(-1.0, 1.0).asin().to_degrees()
}

/// Estimate diffuse horizontal irradiance from GHI and cloud cover.
///
/// Used when a weather source reports no measured DHI. Derives a clearness
/// index proxy from cloud cover alone and applies the Erbs piecewise model
/// for the diffuse fraction. The result is always within `[0, ghi]`.
pub fn estimate_dhi(ghi: f64, cloud_cover_pct: f64, sun_elevation: f64) -> f64 {
    if sun_elevation <= 0.0 || ghi <= 0.0 {
        return 0.0;
    }

    // Clearness index proxy from cloud cover (heuristic, not a measured kt)
    let kt = (1.0 - cloud_cover_pct / 100.0 * 0.8).max(0.1);

    // Erbs diffuse-fraction correlation
    let fraction = if kt <= 0.22 {
        1.0 - 0.09 * kt
    } else if kt <= 0.80 {
        0.9511 - 0.1604 * kt + 4.388 * kt.powi(2) - 16.638 * kt.powi(3) + 12.336 * kt.powi(4)
    } else {
        0.165
    };

    ghi * fraction
}
