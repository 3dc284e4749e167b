//! ---
//! pvsim_section: "03-curve-model"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter and solar reading curves."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use pvsim_common::time::hours_to_fraction;
use pvsim_common::AppConfig;

use crate::{CurveError, Result};

/// Immutable calibration of both curves. Solar points are day fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveParameters {
    pub pv_min: i64,
    pub pv_max: i64,
    pub sunrise_start: f64,
    pub sunrise_end: f64,
    pub zenith: f64,
    pub sundown_start: f64,
    pub sundown_end: f64,
    pub light_eff_lw: f64,
    pub light_eff_std: f64,
    pub max_power: f64,
    /// Consumption peak in whole hours.
    pub max_consume: u32,
}

impl CurveParameters {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let curve = &config.curve;
        let params = Self {
            pv_min: config.reading.pv_min,
            pv_max: config.reading.pv_max,
            sunrise_start: hours_to_fraction(curve.sunrise_start),
            sunrise_end: hours_to_fraction(curve.sunrise_end),
            zenith: hours_to_fraction(curve.zenith),
            sundown_start: hours_to_fraction(curve.sundown_start),
            sundown_end: hours_to_fraction(curve.sundown_end),
            light_eff_lw: curve.light_eff_lw,
            light_eff_std: curve.light_eff_std,
            max_power: curve.max_power,
            max_consume: curve.max_consume,
        };
        params.check()?;
        Ok(params)
    }

    /// The five solar calibration points in chronological order.
    pub fn solar_points(&self) -> [f64; 5] {
        [
            self.sunrise_start,
            self.sunrise_end,
            self.zenith,
            self.sundown_start,
            self.sundown_end,
        ]
    }

    fn check(&self) -> Result<()> {
        if self.pv_min > self.pv_max {
            return Err(CurveError::InvalidParameters(format!(
                "pv_min {} exceeds pv_max {}",
                self.pv_min, self.pv_max
            )));
        }
        if self.solar_points().iter().any(|p| !p.is_finite()) {
            return Err(CurveError::InvalidParameters(
                "solar calibration points must be finite".into(),
            ));
        }
        Ok(())
    }
}

impl Default for CurveParameters {
    fn default() -> Self {
        Self {
            pv_min: 0,
            pv_max: 9000,
            sunrise_start: hours_to_fraction(6.0),
            sunrise_end: hours_to_fraction(8.0),
            zenith: hours_to_fraction(14.0),
            sundown_start: hours_to_fraction(20.0),
            sundown_end: hours_to_fraction(21.0),
            light_eff_lw: 0.1,
            light_eff_std: 0.8125,
            max_power: 9000.0,
            max_consume: 18,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_default_parameters() {
        let params = CurveParameters::from_config(&AppConfig::default()).unwrap();
        assert_eq!(params, CurveParameters::default());
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let mut config = AppConfig::default();
        config.reading.pv_min = 10;
        config.reading.pv_max = 0;
        assert!(matches!(
            CurveParameters::from_config(&config),
            Err(CurveError::InvalidParameters(_))
        ));
    }
}
