//! ---
//! pvsim_section: "03-curve-model"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter and solar reading curves."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use crate::parabola::Parabola;
use crate::params::CurveParameters;
use crate::{CurveError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarSegment {
    Dark,
    Sunrise,
    Daylight,
    Sundown,
}

/// Straight line `slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Line {
    slope: f64,
    intercept: f64,
}

impl Line {
    fn eval(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Three-segment photovoltaic output profile over the day.
///
/// Zero before sunrise and after sundown, linear ramps at both ends and a
/// parabola through the zenith in between. The output is not clamped to the
/// meter bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct SolarCurve {
    sunrise_start: f64,
    sunrise_end: f64,
    sundown_start: f64,
    sundown_end: f64,
    morning: Line,
    daylight: Parabola,
    evening: Line,
}

impl SolarCurve {
    pub fn new(params: &CurveParameters) -> Result<Self> {
        let [sunrise_start, sunrise_end, zenith, sundown_start, sundown_end] =
            params.solar_points();
        if sunrise_end <= sunrise_start || sundown_end <= sundown_start {
            return Err(CurveError::InvalidParameters(
                "sunrise and sundown ramps must have positive length".into(),
            ));
        }

        let morning_slope = params.light_eff_lw * params.max_power / (sunrise_end - sunrise_start);
        let morning = Line {
            slope: morning_slope,
            intercept: -morning_slope * sunrise_start,
        };

        // The sundown ramp scales with the sunrise_end fraction.
        let evening_slope = -sunrise_end * params.max_power * params.light_eff_lw
            / (sundown_end - sundown_start);
        let evening = Line {
            slope: evening_slope,
            intercept: -evening_slope * sundown_end,
        };

        let daylight = Parabola::through(
            (sunrise_end, morning.eval(sunrise_end)),
            (zenith, params.light_eff_std * params.max_power),
            (sundown_start, evening.eval(sundown_start)),
        )?;

        Ok(Self {
            sunrise_start,
            sunrise_end,
            sundown_start,
            sundown_end,
            morning,
            daylight,
            evening,
        })
    }

    pub fn segment_for(&self, x: f64) -> SolarSegment {
        if x < self.sunrise_start || x > self.sundown_end {
            SolarSegment::Dark
        } else if x <= self.sunrise_end {
            SolarSegment::Sunrise
        } else if x < self.sundown_start {
            SolarSegment::Daylight
        } else {
            SolarSegment::Sundown
        }
    }

    /// Continuous output at day fraction `x`.
    pub fn value_at(&self, x: f64) -> f64 {
        match self.segment_for(x) {
            SolarSegment::Dark => 0.0,
            SolarSegment::Sunrise => self.morning.eval(x),
            SolarSegment::Daylight => self.daylight.eval(x),
            SolarSegment::Sundown => self.evening.eval(x),
        }
    }

    /// Output at day fraction `x`, truncated towards zero.
    pub fn reading_at(&self, x: f64) -> i64 {
        self.value_at(x) as i64
    }

    pub fn parabola(&self) -> &Parabola {
        &self.daylight
    }
}
