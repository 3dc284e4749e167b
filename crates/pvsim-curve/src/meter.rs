//! ---
//! pvsim_section: "03-curve-model"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter and solar reading curves."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::fmt;
use std::ops::RangeInclusive;

use pvsim_common::time::fraction_of_day;
use rand::Rng;

use crate::params::CurveParameters;
use crate::{CurveError, Result};

/// Share of `pv_max` reached at the consumption boundary.
const PEAK_SHARE: f64 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterSegment {
    /// Rising line through the origin.
    Morning,
    /// Falling line reaching zero at midnight.
    Evening,
}

impl fmt::Display for MeterSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterSegment::Morning => f.write_str("morning"),
            MeterSegment::Evening => f.write_str("evening"),
        }
    }
}

/// Two-segment consumption profile.
///
/// The boundary between the segments is drawn uniformly from the whole hours
/// `max_consume - 2 ..= max_consume + 2` on every evaluation, so consecutive
/// readings carry some jitter in their slope.
#[derive(Debug, Clone, PartialEq)]
pub struct MeterCurve {
    pv_min: i64,
    pv_max: i64,
    max_consume: u32,
}

impl MeterCurve {
    pub fn new(params: &CurveParameters) -> Self {
        Self {
            pv_min: params.pv_min,
            pv_max: params.pv_max,
            max_consume: params.max_consume,
        }
    }

    /// Hours the boundary is drawn from.
    pub fn boundary_window(&self) -> RangeInclusive<u32> {
        self.max_consume.saturating_sub(2)..=self.max_consume + 2
    }

    /// Draw a boundary and express it as a day fraction.
    pub fn draw_boundary<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let hour = rng.gen_range(self.boundary_window());
        fraction_of_day(hour, 0, 0)
    }

    /// Segment used for the day fraction `x`. Selection follows the fixed
    /// `max_consume` hour, not the drawn boundary. The split is on the day
    /// fraction, so it lands at the same wall-clock hour for any iteration
    /// length rather than at iteration `max_consume * 60`.
    pub fn segment_for(&self, x: f64) -> MeterSegment {
        if x <= fraction_of_day(self.max_consume, 0, 0) {
            MeterSegment::Morning
        } else {
            MeterSegment::Evening
        }
    }

    pub fn morning(&self, x: f64, boundary: f64) -> Result<f64> {
        if boundary == 0.0 {
            return Err(CurveError::DegenerateBoundary {
                segment: MeterSegment::Morning,
                boundary,
            });
        }
        let slope = PEAK_SHARE * self.pv_max as f64 / boundary;
        Ok(slope * x)
    }

    pub fn evening(&self, x: f64, boundary: f64) -> Result<f64> {
        if boundary == 1.0 {
            return Err(CurveError::DegenerateBoundary {
                segment: MeterSegment::Evening,
                boundary,
            });
        }
        let slope = -PEAK_SHARE * self.pv_max as f64 / (1.0 - boundary);
        let intercept = -slope;
        Ok(slope * x + intercept)
    }

    /// Reading at `x` for a given boundary: truncated towards zero and clamped
    /// to `[pv_min, pv_max]`.
    pub fn reading_at(&self, x: f64, boundary: f64) -> Result<i64> {
        let raw = match self.segment_for(x) {
            MeterSegment::Morning => self.morning(x, boundary)?,
            MeterSegment::Evening => self.evening(x, boundary)?,
        };
        Ok((raw as i64).clamp(self.pv_min, self.pv_max))
    }

    /// Reading at `x` with a freshly drawn boundary.
    pub fn sample<R: Rng + ?Sized>(&self, x: f64, rng: &mut R) -> Result<i64> {
        let boundary = self.draw_boundary(rng);
        self.reading_at(x, boundary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn curve() -> MeterCurve {
        MeterCurve::new(&CurveParameters::default())
    }

    #[test]
    fn segments_meet_at_the_boundary() {
        let curve = curve();
        for hour in curve.boundary_window() {
            let b = fraction_of_day(hour, 0, 0);
            let morning = curve.morning(b, b).unwrap();
            let evening = curve.evening(b, b).unwrap();
            assert!((morning - evening).abs() < 1e-9, "hour {hour}: {morning} vs {evening}");
            assert!((morning - 6750.0).abs() < 1e-9);
        }
    }

    #[test]
    fn segment_selection_uses_fixed_peak_hour() {
        let curve = curve();
        assert_eq!(curve.segment_for(0.0), MeterSegment::Morning);
        assert_eq!(curve.segment_for(fraction_of_day(18, 0, 0)), MeterSegment::Morning);
        assert_eq!(curve.segment_for(fraction_of_day(18, 1, 0)), MeterSegment::Evening);
        assert_eq!(curve.segment_for(1.0), MeterSegment::Evening);
    }

    #[test]
    fn split_hour_holds_for_quarter_hour_iterations() {
        use pvsim_common::SimulatedClock;

        let curve = curve();
        let at = |iteration| SimulatedClock::at_iteration(iteration, 900).fraction();
        assert_eq!(curve.segment_for(at(72)), MeterSegment::Morning);
        assert_eq!(curve.segment_for(at(73)), MeterSegment::Evening);
    }

    #[test]
    fn evening_reaches_zero_at_midnight() {
        let curve = curve();
        let b = fraction_of_day(18, 0, 0);
        assert_eq!(curve.reading_at(1.0, b).unwrap(), 0);
        assert_eq!(curve.reading_at(0.0, b).unwrap(), 0);
    }

    #[test]
    fn readings_are_clamped_to_bounds() {
        let params = CurveParameters {
            pv_min: 1000,
            pv_max: 5000,
            ..CurveParameters::default()
        };
        let curve = MeterCurve::new(&params);
        let b = fraction_of_day(16, 0, 0);
        assert_eq!(curve.reading_at(0.0, b).unwrap(), 1000);
        // Morning line keeps rising past the boundary until the segment switch.
        assert_eq!(curve.reading_at(fraction_of_day(18, 0, 0), b).unwrap(), 4218);
    }

    #[test]
    fn zero_boundary_is_reported() {
        let params = CurveParameters {
            max_consume: 1,
            ..CurveParameters::default()
        };
        let curve = MeterCurve::new(&params);
        assert_eq!(curve.boundary_window(), 0..=3);
        let err = curve.reading_at(0.01, 0.0).unwrap_err();
        assert_eq!(
            err,
            CurveError::DegenerateBoundary {
                segment: MeterSegment::Morning,
                boundary: 0.0
            }
        );
    }

    #[test]
    fn full_day_boundary_is_reported() {
        let curve = curve();
        let err = curve.evening(0.9, 1.0).unwrap_err();
        assert!(matches!(
            err,
            CurveError::DegenerateBoundary {
                segment: MeterSegment::Evening,
                ..
            }
        ));
    }

    #[test]
    fn drawn_boundary_stays_in_window() {
        let curve = curve();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..200 {
            let b = curve.draw_boundary(&mut rng);
            assert!(b >= fraction_of_day(16, 0, 0) && b <= fraction_of_day(20, 0, 0));
        }
    }

    proptest! {
        #[test]
        fn sampled_readings_respect_bounds(
            seed in any::<u64>(),
            x in 0.0f64..=1.0,
            pv_min in 0i64..4000,
            span in 0i64..6000,
        ) {
            let params = CurveParameters {
                pv_min,
                pv_max: pv_min + span,
                ..CurveParameters::default()
            };
            let curve = MeterCurve::new(&params);
            let mut rng = StdRng::seed_from_u64(seed);
            let value = curve.sample(x, &mut rng).unwrap();
            prop_assert!(value >= params.pv_min && value <= params.pv_max);
        }
    }
}
