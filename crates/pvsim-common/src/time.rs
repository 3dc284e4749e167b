//! ---
//! pvsim_section: "01-core-functionality"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Shared primitives and utilities for the meter and PV services."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use chrono::Utc;

/// Number of seconds in one simulated day.
pub const SECONDS_PER_DAY: u32 = 24 * 60 * 60;

/// Convert a wall-clock time of day into a fraction of the day.
///
/// `fraction_of_day(24, 0, 0)` is exactly `1.0`; values past midnight are not
/// wrapped.
pub fn fraction_of_day(hour: u32, minute: u32, second: u32) -> f64 {
    let seconds = u64::from(hour) * 3600 + u64::from(minute) * 60 + u64::from(second);
    seconds as f64 / f64::from(SECONDS_PER_DAY)
}

/// Convert a (possibly fractional) hour value into a fraction of the day.
pub fn hours_to_fraction(hours: f64) -> f64 {
    hours / 24.0
}

/// Number of iterations in a simulated day for the given step length.
///
/// Uses integer floor division, so a step that does not divide the day evenly
/// loses the trailing partial step.
pub fn total_iterations(time_iter_seconds: u32) -> u32 {
    if time_iter_seconds == 0 {
        return 0;
    }
    SECONDS_PER_DAY / time_iter_seconds
}

/// Current unix timestamp in whole seconds.
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// Position inside a simulated day, expressed as a fraction in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default)]
pub struct SimulatedClock(f64);

impl SimulatedClock {
    /// Midnight at the start of the simulated day.
    pub const MIDNIGHT: SimulatedClock = SimulatedClock(0.0);

    /// Build a clock from an hour/minute/second triple.
    pub fn from_hms(hour: u32, minute: u32, second: u32) -> Self {
        Self(fraction_of_day(hour, minute, second))
    }

    /// Clock value reached at `iteration` when every iteration lasts `time_iter_seconds`.
    pub fn at_iteration(iteration: u32, time_iter_seconds: u32) -> Self {
        let seconds = u64::from(iteration) * u64::from(time_iter_seconds);
        Self(seconds as f64 / f64::from(SECONDS_PER_DAY))
    }

    /// Raw fraction of the day.
    pub fn fraction(self) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fraction_of_day_bounds() {
        assert_eq!(fraction_of_day(0, 0, 0), 0.0);
        assert_eq!(fraction_of_day(12, 0, 0), 0.5);
        assert_eq!(fraction_of_day(24, 0, 0), 1.0);
    }

    #[test]
    fn seconds_only_matches_hour_form() {
        assert_eq!(fraction_of_day(0, 0, 3600), fraction_of_day(1, 0, 0));
        assert_eq!(hours_to_fraction(6.0), fraction_of_day(6, 0, 0));
    }

    #[test]
    fn one_minute_steps_give_1440_iterations() {
        assert_eq!(total_iterations(60), 1440);
        assert_eq!(total_iterations(3600), 24);
        assert_eq!(total_iterations(0), 0);
    }

    #[test]
    fn uneven_step_truncates() {
        // 86400 / 7 = 12342.857..., last partial step is dropped.
        assert_eq!(total_iterations(7), 12342);
    }

    #[test]
    fn first_iteration_fraction() {
        let clock = SimulatedClock::at_iteration(1, 60);
        assert!((clock.fraction() - 60.0 / 86_400.0).abs() < 1e-12);
        assert!((clock.fraction() - 0.000694).abs() < 1e-6);
        assert_eq!(SimulatedClock::at_iteration(1440, 60).fraction(), 1.0);
        assert_eq!(SimulatedClock::from_hms(12, 0, 0).fraction(), 0.5);
        assert_eq!(SimulatedClock::MIDNIGHT.fraction(), 0.0);
    }
}
