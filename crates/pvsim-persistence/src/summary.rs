//! ---
//! pvsim_section: "04-persistence"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Per-day record files and execution-time log."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use std::path::PathBuf;

use serde::Serialize;

use crate::record::DayRow;

/// Totals of a finalized day, logged for downstream reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaySummary {
    /// Simulated day.
    pub day: u64,
    /// Rows persisted.
    pub rows: usize,
    /// Sum of the signed meter column.
    pub meter_total: i64,
    /// Sum of the PV column.
    pub pv_total: i64,
    /// Sum of the `sum` column.
    pub net_total: i64,
    /// Final record path.
    pub path: PathBuf,
}

impl DaySummary {
    /// Empty summary for `day`.
    pub fn new(day: u64, path: PathBuf) -> Self {
        Self {
            day,
            rows: 0,
            meter_total: 0,
            pv_total: 0,
            net_total: 0,
            path,
        }
    }

    /// Fold one row into the totals.
    pub fn record(&mut self, row: &DayRow) {
        self.rows += 1;
        self.meter_total += row.meter;
        self.pv_total += row.pv;
        self.net_total += row.sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvsim_common::SignConvention;

    #[test]
    fn totals_accumulate() {
        let mut summary = DaySummary::new(2, PathBuf::from("o_day2.csv"));
        summary.record(&DayRow::combine(1, 100, 40, SignConvention::Negated));
        summary.record(&DayRow::combine(2, 50, 60, SignConvention::Negated));
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.meter_total, -150);
        assert_eq!(summary.pv_total, 100);
        assert_eq!(summary.net_total, -50);
    }
}
