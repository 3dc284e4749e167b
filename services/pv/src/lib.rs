//! ---
//! pvsim_section: "05-services"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "PV aggregator service."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
//! PV service library. [`PvAggregator`] owns the consumer loop and the open
//! day record; the binary only loads configuration and wires the transport.

pub mod aggregator;

pub use aggregator::{AggregatorSettings, AggregatorStats, DayState, Disposition, PvAggregator};
