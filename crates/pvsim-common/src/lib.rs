//! ---
//! pvsim_section: "01-core-functionality"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Shared primitives and utilities for the meter and PV services."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
//! Core shared primitives for the PV-Sim workspace.
//! This crate exposes configuration loading, logging bootstrap, the simulated
//! day clock, and the shutdown signal consumed by both services.

pub mod config;
pub mod lifecycle;
pub mod logging;
pub mod time;

pub use config::{
    AggregatorConfig, AppConfig, BrokerConfig, CurveConfig, EmitterConfig, LoggingConfig,
    ReadingConfig, RetryConfig, SignConvention, StrategyKind,
};
pub use lifecycle::{
    cancelled, is_cancelled, shutdown_channel, shutdown_signal, sleep_or_cancel,
    spawn_shutdown_listener,
};
pub use logging::{init_tracing, LogFormat};
pub use time::{fraction_of_day, total_iterations, unix_now, SimulatedClock, SECONDS_PER_DAY};
