//! ---
//! pvsim_section: "05-services"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter emitter service."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
//! Meter service library. The binary wires configuration, logging and the
//! AMQP transport around [`MeterEmitter`].

pub mod emitter;

pub use emitter::{EmitterSession, EmitterSettings, EmitterState, EmitterStats, MeterEmitter};
