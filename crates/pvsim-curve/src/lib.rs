//! ---
//! pvsim_section: "03-curve-model"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter and solar reading curves."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
//! Side-effect-free generation of bounded integer readings for a position in
//! the simulated day. The meter side follows a two-segment linear consumption
//! profile, the PV side a line/parabola/line solar profile; both can be
//! swapped for a uniform random reading.

pub mod meter;
pub mod model;
pub mod parabola;
pub mod params;
pub mod solar;

/// Shared result type for curve evaluation.
pub type Result<T> = std::result::Result<T, CurveError>;

/// Failures raised while building or evaluating a curve.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CurveError {
    /// The randomized consumption boundary landed on midnight, making the
    /// corresponding meter segment vertical.
    #[error("meter {segment} segment is degenerate at boundary fraction {boundary}")]
    DegenerateBoundary {
        segment: meter::MeterSegment,
        boundary: f64,
    },
    /// Two of the three parabola support points share an x coordinate.
    #[error("parabola support points must have distinct x values: {0:?}")]
    DegenerateParabola([f64; 3]),
    /// Parameters that cannot describe a curve at all.
    #[error("invalid curve parameters: {0}")]
    InvalidParameters(String),
}

pub use meter::{MeterCurve, MeterSegment};
pub use model::{CurveModel, ReadingStrategy};
pub use parabola::Parabola;
pub use params::CurveParameters;
pub use solar::{SolarCurve, SolarSegment};
