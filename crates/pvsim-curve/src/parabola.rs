//! ---
//! pvsim_section: "03-curve-model"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter and solar reading curves."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use crate::{CurveError, Result};

/// Quadratic `a*x^2 + b*x + c`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Parabola {
    pub a: f64,
    pub b: f64,
    pub c: f64,
}

impl Parabola {
    /// Fit the unique parabola passing through three points with distinct x values.
    pub fn through(p1: (f64, f64), p2: (f64, f64), p3: (f64, f64)) -> Result<Self> {
        let (x1, y1) = p1;
        let (x2, y2) = p2;
        let (x3, y3) = p3;

        let denom = (x1 - x2) * (x1 - x3) * (x2 - x3);
        if denom == 0.0 || !denom.is_finite() {
            return Err(CurveError::DegenerateParabola([x1, x2, x3]));
        }

        let a = (x3 * (y2 - y1) + x2 * (y1 - y3) + x1 * (y3 - y2)) / denom;
        let b = (x3 * x3 * (y1 - y2) + x2 * x2 * (y3 - y1) + x1 * x1 * (y2 - y3)) / denom;
        let c = (x2 * x3 * (x2 - x3) * y1 + x3 * x1 * (x3 - x1) * y2 + x1 * x2 * (x1 - x2) * y3)
            / denom;
        Ok(Self { a, b, c })
    }

    pub fn eval(&self, x: f64) -> f64 {
        (self.a * x + self.b) * x + self.c
    }

    /// Turning point, or `None` for a straight line.
    pub fn vertex(&self) -> Option<(f64, f64)> {
        if self.a == 0.0 {
            return None;
        }
        let x = -self.b / (2.0 * self.a);
        Some((x, self.eval(x)))
    }
}
