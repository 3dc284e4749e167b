//! ---
//! pvsim_section: "03-curve-model"
//! pvsim_subsection: "module"
//! pvsim_type: "source"
//! pvsim_scope: "code"
//! pvsim_description: "Meter and solar reading curves."
//! pvsim_version: "v0.1.0"
//! pvsim_owner: "tbd"
//! ---
use pvsim_common::{AppConfig, SimulatedClock, StrategyKind};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::meter::MeterCurve;
use crate::params::CurveParameters;
use crate::solar::SolarCurve;
use crate::Result;

/// How readings are produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingStrategy {
    Curve { meter: MeterCurve, solar: SolarCurve },
    Random { min: i64, max: i64 },
}

impl ReadingStrategy {
    pub fn build(kind: StrategyKind, params: &CurveParameters) -> Result<Self> {
        Ok(match kind {
            StrategyKind::Curve => ReadingStrategy::Curve {
                meter: MeterCurve::new(params),
                solar: SolarCurve::new(params)?,
            },
            StrategyKind::Random => ReadingStrategy::Random {
                min: params.pv_min,
                max: params.pv_max,
            },
        })
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            ReadingStrategy::Curve { .. } => StrategyKind::Curve,
            ReadingStrategy::Random { .. } => StrategyKind::Random,
        }
    }
}

/// Reading generator owned by one service loop.
#[derive(Debug)]
pub struct CurveModel {
    strategy: ReadingStrategy,
    rng: StdRng,
}

impl CurveModel {
    /// Create a model; without a seed the generator is seeded from the OS.
    pub fn new(strategy: ReadingStrategy, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { strategy, rng }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let params = CurveParameters::from_config(config)?;
        let strategy = ReadingStrategy::build(config.reading.strategy, &params)?;
        debug!(strategy = ?strategy.kind(), seeded = config.reading.seed.is_some(), "curve model ready");
        Ok(Self::new(strategy, config.reading.seed))
    }

    pub fn strategy(&self) -> &ReadingStrategy {
        &self.strategy
    }

    /// Household consumption at `clock`, always inside `[pv_min, pv_max]`.
    pub fn meter_value(&mut self, clock: SimulatedClock) -> Result<i64> {
        match &self.strategy {
            ReadingStrategy::Curve { meter, .. } => meter.sample(clock.fraction(), &mut self.rng),
            ReadingStrategy::Random { min, max } => Ok(self.rng.gen_range(*min..=*max)),
        }
    }

    /// Photovoltaic output at `clock`.
    pub fn solar_value(&mut self, clock: SimulatedClock) -> i64 {
        match &self.strategy {
            ReadingStrategy::Curve { solar, .. } => solar.reading_at(clock.fraction()),
            ReadingStrategy::Random { min, max } => self.rng.gen_range(*min..=*max),
        }
    }
}
