//! Cost-function configuration.
//!
//! All optimizer knobs live in one serde struct so a run can be described
//! by a small YAML file, e.g.:
//!
//! ```yaml
//! energy_weight: 0.7
//! variance_weight: 0.3
//! energy_power: 2
//! max_weight: 1.0e6
//! min_effective_fraction: 0.3
//! gev_mixing: 0.25
//! gev_mode: Linear
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Direction of the reweighting exponent.
///
/// The per-sample log-weight is `sign × (lnΨ_free(θ) − lnΨ_free(θ_ref))`
/// with `sign = +1` for `Forward` and `−1` for `Reverse`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMode {
    Forward,
    Reverse,
}

impl SamplingMode {
    pub fn sign(self) -> f64 {
        match self {
            SamplingMode::Forward => 1.0,
            SamplingMode::Reverse => -1.0,
        }
    }
}

/// How the optimization target energy is chosen.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum TargetEnergyMode {
    /// Sample-weighted mean energy of the reference evaluation.
    SampleMean,
    /// Caller-supplied target energy.
    Explicit(f64),
}

/// Which generalized-eigenvalue formulation the mixing coefficient blends.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GevMode {
    /// Energy/variance blend on the left-hand matrix.
    Linear,
    /// H²-normalized blend on the right-hand matrix.
    H2,
}

/// Cost-function and eigenproblem configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CostConfig {
    /// Weight of the reweighted mean-energy term.
    pub energy_weight: f64,
    /// Weight of the reweighted variance term.
    pub variance_weight: f64,
    /// Weight of the unreweighted-variance (URV) cross term.
    pub urv_weight: f64,
    /// Weight of the |E − E_target|^p term.
    pub abs_energy_weight: f64,
    /// Exponent p of the |ΔE|^p term.
    pub energy_power: i32,
    /// Target-energy selection.
    pub target_mode: TargetEnergyMode,
    /// Mixing coefficient between the energy-only and variance-biased
    /// eigenproblem formulations.
    pub gev_mixing: f64,
    /// Formulation the mixing coefficient applies to.
    pub gev_mode: GevMode,
    /// Upper clamp on each normalized reweighting factor.
    pub max_weight: f64,
    /// Fraction of the nominal sample count below which the effective
    /// sample count marks the pass invalid.
    pub min_effective_fraction: f64,
    /// Direction of the reweighting exponent.
    pub sampling_mode: SamplingMode,
    /// Name of a nonlocal Hamiltonian sub-term to carry through
    /// optimization. Unsupported by the batched pass; setting it aborts
    /// there rather than silently dropping the term.
    pub include_nonlocal: Option<String>,
}

impl Default for CostConfig {
    fn default() -> Self {
        Self {
            energy_weight: 1.0,
            variance_weight: 0.0,
            urv_weight: 0.0,
            abs_energy_weight: 0.0,
            energy_power: 2,
            target_mode: TargetEnergyMode::SampleMean,
            gev_mixing: 0.0,
            gev_mode: GevMode::Linear,
            max_weight: 1.0e6,
            min_effective_fraction: 0.3,
            sampling_mode: SamplingMode::Forward,
            include_nonlocal: None,
        }
    }
}

/// Failure while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Read a `CostConfig` from a YAML file. Missing keys take their defaults.
pub fn read_cost_config(filename: &str) -> Result<CostConfig, ConfigError> {
    let file = std::fs::File::open(filename)?;
    let reader = std::io::BufReader::new(file);
    let config: CostConfig = serde_yaml::from_reader(reader)?;
    Ok(config)
}
