//! qmc_wfopt - batched wavefunction optimization for Quantum Monte Carlo
//!
//! This crate provides the correlated-sampling machinery that turns an
//! archived set of Monte Carlo configurations into a reusable cost
//! function over trial-wavefunction parameters: walker crowds for batched
//! sampling, sample stores and record tables, the cost-function evaluator
//! with analytic and finite-difference gradients, and the linear-method
//! generalized eigenproblem.

pub mod conf;
pub mod crowd;
pub mod hamiltonian;
pub mod optimize;
pub mod records;
pub mod reduce;
pub mod store;
pub mod systems;
pub mod wavefunction;

// Re-export commonly used types at crate root
pub use conf::{read_cost_config, ConfigError, CostConfig, GevMode, SamplingMode, TargetEnergyMode};
pub use crowd::{CrowdEstimator, ParticleConfiguration, Walker, WalkerCrowd};
pub use hamiltonian::{Hamiltonian, KINETIC_COMPONENT};
pub use optimize::{CostFunctionEvaluator, GeneralizedEigenproblemBuilder, WEIGHT_SKIP_TOLERANCE};
pub use records::{CostSums, DerivRecords, MomentSums, SampleRecord, SampleRecordTable};
pub use reduce::{DistributedReducer, LocalReducer};
pub use store::{InMemorySampleStore, SampleStore};
pub use systems::{HarmonicHamiltonian, HarmonicModel};
pub use wavefunction::TrialWavefunction;
