//! Hamiltonian capability trait.
//!
//! Local energies are evaluated from the particle positions and the
//! log-derivatives of the trial wavefunction, so a Hamiltonian never needs
//! the wavefunction object itself. The optimizer additionally needs a named
//! sub-term lookup to build the auxiliary (kinetic-only) Hamiltonian used
//! during correlated-sampling passes, where the parameter-independent
//! potential is replayed from the reference records instead of re-evaluated.

use nalgebra::Vector3;

/// Name of the kinetic sub-term every Hamiltonian is expected to expose.
pub const KINETIC_COMPONENT: &str = "Kinetic";

/// A local-energy evaluator over a fixed particle configuration.
pub trait Hamiltonian: Clone {
    /// Local energy HΨ/Ψ at `r`, given the per-particle gradient and
    /// Laplacian of ln|Ψ| at `r`.
    fn evaluate(&self, r: &[Vector3<f64>], grad: &[Vector3<f64>], lap: &[f64]) -> f64;

    /// The parameter-independent part of the local energy (the local
    /// potential). Constant across reweighting passes for a stored sample.
    fn local_potential(&self, r: &[Vector3<f64>]) -> f64;

    /// Look up a named sub-term and return it as a standalone Hamiltonian,
    /// or `None` if no term carries that name.
    fn component(&self, name: &str) -> Option<Self>;
}
