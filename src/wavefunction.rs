//! Trial-wavefunction capability trait for correlated-sampling optimization.
//!
//! The optimizer never evaluates a wavefunction directly; it works through
//! this trait, which splits ln|Ψ| into a *fixed* part (no optimizable
//! parameters) and a *free* part (everything the optimizer may change).
//! Only the free part has to be recomputed when the parameters move, which
//! is what makes reweighting an archived sample cheap.

use nalgebra::Vector3;

/// A parameterized trial wavefunction evaluated on a fixed particle count.
///
/// `Clone` stands in for the cloning capability of the evaluator's
/// per-sample context arena: a clone must carry independent scratch state
/// but share the same parameter values as its source.
pub trait TrialWavefunction: Clone {
    /// Number of particles the wavefunction is defined over.
    fn num_particles(&self) -> usize;

    /// Number of optimizable parameters.
    fn num_params(&self) -> usize;

    /// Current parameter values.
    fn params(&self) -> Vec<f64>;

    /// Replace the optimizable parameters.
    fn reset_parameters(&mut self, params: &[f64]);

    /// Enable parameter-derivative tracking for an optimization run.
    fn start_optimization(&mut self);

    /// Disable parameter-derivative tracking.
    fn stop_optimization(&mut self);

    /// Full setup evaluation at the reference parameters.
    ///
    /// Writes the per-particle gradient and Laplacian of the *fixed* part of
    /// ln|Ψ| into `fixed_grad`/`fixed_lap` (these are archived and reused by
    /// every later reweighting pass) and returns
    /// `(ln|Ψ_fixed|, ln|Ψ_free|)`.
    fn evaluate_delta_log_setup(
        &self,
        r: &[Vector3<f64>],
        fixed_grad: &mut [Vector3<f64>],
        fixed_lap: &mut [f64],
    ) -> (f64, f64);

    /// Free-part evaluation under the current parameters.
    ///
    /// Writes the per-particle gradient and Laplacian of the *free* part of
    /// ln|Ψ| into `grad`/`lap` and returns ln|Ψ_free|. Together with the
    /// archived fixed-part derivatives this reconstructs the full
    /// log-derivatives without touching the fixed factors.
    fn evaluate_delta_log(
        &self,
        r: &[Vector3<f64>],
        grad: &mut [Vector3<f64>],
        lap: &mut [f64],
    ) -> f64;

    /// Parameter derivatives at the current parameters.
    ///
    /// Fills `dlogpsi[i] = ∂ ln|Ψ| / ∂θ_i` and
    /// `dhpsi[i] = ∂ (HΨ/Ψ) / ∂θ_i` evaluated at `r`.
    fn parameter_derivatives(&self, r: &[Vector3<f64>], dlogpsi: &mut [f64], dhpsi: &mut [f64]);
}
