//! Batched walker container.
//!
//! A crowd is the ephemeral per-block batch of walkers evaluated together.
//! It holds non-owning references to walkers (and their paired
//! configuration, wavefunction and Hamiltonian objects, which stay owned by
//! the driving loop) plus parallel per-walker result vectors. The batching
//! discipline here fixes the shape of every downstream per-sample array:
//! each result vector always matches the walker count, and a mismatch is
//! repaired by resizing, never reported as an error.

use nalgebra::Vector3;

use crate::hamiltonian::Hamiltonian;
use crate::wavefunction::TrialWavefunction;

/// One Monte Carlo sample point: a particle configuration, a persisted
/// wavefunction scratch buffer, and scalar walker properties.
#[derive(Clone, Debug, Default)]
pub struct Walker {
    /// Persisted particle configuration.
    pub r: Vec<Vector3<f64>>,
    /// Persisted wavefunction scratch buffer.
    pub wf_buffer: Vec<f64>,
    pub local_energy: f64,
    pub weight: f64,
}

impl Walker {
    pub fn new(r: Vec<Vector3<f64>>) -> Self {
        Self { r, wf_buffer: Vec::new(), local_energy: 0.0, weight: 1.0 }
    }
}

/// Working particle positions paired with a walker for the current block.
#[derive(Clone, Debug, Default)]
pub struct ParticleConfiguration {
    pub r: Vec<Vector3<f64>>,
    needs_recompute: bool,
}

impl ParticleConfiguration {
    pub fn new(num_particles: usize) -> Self {
        Self { r: vec![Vector3::zeros(); num_particles], needs_recompute: true }
    }

    /// Copy a walker's persisted configuration in and flag a full
    /// position recompute.
    pub fn load_from(&mut self, walker: &Walker) {
        self.r.resize(walker.r.len(), Vector3::zeros());
        self.r.copy_from_slice(&walker.r);
        self.needs_recompute = true;
    }

    pub fn needs_recompute(&self) -> bool {
        self.needs_recompute
    }

    pub fn mark_recomputed(&mut self) {
        self.needs_recompute = false;
    }
}

/// Per-block estimator aggregator owned by the crowd.
#[derive(Clone, Copy, Debug, Default)]
pub struct CrowdEstimator {
    steps_per_block: usize,
    energy_sum: f64,
    weight_sum: f64,
    samples: usize,
}

impl CrowdEstimator {
    /// Reset the block accumulators and record the planned step count.
    pub fn start_block(&mut self, num_steps: usize) {
        self.steps_per_block = num_steps;
        self.energy_sum = 0.0;
        self.weight_sum = 0.0;
        self.samples = 0;
    }

    pub fn accumulate(&mut self, local_energy: f64, weight: f64) {
        self.energy_sum += weight * local_energy;
        self.weight_sum += weight;
        self.samples += 1;
    }

    pub fn steps_per_block(&self) -> usize {
        self.steps_per_block
    }

    /// Weighted mean energy of the block so far.
    pub fn block_energy(&self) -> f64 {
        if self.weight_sum == 0.0 {
            0.0
        } else {
            self.energy_sum / self.weight_sum
        }
    }
}

/// A bounded batch of walkers with per-block scratch vectors.
pub struct WalkerCrowd<'a, W: TrialWavefunction, H: Hamiltonian> {
    walkers: Vec<&'a mut Walker>,
    configurations: Vec<&'a mut ParticleConfiguration>,
    wavefunctions: Vec<&'a mut W>,
    hamiltonians: Vec<&'a mut H>,

    grads_now: Vec<Vector3<f64>>,
    grads_new: Vec<Vector3<f64>>,
    ratios: Vec<f64>,
    log_gf: Vec<f64>,
    log_gb: Vec<f64>,
    prob: Vec<f64>,

    n_accept: u64,
    n_reject: u64,
    n_nonlocal_accept: u64,
    estimator: CrowdEstimator,
}

impl<'a, W: TrialWavefunction, H: Hamiltonian> Default for WalkerCrowd<'a, W, H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, W: TrialWavefunction, H: Hamiltonian> WalkerCrowd<'a, W, H> {
    pub fn new() -> Self {
        Self {
            walkers: Vec::new(),
            configurations: Vec::new(),
            wavefunctions: Vec::new(),
            hamiltonians: Vec::new(),
            grads_now: Vec::new(),
            grads_new: Vec::new(),
            ratios: Vec::new(),
            log_gf: Vec::new(),
            log_gb: Vec::new(),
            prob: Vec::new(),
            n_accept: 0,
            n_reject: 0,
            n_nonlocal_accept: 0,
            estimator: CrowdEstimator::default(),
        }
    }

    /// Preallocate every per-walker vector without changing the current size.
    pub fn reserve(&mut self, capacity: usize) {
        self.walkers.reserve(capacity);
        self.configurations.reserve(capacity);
        self.wavefunctions.reserve(capacity);
        self.hamiltonians.reserve(capacity);
        self.resize_results(capacity);
    }

    fn resize_results(&mut self, size: usize) {
        self.grads_now.resize(size, Vector3::zeros());
        self.grads_new.resize(size, Vector3::zeros());
        self.ratios.resize(size, 0.0);
        self.log_gf.resize(size, 0.0);
        self.log_gb.resize(size, 0.0);
        self.prob.resize(size, 0.0);
    }

    /// Append one walker with its paired evaluation objects.
    ///
    /// If the walker count diverges from the result-vector length, every
    /// result vector is resized to match. The catch-up is idempotent.
    pub fn add_walker(
        &mut self,
        walker: &'a mut Walker,
        configuration: &'a mut ParticleConfiguration,
        wavefunction: &'a mut W,
        hamiltonian: &'a mut H,
    ) {
        self.walkers.push(walker);
        self.configurations.push(configuration);
        self.wavefunctions.push(wavefunction);
        self.hamiltonians.push(hamiltonian);
        if self.walkers.len() != self.grads_now.len() {
            let size = self.walkers.len();
            self.resize_results(size);
        }
    }

    /// Empty all held references and zero the block counters.
    pub fn clear_walkers(&mut self) {
        self.walkers.clear();
        self.configurations.clear();
        self.wavefunctions.clear();
        self.hamiltonians.clear();

        self.n_accept = 0;
        self.n_reject = 0;
        self.n_nonlocal_accept = 0;
    }

    /// Reset the Green's-function log-ratio accumulators.
    ///
    /// Later updates multiply into these slots, so the reset value is the
    /// multiplicative identity 1.0, not 0.0.
    pub fn clear_results(&mut self) {
        self.log_gf.fill(1.0);
        self.log_gb.fill(1.0);
    }

    /// Reset the per-block counters and forward the step count to the
    /// owned estimator aggregator.
    pub fn start_block(&mut self, num_steps: usize) {
        self.n_accept = 0;
        self.n_reject = 0;
        self.n_nonlocal_accept = 0;
        self.estimator.start_block(num_steps);
    }

    /// Copy every walker's persisted configuration into its paired
    /// particle configuration, flagging a full position recompute.
    pub fn load_walkers(&mut self) {
        for (walker, configuration) in self.walkers.iter().zip(self.configurations.iter_mut()) {
            configuration.load_from(walker);
        }
    }

    pub fn size(&self) -> usize {
        self.walkers.len()
    }

    pub fn walkers(&self) -> &[&'a mut Walker] {
        &self.walkers
    }

    pub fn configurations_mut(&mut self) -> &mut [&'a mut ParticleConfiguration] {
        &mut self.configurations
    }

    pub fn wavefunctions_mut(&mut self) -> &mut [&'a mut W] {
        &mut self.wavefunctions
    }

    pub fn hamiltonians_mut(&mut self) -> &mut [&'a mut H] {
        &mut self.hamiltonians
    }

    pub fn grads_now_mut(&mut self) -> &mut [Vector3<f64>] {
        &mut self.grads_now
    }

    pub fn grads_new_mut(&mut self) -> &mut [Vector3<f64>] {
        &mut self.grads_new
    }

    pub fn ratios_mut(&mut self) -> &mut [f64] {
        &mut self.ratios
    }

    pub fn log_gf(&self) -> &[f64] {
        &self.log_gf
    }

    pub fn log_gf_mut(&mut self) -> &mut [f64] {
        &mut self.log_gf
    }

    pub fn log_gb(&self) -> &[f64] {
        &self.log_gb
    }

    pub fn log_gb_mut(&mut self) -> &mut [f64] {
        &mut self.log_gb
    }

    pub fn prob_mut(&mut self) -> &mut [f64] {
        &mut self.prob
    }

    pub fn inc_accept(&mut self) {
        self.n_accept += 1;
    }

    pub fn inc_reject(&mut self) {
        self.n_reject += 1;
    }

    pub fn inc_nonlocal_accept(&mut self) {
        self.n_nonlocal_accept += 1;
    }

    pub fn accepted(&self) -> u64 {
        self.n_accept
    }

    pub fn rejected(&self) -> u64 {
        self.n_reject
    }

    pub fn nonlocal_accepted(&self) -> u64 {
        self.n_nonlocal_accept
    }

    pub fn estimator(&self) -> &CrowdEstimator {
        &self.estimator
    }

    pub fn estimator_mut(&mut self) -> &mut CrowdEstimator {
        &mut self.estimator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::{HarmonicHamiltonian, HarmonicModel};

    fn make_pool(n: usize) -> Vec<(Walker, ParticleConfiguration, HarmonicModel, HarmonicHamiltonian)> {
        (0..n)
            .map(|i| {
                let model = HarmonicModel::new(2, 0.5, vec![0.3 + 0.1 * i as f64]);
                let ham = HarmonicHamiltonian::new(1.0);
                let walker = Walker::new(vec![Vector3::new(i as f64, 0.0, 0.0); 2]);
                (walker, ParticleConfiguration::new(2), model, ham)
            })
            .collect()
    }

    #[test]
    fn test_clear_results_sets_multiplicative_identity() {
        let mut pool = make_pool(3);
        let mut crowd = WalkerCrowd::new();
        for (walker, cfg, psi, ham) in pool.iter_mut() {
            crowd.add_walker(walker, cfg, psi, ham);
        }
        crowd.clear_results();
        assert!(crowd.log_gf().iter().all(|&v| v == 1.0));
        assert!(crowd.log_gb().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_reserve_then_partial_fill_realigns() {
        let mut pool = make_pool(2);
        let mut crowd = WalkerCrowd::new();
        crowd.reserve(8);
        assert_eq!(crowd.size(), 0);
        assert_eq!(crowd.log_gf().len(), 8);

        for (walker, cfg, psi, ham) in pool.iter_mut() {
            crowd.add_walker(walker, cfg, psi, ham);
        }
        // Result vectors snapped back to the actual walker count.
        assert_eq!(crowd.size(), 2);
        assert_eq!(crowd.log_gf().len(), 2);
        assert_eq!(crowd.ratios_mut().len(), 2);
        assert_eq!(crowd.grads_now_mut().len(), 2);
    }

    #[test]
    fn test_start_block_resets_counters() {
        let mut pool = make_pool(1);
        let mut crowd = WalkerCrowd::new();
        let (walker, cfg, psi, ham) = &mut pool[0];
        crowd.add_walker(walker, cfg, psi, ham);

        crowd.inc_accept();
        crowd.inc_reject();
        crowd.inc_nonlocal_accept();
        crowd.start_block(25);
        assert_eq!(crowd.accepted(), 0);
        assert_eq!(crowd.rejected(), 0);
        assert_eq!(crowd.nonlocal_accepted(), 0);
        assert_eq!(crowd.estimator().steps_per_block(), 25);
    }

    #[test]
    fn test_clear_walkers_empties_and_zeroes() {
        let mut pool = make_pool(2);
        let mut crowd = WalkerCrowd::new();
        for (walker, cfg, psi, ham) in pool.iter_mut() {
            crowd.add_walker(walker, cfg, psi, ham);
        }
        crowd.inc_accept();
        crowd.clear_walkers();
        assert_eq!(crowd.size(), 0);
        assert_eq!(crowd.accepted(), 0);
    }

    #[test]
    fn test_load_walkers_copies_configurations() {
        let mut pool = make_pool(2);
        let mut crowd = WalkerCrowd::new();
        for (walker, cfg, psi, ham) in pool.iter_mut() {
            crowd.add_walker(walker, cfg, psi, ham);
        }
        crowd.load_walkers();
        let configs = crowd.configurations_mut();
        assert_eq!(configs[1].r[0], Vector3::new(1.0, 0.0, 0.0));
        assert!(configs[0].needs_recompute());
    }
}
