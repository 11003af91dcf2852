//! Parameterized Gaussian trial wavefunction over an isotropic harmonic well.
//!
//! The trial state factorizes into a fixed reference Gaussian and an
//! optimizable radial polynomial in the exponent:
//!
//!   ln|Ψ| = −c₀ Σᵢ|rᵢ|²  −  Σₖ θₖ Σᵢ|rᵢ|^(2k)   (k = 1..=3)
//!
//! Everything the optimizer asks for — fixed/free log-amplitudes,
//! per-particle gradients and Laplacians, parameter derivatives of ln|Ψ|
//! and of the local energy — is analytic, which makes this the reference
//! system for gradient and eigenproblem tests. With a single parameter θ₁
//! and c₀ = 0 the exact ground state of the well sits at θ₁ = ω/2 with
//! energy 3Nω/2.

use nalgebra::Vector3;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::hamiltonian::{Hamiltonian, KINETIC_COMPONENT};
use crate::wavefunction::TrialWavefunction;

/// Maximum number of optimizable exponent parameters.
pub const MAX_PARAMS: usize = 3;

/// Gaussian-times-polynomial trial wavefunction.
#[derive(Clone, Debug)]
pub struct HarmonicModel {
    num_particles: usize,
    /// Fixed reference width c₀.
    fixed_width: f64,
    /// Optimizable exponent coefficients θ₁..θₖ.
    params: Vec<f64>,
    optimizing: bool,
}

impl HarmonicModel {
    /// `params` carries 1 to 3 exponent coefficients.
    pub fn new(num_particles: usize, fixed_width: f64, params: Vec<f64>) -> Self {
        assert!(
            !params.is_empty() && params.len() <= MAX_PARAMS,
            "HarmonicModel supports 1 to {} parameters, got {}",
            MAX_PARAMS,
            params.len()
        );
        Self { num_particles, fixed_width, params, optimizing: false }
    }

    /// Draw an initial configuration from a unit normal per coordinate.
    pub fn initialize<R: Rng>(&self, rng: &mut R) -> Vec<Vector3<f64>> {
        let dist = Normal::new(0.0, 1.0).unwrap();
        (0..self.num_particles)
            .map(|_| {
                Vector3::new(dist.sample(rng), dist.sample(rng), dist.sample(rng))
            })
            .collect()
    }

    /// g(s) = Σₖ 2k θₖ s^(k−1), the radial factor of the free-part gradient.
    fn radial_factor(&self, s: f64) -> f64 {
        let mut g = 0.0;
        let mut s_pow = 1.0;
        for (k, &theta) in self.params.iter().enumerate() {
            g += 2.0 * (k + 1) as f64 * theta * s_pow;
            s_pow *= s;
        }
        g
    }

    /// g'(s) = Σₖ 2k(k−1) θₖ s^(k−2).
    fn radial_factor_prime(&self, s: f64) -> f64 {
        let mut gp = 0.0;
        let mut s_pow = 1.0;
        for (k, &theta) in self.params.iter().enumerate().skip(1) {
            gp += 2.0 * ((k + 1) * k) as f64 * theta * s_pow;
            s_pow *= s;
        }
        gp
    }
}

impl TrialWavefunction for HarmonicModel {
    fn num_particles(&self) -> usize {
        self.num_particles
    }

    fn num_params(&self) -> usize {
        self.params.len()
    }

    fn params(&self) -> Vec<f64> {
        self.params.clone()
    }

    fn reset_parameters(&mut self, params: &[f64]) {
        assert_eq!(params.len(), self.params.len());
        self.params.copy_from_slice(params);
    }

    fn start_optimization(&mut self) {
        self.optimizing = true;
    }

    fn stop_optimization(&mut self) {
        self.optimizing = false;
    }

    fn evaluate_delta_log_setup(
        &self,
        r: &[Vector3<f64>],
        fixed_grad: &mut [Vector3<f64>],
        fixed_lap: &mut [f64],
    ) -> (f64, f64) {
        let mut log_fixed = 0.0;
        for (i, ri) in r.iter().enumerate() {
            let s = ri.norm_squared();
            log_fixed -= self.fixed_width * s;
            fixed_grad[i] = -2.0 * self.fixed_width * ri;
            fixed_lap[i] = -6.0 * self.fixed_width;
        }
        let mut free_grad = vec![Vector3::zeros(); r.len()];
        let mut free_lap = vec![0.0; r.len()];
        let log_free = self.evaluate_delta_log(r, &mut free_grad, &mut free_lap);
        (log_fixed, log_free)
    }

    fn evaluate_delta_log(
        &self,
        r: &[Vector3<f64>],
        grad: &mut [Vector3<f64>],
        lap: &mut [f64],
    ) -> f64 {
        let mut log_free = 0.0;
        for (i, ri) in r.iter().enumerate() {
            let s = ri.norm_squared();
            let mut s_pow = s;
            for &theta in &self.params {
                log_free -= theta * s_pow;
                s_pow *= s;
            }
            let g = self.radial_factor(s);
            grad[i] = -g * ri;
            lap[i] = -(3.0 * g + 2.0 * s * self.radial_factor_prime(s));
        }
        log_free
    }

    fn parameter_derivatives(&self, r: &[Vector3<f64>], dlogpsi: &mut [f64], dhpsi: &mut [f64]) {
        dlogpsi.fill(0.0);
        dhpsi.fill(0.0);
        for ri in r {
            let s = ri.norm_squared();
            // Full-gradient radial factor: ∇ᵢ ln|Ψ| = −A(s) rᵢ.
            let a = 2.0 * self.fixed_width + self.radial_factor(s);
            let mut s_km1 = 1.0;
            for k in 0..self.params.len() {
                let kf = (k + 1) as f64;
                dlogpsi[k] -= s_km1 * s;
                // ∂g/∂θₖ = 2k s^(k−1), ∂(3g + 2s g')/∂θₖ = (4k² + 2k) s^(k−1)
                let dg = 2.0 * kf * s_km1;
                let dlap = (4.0 * kf * kf + 2.0 * kf) * s_km1;
                dhpsi[k] -= 0.5 * (-dlap + 2.0 * a * dg * s);
                s_km1 *= s;
            }
        }
    }
}

/// Kinetic-plus-potential Hamiltonian of the isotropic harmonic well.
#[derive(Clone, Debug)]
pub struct HarmonicHamiltonian {
    omega: f64,
    kinetic: bool,
    potential: bool,
}

impl HarmonicHamiltonian {
    pub fn new(omega: f64) -> Self {
        Self { omega, kinetic: true, potential: true }
    }

    pub fn omega(&self) -> f64 {
        self.omega
    }
}

impl Hamiltonian for HarmonicHamiltonian {
    fn evaluate(&self, r: &[Vector3<f64>], grad: &[Vector3<f64>], lap: &[f64]) -> f64 {
        let mut energy = 0.0;
        if self.kinetic {
            for i in 0..r.len() {
                energy -= 0.5 * (lap[i] + grad[i].norm_squared());
            }
        }
        if self.potential {
            energy += self.local_potential(r);
        }
        energy
    }

    fn local_potential(&self, r: &[Vector3<f64>]) -> f64 {
        if !self.potential {
            return 0.0;
        }
        0.5 * self.omega * self.omega * r.iter().map(|ri| ri.norm_squared()).sum::<f64>()
    }

    fn component(&self, name: &str) -> Option<Self> {
        match name {
            KINETIC_COMPONENT => {
                Some(Self { omega: self.omega, kinetic: true, potential: false })
            }
            "Potential" => Some(Self { omega: self.omega, kinetic: false, potential: true }),
            _ => None,
        }
    }
}
