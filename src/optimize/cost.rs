//! Correlated-sampling cost-function evaluator.
//!
//! The evaluator owns an arena of per-sample evaluation contexts cloned
//! from the trial wavefunction and Hamiltonian at the reference parameter
//! set. A correlated-sampling pass replays the archived configurations
//! under the *current* parameters — same positions, new parameters — and
//! restores unbiased statistics through per-sample reweighting factors, so
//! the optimizer can probe many parameter sets against one fixed sample.
//!
//! Call order: `prepare_sample_buffers` → `evaluate_reference_configurations`
//! → any number of `correlated_sampling_pass` / `compute_gradient` /
//! `cost` calls → optionally `build_generalized_eigenproblem`. Skipping the
//! first two steps, or reusing the evaluator after a pass panicked midway,
//! leaves the record tables undefined; restart from
//! `prepare_sample_buffers` in that case.

use nalgebra::{DMatrix, Vector3};
use rayon::prelude::*;

use crate::conf::{CostConfig, TargetEnergyMode};
use crate::hamiltonian::{Hamiltonian, KINETIC_COMPONENT};
use crate::records::{CostSums, DerivRecords, SampleRecordTable};
use crate::reduce::DistributedReducer;
use crate::store::SampleStore;
use crate::wavefunction::TrialWavefunction;

use super::eigen::GeneralizedEigenproblemBuilder;

/// Cost-term weights smaller in magnitude than this are skipped entirely.
pub const WEIGHT_SKIP_TOLERANCE: f64 = 1.0e-10;

/// Independent evaluation context for one archived sample: its positions
/// and the cloned wavefunction/Hamiltonian pair, created once and reused
/// across passes.
struct SampleContext<W, H> {
    r: Vec<Vector3<f64>>,
    psi: W,
    ham: H,
    ham_aux: H,
    /// Free-part (then total) per-particle gradient scratch for the
    /// current pass.
    grad: Vec<Vector3<f64>>,
    lap: Vec<f64>,
}

/// Result of evaluating one sample during a correlated pass.
struct PassEval {
    kinetic: f64,
    dlogpsi: Vec<f64>,
    dhpsi: Vec<f64>,
}

/// Correlated-sampling cost function over an archived sample set.
pub struct CostFunctionEvaluator<W, H, S, R> {
    config: CostConfig,
    samples: S,
    reducer: R,
    psi: W,
    ham: H,
    ham_aux: Option<H>,

    contexts: Vec<SampleContext<W, H>>,
    /// Per-sample fixed-part log-derivatives, archived at reference time.
    fixed_grad: Vec<Vec<Vector3<f64>>>,
    fixed_lap: Vec<Vec<f64>>,

    records: SampleRecordTable,
    derivs: DerivRecords,
    sums: CostSums,

    num_particles: usize,
    num_params: usize,
    /// Sample count summed over all ranks.
    num_samples_global: f64,
    etarget: f64,
    etarget_eff: f64,
    cur_avg: f64,
    cur_avg_w: f64,
    cur_var_w: f64,
    eff_samples: f64,
    /// Inverse of the post-clamp mean weight. Diagnostic only.
    cs_weight: f64,
    is_valid: bool,
    verbose: bool,
}

impl<W, H, S, R> CostFunctionEvaluator<W, H, S, R>
where
    W: TrialWavefunction + Send,
    H: Hamiltonian + Send,
    S: SampleStore + Sync,
    R: DistributedReducer,
{
    pub fn new(config: CostConfig, samples: S, reducer: R, psi: W, ham: H) -> Self {
        let num_particles = psi.num_particles();
        let num_params = psi.num_params();
        Self {
            config,
            samples,
            reducer,
            psi,
            ham,
            ham_aux: None,
            contexts: Vec::new(),
            fixed_grad: Vec::new(),
            fixed_lap: Vec::new(),
            records: SampleRecordTable::new(),
            derivs: DerivRecords::new(),
            sums: CostSums::default(),
            num_particles,
            num_params,
            num_samples_global: 0.0,
            etarget: 0.0,
            etarget_eff: 0.0,
            cur_avg: 0.0,
            cur_avg_w: 0.0,
            cur_var_w: 0.0,
            eff_samples: 0.0,
            cs_weight: 1.0,
            is_valid: true,
            verbose: false,
        }
    }

    /// Set verbosity.
    pub fn with_verbose(mut self, v: bool) -> Self {
        self.verbose = v;
        self
    }

    /// Read the current sample count and (re)allocate the per-sample
    /// fixed-part gradient/Laplacian arenas and the auxiliary Hamiltonian.
    /// Deterministic; must precede `evaluate_reference_configurations`.
    pub fn prepare_sample_buffers(&mut self) {
        let n = self.samples.num_samples();
        let np = self.num_particles;
        if self.fixed_grad.len() != n {
            self.fixed_grad = vec![vec![Vector3::zeros(); np]; n];
            self.fixed_lap = vec![vec![0.0; np]; n];
        }
        if self.ham_aux.is_none() {
            let kinetic = match self.ham.component(KINETIC_COMPONENT) {
                Some(h) => h,
                None => panic!(
                    "Hamiltonian exposes no '{}' component; cannot build the auxiliary Hamiltonian",
                    KINETIC_COMPONENT
                ),
            };
            if let Some(name) = &self.config.include_nonlocal {
                if self.ham.component(name).is_some() {
                    println!("  found nonlocal Hamiltonian term named {}", name);
                } else {
                    println!("  did not find nonlocal Hamiltonian term named {}", name);
                }
            }
            self.ham_aux = Some(kinetic);
        }
    }

    /// Evaluate every archived sample at the fixed reference parameters.
    ///
    /// Builds (or reuses) the per-sample context arena, records fixed and
    /// free log-amplitudes, parameter derivatives and reference energies,
    /// then performs one distributed reduction to establish the global
    /// target energy and sample count. Must precede any gradient or cost
    /// evaluation.
    pub fn evaluate_reference_configurations(&mut self) {
        let n = self.samples.num_samples();
        let np = self.num_particles;
        self.records.resize(n);
        self.derivs.resize(n, self.num_params);

        self.psi.start_optimization();

        if self.contexts.len() != n {
            let ham_aux = match &self.ham_aux {
                Some(h) => h.clone(),
                None => panic!("prepare_sample_buffers must run before evaluate_reference_configurations"),
            };
            let contexts: Vec<SampleContext<W, H>> = (0..n)
                .map(|iw| {
                    let mut r = vec![Vector3::zeros(); np];
                    self.samples.load_sample(iw, &mut r);
                    SampleContext {
                        r,
                        psi: self.psi.clone(),
                        ham: self.ham.clone(),
                        ham_aux: ham_aux.clone(),
                        grad: vec![Vector3::zeros(); np],
                        lap: vec![0.0; np],
                    }
                })
                .collect();
            self.contexts = contexts;
        }

        struct RefEval {
            log_fixed: f64,
            log_free: f64,
            energy: f64,
            potential: f64,
            dlogpsi: Vec<f64>,
            dhpsi: Vec<f64>,
        }

        let num_params = self.num_params;
        let evals: Vec<RefEval> = {
            let samples = &self.samples;
            self.contexts
                .par_iter_mut()
                .zip(self.fixed_grad.par_iter_mut().zip(self.fixed_lap.par_iter_mut()))
                .enumerate()
                .map(|(iw, (ctx, (fg, fl)))| {
                    samples.load_sample(iw, &mut ctx.r);
                    let (log_fixed, log_free) = ctx.psi.evaluate_delta_log_setup(&ctx.r, fg, fl);

                    let mut dlogpsi = vec![0.0; num_params];
                    let mut dhpsi = vec![0.0; num_params];
                    ctx.psi.parameter_derivatives(&ctx.r, &mut dlogpsi, &mut dhpsi);

                    // Full local energy needs the total log-derivatives.
                    ctx.psi.evaluate_delta_log(&ctx.r, &mut ctx.grad, &mut ctx.lap);
                    for i in 0..ctx.r.len() {
                        ctx.grad[i] += fg[i];
                        ctx.lap[i] += fl[i];
                    }
                    let energy = ctx.ham.evaluate(&ctx.r, &ctx.grad, &ctx.lap);
                    let potential = ctx.ham.local_potential(&ctx.r);

                    RefEval { log_fixed, log_free, energy, potential, dlogpsi, dhpsi }
                })
                .collect()
        };

        let mut e_tot = 0.0;
        let mut e2_tot = 0.0;
        for (iw, ev) in evals.iter().enumerate() {
            for j in 0..num_params {
                self.derivs.dlogpsi[(iw, j)] = ev.dlogpsi[j];
                self.derivs.dhpsi[(iw, j)] = ev.dhpsi[j];
            }
            let row = &mut self.records.rows_mut()[iw];
            row.logpsi_fixed = ev.log_fixed;
            row.logpsi_free = ev.log_free;
            row.energy_new = ev.energy;
            row.energy_total = ev.energy;
            row.energy_fixed = ev.potential;
            row.reweight = 1.0;
            e_tot += ev.energy;
            e2_tot += ev.energy * ev.energy;
        }

        let mut etemp = [e_tot, n as f64, e2_tot];
        self.reducer.allreduce(&mut etemp);
        self.etarget = etemp[0] / etemp[1];
        self.num_samples_global = etemp[1];
        self.etarget_eff = match self.config.target_mode {
            TargetEnergyMode::SampleMean => self.etarget,
            TargetEnergyMode::Explicit(e) => e,
        };
        if self.verbose {
            println!("  reference Eavg = {:.8}", self.etarget);
            println!(
                "  reference Evar = {:.8}",
                etemp[2] / etemp[1] - self.etarget * self.etarget
            );
            println!("  total weights  = {}", etemp[1]);
        }

        // Seed the accumulators so a cost evaluation is meaningful before
        // the first correlated pass.
        self.sums.reset();
        self.sums.bare.e = etemp[0];
        self.sums.bare.e_sq = etemp[2];
        self.sums.weighted.e = etemp[0];
        self.sums.weighted.e_sq = etemp[2];
        self.sums.weight = etemp[1];
        self.sums.weight_sq = etemp[1];

        self.eff_samples = etemp[1];
        self.cur_avg = self.etarget;
        self.cur_avg_w = self.etarget;
        self.cur_var_w = etemp[2] / etemp[1] - self.etarget * self.etarget;
        self.is_valid = true;
    }

    /// Push new parameter values to the master wavefunction and every
    /// context in the arena.
    pub fn reset_parameters(&mut self, params: &[f64]) {
        self.psi.reset_parameters(params);
        for ctx in &mut self.contexts {
            ctx.psi.reset_parameters(params);
        }
    }

    /// Final parameter reset at the end of an optimization run; turns
    /// derivative tracking back off.
    pub fn finish_optimization(&mut self, params: &[f64]) {
        self.reset_parameters(params);
        self.psi.stop_optimization();
        for ctx in &mut self.contexts {
            ctx.psi.stop_optimization();
        }
    }

    /// One correlated-sampling pass under the current parameters.
    ///
    /// Replays every archived configuration, reweights it against its
    /// recorded free log-amplitude, recomputes local energies (and, with
    /// `need_grads`, parameter derivatives), reduces the accumulators and
    /// returns the effective sample count (Σw)²/Σw². Callers should treat
    /// a return below the configured fraction of the nominal sample count
    /// as sampling degeneracy.
    pub fn correlated_sampling_pass(&mut self, need_grads: bool) -> f64 {
        if let Some(name) = &self.config.include_nonlocal {
            panic!(
                "nonlocal Hamiltonian term '{}' is not supported by the batched correlated-sampling pass",
                name
            );
        }

        let n = self.contexts.len();
        let np = self.num_particles;
        let num_params = self.num_params;
        let inv_n = 1.0 / n as f64;
        let sign = self.config.sampling_mode.sign();

        // Reload stored positions and recompute the free log-amplitude for
        // every sample under the current parameters.
        let log_free: Vec<f64> = {
            let samples = &self.samples;
            self.contexts
                .par_iter_mut()
                .enumerate()
                .map(|(iw, ctx)| {
                    samples.load_sample(iw, &mut ctx.r);
                    ctx.psi.evaluate_delta_log(&ctx.r, &mut ctx.grad, &mut ctx.lap)
                })
                .collect()
        };

        let mut wgt_tot = 0.0;
        let mut wgt_tot2 = 0.0;
        for (row, lf) in self.records.rows_mut().iter_mut().zip(log_free.iter()) {
            let log_weight = sign * (lf - row.logpsi_free);
            row.reweight = log_weight;
            wgt_tot += inv_n * log_weight;
            wgt_tot2 += inv_n * log_weight * log_weight;
        }

        // Two-stage weight normalization. Stage one subtracts the reduced
        // running normalization constant before exponentiating, bounding
        // the exponential; stage two rescales by the post-clamp total so
        // the sample-mean weight returns to 1. Each stage needs the
        // reduced total weight first; the order is a correctness
        // requirement of the inter-rank contract.
        self.reducer.allreduce_scalar(&mut wgt_tot);
        self.reducer.allreduce_scalar(&mut wgt_tot2);
        let mut wgtnorm = if wgt_tot == 0.0 { 0.0 } else { wgt_tot };
        wgt_tot = 0.0;
        for row in self.records.rows_mut() {
            row.reweight = (row.reweight - wgtnorm).exp().min(f64::MAX * 0.1);
            wgt_tot += inv_n * row.reweight;
        }
        self.reducer.allreduce_scalar(&mut wgt_tot);
        wgtnorm = if wgt_tot == 0.0 { 1.0 } else { 1.0 / wgt_tot };
        wgt_tot = 0.0;
        for row in self.records.rows_mut() {
            row.reweight = (row.reweight * wgtnorm).min(self.config.max_weight);
            wgt_tot += inv_n * row.reweight;
        }
        self.reducer.allreduce_scalar(&mut wgt_tot);
        self.cs_weight = if wgt_tot == 0.0 { 1.0 } else { 1.0 / wgt_tot };

        // Recompute local energies and, if requested, parameter
        // derivatives for every sample under the current parameters.
        let evals: Vec<PassEval> = {
            let fixed_grad = &self.fixed_grad;
            let fixed_lap = &self.fixed_lap;
            self.contexts
                .par_iter_mut()
                .enumerate()
                .map(|(iw, ctx)| {
                    for i in 0..np {
                        ctx.grad[i] += fixed_grad[iw][i];
                        ctx.lap[i] += fixed_lap[iw][i];
                    }
                    let kinetic = ctx.ham_aux.evaluate(&ctx.r, &ctx.grad, &ctx.lap);
                    let mut dlogpsi = Vec::new();
                    let mut dhpsi = Vec::new();
                    if need_grads {
                        dlogpsi = vec![0.0; num_params];
                        dhpsi = vec![0.0; num_params];
                        ctx.psi.parameter_derivatives(&ctx.r, &mut dlogpsi, &mut dhpsi);
                    }
                    PassEval { kinetic, dlogpsi, dhpsi }
                })
                .collect()
        };

        for (iw, ev) in evals.iter().enumerate() {
            let row = &mut self.records.rows_mut()[iw];
            row.energy_new = ev.kinetic + row.energy_fixed;
        }
        if need_grads {
            for (iw, ev) in evals.iter().enumerate() {
                for j in 0..num_params {
                    self.derivs.dlogpsi[(iw, j)] = ev.dlogpsi[j];
                    self.derivs.dhpsi[(iw, j)] = ev.dhpsi[j];
                }
            }
        }

        // Every rank must observe the same normalization constant before
        // any accumulator is formed.
        self.reducer.barrier();

        self.sums.reset();
        let power = self.config.energy_power;
        for row in self.records.rows() {
            let eloc = row.energy_new;
            let del_e = (eloc - self.etarget_eff).abs().powi(power);
            self.sums.bare.e += eloc;
            self.sums.bare.e_sq += eloc * eloc;
            self.sums.bare.abs_de += del_e;
            self.sums.weighted.e += eloc * row.reweight;
            self.sums.weighted.e_sq += eloc * eloc * row.reweight;
            self.sums.weighted.abs_de += del_e * row.reweight;
            self.sums.weight += row.reweight;
            self.sums.weight_sq += row.reweight * row.reweight;
        }
        let mut buf = self.sums.to_array();
        self.reducer.allreduce(&mut buf);
        self.sums = CostSums::from_array(buf);

        self.eff_samples = self.sums.effective_samples();
        self.eff_samples
    }

    /// Cost value under the current parameters: one correlated pass
    /// (without derivative tables) plus the configured term combination.
    pub fn cost(&mut self) -> f64 {
        self.correlated_sampling_pass(false);
        self.cost_from_sums()
    }

    fn cost_from_sums(&self) -> f64 {
        let sums = &self.sums;
        let avg_w = sums.weighted.e / sums.weight;
        let var_w = sums.weighted.e_sq / sums.weight - avg_w * avg_w;
        let avg_bare = sums.bare.e / self.num_samples_global;
        let var_bare = sums.bare.e_sq / self.num_samples_global - avg_bare * avg_bare;

        let mut cost = 0.0;
        if self.config.energy_weight.abs() > WEIGHT_SKIP_TOLERANCE {
            cost += self.config.energy_weight * avg_w;
        }
        if self.config.variance_weight.abs() > WEIGHT_SKIP_TOLERANCE {
            cost += self.config.variance_weight * var_w;
        }
        if self.config.abs_energy_weight.abs() > WEIGHT_SKIP_TOLERANCE {
            cost += self.config.abs_energy_weight * sums.weighted.abs_de / sums.weight;
        }
        if self.config.urv_weight.abs() > WEIGHT_SKIP_TOLERANCE {
            cost += self.config.urv_weight * var_bare;
        }
        cost
    }

    /// Gradient of the cost with respect to the parameters.
    ///
    /// `fd_step > 0` selects the central-difference fallback (two passes
    /// per parameter; the unperturbed parameters are restored afterwards,
    /// though the record tables reflect them only after the next pass).
    /// `fd_step <= 0` selects the analytic mode: a single
    /// gradient-carrying pass and per-term accumulation from the
    /// derivative tables. The analytic mode updates the validity flag;
    /// check `is_valid` before trusting the result.
    pub fn compute_gradient(&mut self, gradient: &mut [f64], params: &[f64], fd_step: f64) {
        if fd_step > 0.0 {
            let dh = 1.0 / (2.0 * fd_step);
            let mut probe = params.to_vec();
            for i in 0..self.num_params {
                probe.copy_from_slice(params);
                probe[i] = params[i] + fd_step;
                self.reset_parameters(&probe);
                let cost_plus = self.cost();
                probe[i] = params[i] - fd_step;
                self.reset_parameters(&probe);
                let cost_minus = self.cost();
                gradient[i] = (cost_plus - cost_minus) * dh;
            }
            self.reset_parameters(params);
            return;
        }

        self.reset_parameters(params);
        self.correlated_sampling_pass(true);

        let n_global = self.num_samples_global;
        let sums = self.sums;
        self.cur_avg_w = sums.weighted.e / sums.weight;
        self.cur_var_w = sums.weighted.e_sq / sums.weight - self.cur_avg_w * self.cur_avg_w;
        self.cur_avg = sums.bare.e / n_global;

        let p = self.num_params;
        let sign = self.config.sampling_mode.sign();
        let power = self.config.energy_power;
        let wgtinv = 1.0 / sums.weight;

        let mut ed_abs = vec![0.0; p];
        let mut ed_w = vec![0.0; p];
        let mut e2d_w = vec![0.0; p];
        let mut urv = vec![0.0; p];
        let mut hd_avg = vec![0.0; p];
        let mut del_e_bar = 0.0;

        for (iw, row) in self.records.rows().iter().enumerate() {
            let weight = row.reweight * wgtinv;
            let eloc = row.energy_new;
            del_e_bar += weight * (eloc - self.etarget_eff).abs().powi(power);
            for pm in 0..p {
                hd_avg[pm] += self.derivs.dhpsi[(iw, pm)];
            }
        }
        self.reducer.allreduce(&mut hd_avg);
        self.reducer.allreduce_scalar(&mut del_e_bar);
        for h in hd_avg.iter_mut() {
            *h /= n_global;
        }

        for (iw, row) in self.records.rows().iter().enumerate() {
            let weight = row.reweight * wgtinv;
            let eloc = row.energy_new;
            let delta = eloc - self.cur_avg_w;
            // The |ΔE|^p derivative switches branch at the target energy;
            // the kink at equality is intentional, not smoothed.
            let above_target = eloc - self.etarget_eff >= 0.0;
            let del_e = (eloc - self.etarget_eff).abs().powi(power);
            let ddel_e = power as f64 * (eloc - self.etarget_eff).abs().powi(power - 1);
            for pm in 0..p {
                let d = self.derivs.dlogpsi[(iw, pm)];
                let hd = self.derivs.dhpsi[(iw, pm)];
                ed_w[pm] += weight * (hd + sign * d * delta);
                urv[pm] += 2.0 * (eloc * hd - self.cur_avg * hd_avg[pm]);
                if above_target {
                    ed_abs[pm] += weight * (sign * d * (del_e - del_e_bar) + ddel_e * hd);
                } else {
                    ed_abs[pm] += weight * (sign * d * (del_e - del_e_bar) - ddel_e * hd);
                }
            }
        }
        self.reducer.allreduce(&mut ed_abs);
        self.reducer.allreduce(&mut ed_w);
        self.reducer.allreduce(&mut urv);

        for (iw, row) in self.records.rows().iter().enumerate() {
            let weight = row.reweight * wgtinv;
            let eloc = row.energy_new;
            let delta = eloc - self.cur_avg_w;
            let sigma = delta * delta;
            for pm in 0..p {
                let d = self.derivs.dlogpsi[(iw, pm)];
                let hd = self.derivs.dhpsi[(iw, pm)];
                e2d_w[pm] +=
                    weight * (2.0 * delta * (hd - ed_w[pm]) + sign * d * (sigma - self.cur_var_w));
            }
        }
        self.reducer.allreduce(&mut e2d_w);
        for u in urv.iter_mut() {
            *u /= n_global;
        }

        for j in 0..p {
            gradient[j] = 0.0;
            if self.config.variance_weight.abs() > WEIGHT_SKIP_TOLERANCE {
                gradient[j] += self.config.variance_weight * e2d_w[j];
            }
            if self.config.energy_weight.abs() > WEIGHT_SKIP_TOLERANCE {
                gradient[j] += self.config.energy_weight * ed_w[j];
            }
            if self.config.urv_weight.abs() > WEIGHT_SKIP_TOLERANCE {
                gradient[j] += self.config.urv_weight * urv[j];
            }
            if self.config.abs_energy_weight.abs() > WEIGHT_SKIP_TOLERANCE {
                gradient[j] += self.config.abs_energy_weight * ed_abs[j];
            }
        }

        self.is_valid = true;
        let required = self.config.min_effective_fraction * n_global;
        if self.eff_samples < required {
            eprintln!(
                "CostFunctionEvaluator: effective sample count {:.2} is below the required minimum {:.2}",
                self.eff_samples, required
            );
            self.is_valid = false;
        }
    }

    /// Assemble the (P+1)×(P+1) linear-method matrices from the records of
    /// the most recent gradient-carrying pass and return the normalization
    /// scalar for the mixed eigenproblem.
    ///
    /// Requires a preceding `correlated_sampling_pass(true)` (directly or
    /// through an analytic `compute_gradient`); the matrix content is
    /// meaningless otherwise.
    pub fn build_generalized_eigenproblem(
        &self,
        left: &mut DMatrix<f64>,
        right: &mut DMatrix<f64>,
    ) -> f64 {
        GeneralizedEigenproblemBuilder::new(
            &self.records,
            &self.derivs,
            &self.sums,
            &self.reducer,
            self.config.gev_mode,
            self.config.gev_mixing,
        )
        .fill(left, right)
    }

    /// Hook for engine-driven optimizers. Not available for the batched
    /// evaluator; aborts rather than silently approximating.
    pub fn evaluate_reference_with_engine(&mut self, engine: &str) -> ! {
        panic!("optimizer engine '{}' is not implemented with batched optimization", engine);
    }

    pub fn num_params(&self) -> usize {
        self.num_params
    }

    pub fn num_samples(&self) -> usize {
        self.samples.num_samples()
    }

    /// Global sample count established by the reference evaluation.
    pub fn num_samples_global(&self) -> f64 {
        self.num_samples_global
    }

    pub fn target_energy(&self) -> f64 {
        self.etarget
    }

    pub fn effective_samples(&self) -> f64 {
        self.eff_samples
    }

    /// False when the last analytic gradient saw the effective sample
    /// count collapse below the configured fraction.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn sums(&self) -> &CostSums {
        &self.sums
    }

    pub fn records(&self) -> &SampleRecordTable {
        &self.records
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::{GevMode, SamplingMode};
    use crate::reduce::LocalReducer;
    use crate::store::InMemorySampleStore;
    use crate::systems::{HarmonicHamiltonian, HarmonicModel};
    use approx::assert_relative_eq;
    use std::cell::RefCell;

    fn fixed_configurations(n: usize, np: usize) -> Vec<Vec<Vector3<f64>>> {
        // Deterministic, non-degenerate configurations away from the origin.
        (0..n)
            .map(|iw| {
                (0..np)
                    .map(|i| {
                        let t = (iw * np + i) as f64;
                        Vector3::new(
                            0.3 + 0.17 * t,
                            -0.5 + 0.23 * (t * 1.3).sin(),
                            0.4 - 0.11 * (t * 0.7).cos(),
                        )
                    })
                    .collect()
            })
            .collect()
    }

    fn make_store(n: usize, np: usize) -> InMemorySampleStore {
        let mut store = InMemorySampleStore::new();
        for r in fixed_configurations(n, np) {
            store.append(r);
        }
        store
    }

    fn make_evaluator(
        config: CostConfig,
        n: usize,
        params: Vec<f64>,
    ) -> CostFunctionEvaluator<HarmonicModel, HarmonicHamiltonian, InMemorySampleStore, LocalReducer>
    {
        let np = 2;
        let psi = HarmonicModel::new(np, 0.2, params);
        let ham = HarmonicHamiltonian::new(1.0);
        let mut evaluator =
            CostFunctionEvaluator::new(config, make_store(n, np), LocalReducer, psi, ham);
        evaluator.prepare_sample_buffers();
        evaluator.evaluate_reference_configurations();
        evaluator
    }

    #[test]
    fn test_unperturbed_pass_reproduces_reference_accumulators() {
        let mut evaluator = make_evaluator(CostConfig::default(), 4, vec![0.45, 0.03]);
        let reference = *evaluator.sums();

        let eff = evaluator.correlated_sampling_pass(true);

        for row in evaluator.records().rows() {
            assert_relative_eq!(row.reweight, 1.0, epsilon = 1e-12);
            assert_relative_eq!(row.energy_new, row.energy_total, epsilon = 1e-10);
        }
        let sums = evaluator.sums();
        assert_relative_eq!(sums.weight, reference.weight, epsilon = 1e-10);
        assert_relative_eq!(sums.weight_sq, reference.weight_sq, epsilon = 1e-10);
        assert_relative_eq!(sums.weighted.e, reference.weighted.e, epsilon = 1e-9);
        assert_relative_eq!(sums.weighted.e_sq, reference.weighted.e_sq, epsilon = 1e-9);
        assert_relative_eq!(sums.bare.e, reference.bare.e, epsilon = 1e-9);
        assert_relative_eq!(sums.bare.e_sq, reference.bare.e_sq, epsilon = 1e-9);
        assert_relative_eq!(eff, 4.0, epsilon = 1e-10);
    }

    #[test]
    fn test_weight_mean_is_one_after_normalization() {
        let mut evaluator = make_evaluator(CostConfig::default(), 6, vec![0.45, 0.03]);
        evaluator.reset_parameters(&[0.5, 0.02]);
        evaluator.correlated_sampling_pass(false);

        let n = evaluator.num_samples() as f64;
        let mean_weight = evaluator.sums().weight / n;
        assert_relative_eq!(mean_weight, 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_effective_samples_bounds() {
        let mut evaluator = make_evaluator(CostConfig::default(), 6, vec![0.45, 0.03]);
        let n = evaluator.num_samples() as f64;

        // Equal weights: exactly the nominal count.
        let eff = evaluator.correlated_sampling_pass(false);
        assert_relative_eq!(eff, n, epsilon = 1e-10);

        // Perturbed parameters: strictly inside (0, n).
        evaluator.reset_parameters(&[0.6, 0.05]);
        let eff = evaluator.correlated_sampling_pass(false);
        assert!(eff > 0.0);
        assert!(eff < n);
    }

    #[test]
    fn test_finite_difference_matches_analytic_gradient() {
        let mut config = CostConfig::default();
        config.energy_weight = 0.4;
        config.variance_weight = 0.3;
        config.abs_energy_weight = 0.2;
        config.urv_weight = 0.15;
        config.energy_power = 2;

        let params = vec![0.45, 0.03];
        let mut evaluator = make_evaluator(config, 8, params.clone());

        let mut analytic = vec![0.0; 2];
        evaluator.compute_gradient(&mut analytic, &params, 0.0);
        assert!(evaluator.is_valid());

        let mut fd = vec![0.0; 2];
        evaluator.compute_gradient(&mut fd, &params, 1e-4);

        for j in 0..2 {
            assert_relative_eq!(analytic[j], fd[j], epsilon = 1e-5, max_relative = 1e-4);
        }
    }

    #[test]
    fn test_finite_difference_matches_analytic_reverse_mode() {
        let mut config = CostConfig::default();
        config.energy_weight = 1.0;
        config.variance_weight = 0.5;
        config.sampling_mode = SamplingMode::Reverse;

        let params = vec![0.4];
        let mut evaluator = make_evaluator(config, 6, params.clone());

        let mut analytic = vec![0.0];
        evaluator.compute_gradient(&mut analytic, &params, 0.0);
        let mut fd = vec![0.0];
        evaluator.compute_gradient(&mut fd, &params, 1e-4);
        assert_relative_eq!(analytic[0], fd[0], epsilon = 1e-5, max_relative = 1e-4);
    }

    /// Wavefunction with an extra flat parameter: a constant offset of
    /// ln|Ψ| that cannot change any normalized expectation value.
    #[derive(Clone)]
    struct FlatPlusGaussian {
        inner: HarmonicModel,
        offset: f64,
    }

    impl TrialWavefunction for FlatPlusGaussian {
        fn num_particles(&self) -> usize {
            self.inner.num_particles()
        }

        fn num_params(&self) -> usize {
            1 + self.inner.num_params()
        }

        fn params(&self) -> Vec<f64> {
            let mut p = vec![self.offset];
            p.extend(self.inner.params());
            p
        }

        fn reset_parameters(&mut self, params: &[f64]) {
            self.offset = params[0];
            self.inner.reset_parameters(&params[1..]);
        }

        fn start_optimization(&mut self) {
            self.inner.start_optimization();
        }

        fn stop_optimization(&mut self) {
            self.inner.stop_optimization();
        }

        fn evaluate_delta_log_setup(
            &self,
            r: &[Vector3<f64>],
            fixed_grad: &mut [Vector3<f64>],
            fixed_lap: &mut [f64],
        ) -> (f64, f64) {
            let (log_fixed, log_free) =
                self.inner.evaluate_delta_log_setup(r, fixed_grad, fixed_lap);
            (log_fixed, log_free + self.offset)
        }

        fn evaluate_delta_log(
            &self,
            r: &[Vector3<f64>],
            grad: &mut [Vector3<f64>],
            lap: &mut [f64],
        ) -> f64 {
            self.inner.evaluate_delta_log(r, grad, lap) + self.offset
        }

        fn parameter_derivatives(
            &self,
            r: &[Vector3<f64>],
            dlogpsi: &mut [f64],
            dhpsi: &mut [f64],
        ) {
            dlogpsi[0] = 1.0;
            dhpsi[0] = 0.0;
            self.inner.parameter_derivatives(r, &mut dlogpsi[1..], &mut dhpsi[1..]);
        }
    }

    #[test]
    fn test_flat_direction_has_zero_variance_and_urv_gradient() {
        let mut config = CostConfig::default();
        config.energy_weight = 0.0;
        config.variance_weight = 1.0;
        config.urv_weight = 1.0;

        let np = 2;
        let psi = FlatPlusGaussian { inner: HarmonicModel::new(np, 0.2, vec![0.45]), offset: 0.1 };
        let ham = HarmonicHamiltonian::new(1.0);
        let mut evaluator =
            CostFunctionEvaluator::new(config, make_store(4, np), LocalReducer, psi, ham);
        evaluator.prepare_sample_buffers();
        evaluator.evaluate_reference_configurations();

        // No parameter perturbation: every reweighting factor stays 1.
        let params = vec![0.1, 0.45];
        let mut gradient = vec![0.0; 2];
        evaluator.compute_gradient(&mut gradient, &params, 0.0);
        for row in evaluator.records().rows() {
            assert_relative_eq!(row.reweight, 1.0, epsilon = 1e-12);
        }
        assert!(
            gradient[0].abs() < 1e-9,
            "flat direction picked up a gradient: {}",
            gradient[0]
        );
    }

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    enum Event {
        Allreduce(usize),
        Barrier,
    }

    /// Reducer that records the order of its collective calls.
    #[derive(Default)]
    struct RecordingReducer {
        events: RefCell<Vec<Event>>,
    }

    impl DistributedReducer for RecordingReducer {
        fn num_ranks(&self) -> usize {
            1
        }

        fn allreduce(&self, values: &mut [f64]) {
            self.events.borrow_mut().push(Event::Allreduce(values.len()));
        }

        fn barrier(&self) {
            self.events.borrow_mut().push(Event::Barrier);
        }
    }

    #[test]
    fn test_pass_collective_ordering() {
        let np = 2;
        let psi = HarmonicModel::new(np, 0.2, vec![0.45]);
        let ham = HarmonicHamiltonian::new(1.0);
        let mut evaluator = CostFunctionEvaluator::new(
            CostConfig::default(),
            make_store(4, np),
            RecordingReducer::default(),
            psi,
            ham,
        );
        evaluator.prepare_sample_buffers();
        evaluator.evaluate_reference_configurations();
        evaluator.reducer.events.borrow_mut().clear();

        evaluator.correlated_sampling_pass(false);

        let events = evaluator.reducer.events.borrow().clone();
        assert_eq!(
            events,
            vec![
                // log-weight normalization constant and its second moment
                Event::Allreduce(1),
                Event::Allreduce(1),
                // stage-one and stage-two total weights
                Event::Allreduce(1),
                Event::Allreduce(1),
                // one full synchronization point per pass, then the
                // accumulator reduction
                Event::Barrier,
                Event::Allreduce(CostSums::LEN),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "not supported by the batched correlated-sampling pass")]
    fn test_nonlocal_term_aborts_pass() {
        let mut config = CostConfig::default();
        config.include_nonlocal = Some("NonLocalECP".to_string());
        let mut evaluator = make_evaluator_with_config_nonlocal(config);
        evaluator.correlated_sampling_pass(false);
    }

    fn make_evaluator_with_config_nonlocal(
        config: CostConfig,
    ) -> CostFunctionEvaluator<HarmonicModel, HarmonicHamiltonian, InMemorySampleStore, LocalReducer>
    {
        let np = 2;
        let psi = HarmonicModel::new(np, 0.2, vec![0.45]);
        let ham = HarmonicHamiltonian::new(1.0);
        let mut evaluator =
            CostFunctionEvaluator::new(config, make_store(4, np), LocalReducer, psi, ham);
        evaluator.prepare_sample_buffers();
        evaluator.evaluate_reference_configurations();
        evaluator
    }

    #[test]
    #[should_panic(expected = "not implemented with batched optimization")]
    fn test_engine_hook_aborts() {
        let mut evaluator = make_evaluator(CostConfig::default(), 4, vec![0.45]);
        evaluator.evaluate_reference_with_engine("lmy");
    }

    #[test]
    fn test_degenerate_reweighting_clears_validity_flag() {
        let mut config = CostConfig::default();
        config.min_effective_fraction = 0.9;
        let params = vec![0.45, 0.03];
        let mut evaluator = make_evaluator(config, 6, params);

        // A large parameter move concentrates the weight on few samples.
        let mut gradient = vec![0.0; 2];
        evaluator.compute_gradient(&mut gradient, &[2.5, 0.8], 0.0);
        assert!(!evaluator.is_valid());
        let n = evaluator.num_samples_global();
        assert!(evaluator.effective_samples() < 0.9 * n);
    }

    #[test]
    fn test_eigenproblem_symmetry_pure_variance() {
        let mut config = CostConfig::default();
        config.gev_mode = GevMode::Linear;
        config.gev_mixing = 1.0;
        let params = vec![0.45, 0.03];
        let mut evaluator = make_evaluator(config, 8, params.clone());

        let mut gradient = vec![0.0; 2];
        evaluator.compute_gradient(&mut gradient, &params, 0.0);

        let p = evaluator.num_params();
        let mut left = DMatrix::zeros(p + 1, p + 1);
        let mut right = DMatrix::zeros(p + 1, p + 1);
        let scale = evaluator.build_generalized_eigenproblem(&mut left, &mut right);
        assert_relative_eq!(scale, 1.0);
        assert_relative_eq!(right[(0, 0)], 1.0);

        for i in 0..=p {
            for j in 0..=p {
                assert_relative_eq!(left[(i, j)], left[(j, i)], epsilon = 1e-9);
                assert_relative_eq!(right[(i, j)], right[(j, i)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_eigenproblem_h2_mode_returns_normalization() {
        let mut config = CostConfig::default();
        config.gev_mode = GevMode::H2;
        config.gev_mixing = 0.4;
        let params = vec![0.45, 0.03];
        let mut evaluator = make_evaluator(config, 8, params.clone());

        let mut gradient = vec![0.0; 2];
        evaluator.compute_gradient(&mut gradient, &params, 0.0);

        let sums = evaluator.sums();
        let avg_w = sums.weighted.e / sums.weight;
        let expected = 1.0 / (avg_w * avg_w);

        let p = evaluator.num_params();
        let mut left = DMatrix::zeros(p + 1, p + 1);
        let mut right = DMatrix::zeros(p + 1, p + 1);
        let scale = evaluator.build_generalized_eigenproblem(&mut left, &mut right);
        assert_relative_eq!(scale, expected, epsilon = 1e-12);
    }
}
