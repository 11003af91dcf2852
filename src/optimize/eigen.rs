//! Linear-method generalized eigenproblem.
//!
//! Assembles the (P+1)×(P+1) Hamiltonian-like and overlap-like matrices
//! from the record tables of a gradient-carrying correlated-sampling pass.
//! Row and column 0 are the current wavefunction; rows/columns 1..=P are
//! the parameter directions, each shifted by the weighted mean
//! log-derivative so the basis stays orthogonal to the current state.

use nalgebra::DMatrix;

use crate::conf::GevMode;
use crate::records::{CostSums, DerivRecords, SampleRecordTable};
use crate::reduce::DistributedReducer;

/// Builder over the borrowed records of the most recent pass.
pub struct GeneralizedEigenproblemBuilder<'a, R> {
    records: &'a SampleRecordTable,
    derivs: &'a DerivRecords,
    sums: &'a CostSums,
    reducer: &'a R,
    mode: GevMode,
    mixing: f64,
}

impl<'a, R: DistributedReducer> GeneralizedEigenproblemBuilder<'a, R> {
    pub fn new(
        records: &'a SampleRecordTable,
        derivs: &'a DerivRecords,
        sums: &'a CostSums,
        reducer: &'a R,
        mode: GevMode,
        mixing: f64,
    ) -> Self {
        Self { records, derivs, sums, reducer, mode, mixing }
    }

    /// Fill `left` and `right` and return the scale factor of the
    /// eigenproblem: 1/⟨E⟩²_w in `H2` mode, 1.0 otherwise.
    ///
    /// Both matrices must already have shape (P+1)×(P+1); existing content
    /// is overwritten. Mixing blends the energy matrices toward their
    /// variance counterparts: `b2 = mixing` in `Linear` mode and
    /// `b1 = mixing` in `H2` mode, with the other coefficient zero.
    pub fn fill(&self, left: &mut DMatrix<f64>, right: &mut DMatrix<f64>) -> f64 {
        let p = self.derivs.num_params();
        assert_eq!(left.nrows(), p + 1, "left matrix shape must be (P+1)x(P+1)");
        assert_eq!(left.ncols(), p + 1);
        assert_eq!(right.nrows(), p + 1);
        assert_eq!(right.ncols(), p + 1);

        let (b1, b2) = match self.mode {
            GevMode::H2 => (self.mixing, 0.0),
            GevMode::Linear => (0.0, self.mixing),
        };

        left.fill(0.0);
        right.fill(0.0);

        let cur_avg_w = self.sums.weighted.e / self.sums.weight;
        let cur_avg2_w = self.sums.weighted.e_sq / self.sums.weight;
        let h2_avg = 1.0 / (cur_avg_w * cur_avg_w);
        let v_avg = cur_avg2_w - cur_avg_w * cur_avg_w;
        let wgtinv = 1.0 / self.sums.weight;

        // Weighted mean log-derivative per parameter, reduced before any
        // matrix element is formed.
        let mut d_avg = vec![0.0; p];
        for (iw, row) in self.records.rows().iter().enumerate() {
            let weight = row.reweight * wgtinv;
            for pm in 0..p {
                d_avg[pm] += self.derivs.dlogpsi[(iw, pm)] * weight;
            }
        }
        self.reducer.allreduce(&mut d_avg);

        for (iw, row) in self.records.rows().iter().enumerate() {
            let weight = row.reweight * wgtinv;
            let eloc_new = row.energy_new;
            for pm in 0..p {
                let d1 = self.derivs.dlogpsi[(iw, pm)] - d_avg[pm];
                let hd1 = self.derivs.dhpsi[(iw, pm)];
                let wfe = (hd1 + d1 * eloc_new) * weight;
                let wfd = d1 * weight;
                let vterm = hd1 * (eloc_new - cur_avg_w)
                    + d1 * eloc_new * (eloc_new - 2.0 * cur_avg_w);
                right[(0, pm + 1)] += b1 * h2_avg * vterm * weight;
                right[(pm + 1, 0)] += b1 * h2_avg * vterm * weight;
                left[(0, pm + 1)] += b2 * vterm * weight + (1.0 - b2) * wfe;
                left[(pm + 1, 0)] += b2 * vterm * weight + (1.0 - b2) * wfd * eloc_new;
                for pm2 in 0..p {
                    let d2 = self.derivs.dlogpsi[(iw, pm2)] - d_avg[pm2];
                    let hd2 = self.derivs.dhpsi[(iw, pm2)];
                    let ovlij = wfd * d2;
                    let varij = weight
                        * (hd1 - 2.0 * d1 * eloc_new)
                        * (hd2 - 2.0 * d2 * eloc_new);
                    left[(pm + 1, pm2 + 1)] += (1.0 - b2) * wfd * (hd2 + d2 * eloc_new)
                        + b2 * (varij + v_avg * ovlij);
                    right[(pm + 1, pm2 + 1)] += ovlij + b1 * h2_avg * varij;
                }
            }
        }

        self.reducer.allreduce(right.as_mut_slice());
        self.reducer.allreduce(left.as_mut_slice());

        left[(0, 0)] = (1.0 - b2) * cur_avg_w + b2 * v_avg;
        right[(0, 0)] = 1.0 + b1 * h2_avg * v_avg;

        match self.mode {
            GevMode::H2 => h2_avg,
            GevMode::Linear => 1.0,
        }
    }
}
