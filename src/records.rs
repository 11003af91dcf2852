//! Per-sample data model of the cost-function evaluator.
//!
//! One `SampleRecord` row per archived configuration, a dense
//! (samples × parameters) derivative table pair, and the named statistical
//! accumulators that every correlated-sampling pass reduces across ranks.

use nalgebra::DMatrix;

/// One row of the record table: everything remembered about a sample
/// between passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SampleRecord {
    /// ln|Ψ_fixed| at the reference parameters.
    pub logpsi_fixed: f64,
    /// ln|Ψ_free| at the reference parameters; the reweighting baseline.
    pub logpsi_free: f64,
    /// Local energy under the current parameters.
    pub energy_new: f64,
    /// Parameter-independent part of the local energy.
    pub energy_fixed: f64,
    /// Full reference local energy.
    pub energy_total: f64,
    /// Reweighting factor. Holds the raw log-weight mid-pass; a finished
    /// pass leaves the normalized, clamped weight.
    pub reweight: f64,
}

/// Record table with one row per archived sample.
///
/// Shape changes reallocate; rows are never silently truncated in place.
#[derive(Clone, Debug, Default)]
pub struct SampleRecordTable {
    rows: Vec<SampleRecord>,
}

impl SampleRecordTable {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    /// Rebuild for `num_samples` rows if the count changed. Existing rows
    /// are discarded; a shape change invalidates every recorded value.
    pub fn resize(&mut self, num_samples: usize) {
        if self.rows.len() != num_samples {
            self.rows = vec![SampleRecord::default(); num_samples];
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[SampleRecord] {
        &self.rows
    }

    pub fn rows_mut(&mut self) -> &mut [SampleRecord] {
        &mut self.rows
    }
}

/// Dense parameter-derivative tables, one row per sample.
///
/// `dlogpsi[(iw, p)] = ∂ ln|Ψ| / ∂θ_p` and
/// `dhpsi[(iw, p)] = ∂ (HΨ/Ψ) / ∂θ_p` at sample `iw`. Recomputed by every
/// pass that needs gradients; rebuilt whenever either count changes.
#[derive(Clone, Debug, Default)]
pub struct DerivRecords {
    pub dlogpsi: DMatrix<f64>,
    pub dhpsi: DMatrix<f64>,
}

impl DerivRecords {
    pub fn new() -> Self {
        Self {
            dlogpsi: DMatrix::zeros(0, 0),
            dhpsi: DMatrix::zeros(0, 0),
        }
    }

    /// Rebuild for the given shape if it changed.
    pub fn resize(&mut self, num_samples: usize, num_params: usize) {
        if self.dlogpsi.nrows() != num_samples || self.dlogpsi.ncols() != num_params {
            self.dlogpsi = DMatrix::zeros(num_samples, num_params);
            self.dhpsi = DMatrix::zeros(num_samples, num_params);
        }
    }

    pub fn num_params(&self) -> usize {
        self.dlogpsi.ncols()
    }
}

/// Bare or reweighted moments of the local energy.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MomentSums {
    /// Σ E
    pub e: f64,
    /// Σ E²
    pub e_sq: f64,
    /// Σ |E − E_target|^p
    pub abs_de: f64,
}

/// Named statistical accumulators of one correlated-sampling pass.
///
/// `bare` sums carry no reweighting factor; `weighted` sums carry one
/// factor of the per-sample weight. Valid only after a full distributed
/// reduction; an aborted pass leaves them undefined.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CostSums {
    pub bare: MomentSums,
    pub weighted: MomentSums,
    /// Σ w
    pub weight: f64,
    /// Σ w². Diagnostic only: consumed by the effective-sample count,
    /// never by gradient or matrix logic.
    pub weight_sq: f64,
}

impl CostSums {
    pub const LEN: usize = 8;

    /// Zero every accumulator; called at the start of each pass.
    pub fn reset(&mut self) {
        *self = CostSums::default();
    }

    /// Fixed-order flattening for collective reduction.
    pub fn to_array(self) -> [f64; Self::LEN] {
        [
            self.bare.e,
            self.bare.e_sq,
            self.bare.abs_de,
            self.weighted.e,
            self.weighted.e_sq,
            self.weighted.abs_de,
            self.weight,
            self.weight_sq,
        ]
    }

    pub fn from_array(a: [f64; Self::LEN]) -> Self {
        Self {
            bare: MomentSums { e: a[0], e_sq: a[1], abs_de: a[2] },
            weighted: MomentSums { e: a[3], e_sq: a[4], abs_de: a[5] },
            weight: a[6],
            weight_sq: a[7],
        }
    }

    /// (Σw)² / Σw², the correlated-sampling efficiency diagnostic.
    pub fn effective_samples(&self) -> f64 {
        self.weight * self.weight / self.weight_sq
    }
}
