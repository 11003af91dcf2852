//! Archived-sample access.
//!
//! The random walk that produced the configurations is not part of this
//! crate; the optimizer only ever reads the archive back, one configuration
//! at a time, into a caller-provided position buffer.

use nalgebra::Vector3;

/// Read access to an append-only archive of particle configurations.
pub trait SampleStore {
    /// Number of archived configurations for the current optimization step.
    fn num_samples(&self) -> usize;

    /// Copy configuration `index` into `positions`.
    ///
    /// `positions` must hold exactly the particle count the archive was
    /// recorded with.
    fn load_sample(&self, index: usize, positions: &mut [Vector3<f64>]);
}

/// In-memory sample archive.
#[derive(Clone, Debug, Default)]
pub struct InMemorySampleStore {
    samples: Vec<Vec<Vector3<f64>>>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self { samples: Vec::new() }
    }

    /// Append one configuration. The archive is append-only; samples from
    /// earlier optimization iterations stay addressable.
    pub fn append(&mut self, positions: Vec<Vector3<f64>>) {
        self.samples.push(positions);
    }
}

impl SampleStore for InMemorySampleStore {
    fn num_samples(&self) -> usize {
        self.samples.len()
    }

    fn load_sample(&self, index: usize, positions: &mut [Vector3<f64>]) {
        positions.copy_from_slice(&self.samples[index]);
    }
}
