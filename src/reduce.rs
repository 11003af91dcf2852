//! Distributed reduction seam.
//!
//! Every statistic that feeds the cost, the gradient, or the eigenproblem
//! matrices must be summed across all participating ranks before use. The
//! crate only depends on this trait; an MPI-backed implementation lives
//! with the embedding application. All collectives are blocking: a rank
//! that never reaches a reduction deadlocks the others.

/// Blocking collective sum-reduction and barrier primitives.
pub trait DistributedReducer {
    /// Number of participating ranks.
    fn num_ranks(&self) -> usize;

    /// Element-wise in-place sum across all ranks.
    fn allreduce(&self, values: &mut [f64]);

    /// Scalar in-place sum across all ranks.
    fn allreduce_scalar(&self, value: &mut f64) {
        let mut buf = [*value];
        self.allreduce(&mut buf);
        *value = buf[0];
    }

    /// Block until every rank has entered the barrier.
    fn barrier(&self);
}

/// Single-rank reducer: sums are already global, barriers are trivial.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalReducer;

impl DistributedReducer for LocalReducer {
    fn num_ranks(&self) -> usize {
        1
    }

    fn allreduce(&self, _values: &mut [f64]) {}

    fn barrier(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_reducer_is_identity() {
        let reducer = LocalReducer;
        let mut values = [1.0, -2.5, 3.25];
        reducer.allreduce(&mut values);
        assert_eq!(values, [1.0, -2.5, 3.25]);

        let mut x = 7.0;
        reducer.allreduce_scalar(&mut x);
        assert_eq!(x, 7.0);
        reducer.barrier();
        assert_eq!(reducer.num_ranks(), 1);
    }
}
