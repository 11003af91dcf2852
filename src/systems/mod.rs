//! Systems module - reference model systems for optimizer tests and demos.

mod harmonic;

pub use harmonic::{HarmonicHamiltonian, HarmonicModel};
