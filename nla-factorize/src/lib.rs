//! Dense factorizations for the small-to-medium systems the filters
//! produce. Nothing here calls out to LAPACK.

#[macro_use]
extern crate ndarray as nd;
extern crate num_traits;
extern crate thiserror;

use nd::{LinalgScalar, ScalarOperand, ShapeError};
use num_traits::Float;

pub use cholesky::*;
pub use lu::*;
pub use svd::*;
pub use triangular::*;

pub mod cholesky;
pub mod lu;
pub mod svd;
pub mod triangular;

pub type Result<T> = ::std::result::Result<T, FactorizeError>;

#[derive(Debug, thiserror::Error)]
pub enum FactorizeError {
  #[error("shape error: {0}")]
  Shape(#[from] ShapeError),
  #[error("matrix is not positive definite (pivot {pivot})")]
  NotPositiveDefinite { pivot: usize },
  #[error("matrix is singular (pivot {pivot})")]
  Singular { pivot: usize },
  #[error("no convergence after {sweeps} sweeps")]
  NoConvergence { sweeps: usize },
}

/// The scalar bound shared by every factorization in this crate.
pub trait Scalar: LinalgScalar + Float + ScalarOperand {}
impl<T> Scalar for T
  where T: LinalgScalar + Float + ScalarOperand,
{ }

pub(crate) fn check_square(dim: (usize, usize)) -> Result<usize> {
  if dim.0 != dim.1 {
    return Err(ShapeError::from_kind(nd::ErrorKind::IncompatibleShape).into());
  }
  Ok(dim.0)
}
