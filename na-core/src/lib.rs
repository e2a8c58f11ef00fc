extern crate ndarray as nd;
extern crate nla_factorize as nla;
extern crate num_traits;
extern crate rand;
extern crate rand_distr;
extern crate rayon;
extern crate thiserror;
extern crate tracing;

use nd::{Array, ArrayBase, ArrayView, ArrayViewMut, Axis, Data, Ix1, Ix2};
use nd::linalg::general_mat_vec_mul;
use nd::parallel::prelude::*;
use nd::LinalgScalar;

use num_traits::{One, Zero};

pub use error::{check_dim, Error, Result};
pub use mlp::{Activation, Mlp};
pub use models::{LinearEmission, LinearRegression, MlpClassification, MlpRegression};

pub mod error;
pub mod mlp;
pub mod models;
pub mod stats;

/// A conditional emission distribution `p(y | state, input)`, summarised by
/// its first two moments. `state` is the (flattened) latent vector the
/// filters estimate; `input` is the per-step covariate.
pub trait EmissionModel: Send + Sync {
  fn emission_dim(&self) -> usize;

  fn eval_mean_at(&self,
                  state: ArrayView<f64, Ix1>,
                  input: ArrayView<f64, Ix1>,
                  out: ArrayViewMut<f64, Ix1>) -> Result<()>;

  fn eval_covariance_at(&self,
                        state: ArrayView<f64, Ix1>,
                        input: ArrayView<f64, Ix1>,
                        out: ArrayViewMut<f64, Ix2>) -> Result<()>;

  /// `out` is `emission_dim x state.len()`. Defaults to central finite
  /// differences.
  fn eval_jacobian_at(&self,
                      state: ArrayView<f64, Ix1>,
                      input: ArrayView<f64, Ix1>,
                      out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    finite_difference_jacobian(self, state, input, out)
  }

  fn mean(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix1>>
  {
    let mut out = Array::zeros(self.emission_dim());
    self.eval_mean_at(state, input, out.view_mut())?;
    Ok(out)
  }
  fn covariance(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix2>>
  {
    let c = self.emission_dim();
    let mut out = Array::zeros((c, c));
    self.eval_covariance_at(state, input, out.view_mut())?;
    Ok(out)
  }
  fn jacobian(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix2>>
  {
    let mut out = Array::zeros((self.emission_dim(), state.len()));
    self.eval_jacobian_at(state, input, out.view_mut())?;
    Ok(out)
  }
}

impl<'a, M> EmissionModel for &'a M
  where M: EmissionModel + ?Sized,
{
  fn emission_dim(&self) -> usize { (**self).emission_dim() }
  fn eval_mean_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                  out: ArrayViewMut<f64, Ix1>) -> Result<()> {
    (**self).eval_mean_at(state, input, out)
  }
  fn eval_covariance_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                        out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    (**self).eval_covariance_at(state, input, out)
  }
  fn eval_jacobian_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                      out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    (**self).eval_jacobian_at(state, input, out)
  }
}

/// Column `j` is `(h(m + e_j d) - h(m - e_j d)) / 2d`; columns are filled in
/// parallel.
pub fn finite_difference_jacobian<M>(model: &M,
                                     state: ArrayView<f64, Ix1>,
                                     input: ArrayView<f64, Ix1>,
                                     mut out: ArrayViewMut<f64, Ix2>) -> Result<()>
  where M: EmissionModel + ?Sized,
{
  let c = model.emission_dim();
  check_dim("jacobian rows", c, out.dim().0)?;
  check_dim("jacobian columns", state.len(), out.dim().1)?;

  const STEP: f64 = 6.0554544523933395e-6; // cbrt(f64::EPSILON)

  out.axis_iter_mut(Axis(1))
    .into_par_iter()
    .enumerate()
    .try_for_each(|(j, mut col)| -> Result<()> {
      let d = STEP * state[j].abs().max(1.0);
      let mut probe = state.to_owned();
      let mut hi = Array::zeros(c);
      let mut lo = Array::zeros(c);

      probe[j] = state[j] + d;
      model.eval_mean_at(probe.view(), input, hi.view_mut())?;
      probe[j] = state[j] - d;
      model.eval_mean_at(probe.view(), input, lo.view_mut())?;

      col.assign(&((hi - lo) / (2.0 * d)));
      Ok(())
    })
}

/// A matrix acting on vectors.
pub trait LinearOperator<E>: Send + Sync {
  fn operator_input_dim(&self) -> usize;
  fn operator_output_dim(&self) -> usize;
  fn eval_at(&self, x: ArrayView<E, Ix1>,
             out: ArrayViewMut<E, Ix1>) -> Result<()>;
  fn eval_jacobian_at(&self, x: ArrayView<E, Ix1>,
                      out: ArrayViewMut<E, Ix2>) -> Result<()>;
}

impl<D, E> LinearOperator<E> for ArrayBase<D, Ix2>
  where D: Data<Elem = E> + Send + Sync,
        E: LinalgScalar + One + Zero + Sync + Send,
{
  fn operator_input_dim(&self) -> usize { self.dim().1 }
  fn operator_output_dim(&self) -> usize { self.dim().0 }
  fn eval_at(&self, x: ArrayView<E, Ix1>,
             mut out: ArrayViewMut<E, Ix1>) -> Result<()> {
    check_dim("operator input", self.operator_input_dim(), x.len())?;
    check_dim("operator output", self.operator_output_dim(), out.len())?;
    general_mat_vec_mul(One::one(),
                        self, &x, Zero::zero(),
                        &mut out);

    Ok(())
  }
  fn eval_jacobian_at(&self, _: ArrayView<E, Ix1>,
                      mut out: ArrayViewMut<E, Ix2>) -> Result<()> {
    if out.dim() != self.dim() {
      return Err(nd::ShapeError::from_kind(nd::ErrorKind::IncompatibleShape).into());
    }
    out.assign(self);
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use nd::{arr1, arr2};

  struct Cubic;
  impl EmissionModel for Cubic {
    fn emission_dim(&self) -> usize { 2 }
    fn eval_mean_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                    mut out: ArrayViewMut<f64, Ix1>) -> Result<()> {
      out[0] = state[0].powi(3) * input[0];
      out[1] = state[0] * state[1];
      Ok(())
    }
    fn eval_covariance_at(&self, _: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>,
                          mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
      out.fill(0.0);
      out.diag_mut().fill(1.0);
      Ok(())
    }
  }

  #[test]
  fn finite_difference_matches_analytic() {
    let m = arr1(&[1.5, -2.0]);
    let x = arr1(&[2.0]);
    let j = Cubic.jacobian(m.view(), x.view()).unwrap();
    let expected = arr2(&[
      [3.0 * 1.5 * 1.5 * 2.0, 0.0],
      [-2.0, 1.5],
    ]);
    for (l, r) in j.iter().zip(expected.iter()) {
      assert!((l - r).abs() < 1e-6, "{} != {}", l, r);
    }
  }

  #[test]
  fn matrix_operator() {
    let a = arr2(&[
      [1.0, 2.0],
      [0.0, -1.0],
      [3.0, 1.0],
    ]);
    let mut out = Array::zeros(3);
    a.eval_at(arr1(&[1.0, 1.0]).view(), out.view_mut()).unwrap();
    assert_eq!(out, arr1(&[3.0, -1.0, 4.0]));

    let mut j = Array::zeros((3, 2));
    a.eval_jacobian_at(arr1(&[0.0, 0.0]).view(), j.view_mut()).unwrap();
    assert_eq!(j, a);

    assert!(a.eval_at(arr1(&[1.0]).view(), out.view_mut()).is_err());
  }
}
