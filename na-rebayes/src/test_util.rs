//! Bayesian linear regression on 21 points, the reference problem the
//! filters are checked against.

use nd::{Array, Array3, Axis, Ix1, Ix2};

use na_core::LinearRegression;

use crate::kalman::{LinearGaussianSsm, PosteriorFiltered};
use crate::RebayesParams;

pub const OBS_VAR: f64 = 0.1;
pub const ATOL: f64 = 1e-3;

const Y: [f64; 21] = [
  2.486, -0.303, -4.053, -4.336, -6.174, -5.604, -3.507, -2.326, -4.638,
  -0.233, -1.986, 1.028, -2.264, -0.451, 1.167, 6.652, 4.145, 5.268, 6.34,
  9.626, 14.784,
];

/// `x = 0, 1, .., 20` as a `T x 1` input matrix, and the `T x 1` targets.
pub fn linreg_data() -> (Array<f64, Ix2>, Array<f64, Ix2>) {
  let xs = Array::linspace(0.0, 20.0, Y.len()).insert_axis(Axis(1));
  let ys = Array::from(Y.to_vec()).insert_axis(Axis(1));
  (xs, ys)
}

pub fn linreg_params() -> RebayesParams<LinearRegression> {
  let model = LinearRegression { input_dim: 1, obs_var: OBS_VAR, };
  RebayesParams::new(Array::zeros(2), model)
}

/// `[1, x_t]` per step, `T x 1 x 2`.
fn design(xs: &Array<f64, Ix2>) -> Array3<f64> {
  Array3::from_shape_fn((xs.dim().0, 1, 2), |(t, _, j)| {
    if j == 0 { 1.0 } else { xs[[t, 0]] }
  })
}

pub fn run_kalman(xs: &Array<f64, Ix2>, ys: &Array<f64, Ix2>) -> PosteriorFiltered {
  let ssm = LinearGaussianSsm {
    initial_mean: Array::zeros(2),
    initial_covariance: Array::eye(2),
    dynamics_weights: Array::eye(2),
    dynamics_covariance: Array::zeros((2, 2)),
    emission_covariance: Array::eye(1) * OBS_VAR,
  };
  ssm.filter(design(xs).view(), ys.view()).unwrap()
}

/// Closed-form posterior under the `N(0, I)` prior.
pub fn batch_bayes(xs: &Array<f64, Ix2>, ys: &Array<f64, Ix2>)
  -> (Array<f64, Ix1>, Array<f64, Ix2>)
{
  let x1 = design(xs).index_axis_move(Axis(1), 0);
  let prec = Array::<f64, Ix2>::eye(2) + x1.t().dot(&x1) / OBS_VAR;
  let b = x1.t().dot(&ys.column(0)) / OBS_VAR;
  let cov = nla::inv(&prec).unwrap();
  let mean = cov.dot(&b);
  (mean, cov)
}
