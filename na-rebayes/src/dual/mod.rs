//! Joint estimation of the state and of the model's hyper-parameters: the
//! estimator updates its belief as usual, then revises the parameters it
//! filters with from the prediction it just made.

use nd::{Array, ArrayView, Axis, Ix1, Ix2};
use tracing::{debug, trace};

use na_core::check_dim;

use crate::{Error, Result};

pub use self::ekf::DualEkf;

pub mod ekf;

/// The hyper-parameters revised online.
#[derive(Clone, Debug, PartialEq)]
pub struct DualParams {
  pub mu0: Array<f64, Ix1>,
  /// Prior precision.
  pub eta0: f64,
  pub dynamics_weights: f64,
  pub dynamics_noise: f64,
  pub dynamics_covariance_inflation: f64,
  pub obs_noise_var: f64,
  pub nobs: usize,
}

impl DualParams {
  pub fn new(mu0: Array<f64, Ix1>) -> DualParams {
    DualParams {
      mu0,
      eta0: 1.0,
      dynamics_weights: 1.0,
      dynamics_noise: 0.0,
      dynamics_covariance_inflation: 0.0,
      obs_noise_var: 1.0,
      nobs: 0,
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.mu0.is_empty() {
      return Err(Error::invalid("mu0", "must not be empty"));
    }
    if !(self.eta0 > 0.0) || !self.eta0.is_finite() {
      return Err(Error::invalid("eta0", format!("must be positive, got {}", self.eta0)));
    }
    if !(self.dynamics_noise >= 0.0) {
      return Err(Error::invalid("dynamics_noise",
                                format!("must be non-negative, got {}", self.dynamics_noise)));
    }
    if !(self.dynamics_covariance_inflation >= 0.0) {
      return Err(Error::invalid("dynamics_covariance_inflation", "must be non-negative"));
    }
    if !(self.obs_noise_var > 0.0) {
      return Err(Error::invalid("obs_noise_var",
                                format!("must be positive, got {}", self.obs_noise_var)));
    }
    Ok(())
  }
}

/// What the dual scan callback sees after each step.
pub struct DualStep<'a, B> {
  pub t: usize,
  pub x: ArrayView<'a, f64, Ix1>,
  pub y: ArrayView<'a, f64, Ix1>,
  pub pred_obs: &'a Array<f64, Ix1>,
  /// Parameters after this step's revision.
  pub params: &'a DualParams,
  pub bel_pred: &'a B,
  pub bel: &'a B,
}

pub trait DualEstimator {
  type Bel: Clone;

  fn init(&self) -> Result<(DualParams, Self::Bel)>;
  fn predict_state(&self, params: &DualParams, bel: &Self::Bel) -> Result<Self::Bel>;
  fn update_state(&self, params: &DualParams, bel: &Self::Bel,
                  x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>) -> Result<Self::Bel>;
  fn predict_obs(&self, params: &DualParams, bel: &Self::Bel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix1>>;
  fn predict_obs_cov(&self, params: &DualParams, bel: &Self::Bel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix2>>;
  /// Revises `params` after step `t`, given the prediction `yhat` made
  /// before `y` was seen and the updated belief.
  fn update_params(&self, params: &DualParams, t: usize,
                   x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>,
                   yhat: &Array<f64, Ix1>, bel: &Self::Bel) -> Result<DualParams>;
}

/// Runs `estimator` over the rows of `xs`/`ys` starting from `init` (or
/// `estimator.init()`). Returns the final parameters and belief and every
/// callback output.
pub fn dual_scan<E, F, O>(estimator: &E, xs: ArrayView<f64, Ix2>, ys: ArrayView<f64, Ix2>,
                          init: Option<(DualParams, E::Bel)>, mut callback: F)
  -> Result<((DualParams, E::Bel), Vec<O>)>
  where E: DualEstimator,
        F: FnMut(DualStep<E::Bel>) -> Result<O>,
{
  check_dim("number of targets", xs.dim().0, ys.dim().0)?;
  let (mut params, mut bel) = match init {
    Some(carry) => carry,
    None => estimator.init()?,
  };

  let steps = xs.dim().0;
  debug!(steps, "dual scan start");
  let mut outputs = Vec::with_capacity(steps);
  for (t, (x, y)) in xs.axis_iter(Axis(0)).zip(ys.axis_iter(Axis(0))).enumerate() {
    let bel_pred = estimator.predict_state(&params, &bel)?;
    let pred_obs = estimator.predict_obs(&params, &bel_pred, x)?;
    let next = estimator.update_state(&params, &bel_pred, x, y)?;
    params = estimator.update_params(&params, t, x, y, &pred_obs, &next)?;
    outputs.push(callback(DualStep {
      t,
      x: x.reborrow(),
      y: y.reborrow(),
      pred_obs: &pred_obs,
      params: &params,
      bel_pred: &bel_pred,
      bel: &next,
    })?);
    trace!(t, obs_noise_var = params.obs_noise_var, "dual step done");
    bel = next;
  }
  debug!(steps, "dual scan done");

  Ok(((params, bel), outputs))
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::{make_2d_randn, Diagonal, PartialEqWithinTol};
  use rand::SeedableRng;
  use rand_isaac::Isaac64Rng;

  /// The belief accumulates the scaled inputs; the dynamics noise is set to
  /// the last step index.
  struct Accumulator {
    ndim_in: usize,
    ndim_out: usize,
    scale: f64,
  }

  impl DualEstimator for Accumulator {
    type Bel = Array<f64, Ix1>;

    fn init(&self) -> Result<(DualParams, Self::Bel)> {
      Ok((DualParams::new(Array::zeros(self.ndim_in)), Array::zeros(self.ndim_in)))
    }
    fn predict_state(&self, _: &DualParams, bel: &Self::Bel) -> Result<Self::Bel> {
      Ok(bel.clone())
    }
    fn update_state(&self, _: &DualParams, bel: &Self::Bel,
                    x: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>) -> Result<Self::Bel> {
      Ok(bel + &(&x * self.scale))
    }
    fn predict_obs(&self, _: &DualParams, _: &Self::Bel, _: ArrayView<f64, Ix1>)
      -> Result<Array<f64, Ix1>>
    {
      Ok(Array::zeros(self.ndim_out))
    }
    fn predict_obs_cov(&self, _: &DualParams, _: &Self::Bel, _: ArrayView<f64, Ix1>)
      -> Result<Array<f64, Ix2>>
    {
      Ok(Array::eye(self.ndim_out))
    }
    fn update_params(&self, params: &DualParams, t: usize,
                     _: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>,
                     _: &Array<f64, Ix1>, _: &Self::Bel) -> Result<DualParams> {
      let mut params = params.clone();
      params.dynamics_noise = t as f64;
      Ok(params)
    }
  }

  #[test]
  fn scan_bookkeeping() {
    let mut rng = Isaac64Rng::seed_from_u64(0);
    let xs = make_2d_randn((12, 5), Diagonal::Single(1.0), &mut rng);
    let mut ys = Array::<f64, Ix2>::zeros((12, 10));
    for t in 0..12 {
      ys[[t, t % 9]] = 1.0;
    }

    let est = Accumulator { ndim_in: 5, ndim_out: 10, scale: 2.0, };
    let ((params, bel), ts) = dual_scan(&est, xs.view(), ys.view(), None, |s| Ok(s.t))
      .unwrap();
    assert!(bel.partial_eq_within_tol(&(xs.sum_axis(Axis(0)) * 2.0), 1e-12));
    assert_eq!(params.dynamics_noise, 11.0);
    assert_eq!(ts, (0..12).collect::<Vec<_>>());

    let short = xs.slice(nd::s![..3, ..]);
    assert!(dual_scan(&est, short, ys.view(), None, |_| Ok(())).is_err());
  }

  #[test]
  fn validation() {
    let mut params = DualParams::new(Array::zeros(2));
    assert!(params.validate().is_ok());
    params.eta0 = 0.0;
    assert!(params.validate().is_err());
    params.eta0 = 1.0;
    params.obs_noise_var = -1.0;
    assert!(params.validate().is_err());
  }
}
