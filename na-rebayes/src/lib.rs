//! Recursive Bayesian estimators for the parameters of a state-space model
//!
//! ```text
//! z_t = gamma z_{t-1} + N(0, q I)
//! y_t ~ N(h(z_t, x_t), R_t)
//! ```
//!
//! one observation at a time.

extern crate ndarray as nd;
extern crate na_core;
extern crate nla_factorize as nla;
extern crate rand;
extern crate rand_distr;
extern crate rand_isaac;
extern crate rayon;
extern crate tracing;

use nd::{Array, ArrayView, Axis, Ix1, Ix2};
use tracing::{debug, trace, warn};

pub use na_core::{EmissionModel, Error, Result};
use na_core::check_dim;

pub mod callbacks;
pub mod dual;
pub mod kalman;
pub mod lofi;
pub mod lrvga;
pub mod orfit;
pub mod sampling;
pub mod utils;

#[cfg(test)]
mod test_util;

/// Floor for adaptively estimated observation noise.
pub const MIN_OBS_NOISE_VAR: f64 = 1e-6;

pub trait Belief: Clone + Send {
  fn mean(&self) -> ArrayView<f64, Ix1>;
}

/// Model settings shared by every estimator. Covariances are isotropic:
/// the prior is `N(initial_mean, initial_covariance I)` and the dynamics
/// add `N(0, dynamics_covariance I)` after decaying by `dynamics_weights`.
#[derive(Clone, Debug)]
pub struct RebayesParams<M> {
  pub initial_mean: Array<f64, Ix1>,
  pub initial_covariance: f64,
  pub dynamics_weights: f64,
  pub dynamics_covariance: f64,
  pub emission: M,
  pub adaptive_emission_cov: bool,
  pub dynamics_covariance_inflation_factor: f64,
}

impl<M> RebayesParams<M>
  where M: EmissionModel,
{
  /// Unit prior covariance, static dynamics, no inflation.
  pub fn new(initial_mean: Array<f64, Ix1>, emission: M) -> RebayesParams<M> {
    RebayesParams {
      initial_mean,
      initial_covariance: 1.0,
      dynamics_weights: 1.0,
      dynamics_covariance: 0.0,
      emission,
      adaptive_emission_cov: false,
      dynamics_covariance_inflation_factor: 0.0,
    }
  }

  pub fn state_dim(&self) -> usize { self.initial_mean.len() }
  /// Prior precision.
  pub fn eta(&self) -> f64 { 1.0 / self.initial_covariance }

  pub fn validate(&self) -> Result<()> {
    if self.initial_mean.is_empty() {
      return Err(Error::invalid("initial_mean", "must not be empty"));
    }
    if self.initial_mean.iter().any(|v| !v.is_finite()) {
      return Err(Error::NonFinite { what: "initial_mean" });
    }
    if !(self.initial_covariance > 0.0) || !self.initial_covariance.is_finite() {
      return Err(Error::invalid("initial_covariance",
                                format!("must be positive, got {}", self.initial_covariance)));
    }
    if !self.dynamics_weights.is_finite() {
      return Err(Error::NonFinite { what: "dynamics_weights" });
    }
    if !(self.dynamics_covariance >= 0.0) || !self.dynamics_covariance.is_finite() {
      return Err(Error::invalid("dynamics_covariance",
                                format!("must be non-negative, got {}", self.dynamics_covariance)));
    }
    let alpha = self.dynamics_covariance_inflation_factor;
    if !(alpha >= 0.0) || !alpha.is_finite() {
      return Err(Error::invalid("dynamics_covariance_inflation_factor",
                                format!("must be non-negative, got {}", alpha)));
    }
    Ok(())
  }

  /// `Some(obs_noise_var)` when the noise is estimated online.
  pub fn noise_override(&self, obs_noise_var: f64) -> Option<f64> {
    if self.adaptive_emission_cov { Some(obs_noise_var) } else { None }
  }

  /// The observation noise used when conditioning at `mean`.
  pub fn emission_noise(&self, mean: ArrayView<f64, Ix1>, x: ArrayView<f64, Ix1>,
                        obs_noise_var: f64) -> Result<Array<f64, Ix2>> {
    observation_noise(&self.emission, mean, x, self.noise_override(obs_noise_var))
  }

  /// Adaptive estimate of the observation noise variance after
  /// conditioning. Returns `(0, 0.0)` when adaptation is off.
  pub fn estimate_noise(&self, mean: ArrayView<f64, Ix1>,
                        x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>,
                        nobs: usize, obs_noise_var: f64) -> Result<(usize, f64)> {
    if !self.adaptive_emission_cov {
      return Ok((0, 0.0));
    }
    let yhat = self.emission.mean(mean, x)?;
    let r = (&yhat - &y).mapv(|v| v * v).sum() / yhat.len() as f64;
    let nobs = nobs + 1;
    let est = obs_noise_var + (r - obs_noise_var) / nobs as f64;
    if est < MIN_OBS_NOISE_VAR {
      warn!(nobs, est, "observation noise estimate hit its floor");
    }
    Ok((nobs, est.max(MIN_OBS_NOISE_VAR)))
  }
}

/// `r I` when an override is given, else the model's `Cov[y | mean, x]`.
pub fn observation_noise<M>(emission: &M, mean: ArrayView<f64, Ix1>,
                            x: ArrayView<f64, Ix1>, obs_noise_var: Option<f64>)
  -> Result<Array<f64, Ix2>>
  where M: EmissionModel + ?Sized,
{
  match obs_noise_var {
    Some(r) => Ok(Array::eye(emission.emission_dim()) * r),
    None => emission.covariance(mean, x),
  }
}

/// What the scan callback sees after each step.
pub struct Step<'a, B> {
  pub t: usize,
  pub x: ArrayView<'a, f64, Ix1>,
  pub y: ArrayView<'a, f64, Ix1>,
  /// One-step-ahead prediction, made from `bel_pred` before seeing `y`.
  pub pred_obs: &'a Array<f64, Ix1>,
  pub bel_pred: &'a B,
  pub bel: &'a B,
}

pub trait Rebayes {
  type Bel: Belief;

  fn init_bel(&self) -> Result<Self::Bel>;
  fn predict_state(&self, bel: &Self::Bel) -> Result<Self::Bel>;
  fn predict_obs(&self, bel: &Self::Bel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix1>>;
  fn predict_obs_cov(&self, bel: &Self::Bel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix2>>;
  fn update_state(&self, bel: &Self::Bel,
                  x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>)
    -> Result<Self::Bel>;

  fn step<F, O>(&self, t: usize, bel: &Self::Bel,
                x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>,
                callback: &mut F) -> Result<(Self::Bel, O)>
    where F: FnMut(Step<Self::Bel>) -> Result<O>,
  {
    let bel_pred = self.predict_state(bel)?;
    let pred_obs = self.predict_obs(&bel_pred, x)?;
    let bel = self.update_state(&bel_pred, x, y)?;
    let out = callback(Step {
      t,
      x: x.reborrow(),
      y: y.reborrow(),
      pred_obs: &pred_obs,
      bel_pred: &bel_pred,
      bel: &bel,
    })?;
    Ok((bel, out))
  }

  /// Filters the rows of `xs`/`ys` in order, starting from `bel` (or the
  /// prior). Returns the final belief and every callback output.
  fn scan<F, O>(&self, xs: ArrayView<f64, Ix2>, ys: ArrayView<f64, Ix2>,
                bel: Option<Self::Bel>, mut callback: F)
    -> Result<(Self::Bel, Vec<O>)>
    where F: FnMut(Step<Self::Bel>) -> Result<O>,
  {
    check_dim("number of targets", xs.dim().0, ys.dim().0)?;
    let mut bel = match bel {
      Some(bel) => bel,
      None => self.init_bel()?,
    };

    let steps = xs.dim().0;
    debug!(steps, "scan start");
    let mut outputs = Vec::with_capacity(steps);
    for (t, (x, y)) in xs.axis_iter(Axis(0)).zip(ys.axis_iter(Axis(0))).enumerate() {
      let (next, out) = self.step(t, &bel, x, y, &mut callback)?;
      trace!(t, "step done");
      bel = next;
      outputs.push(out);
    }
    debug!(steps, "scan done");

    Ok((bel, outputs))
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use na_core::LinearRegression;
  use nd::arr1;

  #[test]
  fn params_validation() {
    let model = LinearRegression { input_dim: 1, obs_var: 0.1, };
    let mut params = RebayesParams::new(arr1(&[0.0, 0.0]), model);
    assert!(params.validate().is_ok());

    params.initial_covariance = 0.0;
    assert!(params.validate().is_err());
    params.initial_covariance = 1.0;
    params.dynamics_covariance = -1.0;
    assert!(params.validate().is_err());
    params.dynamics_covariance = 0.0;
    params.dynamics_covariance_inflation_factor = ::std::f64::NAN;
    assert!(params.validate().is_err());

    let empty = RebayesParams::new(Array::zeros(0), model);
    assert!(empty.validate().is_err());
  }

  #[test]
  fn noise_estimate_running_mean() {
    let model = LinearRegression { input_dim: 1, obs_var: 0.1, };
    let mut params = RebayesParams::new(arr1(&[0.0, 0.0]), model);
    let m = arr1(&[0.0, 1.0]);
    let x = arr1(&[2.0]);
    let y = arr1(&[5.0]);

    assert_eq!(params.estimate_noise(m.view(), x.view(), y.view(), 0, 1.0).unwrap(),
               (0, 0.0));

    params.adaptive_emission_cov = true;
    let (nobs, r) = params.estimate_noise(m.view(), x.view(), y.view(), 0, 1.0).unwrap();
    assert_eq!(nobs, 1);
    assert_eq!(r, 9.0);
    let (nobs, r) = params.estimate_noise(m.view(), x.view(), x.view(), nobs, r).unwrap();
    assert_eq!(nobs, 2);
    assert_eq!(r, 4.5);

    let (_, r) = params.estimate_noise(m.view(), x.view(), x.view(), 0, 0.0).unwrap();
    assert_eq!(r, MIN_OBS_NOISE_VAR);
  }
}
