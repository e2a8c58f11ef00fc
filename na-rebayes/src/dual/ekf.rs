use nd::{Array, ArrayView, Ix1, Ix2};
use tracing::trace;

use na_core::EmissionModel;

use crate::dual::{DualEstimator, DualParams};
use crate::kalman::ekf::{condition_on, dynamics_predict, predict_obs_cov};
use crate::kalman::{Covariance, EkfBel, EkfMethod};
use crate::{Error, Result, MIN_OBS_NOISE_VAR};

/// EKF whose observation noise is a hyper-parameter, learnt from the squared
/// one-step-ahead errors with a decaying learning rate
/// `obs_noise_var_lr / nobs`. A zero learning rate keeps the model's own
/// emission covariance.
pub struct DualEkf<M> {
  pub emission: M,
  pub method: EkfMethod,
  pub obs_noise_var_lr: f64,
  pub params: DualParams,
}

impl<M> DualEkf<M>
  where M: EmissionModel,
{
  pub fn new(params: DualParams, emission: M, method: EkfMethod, obs_noise_var_lr: f64)
    -> Result<DualEkf<M>>
  {
    params.validate()?;
    if !(obs_noise_var_lr >= 0.0) {
      return Err(Error::invalid("obs_noise_var_lr",
                                format!("must be non-negative, got {}", obs_noise_var_lr)));
    }
    Ok(DualEkf { emission, method, obs_noise_var_lr, params, })
  }

  fn adaptive(&self) -> bool { self.obs_noise_var_lr > 0.0 }

  fn noise_override(&self, params: &DualParams) -> Option<f64> {
    if self.adaptive() { Some(params.obs_noise_var) } else { None }
  }
}

impl<M> DualEstimator for DualEkf<M>
  where M: EmissionModel,
{
  type Bel = EkfBel;

  fn init(&self) -> Result<(DualParams, EkfBel)> {
    let p = &self.params;
    let bel = EkfBel {
      mean: p.mu0.clone(),
      cov: Covariance::isotropic(self.method, p.mu0.len(), 1.0 / p.eta0),
      nobs: p.nobs,
      obs_noise_var: p.obs_noise_var,
    };
    Ok((p.clone(), bel))
  }

  fn predict_state(&self, params: &DualParams, bel: &EkfBel) -> Result<EkfBel> {
    let (mean, cov) = dynamics_predict(&bel.mean, &bel.cov, params.dynamics_noise,
                                       params.dynamics_weights,
                                       params.dynamics_covariance_inflation);
    Ok(EkfBel { mean, cov, ..bel.clone() })
  }

  fn update_state(&self, params: &DualParams, bel: &EkfBel,
                  x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>) -> Result<EkfBel> {
    let (mean, cov) = condition_on(self.method, &bel.mean, &bel.cov, &self.emission, x, y, 1,
                                   self.noise_override(params))?;
    Ok(EkfBel {
      mean,
      cov,
      nobs: params.nobs,
      obs_noise_var: params.obs_noise_var,
    })
  }

  fn predict_obs(&self, _: &DualParams, bel: &EkfBel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix1>>
  {
    self.emission.mean(bel.mean.view(), x)
  }

  fn predict_obs_cov(&self, params: &DualParams, bel: &EkfBel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix2>>
  {
    predict_obs_cov(&bel.mean, &bel.cov, &self.emission, x, self.noise_override(params))
  }

  fn update_params(&self, params: &DualParams, t: usize,
                   _: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>,
                   yhat: &Array<f64, Ix1>, _: &EkfBel) -> Result<DualParams> {
    if !self.adaptive() {
      return Ok(params.clone());
    }
    let sqerr = (yhat - &y).mapv(|v| v * v).sum() / yhat.len() as f64;
    let nobs = params.nobs + 1;
    let lr = self.obs_noise_var_lr / nobs as f64;
    let r = (1.0 - lr) * params.obs_noise_var + lr * sqerr;
    trace!(t, sqerr, r, "observation noise revised");
    Ok(DualParams {
      nobs,
      obs_noise_var: r.max(MIN_OBS_NOISE_VAR),
      ..params.clone()
    })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::dual::dual_scan;
  use crate::kalman::RebayesEkf;
  use crate::test_util::*;
  use crate::utils::PartialEqWithinTol;
  use crate::Rebayes;
  use na_core::LinearRegression;

  fn dual_params() -> DualParams {
    let mut params = DualParams::new(Array::zeros(2));
    params.dynamics_noise = 1e-2;
    params.dynamics_weights = 0.99;
    params
  }

  fn model() -> LinearRegression {
    LinearRegression { input_dim: 1, obs_var: OBS_VAR, }
  }

  #[test]
  fn fixed_noise_is_the_plain_ekf() {
    let (xs, ys) = linreg_data();
    for &method in [EkfMethod::Fcekf, EkfMethod::Fdekf, EkfMethod::Vdekf].iter() {
      let dual = DualEkf::new(dual_params(), model(), method, 0.0).unwrap();
      let mut params = linreg_params();
      params.dynamics_covariance = 1e-2;
      params.dynamics_weights = 0.99;
      let ekf = RebayesEkf::new(params, method).unwrap();

      let ((p, _), dual_means) = dual_scan(&dual, xs.view(), ys.view(), None, |s| {
        Ok(s.bel.mean.clone())
      }).unwrap();
      let (_, means) = ekf.scan(xs.view(), ys.view(), None, |s| Ok(s.bel.mean.clone()))
        .unwrap();
      for (a, b) in dual_means.iter().zip(means.iter()) {
        assert!(a.partial_eq_within_tol(b, 1e-10));
      }
      assert_eq!(p, dual_params());
    }
  }

  #[test]
  fn unit_rate_averages_squared_errors() {
    let (xs, ys) = linreg_data();
    let dual = DualEkf::new(dual_params(), model(), EkfMethod::Fcekf, 1.0).unwrap();
    let ((params, _), sqerrs) = dual_scan(&dual, xs.view(), ys.view(), None, |s| {
      let e = s.pred_obs[0] - s.y[0];
      Ok(e * e)
    }).unwrap();

    let mean = sqerrs.iter().sum::<f64>() / sqerrs.len() as f64;
    assert_eq!(params.nobs, xs.dim().0);
    assert!((params.obs_noise_var - mean.max(MIN_OBS_NOISE_VAR)).abs() < 1e-9 * mean.max(1.0));

    let x = xs.row(0);
    let (_, bel) = dual.init().unwrap();
    let cov = dual.predict_obs_cov(&params, &bel, x).unwrap();
    assert!((cov[[0, 0]] - (1.0 + params.obs_noise_var)).abs() < 1e-10);
  }

  #[test]
  fn rejects_negative_rates() {
    assert!(DualEkf::new(dual_params(), model(), EkfMethod::Fcekf, -0.5).is_err());
  }
}
