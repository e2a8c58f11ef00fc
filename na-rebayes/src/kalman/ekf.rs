//! Extended Kalman filters: full covariance (`fcekf`), variational
//! diagonal (`vdekf`) and fully decoupled diagonal (`fdekf`).

use std::str::FromStr;

use nd::{Array, ArrayBase, ArrayView, Axis, Data, Ix1, Ix2};
use nla::{inv_spd, solve_spd};
use tracing::trace;

use na_core::{check_dim, EmissionModel};

use crate::{observation_noise, Belief, Error, Rebayes, RebayesParams, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EkfMethod {
  Fcekf,
  Vdekf,
  Fdekf,
}

impl EkfMethod {
  pub fn is_full(self) -> bool { self == EkfMethod::Fcekf }
}

impl FromStr for EkfMethod {
  type Err = Error;
  fn from_str(s: &str) -> Result<EkfMethod> {
    match s {
      "fcekf" => Ok(EkfMethod::Fcekf),
      "vdekf" => Ok(EkfMethod::Vdekf),
      "fdekf" => Ok(EkfMethod::Fdekf),
      _ => Err(Error::invalid("method", format!("unknown EKF method `{}`", s))),
    }
  }
}

/// Diagonal covariances are stored as their diagonal.
#[derive(Clone, Debug)]
pub enum Covariance {
  Full(Array<f64, Ix2>),
  Diagonal(Array<f64, Ix1>),
}

impl Covariance {
  pub fn isotropic(method: EkfMethod, dim: usize, var: f64) -> Covariance {
    if method.is_full() {
      Covariance::Full(Array::eye(dim) * var)
    } else {
      Covariance::Diagonal(Array::from_elem(dim, var))
    }
  }

  pub fn to_dense(&self) -> Array<f64, Ix2> {
    match self {
      Covariance::Full(p) => p.clone(),
      Covariance::Diagonal(p) => Array::from_diag(p),
    }
  }

  /// `H P H^T`.
  pub fn project<S>(&self, h: &ArrayBase<S, Ix2>) -> Array<f64, Ix2>
    where S: Data<Elem = f64>,
  {
    match self {
      Covariance::Full(p) => h.dot(p).dot(&h.t()),
      Covariance::Diagonal(p) => (h * p).dot(&h.t()),
    }
  }
}

#[derive(Clone, Debug)]
pub struct EkfBel {
  pub mean: Array<f64, Ix1>,
  pub cov: Covariance,
  pub nobs: usize,
  pub obs_noise_var: f64,
}

impl Belief for EkfBel {
  fn mean(&self) -> ArrayView<f64, Ix1> { self.mean.view() }
}

/// `m <- gamma m`, `P <- (1 + alpha)(gamma^2 P + q I)`.
pub fn dynamics_predict(mean: &Array<f64, Ix1>, cov: &Covariance,
                        q: f64, gamma: f64, alpha: f64)
  -> (Array<f64, Ix1>, Covariance)
{
  let mean = mean * gamma;
  let inflate = 1.0 + alpha;
  let cov = match cov {
    Covariance::Full(p) => {
      let mut pred = p * (gamma * gamma);
      pred.diag_mut().mapv_inplace(|v| v + q);
      Covariance::Full(pred * inflate)
    },
    Covariance::Diagonal(p) => {
      Covariance::Diagonal(p.mapv(|v| inflate * (gamma * gamma * v + q)))
    },
  };
  (mean, cov)
}

/// Conditions `N(mean, cov)` on `y`, relinearising `num_iter` times at the
/// latest iterate. `obs_noise_var` overrides the model's emission noise.
pub fn condition_on<M>(method: EkfMethod, mean: &Array<f64, Ix1>, cov: &Covariance,
                       emission: &M, x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>,
                       num_iter: usize, obs_noise_var: Option<f64>)
  -> Result<(Array<f64, Ix1>, Covariance)>
  where M: EmissionModel + ?Sized,
{
  check_dim("emission", emission.emission_dim(), y.len())?;

  let mut iterate = mean.clone();
  let mut post_cov = cov.clone();
  for iter in 0..num_iter.max(1) {
    let h = emission.jacobian(iterate.view(), x)?;
    let yhat = emission.mean(iterate.view(), x)? + &h.dot(&(mean - &iterate));
    let r = observation_noise(emission, iterate.view(), x, obs_noise_var)?;
    let innovation = &y - &yhat;

    let (m, p) = match (method, cov) {
      (EkfMethod::Fcekf, Covariance::Full(p)) => {
        let ph_t = p.dot(&h.t());
        let s = &r + &h.dot(&ph_t);
        let k = solve_spd(&s, &ph_t.t())?.reversed_axes();
        let post = p - &k.dot(&s).dot(&k.t());
        (mean + &k.dot(&innovation), Covariance::Full(post))
      },
      (EkfMethod::Vdekf, Covariance::Diagonal(p)) => {
        let rinv_h = inv_spd(&r)?.dot(&h);
        // diag(H^T R^-1 H)
        let info = (&h * &rinv_h).sum_axis(Axis(0));
        let post = p.iter()
          .zip(info.iter())
          .map(|(&p, &i)| 1.0 / (1.0 / p + i))
          .collect::<Array<f64, Ix1>>();
        let step = &post * &rinv_h.t().dot(&innovation);
        (mean + &step, Covariance::Diagonal(post))
      },
      (EkfMethod::Fdekf, Covariance::Diagonal(p)) => {
        let hp = &h * p;
        let s = &r + &hp.dot(&h.t());
        // K^T = S^-1 H diag(P)
        let k_t = solve_spd(&s, &hp)?;
        let shrink = (&hp * &k_t).sum_axis(Axis(0));
        (mean + &k_t.t().dot(&innovation), Covariance::Diagonal(p - &shrink))
      },
      _ => {
        return Err(Error::invalid("cov", "covariance layout does not match the EKF method"));
      },
    };
    trace!(iter, "ekf relinearised");
    iterate = m;
    post_cov = p;
  }

  Ok((iterate, post_cov))
}

/// `H P H^T + R` at the belief mean.
pub fn predict_obs_cov<M>(mean: &Array<f64, Ix1>, cov: &Covariance, emission: &M,
                          x: ArrayView<f64, Ix1>, obs_noise_var: Option<f64>)
  -> Result<Array<f64, Ix2>>
  where M: EmissionModel + ?Sized,
{
  let h = emission.jacobian(mean.view(), x)?;
  let r = observation_noise(emission, mean.view(), x, obs_noise_var)?;
  Ok(cov.project(&h) + &r)
}

pub struct RebayesEkf<M> {
  pub params: RebayesParams<M>,
  pub method: EkfMethod,
  pub num_iter: usize,
}

impl<M> RebayesEkf<M>
  where M: EmissionModel,
{
  pub fn new(params: RebayesParams<M>, method: EkfMethod) -> Result<RebayesEkf<M>> {
    params.validate()?;
    Ok(RebayesEkf {
      params,
      method,
      num_iter: 1,
    })
  }

  pub fn with_num_iter(mut self, num_iter: usize) -> Result<RebayesEkf<M>> {
    if num_iter == 0 {
      return Err(Error::invalid("num_iter", "must be at least 1"));
    }
    self.num_iter = num_iter;
    Ok(self)
  }
}

impl<M> Rebayes for RebayesEkf<M>
  where M: EmissionModel,
{
  type Bel = EkfBel;

  fn init_bel(&self) -> Result<EkfBel> {
    let p = &self.params;
    Ok(EkfBel {
      mean: p.initial_mean.clone(),
      cov: Covariance::isotropic(self.method, p.state_dim(), p.initial_covariance),
      nobs: 0,
      obs_noise_var: 1.0,
    })
  }

  fn predict_state(&self, bel: &EkfBel) -> Result<EkfBel> {
    let p = &self.params;
    let (mean, cov) = dynamics_predict(&bel.mean, &bel.cov,
                                       p.dynamics_covariance, p.dynamics_weights,
                                       p.dynamics_covariance_inflation_factor);
    Ok(EkfBel {
      mean,
      cov,
      nobs: bel.nobs,
      obs_noise_var: bel.obs_noise_var,
    })
  }

  fn predict_obs(&self, bel: &EkfBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix1>> {
    self.params.emission.mean(bel.mean.view(), x)
  }

  fn predict_obs_cov(&self, bel: &EkfBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix2>> {
    predict_obs_cov(&bel.mean, &bel.cov, &self.params.emission, x,
                    self.params.noise_override(bel.obs_noise_var))
  }

  fn update_state(&self, bel: &EkfBel, x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>)
    -> Result<EkfBel>
  {
    let p = &self.params;
    let (mean, cov) = condition_on(self.method, &bel.mean, &bel.cov, &p.emission,
                                   x, y, self.num_iter,
                                   p.noise_override(bel.obs_noise_var))?;
    let (nobs, obs_noise_var) = p.estimate_noise(mean.view(), x, y,
                                                 bel.nobs, bel.obs_noise_var)?;
    Ok(EkfBel { mean, cov, nobs, obs_noise_var, })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_util::*;
  use crate::utils::PartialEqWithinTol;
  use na_core::stats::mvn_log_prob;
  use na_core::LinearEmission;
  use nd::{arr1, arr2};

  #[test]
  fn fcekf_matches_kalman_filter() {
    let (xs, ys) = linreg_data();
    let kf = run_kalman(&xs, &ys);
    let ekf = RebayesEkf::new(linreg_params(), EkfMethod::Fcekf).unwrap();

    let (bel, lls) = ekf.scan(xs.view(), ys.view(), None, |step| {
      let cov = ekf.predict_obs_cov(step.bel_pred, step.x)?;
      assert!(ekf.predict_obs(step.bel_pred, step.x)?
                .partial_eq_within_tol(step.pred_obs, ATOL));
      assert!(step.bel.mean.partial_eq_within_tol(&kf.filtered_means.row(step.t), ATOL));
      assert!(step.bel.cov.to_dense()
                .partial_eq_within_tol(&kf.filtered_covariances.index_axis(Axis(0), step.t),
                                       ATOL));
      mvn_log_prob(step.pred_obs.view(), cov.view(), step.y)
    }).unwrap();

    let ll: f64 = lls.iter().sum();
    assert!((ll - kf.marginal_loglik).abs() < 1e-1, "{} != {}", ll, kf.marginal_loglik);

    let (mean, cov) = batch_bayes(&xs, &ys);
    assert!(bel.mean.partial_eq_within_tol(&mean, ATOL));
    assert!(bel.cov.to_dense().partial_eq_within_tol(&cov, ATOL));
  }

  #[test]
  fn diagonal_methods_agree_in_one_dimension() {
    let emission = LinearEmission::new(arr2(&[[2.0]]), arr2(&[[0.5]])).unwrap();
    let mut params = RebayesParams::new(arr1(&[0.3]), emission);
    params.initial_covariance = 2.0;
    params.dynamics_weights = 0.9;
    params.dynamics_covariance = 0.05;

    let xs = Array::zeros((4, 1));
    let ys = arr2(&[[1.0], [0.5], [-0.2], [0.8]]);

    let run = |method| {
      let ekf = RebayesEkf::new(params.clone(), method).unwrap();
      let (bel, _) = ekf.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
      (bel.mean.clone(), bel.cov.to_dense())
    };
    let (m_full, p_full) = run(EkfMethod::Fcekf);
    for &method in &[EkfMethod::Vdekf, EkfMethod::Fdekf] {
      let (m, p) = run(method);
      assert!(m.partial_eq_within_tol(&m_full, 1e-12), "{:?}", method);
      assert!(p.partial_eq_within_tol(&p_full, 1e-12), "{:?}", method);
    }
  }

  #[test]
  fn iterating_a_linear_model_changes_nothing() {
    let (xs, ys) = linreg_data();
    let plain = RebayesEkf::new(linreg_params(), EkfMethod::Fcekf).unwrap();
    let iterated = RebayesEkf::new(linreg_params(), EkfMethod::Fcekf).unwrap()
      .with_num_iter(3).unwrap();
    let (a, _) = plain.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    let (b, _) = iterated.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert!(a.mean.partial_eq_within_tol(&b.mean, 1e-8));

    assert!(RebayesEkf::new(linreg_params(), EkfMethod::Fcekf).unwrap()
              .with_num_iter(0).is_err());
  }

  #[test]
  fn inflation_and_decay() {
    let cov = Covariance::Full(arr2(&[
      [1.0, 0.5],
      [0.5, 2.0],
    ]));
    let (m, p) = dynamics_predict(&arr1(&[1.0, -1.0]), &cov, 0.1, 0.5, 1.0);
    assert_eq!(m, arr1(&[0.5, -0.5]));
    assert!(p.to_dense().partial_eq_within_tol(&arr2(&[
      [2.0 * (0.25 + 0.1), 2.0 * 0.125],
      [2.0 * 0.125, 2.0 * (0.5 + 0.1)],
    ]), 1e-12));
  }

  #[test]
  fn adaptive_noise_tracks_residuals() {
    let (xs, ys) = linreg_data();
    let mut params = linreg_params();
    params.adaptive_emission_cov = true;
    let ekf = RebayesEkf::new(params, EkfMethod::Fdekf).unwrap();
    let (bel, _) = ekf.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert_eq!(bel.nobs, xs.dim().0);
    assert!(bel.obs_noise_var > 0.0);

    let (bel, _) = RebayesEkf::new(linreg_params(), EkfMethod::Fdekf).unwrap()
      .scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert_eq!((bel.nobs, bel.obs_noise_var), (0, 0.0));
  }

  #[test]
  fn parse_method() {
    assert_eq!("vdekf".parse::<EkfMethod>().unwrap(), EkfMethod::Vdekf);
    assert!("ukf".parse::<EkfMethod>().is_err());
  }
}
