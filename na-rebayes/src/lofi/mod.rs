//! Low-rank filtering. The posterior precision is kept as a spherical or
//! diagonal part plus `W W^T`, with `W = U diag(svs)` of `memory_size`
//! columns, so memory grows linearly in the state dimension.

use std::str::FromStr;

use nd::{Array, ArrayView, Axis, Ix1, Ix2};
use nd::parallel::prelude::*;
use rand::Rng;
use tracing::trace;

use na_core::stats::{logsumexp, mvn_log_prob};
use na_core::{check_dim, EmissionModel};

use crate::sampling::sample_gaussian_dlr;
use crate::utils::{low_rank_precision_project, Diagonal};
use crate::{Belief, Error, Rebayes, RebayesParams, Result};

pub use self::replay::{RebayesReplayLofi, ReplayLofiBel, ReplayLofiParams};

pub mod inference;
pub mod replay;

/// How the precision is widened before the dynamics step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inflation {
  /// Inflate and pull the mean back towards the predictive prior mean.
  Bayesian,
  /// Inflate the low-rank and spherical parts alike.
  Simple,
  /// Inflate the low-rank part, add back prior precision.
  Hybrid,
}

impl Default for Inflation {
  fn default() -> Inflation { Inflation::Bayesian }
}

impl FromStr for Inflation {
  type Err = Error;
  fn from_str(s: &str) -> Result<Inflation> {
    match s {
      "bayesian" => Ok(Inflation::Bayesian),
      "simple" => Ok(Inflation::Simple),
      "hybrid" => Ok(Inflation::Hybrid),
      _ => Err(Error::invalid("inflation", format!("unknown inflation method `{}`", s))),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LofiMethod {
  Spherical,
  Diagonal,
  Orthogonal,
}

impl FromStr for LofiMethod {
  type Err = Error;
  fn from_str(s: &str) -> Result<LofiMethod> {
    match s {
      "spherical" => Ok(LofiMethod::Spherical),
      "diagonal" => Ok(LofiMethod::Diagonal),
      "orthogonal" => Ok(LofiMethod::Orthogonal),
      _ => Err(Error::invalid("method", format!("unknown LoFi method `{}`", s))),
    }
  }
}

#[derive(Clone, Debug)]
pub struct LofiParams {
  pub memory_size: usize,
  /// Pick `q` so that the prior precision is a fixed point of the
  /// dynamics.
  pub steady_state: bool,
  pub inflation: Inflation,
  /// Seeds the output permutation of the orthogonal basis update.
  pub seed: u64,
}

impl LofiParams {
  pub fn new(memory_size: usize) -> LofiParams {
    LofiParams {
      memory_size,
      steady_state: false,
      inflation: Inflation::Bayesian,
      seed: 0,
    }
  }

  pub fn validate(&self) -> Result<()> {
    if self.memory_size == 0 {
      return Err(Error::invalid("memory_size", "must be at least 1"));
    }
    Ok(())
  }
}

#[derive(Clone, Debug)]
pub struct LofiBel {
  /// Mean of the predictive prior, the target of Bayesian inflation.
  pub pp_mean: Array<f64, Ix1>,
  pub mean: Array<f64, Ix1>,
  /// `D x memory_size`.
  pub basis: Array<f64, Ix2>,
  pub svs: Array<f64, Ix1>,
  pub eta: f64,
  pub gamma: f64,
  pub q: f64,
  /// Diagonal precision, only evolved by the diagonal method.
  pub ups: Array<f64, Ix1>,
  pub nobs: usize,
  pub obs_noise_var: f64,
  /// Number of conditioning steps taken.
  pub step: u64,
}

impl Belief for LofiBel {
  fn mean(&self) -> ArrayView<f64, Ix1> { self.mean.view() }
}

impl LofiBel {
  /// `W = U diag(svs)`.
  pub fn low_rank_factor(&self) -> Array<f64, Ix2> {
    &self.basis * &self.svs
  }

  pub fn precision_diagonal(&self, method: LofiMethod) -> Diagonal<f64> {
    match method {
      LofiMethod::Diagonal => Diagonal::Multiple(self.ups.view()),
      _ => Diagonal::Single(self.eta),
    }
  }

  /// Dense `(diag + W W^T)^{-1}`; for tests and small problems only.
  pub fn covariance(&self, method: LofiMethod) -> Result<Array<f64, Ix2>> {
    let w = self.low_rank_factor();
    let d = self.precision_diagonal(method).to_vec(self.mean.len());
    let prec = Array::from_diag(&d) + w.dot(&w.t());
    Ok(nla::inv_spd(&prec)?)
  }
}

pub struct RebayesLofi<M> {
  pub params: RebayesParams<M>,
  pub lofi: LofiParams,
  pub method: LofiMethod,
}

impl<M> RebayesLofi<M>
  where M: EmissionModel,
{
  pub fn new(params: RebayesParams<M>, lofi: LofiParams, method: LofiMethod)
    -> Result<RebayesLofi<M>>
  {
    params.validate()?;
    lofi.validate()?;
    Ok(RebayesLofi { params, lofi, method, })
  }

  /// `q = (1 - gamma^2) / eta`.
  pub fn steady_state_constraint(eta: f64, gamma: f64) -> f64 {
    (1.0 - gamma * gamma) / eta
  }

  fn noise_override(&self, bel: &LofiBel) -> Option<f64> {
    self.params.noise_override(bel.obs_noise_var)
  }

  /// Conditions on `y`, linearising the emission at `lin` (or the mean).
  pub(crate) fn condition(&self, bel: &LofiBel, lin: Option<&Array<f64, Ix1>>,
                          x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>)
    -> Result<LofiBel>
  {
    check_dim("emission", self.params.emission.emission_dim(), y.len())?;
    let linear = inference::linearize(&self.params.emission, &bel.mean, lin, x,
                                      self.noise_override(bel))?;
    let mut post = match self.method {
      LofiMethod::Spherical => {
        inference::spherical_condition(bel, &linear, y, self.lofi.memory_size)?
      },
      LofiMethod::Diagonal => {
        inference::diagonal_condition(bel, &linear, y, self.lofi.memory_size)?
      },
      LofiMethod::Orthogonal => {
        let perm = inference::output_permutation(self.lofi.seed, bel.step, y.len());
        inference::orthogonal_condition(bel, &linear, y, &perm)?
      },
    };
    let (nobs, obs_noise_var) = self.params.estimate_noise(post.mean.view(), x, y,
                                                           bel.nobs, bel.obs_noise_var)?;
    post.nobs = nobs;
    post.obs_noise_var = obs_noise_var;
    post.step = bel.step + 1;
    trace!(step = post.step, "lofi conditioned");
    Ok(post)
  }

  /// `n x C` draws of `h(theta, x)` with `theta` from the predicted belief.
  pub fn pred_obs_mc<R>(&self, rng: &mut R, bel: &LofiBel, x: ArrayView<f64, Ix1>, n: usize)
    -> Result<Array<f64, Ix2>>
    where R: Rng + ?Sized,
  {
    let bel = self.predict_state(bel)?;
    let thetas = self.sample_params(rng, &bel, n)?;
    let emission = &self.params.emission;
    let mut out: Array<f64, Ix2> = Array::zeros((n, emission.emission_dim()));
    out.axis_iter_mut(Axis(0))
      .into_par_iter()
      .zip(thetas.axis_iter(Axis(0)).into_par_iter())
      .try_for_each(|(mut row, theta)| -> Result<()> {
        emission.eval_mean_at(theta, x, row.view_mut())
      })?;
    Ok(out)
  }

  /// Monte-Carlo negative log predictive density, averaged over the rows
  /// of `xs`/`ys`:
  /// `-mean_i log (1/n sum_s N(y_i; h(theta_s, x_i), R))`.
  pub fn nlpd_mc<R>(&self, rng: &mut R, bel: &LofiBel,
                    xs: ArrayView<f64, Ix2>, ys: ArrayView<f64, Ix2>, n: usize)
    -> Result<f64>
    where R: Rng + ?Sized,
  {
    check_dim("number of targets", xs.dim().0, ys.dim().0)?;
    if n == 0 {
      return Err(Error::invalid("n_samples", "must be at least 1"));
    }
    let bel = self.predict_state(bel)?;
    let thetas = self.sample_params(rng, &bel, n)?;
    let obs = xs.dim().0;
    if obs == 0 {
      return Ok(0.0);
    }

    let ln_n = (n as f64).ln();
    let total = xs.axis_iter(Axis(0))
      .into_par_iter()
      .zip(ys.axis_iter(Axis(0)).into_par_iter())
      .map(|(x, y)| -> Result<f64> {
        let mut ll = Array::<f64, Ix1>::zeros(n);
        for (s, theta) in thetas.axis_iter(Axis(0)).enumerate() {
          let yhat = self.params.emission.mean(theta, x)?;
          let r = self.params.emission_noise(theta, x, bel.obs_noise_var)?;
          ll[s] = mvn_log_prob(yhat.view(), r.view(), y)?;
        }
        Ok(-(logsumexp(ll.view()) - ln_n))
      })
      .collect::<Result<Vec<f64>>>()?
      .into_iter()
      .sum::<f64>();
    Ok(total / obs as f64)
  }

  fn sample_params<R>(&self, rng: &mut R, bel: &LofiBel, n: usize) -> Result<Array<f64, Ix2>>
    where R: Rng + ?Sized,
  {
    let w = bel.low_rank_factor();
    sample_gaussian_dlr(rng, &bel.mean, &w, &bel.precision_diagonal(self.method), n)
  }
}

impl<M> Rebayes for RebayesLofi<M>
  where M: EmissionModel,
{
  type Bel = LofiBel;

  fn init_bel(&self) -> Result<LofiBel> {
    let p = &self.params;
    let d = p.state_dim();
    let l = self.lofi.memory_size;
    let eta = p.eta();
    let gamma = p.dynamics_weights;
    let q = if self.lofi.steady_state {
      Self::steady_state_constraint(eta, gamma)
    } else {
      p.dynamics_covariance
    };
    Ok(LofiBel {
      pp_mean: p.initial_mean.clone(),
      mean: p.initial_mean.clone(),
      basis: Array::zeros((d, l)),
      svs: Array::zeros(l),
      eta,
      gamma,
      q,
      ups: Array::from_elem(d, eta),
      nobs: 0,
      obs_noise_var: 1.0,
      step: 0,
    })
  }

  fn predict_state(&self, bel: &LofiBel) -> Result<LofiBel> {
    let alpha = self.params.dynamics_covariance_inflation_factor;
    let inflation = self.lofi.inflation;
    match self.method {
      LofiMethod::Spherical | LofiMethod::Orthogonal => {
        let infl = inference::spherical_inflate(bel, alpha, inflation)?;
        Ok(inference::spherical_predict(&infl, self.lofi.steady_state))
      },
      LofiMethod::Diagonal => {
        let infl = inference::diagonal_inflate(bel, alpha, inflation, self.lofi.memory_size)?;
        inference::diagonal_predict(&infl, self.lofi.memory_size)
      },
    }
  }

  fn predict_obs(&self, bel: &LofiBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix1>> {
    self.params.emission.mean(bel.mean.view(), x)
  }

  fn predict_obs_cov(&self, bel: &LofiBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix2>> {
    let h = self.params.emission.jacobian(bel.mean.view(), x)?;
    let r = self.params.emission_noise(bel.mean.view(), x, bel.obs_noise_var)?;
    let w = bel.low_rank_factor();
    Ok(low_rank_precision_project(&h, &w, &bel.precision_diagonal(self.method))? + &r)
  }

  fn update_state(&self, bel: &LofiBel, x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>)
    -> Result<LofiBel>
  {
    self.condition(bel, None, x, y)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::kalman::{EkfMethod, RebayesEkf};
  use crate::test_util::*;
  use crate::utils::PartialEqWithinTol;
  use na_core::stats::mvn_log_prob;
  use na_core::{Activation, Mlp, MlpRegression};
  use nd::arr1;
  use rand::SeedableRng;
  use rand_isaac::Isaac64Rng;

  fn linreg_lofi(method: LofiMethod) -> RebayesLofi<na_core::LinearRegression> {
    RebayesLofi::new(linreg_params(), LofiParams::new(2), method).unwrap()
  }

  #[test]
  fn full_memory_matches_ekf() {
    let (xs, ys) = linreg_data();
    let ekf = RebayesEkf::new(linreg_params(), EkfMethod::Fcekf).unwrap();
    let (_, ekf_steps) = ekf.scan(xs.view(), ys.view(), None, |step| {
      Ok((step.bel.mean.clone(), step.bel.cov.to_dense(),
          ekf.predict_obs_cov(step.bel_pred, step.x)?))
    }).unwrap();

    for &method in &[LofiMethod::Spherical, LofiMethod::Diagonal] {
      let lofi = linreg_lofi(method);
      let (_, lls) = lofi.scan(xs.view(), ys.view(), None, |step| {
        let (ref mean, ref cov, ref obs_cov) = ekf_steps[step.t];
        assert!(step.bel.mean.partial_eq_within_tol(mean, ATOL), "{:?} t = {}", method, step.t);
        assert!(step.bel.covariance(method)?.partial_eq_within_tol(cov, ATOL));
        let s = lofi.predict_obs_cov(step.bel_pred, step.x)?;
        assert!(s.partial_eq_within_tol(obs_cov, ATOL));
        mvn_log_prob(step.pred_obs.view(), s.view(), step.y)
      }).unwrap();
      let ll: f64 = lls.iter().sum();
      let kf = run_kalman(&xs, &ys);
      assert!((ll - kf.marginal_loglik).abs() < 1e-1);
    }
  }

  #[test]
  fn orthogonal_first_step_is_exact() {
    let (xs, ys) = linreg_data();
    let ekf = RebayesEkf::new(linreg_params(), EkfMethod::Fcekf).unwrap();
    let lofi = linreg_lofi(LofiMethod::Orthogonal);

    let e0 = ekf.update_state(&ekf.init_bel().unwrap(), xs.row(1), ys.row(1)).unwrap();
    let l0 = lofi.update_state(&lofi.init_bel().unwrap(), xs.row(1), ys.row(1)).unwrap();
    assert!(l0.mean.partial_eq_within_tol(&e0.mean, 1e-10));
    assert!(l0.covariance(LofiMethod::Orthogonal).unwrap()
              .partial_eq_within_tol(&e0.cov.to_dense(), 1e-10));

    let (bel, _) = lofi.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert_eq!(bel.step, xs.dim().0 as u64);
    assert!(bel.mean.iter().all(|v| v.is_finite()));
    let gram = bel.basis.t().dot(&bel.basis);
    assert!(gram.partial_eq_within_tol(&Array::eye(2), 1e-8), "{}", gram);
  }

  #[test]
  fn every_variant_runs_on_an_mlp() {
    let mut rng = Isaac64Rng::seed_from_u64(0);
    let mlp = Mlp::new(vec![3, 4, 1], Activation::Tanh).unwrap();
    let theta0 = mlp.init_params(&mut rng).unwrap();
    let model = MlpRegression { mlp, obs_var: 0.1, };
    let xs = crate::utils::make_2d_randn((40, 3), Diagonal::Single(1.0), &mut rng);
    let ys = xs.map_axis(Axis(1), |x| (x[0] - x[1] * x[2]).sin()).insert_axis(Axis(1));

    for &method in &[LofiMethod::Spherical, LofiMethod::Diagonal, LofiMethod::Orthogonal] {
      for &steady_state in &[true, false] {
        for &inflation in &[Inflation::Bayesian, Inflation::Simple, Inflation::Hybrid] {
          let mut params = RebayesParams::new(theta0.clone(), model.clone());
          params.initial_covariance = 1e-1;
          params.dynamics_covariance = 1e-1;
          params.adaptive_emission_cov = true;
          params.dynamics_covariance_inflation_factor = 1e-5;
          let lofi = LofiParams {
            memory_size: 5,
            steady_state,
            inflation,
            seed: 3,
          };
          let filter = RebayesLofi::new(params, lofi, method).unwrap();
          let (bel, _) = filter.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
          assert!(bel.mean.iter().all(|v| v.is_finite()),
                  "{:?} {} {:?}", method, steady_state, inflation);
          assert_eq!(bel.svs.len(), 5);
          assert_eq!(bel.nobs, 40);
        }
      }
    }
  }

  #[test]
  fn monte_carlo_predictions() {
    let (xs, ys) = linreg_data();
    let mut params = linreg_params();
    params.initial_mean = arr1(&[1.0, 0.5]);
    params.initial_covariance = 1e-8;
    let lofi = RebayesLofi::new(params, LofiParams::new(1), LofiMethod::Diagonal).unwrap();
    let bel = lofi.init_bel().unwrap();
    let mut rng = Isaac64Rng::seed_from_u64(5);

    let x = xs.row(4);
    let draws = lofi.pred_obs_mc(&mut rng, &bel, x, 8).unwrap();
    assert_eq!(draws.dim(), (8, 1));
    assert!(draws.iter().all(|&v| (v - 3.0).abs() < 1e-2));

    // a near point mass has the density of the emission noise itself
    let nlpd = lofi.nlpd_mc(&mut rng, &bel, xs.slice(nd::s![..3, ..]),
                            ys.slice(nd::s![..3, ..]), 16).unwrap();
    let expected = (0..3)
      .map(|t| {
        let yhat = 1.0 + 0.5 * xs[[t, 0]];
        -na_core::stats::normal_log_prob(yhat, OBS_VAR, ys[[t, 0]])
      })
      .sum::<f64>() / 3.0;
    assert!((nlpd - expected).abs() < 1e-2, "{} != {}", nlpd, expected);
  }

  #[test]
  fn parse_names() {
    assert_eq!("hybrid".parse::<Inflation>().unwrap(), Inflation::Hybrid);
    assert!("none".parse::<Inflation>().is_err());
    assert_eq!("orthogonal".parse::<LofiMethod>().unwrap(), LofiMethod::Orthogonal);
    assert!(LofiParams::new(0).validate().is_err());
  }
}
