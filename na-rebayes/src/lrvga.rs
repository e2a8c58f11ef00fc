//! Limited-memory recursive variational Gaussian approximation. The
//! precision is kept as `W W^T + diag(psi)` and refitted by factor analysis
//! after every observation; the mean follows a natural-gradient step
//! estimated by Monte Carlo.

use nd::{Array, Array3, ArrayView, Axis, Ix1, Ix2};
use nd::parallel::prelude::*;

use rand::{Rng, SeedableRng};
use rand_isaac::Isaac64Rng;
use tracing::{trace, warn};

use na_core::{check_dim, EmissionModel};

use crate::sampling::sample_gaussian_dlr;
use crate::utils::{div_rows, low_rank_precision_project, low_rank_precision_solve, make_2d_randn,
                   Diagonal};
use crate::{Belief, Error, Rebayes, Result};

/// Floor applied to factor-analysis variances that come out non-positive.
pub const MIN_PSI: f64 = 1e-8;

#[derive(Clone, Debug)]
pub struct LrvgaParams {
  /// Weight of the previous precision in the factor-analysis target.
  pub alpha: f64,
  /// Weight of the sampled Fisher information.
  pub beta: f64,
  /// Full steps per observation.
  pub n_inner: usize,
  /// Factor-analysis iterations per step. Each one recovers only part of a
  /// Fisher information much larger than the current precision, so inputs
  /// should be scaled to keep the per-step Fisher moderate.
  pub n_inner_fa: usize,
  pub n_samples: usize,
  pub dim_latent: usize,
  pub sigma2_init: f64,
  /// Share of the prior precision carried by `W`.
  pub eps: f64,
  pub obs_std: f64,
  pub seed: u64,
}

impl LrvgaParams {
  pub fn new(dim_latent: usize) -> LrvgaParams {
    LrvgaParams {
      alpha: 1.0,
      beta: 1.0,
      n_inner: 3,
      n_inner_fa: 3,
      n_samples: 6,
      dim_latent,
      sigma2_init: 1.0,
      eps: 1e-2,
      obs_std: 1.0,
      seed: 0,
    }
  }

  pub fn validate(&self) -> Result<()> {
    if !(self.alpha >= 0.0) || !(self.beta >= 0.0) {
      return Err(Error::invalid("alpha/beta", "must be non-negative"));
    }
    for &(name, n) in [
      ("n_inner", self.n_inner),
      ("n_inner_fa", self.n_inner_fa),
      ("n_samples", self.n_samples),
      ("dim_latent", self.dim_latent),
    ].iter() {
      if n == 0 {
        return Err(Error::invalid(name, "must be at least 1"));
      }
    }
    if !(self.sigma2_init > 0.0) || !self.sigma2_init.is_finite() {
      return Err(Error::invalid("sigma2_init",
                                format!("must be positive, got {}", self.sigma2_init)));
    }
    if !(self.eps > 0.0 && self.eps < 1.0) {
      return Err(Error::invalid("eps", format!("must lie in (0, 1), got {}", self.eps)));
    }
    if !(self.obs_std > 0.0) || !self.obs_std.is_finite() {
      return Err(Error::invalid("obs_std", format!("must be positive, got {}", self.obs_std)));
    }
    Ok(())
  }
}

#[derive(Clone, Debug)]
pub struct LrvgaBel {
  pub mu: Array<f64, Ix1>,
  pub w: Array<f64, Ix2>,
  pub psi: Array<f64, Ix1>,
  pub sigma: f64,
  pub seed: u64,
  pub step: u64,
}

impl Belief for LrvgaBel {
  fn mean(&self) -> ArrayView<f64, Ix1> { self.mu.view() }
}

pub struct RebayesLrvga<M> {
  pub initial_mean: Array<f64, Ix1>,
  pub emission: M,
  pub lrvga: LrvgaParams,
}

impl<M> RebayesLrvga<M>
  where M: EmissionModel,
{
  pub fn new(initial_mean: Array<f64, Ix1>, emission: M, lrvga: LrvgaParams)
    -> Result<RebayesLrvga<M>>
  {
    lrvga.validate()?;
    if initial_mean.is_empty() {
      return Err(Error::invalid("initial_mean", "must not be empty"));
    }
    if initial_mean.iter().any(|v| !v.is_finite()) {
      return Err(Error::NonFinite { what: "initial_mean" });
    }
    Ok(RebayesLrvga { initial_mean, emission, lrvga, })
  }

  /// `n x D` draws from `N(mu, (W W^T + diag(psi))^{-1})`.
  pub fn sample_params<R>(&self, rng: &mut R, bel: &LrvgaBel, n: usize)
    -> Result<Array<f64, Ix2>>
    where R: Rng + ?Sized,
  {
    sample_gaussian_dlr(rng, &bel.mu, &bel.w, &Diagonal::Multiple(bel.psi.view()), n)
  }

  /// `X` with `X^T X` estimating the expected Fisher information: the
  /// stacked Jacobians `J(theta_s) / (sigma sqrt(S))`.
  fn half_fisher(&self, seed: u64, bel: &LrvgaBel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix2>>
  {
    let s = self.lrvga.n_samples;
    let c = self.emission.emission_dim();
    let d = bel.mu.len();
    let thetas = self.sample_params(&mut Isaac64Rng::seed_from_u64(seed), bel, s)?;
    let scale = 1.0 / (bel.sigma * (s as f64).sqrt());

    let mut jacs = Array3::<f64>::zeros((s, c, d));
    jacs.axis_iter_mut(Axis(0))
      .into_par_iter()
      .zip(thetas.axis_iter(Axis(0)).into_par_iter())
      .try_for_each(|(mut jac, theta)| -> Result<()> {
        self.emission.eval_jacobian_at(theta, x, jac.view_mut())?;
        jac *= scale;
        Ok(())
      })?;
    Ok(jacs.into_shape((s * c, d))?)
  }

  /// Monte-Carlo `E[J^T (y - h(theta)) / sigma^2]` under `bel`.
  fn expected_grad(&self, seed: u64, bel: &LrvgaBel, x: ArrayView<f64, Ix1>,
                   y: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix1>>
  {
    let s = self.lrvga.n_samples;
    let thetas = self.sample_params(&mut Isaac64Rng::seed_from_u64(seed), bel, s)?;
    let var = bel.sigma * bel.sigma;
    let grads = thetas.axis_iter(Axis(0))
      .into_par_iter()
      .map(|theta| -> Result<Array<f64, Ix1>> {
        let resid = &y - &self.emission.mean(theta, x)?;
        Ok(self.emission.jacobian(theta, x)?.t().dot(&resid) / var)
      })
      .collect::<Result<Vec<_>>>()?;

    let mut total = Array::zeros(bel.mu.len());
    for g in grads.iter() {
      total += g;
    }
    Ok(total / s as f64)
  }

  /// One factor-analysis refit of `(w, psi)` towards
  /// `alpha (W_prev W_prev^T + diag(psi_prev)) + beta X^T X`.
  fn fa_step(&self, x: &Array<f64, Ix2>, w: &Array<f64, Ix2>, psi: &Array<f64, Ix1>,
             prev: &LrvgaBel) -> Result<(Array<f64, Ix2>, Array<f64, Ix1>)>
  {
    let (alpha, beta) = (self.lrvga.alpha, self.lrvga.beta);
    let l = w.dim().1;
    let psi_view = psi.view();
    let diag = Diagonal::Multiple(psi_view);
    let w_psi = div_rows(w, &diag);

    let m_inv = nla::inv(&(Array::<f64, Ix2>::eye(l) + w.t().dot(&w_psi)))?;
    let v_beta = x.t().dot(&x.dot(&w_psi));
    let v_alpha = prev.w.dot(&prev.w.t().dot(&w_psi))
      + &(&w_psi * &prev.psi.view().insert_axis(Axis(1)));
    let v = v_beta * beta + &(v_alpha * alpha);

    let w_solve = Array::<f64, Ix2>::eye(l) + &v.t().dot(&w_psi).dot(&m_inv.t());
    let w_new = nla::solve(&w_solve, &v.t())?.reversed_axes();

    let shrink = (&w_new.dot(&m_inv) * &v).sum_axis(Axis(1));
    let mut psi_new = x.mapv(|v| v * v).sum_axis(Axis(0)) * beta
      + &(prev.w.mapv(|v| v * v).sum_axis(Axis(1)) * alpha)
      + &(&prev.psi * alpha)
      - &shrink;

    if psi_new.iter().any(|v| !v.is_finite()) {
      return Err(Error::NonFinite { what: "psi" });
    }
    let clamped = psi_new.iter().filter(|&&v| v <= 0.0).count();
    if clamped > 0 {
      warn!(clamped, "non-positive factor-analysis variances clamped");
      psi_new.mapv_inplace(|v| v.max(MIN_PSI));
    }
    Ok((w_new, psi_new))
  }

  fn step_once(&self, bel: &LrvgaBel, seed: u64, x: ArrayView<f64, Ix1>,
               y: ArrayView<f64, Ix1>) -> Result<LrvgaBel>
  {
    let mut rng = Isaac64Rng::seed_from_u64(seed);
    let (key_fisher, key_est, key_final): (u64, u64, u64) = (rng.gen(), rng.gen(), rng.gen());

    let fisher = self.half_fisher(key_fisher, bel, x)?;
    let mut w = bel.w.clone();
    let mut psi = bel.psi.clone();
    for _ in 0..self.lrvga.n_inner_fa {
      let (w_next, psi_next) = self.fa_step(&fisher, &w, &psi, bel)?;
      w = w_next;
      psi = psi_next;
    }

    let mut next = LrvgaBel {
      mu: bel.mu.clone(),
      w,
      psi,
      sigma: bel.sigma,
      seed: bel.seed,
      step: bel.step + 1,
    };

    // first from the previous belief, then from the refitted one
    let g = self.expected_grad(key_est, bel, x, y)?;
    let delta = low_rank_precision_solve(&next.w, &Diagonal::Multiple(next.psi.view()), &g)?;
    next.mu = &bel.mu + &delta;
    let g = self.expected_grad(key_final, &next, x, y)?;
    let delta = low_rank_precision_solve(&next.w, &Diagonal::Multiple(next.psi.view()), &g)?;
    next.mu = &bel.mu + &delta;

    if next.mu.iter().any(|v| !v.is_finite()) {
      return Err(Error::NonFinite { what: "lrvga mean" });
    }
    Ok(next)
  }
}

impl<M> Rebayes for RebayesLrvga<M>
  where M: EmissionModel,
{
  type Bel = LrvgaBel;

  fn init_bel(&self) -> Result<LrvgaBel> {
    let p = &self.lrvga;
    let d = self.initial_mean.len();
    let psi0 = (1.0 - p.eps) / p.sigma2_init;
    let w0 = (p.eps * d as f64 / (p.dim_latent as f64 * p.sigma2_init)).sqrt();

    let mut rng = Isaac64Rng::seed_from_u64(p.seed);
    let mut w = make_2d_randn((d, p.dim_latent), Diagonal::Single(1.0), &mut rng);
    for mut col in w.axis_iter_mut(Axis(1)) {
      let norm = col.dot(&col).sqrt();
      col.mapv_inplace(|v| v / norm * w0);
    }

    Ok(LrvgaBel {
      mu: self.initial_mean.clone(),
      w,
      psi: Array::from_elem(d, psi0),
      sigma: p.obs_std,
      seed: rng.gen(),
      step: 0,
    })
  }

  fn predict_state(&self, bel: &LrvgaBel) -> Result<LrvgaBel> {
    Ok(bel.clone())
  }

  fn predict_obs(&self, bel: &LrvgaBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix1>> {
    self.emission.mean(bel.mu.view(), x)
  }

  fn predict_obs_cov(&self, bel: &LrvgaBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix2>> {
    let h = self.emission.jacobian(bel.mu.view(), x)?;
    let c = h.dim().0;
    Ok(low_rank_precision_project(&h, &bel.w, &Diagonal::Multiple(bel.psi.view()))?
       + &(Array::<f64, Ix2>::eye(c) * (bel.sigma * bel.sigma)))
  }

  fn update_state(&self, bel: &LrvgaBel, x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>)
    -> Result<LrvgaBel>
  {
    check_dim("emission", self.emission.emission_dim(), y.len())?;
    let mut rng = Isaac64Rng::seed_from_u64(bel.seed.wrapping_add(bel.step));
    let mut bel = bel.clone();
    for i in 0..self.lrvga.n_inner {
      bel = self.step_once(&bel, rng.gen(), x, y)?;
      trace!(i, step = bel.step, "lrvga inner step");
    }
    Ok(bel)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_util::*;
  use crate::utils::PartialEqWithinTol;
  use na_core::LinearRegression;

  fn lrvga(seed: u64) -> RebayesLrvga<LinearRegression> {
    let mut p = LrvgaParams::new(2);
    p.n_samples = 50;
    p.obs_std = OBS_VAR.sqrt();
    p.eps = 0.1;
    p.seed = seed;
    RebayesLrvga::new(Array::zeros(2), LinearRegression { input_dim: 1, obs_var: OBS_VAR, }, p)
      .unwrap()
  }

  #[test]
  fn init_scales_factor_columns() {
    let agent = lrvga(3);
    let bel = agent.init_bel().unwrap();
    let w0 = (0.1f64 * 2.0 / 2.0).sqrt();
    for col in bel.w.axis_iter(Axis(1)) {
      assert!((col.dot(&col).sqrt() - w0).abs() < 1e-12);
    }
    assert!(bel.psi.iter().all(|&v| (v - 0.9).abs() < 1e-12));
    assert_eq!(bel.step, 0);
  }

  #[test]
  fn factor_analysis_without_data_is_a_fixed_point() {
    let agent = lrvga(4);
    let bel = agent.init_bel().unwrap();
    let x = Array::zeros((1, 2));
    let (w, psi) = agent.fa_step(&x, &bel.w, &bel.psi, &bel).unwrap();
    assert!(w.partial_eq_within_tol(&bel.w, 1e-10));
    assert!(psi.partial_eq_within_tol(&bel.psi, 1e-10));
  }

  #[test]
  fn observation_covariance_matches_dense() {
    let agent = lrvga(5);
    let bel = agent.init_bel().unwrap();
    let x = nd::arr1(&[0.7]);
    let h = agent.emission.jacobian(bel.mu.view(), x.view()).unwrap();
    let prec = bel.w.dot(&bel.w.t()) + &Array::from_diag(&bel.psi);
    let dense = h.dot(&nla::inv(&prec).unwrap()).dot(&h.t()) + OBS_VAR;
    let cov = agent.predict_obs_cov(&bel, x.view()).unwrap();
    assert!(cov.partial_eq_within_tol(&dense, 1e-9));
  }

  #[test]
  fn fits_linear_regression() {
    // inputs on [0, 1]; on [0, 20] a few EM iterations cannot absorb the
    // per-step Fisher and the intercept stalls
    let (xs, ys) = linreg_data();
    let xs = xs / 20.0;
    let agent = lrvga(6);
    let rmse = |bel: &LrvgaBel| -> f64 {
      let mut total = 0.0;
      for (x, y) in xs.outer_iter().zip(ys.outer_iter()) {
        let e = agent.predict_obs(bel, x).unwrap()[0] - y[0];
        total += e * e;
      }
      (total / xs.dim().0 as f64).sqrt()
    };

    let prior = agent.init_bel().unwrap();
    let (bel, _) = agent.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert!(rmse(&bel) < 0.9 * rmse(&prior), "{} vs {}", rmse(&bel), rmse(&prior));
    assert_eq!(bel.step, 3 * xs.dim().0 as u64);
    assert!(bel.psi.iter().all(|&v| v > 0.0));

    let (again, _) = lrvga(6).scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert_eq!(again.mu, bel.mu);
  }

  #[test]
  fn rejects_bad_params() {
    let mut p = LrvgaParams::new(2);
    assert!(p.validate().is_ok());
    p.eps = 1.0;
    assert!(p.validate().is_err());
    p.eps = 0.5;
    p.n_samples = 0;
    assert!(p.validate().is_err());
    p.n_samples = 1;
    p.obs_std = 0.0;
    assert!(p.validate().is_err());
  }
}
