//! You probably don't want to use unmodified Kalman filters.
//! This is here as ground truth for the nonlinear filters on linear
//! problems.

use nd::{Array, ArrayView, Axis, Ix1, Ix2, Ix3};
use nla::solve_spd;
use tracing::debug;

use na_core::stats::mvn_log_prob;
use na_core::check_dim;

use crate::Result;

#[derive(Clone, Debug)]
pub struct LinearGaussianSsm {
  pub initial_mean: Array<f64, Ix1>,
  pub initial_covariance: Array<f64, Ix2>,
  pub dynamics_weights: Array<f64, Ix2>,
  pub dynamics_covariance: Array<f64, Ix2>,
  pub emission_covariance: Array<f64, Ix2>,
}

#[derive(Clone, Debug)]
pub struct PosteriorFiltered {
  /// `T x D`
  pub filtered_means: Array<f64, Ix2>,
  /// `T x D x D`
  pub filtered_covariances: Array<f64, Ix3>,
  pub marginal_loglik: f64,
}

impl LinearGaussianSsm {
  pub fn state_dim(&self) -> usize { self.initial_mean.len() }

  fn validate(&self, emission_dim: usize) -> Result<()> {
    let d = self.state_dim();
    check_dim("initial covariance", d, self.initial_covariance.dim().0)?;
    check_dim("initial covariance", d, self.initial_covariance.dim().1)?;
    check_dim("dynamics weights", d, self.dynamics_weights.dim().0)?;
    check_dim("dynamics weights", d, self.dynamics_weights.dim().1)?;
    check_dim("dynamics covariance", d, self.dynamics_covariance.dim().0)?;
    check_dim("dynamics covariance", d, self.dynamics_covariance.dim().1)?;
    check_dim("emission covariance", emission_dim, self.emission_covariance.dim().0)?;
    check_dim("emission covariance", emission_dim, self.emission_covariance.dim().1)
  }

  /// `emission_weights` is `T x C x D`, `emissions` is `T x C`.
  pub fn filter(&self, emission_weights: ArrayView<f64, Ix3>,
                emissions: ArrayView<f64, Ix2>) -> Result<PosteriorFiltered>
  {
    let (steps, c) = emissions.dim();
    let d = self.state_dim();
    self.validate(c)?;
    check_dim("emission weight steps", steps, emission_weights.dim().0)?;
    check_dim("emission weight rows", c, emission_weights.dim().1)?;
    check_dim("emission weight columns", d, emission_weights.dim().2)?;

    let mut means = Array::zeros((steps, d));
    let mut covariances = Array::zeros((steps, d, d));
    let mut ll = 0.0;

    let mut m = self.initial_mean.clone();
    let mut p = self.initial_covariance.clone();
    let f = &self.dynamics_weights;

    for t in 0..steps {
      let h = emission_weights.index_axis(Axis(0), t);
      let y = emissions.index_axis(Axis(0), t);

      let yhat = h.dot(&m);
      let ph_t = p.dot(&h.t());
      let s = h.dot(&ph_t) + &self.emission_covariance;
      ll += mvn_log_prob(yhat.view(), s.view(), y)?;

      // K = P H^T S^{-1}
      let k = solve_spd(&s, &ph_t.t())?.reversed_axes();
      m = &m + &k.dot(&(&y - &yhat));
      p = &p - &k.dot(&s).dot(&k.t());

      means.index_axis_mut(Axis(0), t).assign(&m);
      covariances.index_axis_mut(Axis(0), t).assign(&p);

      m = f.dot(&m);
      p = f.dot(&p).dot(&f.t()) + &self.dynamics_covariance;
    }
    debug!(steps, marginal_loglik = ll, "kalman filter done");

    Ok(PosteriorFiltered {
      filtered_means: means,
      filtered_covariances: covariances,
      marginal_loglik: ll,
    })
  }

  pub fn filter_time_invariant(&self, emission_weights: ArrayView<f64, Ix2>,
                               emissions: ArrayView<f64, Ix2>)
    -> Result<PosteriorFiltered>
  {
    let steps = emissions.dim().0;
    let (c, d) = emission_weights.dim();
    let h = emission_weights.insert_axis(Axis(0));
    let h = h
      .broadcast((steps, c, d))
      .ok_or_else(|| nd::ShapeError::from_kind(nd::ErrorKind::IncompatibleShape))?;
    self.filter(h, emissions)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_util::*;
  use crate::utils::PartialEqWithinTol;

  #[test]
  fn kalman_matches_batch_bayes() {
    let (xs, ys) = linreg_data();
    let post = run_kalman(&xs, &ys);
    let (mean, cov) = batch_bayes(&xs, &ys);
    let last = xs.dim().0 - 1;
    assert!(post.filtered_means.row(last).partial_eq_within_tol(&mean, ATOL));
    assert!(post.filtered_covariances.index_axis(Axis(0), last)
              .partial_eq_within_tol(&cov, ATOL));
  }

  #[test]
  fn time_invariant_kalman_filter() {
    let h = nd::arr2(&[[1.0, 0.5]]);
    let ys = nd::arr2(&[[1.0], [0.8], [1.3]]);
    let ssm = LinearGaussianSsm {
      initial_mean: Array::zeros(2),
      initial_covariance: Array::eye(2),
      dynamics_weights: Array::eye(2) * 0.9,
      dynamics_covariance: Array::eye(2) * 0.1,
      emission_covariance: Array::eye(1) * 0.5,
    };
    let invariant = ssm.filter_time_invariant(h.view(), ys.view()).unwrap();
    let hs = h.insert_axis(Axis(0)).broadcast((3, 1, 2)).unwrap().to_owned();
    let varying = ssm.filter(hs.view(), ys.view()).unwrap();
    assert!(invariant.filtered_means.partial_eq_within_tol(&varying.filtered_means, 1e-12));
    assert_eq!(invariant.marginal_loglik, varying.marginal_loglik);

    assert!(ssm.filter(hs.view(), ys.slice(nd::s![..2, ..])).is_err());
  }
}
