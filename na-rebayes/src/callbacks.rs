//! Per-step evaluation for `Rebayes::scan` callbacks.

use nd::{ArrayView, Axis, Ix1, Ix2};

use na_core::stats::mvn_log_prob;
use na_core::{check_dim, EmissionModel};

use crate::{Belief, Error, Rebayes, Result, Step};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RegressionMetrics {
  /// One-step-ahead RMSE on the observation just seen.
  pub osa: f64,
  /// RMSE over the whole test set.
  pub test: f64,
  /// RMSE over the test rows around `t`.
  pub window: f64,
}

/// RMSE of the predictive mean on a held-out set, reported in the original
/// units of targets normalised as `(y - ymean) / ystd`.
pub struct RegressionEval<'a, M> {
  emission: &'a M,
  x_test: ArrayView<'a, f64, Ix2>,
  y_test: ArrayView<'a, f64, Ix2>,
  pub ymean: f64,
  pub ystd: f64,
  /// Rows in the window centred on `t`; indices past either end are
  /// clamped to the first or last test row.
  pub window: usize,
}

impl<'a, M> RegressionEval<'a, M>
  where M: EmissionModel,
{
  pub fn new(emission: &'a M, x_test: ArrayView<'a, f64, Ix2>, y_test: ArrayView<'a, f64, Ix2>)
    -> Result<RegressionEval<'a, M>>
  {
    check_dim("number of test targets", x_test.dim().0, y_test.dim().0)?;
    check_dim("test target width", emission.emission_dim(), y_test.dim().1)?;
    if x_test.dim().0 == 0 {
      return Err(Error::invalid("x_test", "must not be empty"));
    }
    Ok(RegressionEval {
      emission,
      x_test,
      y_test,
      ymean: 0.0,
      ystd: 1.0,
      window: 10,
    })
  }

  pub fn with_normalization(mut self, ymean: f64, ystd: f64) -> RegressionEval<'a, M> {
    self.ymean = ymean;
    self.ystd = ystd;
    self
  }

  pub fn with_window(mut self, window: usize) -> RegressionEval<'a, M> {
    self.window = window;
    self
  }

  fn denormalize(&self, v: f64) -> f64 { v * self.ystd + self.ymean }

  /// Squared de-normalised error of each test row under `mean`.
  fn test_errors(&self, mean: ArrayView<f64, Ix1>) -> Result<Vec<f64>> {
    self.x_test.axis_iter(Axis(0))
      .zip(self.y_test.axis_iter(Axis(0)))
      .map(|(x, y)| {
        let yhat = self.emission.mean(mean, x)?;
        let se = yhat.iter()
          .zip(y.iter())
          .map(|(&p, &o)| (self.denormalize(p) - self.denormalize(o)).powi(2))
          .sum::<f64>();
        Ok(se / y.len() as f64)
      })
      .collect()
  }

  pub fn evaluate<B>(&self, step: &Step<B>) -> Result<RegressionMetrics>
    where B: Belief,
  {
    let osa = step.pred_obs.iter()
      .zip(step.y.iter())
      .map(|(&p, &o)| (self.denormalize(p) - self.denormalize(o)).powi(2))
      .sum::<f64>() / step.y.len() as f64;

    let errs = self.test_errors(step.bel_pred.mean())?;
    let test = errs.iter().sum::<f64>() / errs.len() as f64;

    // rows before the first or past the last test row repeat the end row;
    // negative indices do not wrap around
    let n = errs.len() as isize;
    let start = step.t as isize - (self.window / 2) as isize;
    let window = if self.window == 0 {
      ::std::f64::NAN
    } else {
      (0..self.window as isize)
        .map(|k| errs[(start + k).max(0).min(n - 1) as usize])
        .sum::<f64>() / self.window as f64
    };

    Ok(RegressionMetrics {
      osa: osa.sqrt(),
      test: test.sqrt(),
      window: window.sqrt(),
    })
  }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClassificationMetrics {
  /// 1 if the one-step-ahead prediction picked the right class.
  pub osa_accuracy: f64,
  /// Accuracy of the posterior mean on the next `lag` test rows, `None` once
  /// `t` runs past the test set.
  pub nstep_accuracy: Option<f64>,
}

/// Predicted class: the arg-max of class probabilities, or a 0.5 threshold
/// for a single output.
pub fn class_label(p: ArrayView<f64, Ix1>) -> usize {
  if p.len() == 1 {
    return (p[0] > 0.5) as usize;
  }
  p.iter()
    .enumerate()
    .fold((0, ::std::f64::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
    .0
}

pub struct ClassificationEval<'a, M> {
  emission: &'a M,
  x_test: ArrayView<'a, f64, Ix2>,
  /// One-hot (or 0/1 for a single output) labels.
  y_test: ArrayView<'a, f64, Ix2>,
  pub lag: usize,
}

impl<'a, M> ClassificationEval<'a, M>
  where M: EmissionModel,
{
  pub fn new(emission: &'a M, x_test: ArrayView<'a, f64, Ix2>, y_test: ArrayView<'a, f64, Ix2>,
             lag: usize) -> Result<ClassificationEval<'a, M>>
  {
    check_dim("number of test labels", x_test.dim().0, y_test.dim().0)?;
    check_dim("test label width", emission.emission_dim(), y_test.dim().1)?;
    Ok(ClassificationEval { emission, x_test, y_test, lag, })
  }

  pub fn evaluate<B>(&self, step: &Step<B>) -> Result<ClassificationMetrics>
    where B: Belief,
  {
    let osa = (class_label(step.pred_obs.view()) == class_label(step.y)) as usize as f64;

    let end = (step.t + self.lag).min(self.x_test.dim().0);
    let nstep = if step.t >= end {
      None
    } else {
      let mut hits = 0usize;
      for i in step.t..end {
        let p = self.emission.mean(step.bel.mean(), self.x_test.row(i))?;
        if class_label(p.view()) == class_label(self.y_test.row(i)) {
          hits += 1;
        }
      }
      Some(hits as f64 / (end - step.t) as f64)
    };

    Ok(ClassificationMetrics { osa_accuracy: osa, nstep_accuracy: nstep, })
  }
}

/// `log N(y_t; yhat_t, Cov[y_t])` under the predictive belief; summed over
/// a scan this is the marginal log-likelihood.
pub fn gaussian_step_log_prob<R>(agent: &R, step: &Step<R::Bel>) -> Result<f64>
  where R: Rebayes,
{
  let cov = agent.predict_obs_cov(step.bel_pred, step.x)?;
  mvn_log_prob(step.pred_obs.view(), cov.view(), step.y)
}
