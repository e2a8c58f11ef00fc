//! Emission models for the filters: linear-Gaussian, Bayesian linear
//! regression, and MLP regression/classification heads.

use nd::{s, Array, ArrayView, ArrayViewMut, Ix1, Ix2};

use crate::{check_dim, EmissionModel, Error, LinearOperator, Mlp, Result};

/// `y = H z + N(0, R)`, ignoring the per-step input.
#[derive(Clone, Debug)]
pub struct LinearEmission {
  pub weights: Array<f64, Ix2>,
  pub covariance: Array<f64, Ix2>,
}

impl LinearEmission {
  pub fn new(weights: Array<f64, Ix2>, covariance: Array<f64, Ix2>) -> Result<LinearEmission> {
    let c = weights.dim().0;
    check_dim("emission covariance rows", c, covariance.dim().0)?;
    check_dim("emission covariance columns", c, covariance.dim().1)?;
    Ok(LinearEmission { weights, covariance, })
  }
}

impl EmissionModel for LinearEmission {
  fn emission_dim(&self) -> usize { self.weights.operator_output_dim() }
  fn eval_mean_at(&self, state: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>,
                  out: ArrayViewMut<f64, Ix1>) -> Result<()> {
    self.weights.eval_at(state, out)
  }
  fn eval_covariance_at(&self, _: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>,
                        mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    out.assign(&self.covariance);
    Ok(())
  }
  fn eval_jacobian_at(&self, state: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>,
                      out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    self.weights.eval_jacobian_at(state, out)
  }
}

/// Scalar regression `y = b + w.x + N(0, obs_var)` with state `[b, w..]`.
#[derive(Copy, Clone, Debug)]
pub struct LinearRegression {
  pub input_dim: usize,
  pub obs_var: f64,
}

impl LinearRegression {
  pub fn state_dim(&self) -> usize { self.input_dim + 1 }

  fn check(&self, state: &ArrayView<f64, Ix1>, input: &ArrayView<f64, Ix1>) -> Result<()> {
    check_dim("regression state", self.state_dim(), state.len())?;
    check_dim("regression input", self.input_dim, input.len())
  }
}

impl EmissionModel for LinearRegression {
  fn emission_dim(&self) -> usize { 1 }
  fn eval_mean_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                  mut out: ArrayViewMut<f64, Ix1>) -> Result<()> {
    self.check(&state, &input)?;
    out[0] = state[0] + state.slice(s![1..]).dot(&input);
    Ok(())
  }
  fn eval_covariance_at(&self, _: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>,
                        mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    out[[0, 0]] = self.obs_var;
    Ok(())
  }
  fn eval_jacobian_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                      mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    self.check(&state, &input)?;
    out[[0, 0]] = 1.0;
    out.slice_mut(s![0, 1..]).assign(&input);
    Ok(())
  }
}

#[derive(Clone, Debug)]
pub struct MlpRegression {
  pub mlp: Mlp,
  pub obs_var: f64,
}

impl EmissionModel for MlpRegression {
  fn emission_dim(&self) -> usize { self.mlp.output_dim() }
  fn eval_mean_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                  mut out: ArrayViewMut<f64, Ix1>) -> Result<()> {
    out.assign(&self.mlp.forward(state, input)?);
    Ok(())
  }
  fn eval_covariance_at(&self, _: ArrayView<f64, Ix1>, _: ArrayView<f64, Ix1>,
                        mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    out.fill(0.0);
    out.diag_mut().fill(self.obs_var);
    Ok(())
  }
  fn eval_jacobian_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                      mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    let (_, jac) = self.mlp.forward_with_jacobian(state, input)?;
    out.assign(&jac);
    Ok(())
  }
}

pub const PROB_CLIP: f64 = 1e-4;
pub const SOFTMAX_JITTER: f64 = 1e-3;

/// Bernoulli (one logit) or categorical (softmax over `C > 1` logits)
/// emission, moment-matched to a Gaussian.
#[derive(Clone, Debug)]
pub struct MlpClassification {
  pub mlp: Mlp,
}

fn sigmoid(z: f64) -> f64 {
  if z >= 0.0 {
    1.0 / (1.0 + (-z).exp())
  } else {
    let e = z.exp();
    e / (1.0 + e)
  }
}

pub fn softmax(logits: ArrayView<f64, Ix1>) -> Array<f64, Ix1> {
  let max = logits.fold(::std::f64::NEG_INFINITY, |m, &v| m.max(v));
  let mut e = logits.mapv(|v| (v - max).exp());
  let sum = e.sum();
  e /= sum;
  e
}

impl MlpClassification {
  pub fn new(mlp: Mlp) -> Result<MlpClassification> {
    if mlp.output_dim() == 0 {
      return Err(Error::invalid("mlp", "classifier needs at least one output"));
    }
    Ok(MlpClassification { mlp, })
  }

  pub fn is_binary(&self) -> bool { self.mlp.output_dim() == 1 }

  /// Class probabilities; for a single logit this is `[p(y = 1)]`.
  pub fn probabilities(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix1>>
  {
    let logits = self.mlp.forward(state, input)?;
    if self.is_binary() {
      Ok(logits.mapv(|z| sigmoid(z).max(PROB_CLIP).min(1.0 - PROB_CLIP)))
    } else {
      Ok(softmax(logits.view()))
    }
  }
}

impl EmissionModel for MlpClassification {
  fn emission_dim(&self) -> usize { self.mlp.output_dim() }
  fn eval_mean_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                  mut out: ArrayViewMut<f64, Ix1>) -> Result<()> {
    out.assign(&self.probabilities(state, input)?);
    Ok(())
  }
  fn eval_covariance_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                        mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    let p = self.probabilities(state, input)?;
    if self.is_binary() {
      out[[0, 0]] = p[0] * (1.0 - p[0]);
      return Ok(());
    }
    let c = p.len();
    for i in 0..c {
      for j in 0..c {
        out[[i, j]] = -p[i] * p[j];
      }
      out[[i, i]] += p[i] + SOFTMAX_JITTER;
    }
    Ok(())
  }
  fn eval_jacobian_at(&self, state: ArrayView<f64, Ix1>, input: ArrayView<f64, Ix1>,
                      mut out: ArrayViewMut<f64, Ix2>) -> Result<()> {
    let (logits, jac) = self.mlp.forward_with_jacobian(state, input)?;
    if self.is_binary() {
      let p = sigmoid(logits[0]);
      if p < PROB_CLIP || p > 1.0 - PROB_CLIP {
        out.fill(0.0);
      } else {
        out.assign(&(jac * (p * (1.0 - p))));
      }
      return Ok(());
    }

    let p = softmax(logits.view());
    let c = p.len();
    let mut dp: Array<f64, Ix2> = Array::zeros((c, c));
    for i in 0..c {
      for j in 0..c {
        dp[[i, j]] = -p[i] * p[j];
      }
      dp[[i, i]] += p[i];
    }
    out.assign(&dp.dot(&jac));
    Ok(())
  }
}
