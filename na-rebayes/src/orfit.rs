//! Orthogonal recursive fitting: one-pass least squares that fits each new
//! point exactly while moving orthogonally to the gradients it remembers.

use nd::{concatenate, Array, Array3, ArrayBase, ArrayView, Axis, Data, Ix1, Ix2};
use nla::pinv;
use tracing::debug;

use na_core::{check_dim, EmissionModel};

use crate::utils::{argmin, inv_sqrt_noise, low_rank_precision_project, normalize, Diagonal};
use crate::{Belief, Error, Rebayes, RebayesParams, Result};

#[derive(Clone, Debug)]
pub struct OrfitParams {
  pub memory_size: usize,
  /// Directions weaker than this are never stored.
  pub sv_threshold: f64,
}

impl OrfitParams {
  pub fn new(memory_size: usize) -> OrfitParams {
    OrfitParams { memory_size, sv_threshold: 0.0, }
  }

  pub fn validate(&self) -> Result<()> {
    if self.memory_size == 0 {
      return Err(Error::invalid("memory_size", "must be at least 1"));
    }
    if !(self.sv_threshold >= 0.0) {
      return Err(Error::invalid("sv_threshold",
                                format!("must be non-negative, got {}", self.sv_threshold)));
    }
    Ok(())
  }
}

#[derive(Clone, Debug)]
pub struct OrfitBel {
  pub mean: Array<f64, Ix1>,
  pub basis: Array<f64, Ix2>,
  pub svs: Array<f64, Ix1>,
}

impl Belief for OrfitBel {
  fn mean(&self) -> ArrayView<f64, Ix1> { self.mean.view() }
}

impl OrfitBel {
  pub fn new(mean: Array<f64, Ix1>, memory_size: usize) -> OrfitBel {
    let d = mean.len();
    OrfitBel {
      mean,
      basis: Array::zeros((d, memory_size)),
      svs: Array::zeros(memory_size),
    }
  }
}

#[derive(Clone, Debug)]
pub struct PosteriorOrfitFiltered {
  /// `T x D`
  pub filtered_means: Array<f64, Ix2>,
  /// `T x D x memory_size`
  pub filtered_bases: Array3<f64>,
  /// `T x memory_size`
  pub filtered_svs: Array<f64, Ix2>,
}

impl PosteriorOrfitFiltered {
  fn with_capacity(steps: usize, d: usize, l: usize) -> PosteriorOrfitFiltered {
    PosteriorOrfitFiltered {
      filtered_means: Array::zeros((steps, d)),
      filtered_bases: Array3::zeros((steps, d, l)),
      filtered_svs: Array::zeros((steps, l)),
    }
  }

  fn record(&mut self, t: usize, bel: &OrfitBel) {
    self.filtered_means.row_mut(t).assign(&bel.mean);
    self.filtered_bases.index_axis_mut(Axis(0), t).assign(&bel.basis);
    self.filtered_svs.row_mut(t).assign(&bel.svs);
  }
}

fn stable_division(a: f64, b: f64) -> f64 {
  if b != 0.0 { a / b } else { 0.0 }
}

/// `sum_j a_j (a_j . x) / (a_j . a_j)` over the columns of `a`, skipping
/// zero columns.
fn project_to_columns<S1, S2>(a: &ArrayBase<S1, Ix2>, x: &ArrayBase<S2, Ix1>) -> Array<f64, Ix1>
  where S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
{
  let mut out = Array::zeros(x.len());
  for col in a.axis_iter(Axis(1)) {
    let scale = stable_division(col.dot(x), col.dot(&col));
    out.scaled_add(scale, &col);
  }
  out
}

fn replace_weakest(bel: &mut OrfitBel, u: &Array<f64, Ix1>, strength: f64, sv_threshold: f64) {
  if let Some(j) = argmin(&bel.svs) {
    if bel.svs[j] < strength && sv_threshold < strength {
      bel.basis.column_mut(j).assign(u);
      bel.svs[j] = strength;
    }
  }
}

/// Scalar-output update: moves the mean along the part of the gradient
/// orthogonal to the stored basis until `f(m) = y`.
pub fn orfit_condition_on<M>(bel: &OrfitBel, emission: &M, x: ArrayView<f64, Ix1>,
                             y: ArrayView<f64, Ix1>, sv_threshold: f64)
  -> Result<OrfitBel>
  where M: EmissionModel + ?Sized,
{
  if emission.emission_dim() != 1 {
    return Err(Error::invalid("emission", "orthogonal recursive fitting needs a scalar output"));
  }
  check_dim("emission", 1, y.len())?;

  let jac = emission.jacobian(bel.mean.view(), x)?;
  let v = jac.row(0);
  let v_prime = &v - &project_to_columns(&bel.basis, &v);
  let u = normalize(&v_prime);

  let mut out = bel.clone();
  replace_weakest(&mut out, &u, u.dot(&v_prime), sv_threshold);

  let resid = emission.mean(bel.mean.view(), x)?[0] - y[0];
  out.mean.scaled_add(-stable_division(resid, v.dot(&v_prime)), &v_prime);
  Ok(out)
}

/// Multi-output update with the prior precision `eta` and emission noise.
/// The basis absorbs the whitened output directions orthogonal to it.
pub fn generalized_orfit_condition_on<M>(bel: &OrfitBel, eta: f64, emission: &M,
                                         x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>,
                                         sv_threshold: f64)
  -> Result<OrfitBel>
  where M: EmissionModel + ?Sized,
{
  check_dim("emission", emission.emission_dim(), y.len())?;
  let m = bel.mean.view();
  let yhat = emission.mean(m, x)?;
  let a = inv_sqrt_noise(&emission.covariance(m, x)?)?;
  let hta = emission.jacobian(m, x)?.t().dot(&a);
  let htaat = hta.dot(&a.t());

  let w = &bel.basis * &bel.svs;
  let w_tilde = concatenate(Axis(1), &[w.view(), hta.view()])?;
  let p = w_tilde.dim().1;
  let s = Array::<f64, Ix2>::eye(p) * eta + w_tilde.t().dot(&w_tilde);
  let gain = &htaat - &w_tilde.dot(&pinv(&s)?.dot(&w_tilde.t().dot(&htaat)));

  let mut out = bel.clone();
  out.mean = &bel.mean + &(gain / eta).dot(&(&y - &yhat));

  let u_tilde = &hta - &bel.basis.dot(&bel.basis.t().dot(&hta));
  for v in u_tilde.axis_iter(Axis(1)) {
    let u = normalize(&v);
    replace_weakest(&mut out, &u, u.dot(&v), sv_threshold);
  }
  Ok(out)
}

pub fn generalized_orfit_predict(bel: &OrfitBel, gamma: f64, q: f64) -> OrfitBel {
  OrfitBel {
    mean: &bel.mean * gamma,
    basis: bel.basis.clone(),
    svs: bel.svs.mapv(|s| (gamma * gamma * s * s / (1.0 + q * s * s)).sqrt()),
  }
}

/// Runs scalar ORFit over `inputs`/`emissions` from `initial_mean`.
pub fn orthogonal_recursive_fitting<M>(initial_mean: ArrayView<f64, Ix1>, emission: &M,
                                       params: &OrfitParams,
                                       emissions: ArrayView<f64, Ix2>,
                                       inputs: ArrayView<f64, Ix2>)
  -> Result<PosteriorOrfitFiltered>
  where M: EmissionModel + ?Sized,
{
  params.validate()?;
  check_dim("number of inputs", emissions.dim().0, inputs.dim().0)?;
  let steps = inputs.dim().0;
  let mut post = PosteriorOrfitFiltered::with_capacity(steps, initial_mean.len(),
                                                       params.memory_size);

  let mut bel = OrfitBel::new(initial_mean.to_owned(), params.memory_size);
  for (t, (x, y)) in inputs.axis_iter(Axis(0)).zip(emissions.axis_iter(Axis(0))).enumerate() {
    bel = orfit_condition_on(&bel, emission, x, y, params.sv_threshold)?;
    post.record(t, &bel);
  }
  debug!(steps, "orfit done");
  Ok(post)
}

/// Runs generalized ORFit, conditioning then predicting at each step. The
/// recorded moments are the post-condition ones.
pub fn generalized_orthogonal_recursive_fitting<M>(model_params: &RebayesParams<M>,
                                                   params: &OrfitParams,
                                                   emissions: ArrayView<f64, Ix2>,
                                                   inputs: ArrayView<f64, Ix2>)
  -> Result<PosteriorOrfitFiltered>
  where M: EmissionModel,
{
  model_params.validate()?;
  params.validate()?;
  check_dim("number of inputs", emissions.dim().0, inputs.dim().0)?;
  let eta = model_params.eta();
  let (gamma, q) = (model_params.dynamics_weights, model_params.dynamics_covariance);
  let steps = inputs.dim().0;
  let mut post = PosteriorOrfitFiltered::with_capacity(steps, model_params.state_dim(),
                                                       params.memory_size);

  let mut bel = OrfitBel::new(model_params.initial_mean.clone(), params.memory_size);
  for (t, (x, y)) in inputs.axis_iter(Axis(0)).zip(emissions.axis_iter(Axis(0))).enumerate() {
    let filtered = generalized_orfit_condition_on(&bel, eta, &model_params.emission, x, y,
                                                  params.sv_threshold)?;
    post.record(t, &filtered);
    bel = generalized_orfit_predict(&filtered, gamma, q);
  }
  debug!(steps, "generalized orfit done");
  Ok(post)
}

pub struct RebayesOrfit<M> {
  pub params: RebayesParams<M>,
  pub orfit: OrfitParams,
}

impl<M> RebayesOrfit<M>
  where M: EmissionModel,
{
  pub fn new(params: RebayesParams<M>, orfit: OrfitParams) -> Result<RebayesOrfit<M>> {
    params.validate()?;
    orfit.validate()?;
    Ok(RebayesOrfit { params, orfit, })
  }
}

impl<M> Rebayes for RebayesOrfit<M>
  where M: EmissionModel,
{
  type Bel = OrfitBel;

  fn init_bel(&self) -> Result<OrfitBel> {
    Ok(OrfitBel::new(self.params.initial_mean.clone(), self.orfit.memory_size))
  }

  fn predict_state(&self, bel: &OrfitBel) -> Result<OrfitBel> {
    Ok(generalized_orfit_predict(bel, self.params.dynamics_weights,
                                 self.params.dynamics_covariance))
  }

  fn predict_obs(&self, bel: &OrfitBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix1>> {
    self.params.emission.mean(bel.mean.view(), x)
  }

  fn predict_obs_cov(&self, bel: &OrfitBel, x: ArrayView<f64, Ix1>) -> Result<Array<f64, Ix2>> {
    let m = bel.mean.view();
    let h = self.params.emission.jacobian(m, x)?;
    let r = self.params.emission.covariance(m, x)?;
    let w = &bel.basis * &bel.svs;
    Ok(low_rank_precision_project(&h, &w, &Diagonal::Single(self.params.eta()))? + &r)
  }

  fn update_state(&self, bel: &OrfitBel, x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>)
    -> Result<OrfitBel>
  {
    generalized_orfit_condition_on(bel, self.params.eta(), &self.params.emission, x, y,
                                   self.orfit.sv_threshold)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::kalman::{EkfMethod, RebayesEkf};
  use crate::test_util::*;
  use crate::utils::PartialEqWithinTol;
  use na_core::{LinearEmission, LinearRegression};
  use nd::{arr1, arr2};

  #[test]
  fn interpolates_what_it_remembers() {
    let model = LinearRegression { input_dim: 2, obs_var: 1.0, };
    let inputs = arr2(&[
      [1.0, 0.0],
      [0.5, 2.0],
      [-1.0, 1.0],
    ]);
    let emissions = arr2(&[[1.0], [-2.0], [0.5]]);
    let post = orthogonal_recursive_fitting(Array::zeros(3).view(), &model, &OrfitParams::new(3),
                                            emissions.view(), inputs.view()).unwrap();

    let mean = post.filtered_means.row(2);
    for (x, y) in inputs.outer_iter().zip(emissions.outer_iter()) {
      let fit = model.mean(mean, x).unwrap();
      assert!((fit[0] - y[0]).abs() < 1e-10);
    }
    // each step fits its own point
    for t in 0..3 {
      let fit = model.mean(post.filtered_means.row(t), inputs.row(t)).unwrap();
      assert!((fit[0] - emissions[[t, 0]]).abs() < 1e-10);
    }
    let gram = post.filtered_bases.index_axis(Axis(0), 2);
    assert!(gram.t().dot(&gram).partial_eq_within_tol(&Array::eye(3), 1e-10));
  }

  #[test]
  fn small_memory_keeps_the_strongest_directions() {
    let model = LinearRegression { input_dim: 2, obs_var: 1.0, };
    let inputs = arr2(&[
      [0.1, 0.0],
      [3.0, 3.0],
    ]);
    let emissions = arr2(&[[0.0], [1.0]]);
    let mut params = OrfitParams::new(1);
    params.sv_threshold = 0.5;
    let post = orthogonal_recursive_fitting(Array::zeros(3).view(), &model, &params,
                                            emissions.view(), inputs.view()).unwrap();
    assert!(post.filtered_svs[[0, 0]] > 0.5);
    assert!(post.filtered_svs[[1, 0]] >= post.filtered_svs[[0, 0]]);

    let two_outputs = LinearEmission::new(Array::eye(2), Array::eye(2)).unwrap();
    let bel = OrfitBel::new(Array::zeros(2), 1);
    assert!(orfit_condition_on(&bel, &two_outputs, arr1(&[0.0]).view(),
                               arr1(&[0.0, 0.0]).view(), 0.0).is_err());
  }

  #[test]
  fn generalized_first_step_is_bayesian() {
    let (xs, ys) = linreg_data();
    let ekf = RebayesEkf::new(linreg_params(), EkfMethod::Fcekf).unwrap();
    let orfit = RebayesOrfit::new(linreg_params(), OrfitParams::new(2)).unwrap();

    let e = ekf.update_state(&ekf.init_bel().unwrap(), xs.row(3), ys.row(3)).unwrap();
    let o = orfit.update_state(&orfit.init_bel().unwrap(), xs.row(3), ys.row(3)).unwrap();
    assert!(o.mean.partial_eq_within_tol(&e.mean, 1e-10));
  }

  #[test]
  fn batch_and_streaming_agree() {
    let (xs, ys) = linreg_data();
    let orfit = RebayesOrfit::new(linreg_params(), OrfitParams::new(2)).unwrap();
    let (_, means) = orfit.scan(xs.view(), ys.view(), None, |s| Ok(s.bel.mean.clone()))
      .unwrap();
    let post = generalized_orthogonal_recursive_fitting(&orfit.params, &orfit.orfit,
                                                        ys.view(), xs.view()).unwrap();
    for (t, mean) in means.iter().enumerate() {
      assert!(mean.partial_eq_within_tol(&post.filtered_means.row(t), 1e-10));
    }
    assert_eq!(post.filtered_bases.dim(), (xs.dim().0, 2, 2));
  }
}
