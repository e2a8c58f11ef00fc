//! The inflate, predict and condition steps of each low-rank variant, as
//! functions of the belief.

use nd::{concatenate, s, Array, ArrayBase, Axis, Data, ArrayView, Ix1, Ix2};
use nla::{cholesky_lower, inv, pinv, thin_svd, Svd};

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;

use na_core::EmissionModel;

use crate::lofi::{Inflation, LofiBel};
use crate::utils::{argmin, capacitance, div_rows, inv_sqrt_noise, leading_columns,
                   normalize, Diagonal};
use crate::{observation_noise, Error, Result};

/// The emission linearised around a point: `y ~ N(yhat + H (m - m0), R)`.
#[derive(Clone, Debug)]
pub struct Linearization {
  /// The predicted emission at the belief mean.
  pub yhat: Array<f64, Ix1>,
  pub jacobian: Array<f64, Ix2>,
  pub noise: Array<f64, Ix2>,
}

impl Linearization {
  /// `(H^T A, H^T A A^T)` with `A A^T = R^{-1}`.
  fn whitened(&self) -> Result<(Array<f64, Ix2>, Array<f64, Ix2>)> {
    let a = inv_sqrt_noise(&self.noise)?;
    let hta = self.jacobian.t().dot(&a);
    let htaat = hta.dot(&a.t());
    Ok((hta, htaat))
  }
}

/// Linearises at `lin` when given, otherwise at `mean`.
pub fn linearize<M>(emission: &M, mean: &Array<f64, Ix1>, lin: Option<&Array<f64, Ix1>>,
                    x: ArrayView<f64, Ix1>, obs_noise_var: Option<f64>)
  -> Result<Linearization>
  where M: EmissionModel + ?Sized,
{
  let point = lin.unwrap_or(mean);
  let jacobian = emission.jacobian(point.view(), x)?;
  let mut yhat = emission.mean(point.view(), x)?;
  if lin.is_some() {
    yhat += &jacobian.dot(&(mean - point));
  }
  let noise = observation_noise(emission, point.view(), x, obs_noise_var)?;
  Ok(Linearization { yhat, jacobian, noise, })
}

/// `[W, H^T A]`.
fn augment(bel: &LofiBel, hta: &Array<f64, Ix2>) -> Result<Array<f64, Ix2>> {
  let w = bel.low_rank_factor();
  Ok(concatenate(Axis(1), &[w.view(), hta.view()])?)
}

fn innovation(lin: &Linearization, y: ArrayView<f64, Ix1>) -> Array<f64, Ix1> {
  &y - &lin.yhat
}

pub fn spherical_inflate(bel: &LofiBel, alpha: f64, inflation: Inflation) -> Result<LofiBel> {
  let mut out = bel.clone();
  out.svs = &bel.svs / (1.0 + alpha).sqrt();

  match inflation {
    Inflation::Bayesian => {
      let eta = bel.eta;
      let w = out.low_rank_factor();
      let g = capacitance(&w, &Diagonal::Single(eta))?;
      let e = &bel.pp_mean - &bel.mean;
      let k = &e - &(&w / eta).dot(&g.dot(&w.t().dot(&e)));
      out.mean = &bel.mean + &(k * (alpha / (1.0 + alpha)));
    },
    Inflation::Simple => {
      out.eta = bel.eta / (1.0 + alpha);
    },
    Inflation::Hybrid => { },
  }
  Ok(out)
}

pub fn spherical_predict(bel: &LofiBel, steady_state: bool) -> LofiBel {
  let (gamma, q, eta) = (bel.gamma, bel.q, bel.eta);
  let g2 = gamma * gamma;

  let mut out = bel.clone();
  out.pp_mean = &bel.pp_mean * gamma;
  out.mean = &bel.mean * gamma;
  if steady_state {
    out.svs = bel.svs.mapv(|l| (g2 * l * l / (1.0 + q * l * l)).sqrt());
  } else {
    let c = g2 + q * eta;
    out.eta = eta / c;
    out.svs = bel.svs.mapv(|l| (g2 * l * l / (c * (c + q * l * l))).sqrt());
  }
  out
}

pub fn spherical_condition(bel: &LofiBel, lin: &Linearization, y: ArrayView<f64, Ix1>,
                           memory_size: usize) -> Result<LofiBel> {
  let (hta, htaat) = lin.whitened()?;
  let w_tilde = augment(bel, &hta)?;
  let Svd { u, s: lamb, .. } = thin_svd(&w_tilde)?;

  let eta = bel.eta;
  let d = lamb.mapv(|l| l * l / (eta * eta + eta * l * l));
  let gain = &htaat / eta - &(&u * &d).dot(&u.t().dot(&htaat));

  let mut out = bel.clone();
  out.mean = &bel.mean + &gain.dot(&innovation(lin, y));
  let (basis, svs) = leading_columns(&u, &lamb, memory_size);
  out.basis = basis;
  out.svs = svs;
  Ok(out)
}

/// Also decays `eta` towards its steady state.
pub fn diagonal_inflate(bel: &LofiBel, alpha: f64, inflation: Inflation, memory_size: usize)
  -> Result<LofiBel>
{
  let (gamma, q, eta) = (bel.gamma, bel.q, bel.eta);
  let w_pred = bel.low_rank_factor() / (1.0 + alpha).sqrt();
  let shrunk = &bel.ups / (1.0 + alpha);
  let restore = alpha * eta / (1.0 + alpha);

  let mut out = bel.clone();
  match inflation {
    Inflation::Bayesian => {
      let ups_pred = shrunk + restore;
      let k = {
        let d = Diagonal::Multiple(ups_pred.view());
        let g = capacitance(&w_pred, &d)?;
        let e = &bel.pp_mean - &bel.mean;
        let resid = &e - &w_pred.dot(&g.dot(&div_rows(&w_pred, &d).t().dot(&e)));
        resid / &ups_pred
      };
      out.mean = &bel.mean + &(k * restore);
      out.ups = ups_pred;
    },
    Inflation::Simple => {
      out.ups = shrunk;
    },
    Inflation::Hybrid => {
      out.ups = shrunk + restore;
    },
  }

  let Svd { u, s, .. } = thin_svd(&w_pred)?;
  let (basis, svs) = leading_columns(&u, &s, memory_size);
  out.basis = basis;
  out.svs = svs;
  out.eta = eta / (gamma * gamma + q * eta);
  Ok(out)
}

pub fn diagonal_predict(bel: &LofiBel, memory_size: usize) -> Result<LofiBel> {
  let (gamma, q) = (bel.gamma, bel.q);
  let w = bel.low_rank_factor();
  let ups_pred = bel.ups.mapv(|u| 1.0 / (gamma * gamma / u + q));
  let ratio = &ups_pred / &bel.ups;
  let w_scaled = &w * &ratio.view().insert_axis(Axis(1));

  let l = w.dim().1;
  let c = pinv(&(Array::<f64, Ix2>::eye(l) + &(w.t().dot(&w_scaled) * q)))?;
  let c = (&c + &c.t()) / 2.0;
  let w_pred = (w_scaled * gamma).dot(&cholesky_lower(&c)?);
  let Svd { u, s, .. } = thin_svd(&w_pred)?;

  let mut out = bel.clone();
  out.pp_mean = &bel.pp_mean * gamma;
  out.mean = &bel.mean * gamma;
  let (basis, svs) = leading_columns(&u, &s, memory_size);
  out.basis = basis;
  out.svs = svs;
  out.ups = ups_pred;
  Ok(out)
}

/// Directions discarded from the low-rank part are folded into the
/// diagonal, which keeps `diag(precision)` exact.
pub fn diagonal_condition(bel: &LofiBel, lin: &Linearization, y: ArrayView<f64, Ix1>,
                          memory_size: usize) -> Result<LofiBel> {
  let (hta, htaat) = lin.whitened()?;
  let w_tilde = augment(bel, &hta)?;
  let Svd { u, s: lamb, .. } = thin_svd(&w_tilde)?;

  let mut ups = bel.ups.clone();
  if lamb.len() > memory_size {
    let extra = &u.slice(s![.., memory_size..]) * &lamb.slice(s![memory_size..]);
    ups += &extra.mapv(|v| v * v).sum_axis(Axis(1));
  }

  let prior = Diagonal::Multiple(bel.ups.view());
  let g = capacitance(&w_tilde, &prior)?;
  let wu = div_rows(&w_tilde, &prior);
  let gain = div_rows(&htaat, &prior) - wu.dot(&g).dot(&wu.t().dot(&htaat));

  let mut out = bel.clone();
  out.mean = &bel.mean + &gain.dot(&innovation(lin, y));
  let (basis, svs) = leading_columns(&u, &lamb, memory_size);
  out.basis = basis;
  out.svs = svs;
  out.ups = ups;
  Ok(out)
}

/// Inverse of `[[A, B], [B^T, D]]` with `A` diagonal and `D` of size
/// `lr_block_dim`, by the Schur complement of `A`.
pub fn invert_2x2_block<S>(m: &ArrayBase<S, Ix2>, lr_block_dim: usize)
  -> Result<Array<f64, Ix2>>
  where S: Data<Elem = f64>,
{
  let n = m.dim().0;
  if m.dim().1 != n || lr_block_dim > n {
    return Err(Error::invalid("lr_block_dim",
                              format!("{} does not fit a {:?} matrix", lr_block_dim, m.dim())));
  }
  let k = n - lr_block_dim;
  let a = m.slice(s![..k, ..k]).diag().mapv(|v| 1.0 / v);
  let b = m.slice(s![..k, k..]);
  let d = m.slice(s![k.., k..]);

  let abt = &b.t() * &a;
  let k_inv = inv(&(&d - &abt.dot(&b)))?;

  let mut out = Array::zeros((n, n));
  out.slice_mut(s![..k, ..k])
    .assign(&(Array::from_diag(&a) + abt.t().dot(&k_inv).dot(&abt)));
  out.slice_mut(s![..k, k..]).assign(&-abt.t().dot(&k_inv));
  out.slice_mut(s![k.., ..k]).assign(&-k_inv.dot(&abt));
  out.slice_mut(s![k.., k..]).assign(&k_inv);
  Ok(out)
}

/// A permutation of the `c` outputs, fixed by `seed` and the step count.
pub fn output_permutation(seed: u64, step: u64, c: usize) -> Vec<usize> {
  let mut rng = Isaac64Rng::seed_from_u64(seed.wrapping_add(step));
  let mut perm: Vec<usize> = (0..c).collect();
  perm.shuffle(&mut rng);
  perm
}

/// The mean is updated exactly. The basis takes the part of each whitened
/// output direction orthogonal to it, replacing its weakest column when
/// that part is stronger.
pub fn orthogonal_condition(bel: &LofiBel, lin: &Linearization, y: ArrayView<f64, Ix1>,
                            perm: &[usize]) -> Result<LofiBel> {
  let (hta, htaat) = lin.whitened()?;
  let c = hta.dim().1;
  let w_tilde = augment(bel, &hta)?;
  let p = w_tilde.dim().1;

  let s = Array::<f64, Ix2>::eye(p) * bel.eta + w_tilde.t().dot(&w_tilde);
  let s_inv = invert_2x2_block(&s, c)?;
  let gain = &htaat - &w_tilde.dot(&s_inv.dot(&w_tilde.t().dot(&htaat)));

  let mut out = bel.clone();
  out.mean = &bel.mean + &(gain / bel.eta).dot(&innovation(lin, y));

  for &i in perm {
    let h = hta.column(i);
    let v = &h - &out.basis.dot(&out.basis.t().dot(&h));
    let u = normalize(&v);
    let strength = u.dot(&v);
    if let Some(j) = argmin(&out.svs) {
      if out.svs[j] < strength {
        out.basis.column_mut(j).assign(&u);
        out.svs[j] = strength;
      }
    }
  }
  Ok(out)
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::utils::PartialEqWithinTol;
  use nd::{arr1, arr2};

  fn bel(d: usize, l: usize) -> LofiBel {
    LofiBel {
      pp_mean: Array::zeros(d),
      mean: Array::zeros(d),
      basis: Array::zeros((d, l)),
      svs: Array::zeros(l),
      eta: 2.0,
      gamma: 0.9,
      q: 0.1,
      ups: Array::from_elem(d, 2.0),
      nobs: 0,
      obs_noise_var: 1.0,
      step: 0,
    }
  }

  #[test]
  fn block_inverse() {
    let m = arr2(&[
      [2.0, 0.0, 0.5, 0.1],
      [0.0, 3.0, 0.2, 0.4],
      [0.5, 0.2, 4.0, 0.3],
      [0.1, 0.4, 0.3, 5.0],
    ]);
    let expected = inv(&m).unwrap();
    assert!(invert_2x2_block(&m, 2).unwrap().partial_eq_within_tol(&expected, 1e-12));
    assert!(invert_2x2_block(&m, 5).is_err());
  }

  #[test]
  fn steady_state_keeps_prior_precision() {
    let mut b = bel(3, 2);
    b.q = (1.0 - b.gamma * b.gamma) / b.eta;
    b.svs = arr1(&[1.5, 0.5]);
    let steady = spherical_predict(&b, true);
    assert_eq!(steady.eta, b.eta);
    let plain = spherical_predict(&b, false);
    assert!((plain.eta - b.eta).abs() < 1e-12);
    assert!(steady.svs.iter().zip(b.svs.iter()).all(|(n, o)| n < o));
  }

  #[test]
  fn inflation_pulls_towards_predictive_prior() {
    let mut b = bel(2, 1);
    b.pp_mean = arr1(&[1.0, -1.0]);
    b.mean = arr1(&[3.0, 1.0]);

    let infl = spherical_inflate(&b, 1.0, Inflation::Bayesian).unwrap();
    assert!(infl.mean.partial_eq_within_tol(&arr1(&[2.0, 0.0]), 1e-12));
    let infl = diagonal_inflate(&b, 1.0, Inflation::Bayesian, 1).unwrap();
    assert!(infl.mean.partial_eq_within_tol(&arr1(&[2.0, 0.0]), 1e-12));

    let simple = spherical_inflate(&b, 1.0, Inflation::Simple).unwrap();
    assert_eq!((simple.eta, simple.mean.clone()), (1.0, b.mean.clone()));
    let hybrid = diagonal_inflate(&b, 1.0, Inflation::Hybrid, 1).unwrap();
    assert_eq!(hybrid.ups, arr1(&[2.0, 2.0]));
    assert_eq!(hybrid.mean, b.mean);
  }

  #[test]
  fn diagonal_condition_preserves_precision_diagonal() {
    let b = bel(3, 1);
    let lin = Linearization {
      yhat: arr1(&[0.0, 0.0]),
      jacobian: arr2(&[
        [1.0, 2.0, 0.0],
        [0.0, 1.0, -1.0],
      ]),
      noise: arr2(&[
        [0.5, 0.1],
        [0.1, 0.5],
      ]),
    };
    let post = diagonal_condition(&b, &lin, arr1(&[1.0, 2.0]).view(), 1).unwrap();

    let rinv = inv(&lin.noise).unwrap();
    let full = Array::from_diag(&b.ups) + lin.jacobian.t().dot(&rinv).dot(&lin.jacobian);
    let w = post.low_rank_factor();
    let kept = Array::from_diag(&post.ups) + w.dot(&w.t());
    assert!(kept.diag().partial_eq_within_tol(&full.diag(), 1e-10));

    // the mean update uses the full-rank precision
    let expected = inv(&full).unwrap()
      .dot(&lin.jacobian.t())
      .dot(&rinv)
      .dot(&arr1(&[1.0, 2.0]));
    assert!(post.mean.partial_eq_within_tol(&expected, 1e-10));
  }

  #[test]
  fn permutations_are_reproducible() {
    let a = output_permutation(4, 9, 10);
    assert_eq!(a, output_permutation(4, 9, 10));
    let mut sorted = a.clone();
    sorted.sort();
    assert_eq!(sorted, (0..10).collect::<Vec<_>>());
  }
}
