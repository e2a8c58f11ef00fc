use nd::{Array, ArrayBase, ArrayView, Axis, Data, Dimension, Ix1, Ix2};
use nla::{cholesky_lower, pinv, solve_lower_triangular};

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use std::ops::Index;

use crate::Result;

/// `diag(d)` where `d` is either a repeated scalar or a vector.
#[derive(Debug, Clone)]
pub enum Diagonal<'a, E>
  where E: 'a,
{
  Single(E),
  Multiple(ArrayView<'a, E, Ix1>)
}
impl<'a, E> Index<usize> for Diagonal<'a, E> {
  type Output = E;
  fn index(&self, idx: usize) -> &E {
    match self {
      &Diagonal::Single(ref e) => e,
      &Diagonal::Multiple(ref v) => &v[idx],
    }
  }
}
impl<'a, E> From<E> for Diagonal<'a, E> {
  fn from(v: E) -> Diagonal<'a, E> {
    Diagonal::Single(v)
  }
}
impl<'a, E> From<ArrayView<'a, E, Ix1>> for Diagonal<'a, E> {
  fn from(v: ArrayView<'a, E, Ix1>) -> Self {
    Diagonal::Multiple(v)
  }
}
impl<'a> Diagonal<'a, f64> {
  /// Materialise as a length-`n` vector.
  pub fn to_vec(&self, n: usize) -> Array<f64, Ix1> {
    match self {
      &Diagonal::Single(e) => Array::from_elem(n, e),
      &Diagonal::Multiple(ref v) => v.to_owned(),
    }
  }
}

pub trait PartialEqWithinTol<Rhs, Tol> {
  const STD_TOL: Tol;
  fn partial_eq_within_tol(&self, rhs: &Rhs, tol: Tol) -> bool;

  fn partial_neq_within_tol(&self, rhs: &Rhs, tol: Tol) -> bool {
    !self.partial_eq_within_tol(rhs, tol)
  }

  fn partial_eq_within_std_tol(&self, rhs: &Rhs) -> bool {
    self.partial_eq_within_tol(rhs, Self::STD_TOL)
  }
  fn partial_neq_within_std_tol(&self, rhs: &Rhs) -> bool {
    !self.partial_eq_within_std_tol(rhs)
  }
}

impl PartialEqWithinTol<f64, f64> for f64 {
  const STD_TOL: Self = ::std::f64::EPSILON;
  fn partial_eq_within_tol(&self, rhs: &f64, tol: f64) -> bool {
    (self - rhs).abs() <= tol
  }
}
impl PartialEqWithinTol<f32, f32> for f32 {
  const STD_TOL: Self = ::std::f32::EPSILON;
  fn partial_eq_within_tol(&self, rhs: &f32, tol: f32) -> bool {
    (self - rhs).abs() <= tol
  }
}
impl<S1, S2, D> PartialEqWithinTol<ArrayBase<S2, D>, f64> for ArrayBase<S1, D>
  where S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
        D: Dimension,
{
  const STD_TOL: f64 = ::std::f64::EPSILON;
  fn partial_eq_within_tol(&self, rhs: &ArrayBase<S2, D>, tol: f64) -> bool {
    self.shape() == rhs.shape() &&
      self.iter()
        .zip(rhs.iter())
        .all(|(l, r)| l.partial_eq_within_tol(r, tol))
  }
}

/// Standard normal draws, column `j` scaled by `d[j]`.
pub fn make_2d_randn<R>(dim: (usize, usize),
                        d: Diagonal<f64>,
                        rand: &mut R) -> Array<f64, Ix2>
  where R: Rng + ?Sized,
{
  let mut r: Array<f64, Ix2> = Array::zeros(dim);
  for i in 0..dim.0 {
    for j in 0..dim.1 {
      let z: f64 = StandardNormal.sample(rand);
      r[[i, j]] = z * d[j];
    }
  }

  r
}

/// `A = L^{-T}` with `R = L L^T`, so that `A A^T = R^{-1}`.
pub fn inv_sqrt_noise<S>(r: &ArrayBase<S, Ix2>) -> Result<Array<f64, Ix2>>
  where S: Data<Elem = f64>,
{
  let l = cholesky_lower(r)?;
  let linv = solve_lower_triangular(&l, &Array::eye(l.dim().0))?;
  Ok(linv.reversed_axes())
}

/// `v / |v|`, or zeros for the zero vector.
pub fn normalize<S>(v: &ArrayBase<S, Ix1>) -> Array<f64, Ix1>
  where S: Data<Elem = f64>,
{
  let norm = v.dot(v).sqrt();
  if norm > 0.0 {
    v / norm
  } else {
    Array::zeros(v.len())
  }
}

/// Scales row `i` of `m` by `1 / d[i]`.
pub fn div_rows<S>(m: &ArrayBase<S, Ix2>, d: &Diagonal<f64>) -> Array<f64, Ix2>
  where S: Data<Elem = f64>,
{
  let mut out = m.to_owned();
  for (i, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
    let di = d[i];
    row.mapv_inplace(|v| v / di);
  }
  out
}

/// `G = pinv(I + W^T diag(d)^{-1} W)`, the capacitance matrix of the
/// precision `diag(d) + W W^T`.
pub fn capacitance<S>(w: &ArrayBase<S, Ix2>, d: &Diagonal<f64>) -> Result<Array<f64, Ix2>>
  where S: Data<Elem = f64>,
{
  let l = w.dim().1;
  let m = Array::<f64, Ix2>::eye(l) + w.t().dot(&div_rows(w, d));
  Ok(pinv(&m)?)
}

/// `(diag(d) + W W^T)^{-1} g`, by Woodbury.
pub fn low_rank_precision_solve<S1, S2>(w: &ArrayBase<S1, Ix2>,
                                        d: &Diagonal<f64>,
                                        g: &ArrayBase<S2, Ix1>)
  -> Result<Array<f64, Ix1>>
  where S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
{
  let gd = g.iter().enumerate().map(|(i, &v)| v / d[i]).collect::<Array<f64, Ix1>>();
  let wd = div_rows(w, d);
  let cap = capacitance(w, d)?;
  Ok(&gd - &wd.dot(&cap.dot(&w.t().dot(&gd))))
}

/// `H (diag(d) + W W^T)^{-1} H^T`, without forming the state covariance.
pub fn low_rank_precision_project<S1, S2>(h: &ArrayBase<S1, Ix2>,
                                          w: &ArrayBase<S2, Ix2>,
                                          d: &Diagonal<f64>)
  -> Result<Array<f64, Ix2>>
  where S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
{
  // H diag(d)^{-1}
  let hd = div_rows(&h.t(), d).reversed_axes();
  let cap = capacitance(w, d)?;
  let hw = hd.dot(w);
  Ok(hd.dot(&h.t()) - hw.dot(&cap).dot(&hw.t()))
}

/// Keeps the leading `k` columns of `u` (and entries of `s`), padding with
/// zeros when fewer are available.
pub fn leading_columns(u: &Array<f64, Ix2>, s: &Array<f64, Ix1>, k: usize)
  -> (Array<f64, Ix2>, Array<f64, Ix1>)
{
  let avail = s.len().min(k);
  let mut uk = Array::zeros((u.dim().0, k));
  let mut sk = Array::zeros(k);
  uk.slice_mut(nd::s![.., ..avail]).assign(&u.slice(nd::s![.., ..avail]));
  sk.slice_mut(nd::s![..avail]).assign(&s.slice(nd::s![..avail]));
  (uk, sk)
}

pub fn argmin(v: &Array<f64, Ix1>) -> Option<usize> {
  v.iter()
    .enumerate()
    .fold(None, |best: Option<(usize, f64)>, (i, &x)| match best {
      Some((_, b)) if b <= x => best,
      _ => Some((i, x)),
    })
    .map(|(i, _)| i)
}
