//! Thin SVD by one-sided (Hestenes) Jacobi rotations. Accurate for the
//! narrow, tall matrices the low-rank filters build each step.

use nd::{Array, ArrayBase, Axis, Data, Ix1, Ix2};
use num_traits::{Float, NumCast, One, Zero};

use crate::{FactorizeError, Result, Scalar};

pub const MAX_SWEEPS: usize = 60;

#[derive(Debug, Clone)]
pub struct Svd<A> {
  /// `m x k` left singular vectors. Columns belonging to zero singular
  /// values are zero.
  pub u: Array<A, Ix2>,
  /// Descending.
  pub s: Array<A, Ix1>,
  /// `k x n`.
  pub vt: Array<A, Ix2>,
}

impl<A> Svd<A>
  where A: Scalar,
{
  pub fn rank(&self) -> usize { self.s.len() }
}

fn cast<A: Scalar>(v: f64) -> A {
  NumCast::from(v).unwrap_or_else(A::zero)
}

/// Returns (u, s, v) for a tall matrix, m >= n.
fn jacobi_tall<S>(a: &ArrayBase<S, Ix2>)
  -> Result<(Array<S::Elem, Ix2>, Array<S::Elem, Ix1>, Array<S::Elem, Ix2>)>
  where S: Data,
        S::Elem: Scalar,
{
  let (m, n) = a.dim();
  let zero = S::Elem::zero();
  let one = S::Elem::one();
  let tol = S::Elem::epsilon() * cast(m.max(1) as f64);

  let mut u = a.to_owned();
  let mut v: Array<S::Elem, Ix2> = Array::eye(n);

  let mut converged = n < 2;
  let mut sweep = 0;
  while !converged {
    if sweep == MAX_SWEEPS {
      return Err(FactorizeError::NoConvergence { sweeps: sweep, });
    }
    sweep += 1;
    converged = true;

    for p in 0..n - 1 {
      for q in p + 1..n {
        let (alpha, beta, gamma) = {
          let up = u.column(p);
          let uq = u.column(q);
          (up.dot(&up), uq.dot(&uq), up.dot(&uq))
        };
        if gamma == zero || gamma.abs() <= tol * (alpha * beta).sqrt() {
          continue;
        }
        converged = false;

        let two = one + one;
        let zeta = (beta - alpha) / (two * gamma);
        let sign = if zeta >= zero { one } else { -one };
        let t = sign / (zeta.abs() + (one + zeta * zeta).sqrt());
        let c = one / (one + t * t).sqrt();
        let s = c * t;

        rotate(&mut u, p, q, c, s);
        rotate(&mut v, p, q, c, s);
      }
    }
  }

  let mut s: Array<S::Elem, Ix1> = Array::zeros(n);
  for j in 0..n {
    let mut col = u.column_mut(j);
    let norm = col.dot(&col).sqrt();
    s[j] = norm;
    if norm > zero {
      col.mapv_inplace(|x| x / norm);
    } else {
      col.fill(zero);
    }
  }

  let mut order: Vec<usize> = (0..n).collect();
  order.sort_by(|&l, &r| {
    s[r].partial_cmp(&s[l]).unwrap_or(::std::cmp::Ordering::Equal)
  });

  let s = order.iter().map(|&i| s[i]).collect::<Array<_, Ix1>>();
  let u = u.select(Axis(1), &order[..]);
  let v = v.select(Axis(1), &order[..]);

  Ok((u, s, v))
}

fn rotate<A: Scalar>(m: &mut Array<A, Ix2>, p: usize, q: usize, c: A, s: A) {
  for i in 0..m.dim().0 {
    let mp = m[[i, p]];
    let mq = m[[i, q]];
    m[[i, p]] = c * mp - s * mq;
    m[[i, q]] = s * mp + c * mq;
  }
}

/// Economy SVD, A = U diag(s) V^T with k = min(m, n).
pub fn thin_svd<S>(a: &ArrayBase<S, Ix2>) -> Result<Svd<S::Elem>>
  where S: Data,
        S::Elem: Scalar,
{
  let (m, n) = a.dim();
  if m >= n {
    let (u, s, v) = jacobi_tall(a)?;
    Ok(Svd { u, s, vt: v.reversed_axes(), })
  } else {
    let (u, s, v) = jacobi_tall(&a.t())?;
    Ok(Svd { u: v, s, vt: u.reversed_axes(), })
  }
}

/// Moore-Penrose pseudo-inverse. Singular values below `1e-15 * s_max`
/// are treated as zero.
pub fn pinv<S>(a: &ArrayBase<S, Ix2>) -> Result<Array<S::Elem, Ix2>>
  where S: Data,
        S::Elem: Scalar,
{
  let Svd { u, s, vt } = thin_svd(a)?;
  let zero = S::Elem::zero();
  let smax = s.iter().cloned().fold(zero, |l, r| if r > l { r } else { l });
  let cutoff = smax * cast(1e-15);

  let inv_s = s.mapv(|v| if v > cutoff && v > zero { S::Elem::one() / v } else { zero });
  // V diag(1/s) U^T
  let vs = vt.t().to_owned() * &inv_s;
  Ok(vs.dot(&u.t()))
}

#[cfg(test)]
fn reconstruct(svd: &Svd<f64>) -> Array<f64, Ix2> {
  (&svd.u * &svd.s).dot(&svd.vt)
}

#[test]
fn svd_tall_reconstructs() {
  use nd::arr2;

  let a = arr2(&[
    [1.0, 2.0],
    [3.0, 4.0],
    [5.0, 6.0],
    [0.5, -1.0],
  ]);
  let svd = thin_svd(&a).unwrap();
  assert_eq!(svd.u.dim(), (4, 2));
  assert_eq!(svd.vt.dim(), (2, 2));
  assert!(svd.s[0] >= svd.s[1]);

  let r = reconstruct(&svd);
  for (l, r) in r.iter().zip(a.iter()) {
    assert!((l - r).abs() < 1e-10);
  }

  let utu = svd.u.t().dot(&svd.u);
  for i in 0..2 {
    for j in 0..2 {
      let e = if i == j { 1.0 } else { 0.0 };
      assert!((utu[[i, j]] - e).abs() < 1e-10);
    }
  }
}

#[test]
fn svd_wide_reconstructs() {
  use nd::arr2;

  let a = arr2(&[
    [3.0, 2.0, 2.0],
    [2.0, 3.0, -2.0],
  ]);
  let svd = thin_svd(&a).unwrap();
  assert_eq!(svd.u.dim(), (2, 2));
  assert_eq!(svd.vt.dim(), (2, 3));
  assert!((svd.s[0] - 5.0).abs() < 1e-10);
  assert!((svd.s[1] - 3.0).abs() < 1e-10);

  let r = reconstruct(&svd);
  for (l, r) in r.iter().zip(a.iter()) {
    assert!((l - r).abs() < 1e-10);
  }
}

#[test]
fn svd_zero_columns() {
  use nd::arr2;

  let a = arr2(&[
    [0.0, 1.0, 0.0],
    [0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0],
  ]);
  let svd = thin_svd(&a).unwrap();
  assert!((svd.s[0] - 2.0f64.sqrt()).abs() < 1e-12);
  assert_eq!(svd.s[1], 0.0);
  assert_eq!(svd.s[2], 0.0);
  assert!(svd.u.column(1).iter().all(|&v| v == 0.0));
  assert!(svd.u.column(2).iter().all(|&v| v == 0.0));
}

#[test]
fn pinv_of_rank_deficient() {
  use nd::arr2;

  let a = arr2(&[
    [1.0, 1.0],
    [1.0, 1.0],
  ]);
  let p = pinv(&a).unwrap();
  for &v in p.iter() {
    assert!((v - 0.25).abs() < 1e-12);
  }

  let b = arr2(&[
    [2.0, 0.0],
    [0.0, 4.0],
  ]);
  let p = pinv(&b).unwrap();
  assert!((p[[0, 0]] - 0.5).abs() < 1e-14);
  assert!((p[[1, 1]] - 0.25).abs() < 1e-14);
  assert!(p[[0, 1]].abs() < 1e-14);
}
