use nd::{Array, ArrayBase, Data, DataMut, Ix1, Ix2};
use num_traits::{Float, One, Zero};

use crate::{check_square, FactorizeError, Result, Scalar};
use crate::triangular::{solve_lower_triangular, solve_upper_triangular};

pub trait Cholesky {
  type LMatrix: Sized;
  type DMatrix: Sized;
  /// Returns the upper triangular factor, R, of A = R^*R. Only the upper
  /// triangle of A is read.
  fn l_lstar(self) -> Result<Self::LMatrix>;
  /// Returns unit lower triangular L and the diagonal of D, A = L D L^*.
  /// Only the lower triangle of A is read.
  fn l_d_lstar(self) -> Result<(Self::LMatrix, Self::DMatrix)>;
}

impl<S> Cholesky for ArrayBase<S, Ix2>
  where S: DataMut,
        S::Elem: Scalar,
{
  type LMatrix = ArrayBase<S, Ix2>;
  type DMatrix = Array<S::Elem, Ix1>;

  fn l_lstar(self) -> Result<Self::LMatrix> {
    let m = check_square(self.dim())?;
    let mut r = self;
    let zero = S::Elem::zero();

    for k in 0..m {
      let mut d = r[[k, k]];
      for i in 0..k {
        d = d - r[[i, k]] * r[[i, k]];
      }
      if !(d > zero) || !d.is_finite() {
        return Err(FactorizeError::NotPositiveDefinite { pivot: k, });
      }
      let rkk = d.sqrt();
      r[[k, k]] = rkk;

      for j in k + 1..m {
        let mut v = r[[k, j]];
        for i in 0..k {
          v = v - r[[i, k]] * r[[i, j]];
        }
        r[[k, j]] = v / rkk;
      }
    }

    for k in 0..m {
      r.row_mut(k)
        .slice_mut(s![..k])
        .fill(zero);
    }

    Ok(r)
  }

  fn l_d_lstar(self) -> Result<(Self::LMatrix, Self::DMatrix)> {
    let m = check_square(self.dim())?;
    let mut l = self;
    let zero = S::Elem::zero();
    let mut d: Array<S::Elem, Ix1> = Array::zeros(m);

    for j in 0..m {
      let mut dj = l[[j, j]];
      for k in 0..j {
        dj = dj - l[[j, k]] * l[[j, k]] * d[k];
      }
      if dj == zero || !dj.is_finite() {
        return Err(FactorizeError::Singular { pivot: j, });
      }
      d[j] = dj;

      for i in j + 1..m {
        let mut v = l[[i, j]];
        for k in 0..j {
          v = v - l[[i, k]] * l[[j, k]] * d[k];
        }
        l[[i, j]] = v / dj;
      }
    }

    for k in 0..m {
      l[[k, k]] = S::Elem::one();
      l.row_mut(k)
        .slice_mut(s![k + 1..])
        .fill(zero);
    }

    Ok((l, d))
  }
}

/// Lower factor L with A = L L^T.
pub fn cholesky_lower<S>(a: &ArrayBase<S, Ix2>) -> Result<Array<S::Elem, Ix2>>
  where S: Data,
        S::Elem: Scalar,
{
  let r = a.to_owned().l_lstar()?;
  Ok(r.reversed_axes())
}

/// Solves A X = B for symmetric positive definite A.
pub fn solve_spd<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>)
  -> Result<Array<S1::Elem, Ix2>>
  where S1: Data,
        S2: Data<Elem = S1::Elem>,
        S1::Elem: Scalar,
{
  let l = cholesky_lower(a)?;
  let z = solve_lower_triangular(&l, b)?;
  solve_upper_triangular(&l.t(), &z)
}

pub fn inv_spd<S>(a: &ArrayBase<S, Ix2>) -> Result<Array<S::Elem, Ix2>>
  where S: Data,
        S::Elem: Scalar,
{
  let n = check_square(a.dim())?;
  solve_spd(a, &Array::eye(n))
}

#[test]
fn cholesky_llstar() {
  use nd::arr2;

  let a = arr2(&[
    [4.0, 12.0, -16.0],
    [12.0, 37.0, -43.0],
    [-16.0, -43.0, 98.0],
  ]);

  let l = a.l_lstar().expect("cholesky factorization failed");

  let expected = arr2(&[
    [2.0, 6.0, -8.0],
    [0.0, 1.0, 5.0],
    [0.0, 0.0, 3.0],
  ]);
  assert_eq!(l, expected);
}

#[test]
fn cholesky_ldlstar() {
  use nd::{arr1, arr2};

  let a = arr2(&[
    [4.0, 12.0, -16.0],
    [12.0, 37.0, -43.0],
    [-16.0, -43.0, 98.0],
  ]);

  let (l, d) = a.l_d_lstar().expect("ldl factorization failed");

  let expected = arr2(&[
    [1.0, 0.0, 0.0],
    [3.0, 1.0, 0.0],
    [-4.0, 5.0, 1.0],
  ]);
  assert_eq!(l, expected);
  assert_eq!(d, arr1(&[4.0, 1.0, 9.0]));
}

#[test]
fn cholesky_rejects_indefinite() {
  use nd::arr2;

  let a = arr2(&[
    [1.0, 2.0],
    [2.0, 1.0],
  ]);
  match a.l_lstar() {
    Err(FactorizeError::NotPositiveDefinite { pivot, }) => assert_eq!(pivot, 1),
    other => panic!("expected failure, got {:?}", other),
  }
}

#[test]
fn spd_inverse() {
  use nd::arr2;

  let a = arr2(&[
    [4.0, 1.0],
    [1.0, 3.0],
  ]);
  let inv = inv_spd(&a).unwrap();
  let id = a.dot(&inv);
  for i in 0..2 {
    for j in 0..2 {
      let e = if i == j { 1.0 } else { 0.0 };
      assert!((id[[i, j]] - e).abs() < 1e-12);
    }
  }
}
