use nd::{Array, ArrayBase, Data, Ix2};
use num_traits::{Float, Zero};

use crate::{check_square, FactorizeError, Result, Scalar};

/// Row-pivoted LU factorization, P A = L U. `L` is unit lower triangular
/// and shares storage with `U`.
#[derive(Debug, Clone)]
pub struct Lu<A> {
  lu: Array<A, Ix2>,
  perm: Vec<usize>,
}

impl<A> Lu<A>
  where A: Scalar,
{
  pub fn factor<S>(a: &ArrayBase<S, Ix2>) -> Result<Lu<A>>
    where S: Data<Elem = A>,
  {
    let n = check_square(a.dim())?;
    let mut lu = a.to_owned();
    let mut perm: Vec<usize> = (0..n).collect();

    for k in 0..n {
      let mut p = k;
      let mut max = lu[[k, k]].abs();
      for i in k + 1..n {
        let v = lu[[i, k]].abs();
        if v > max {
          max = v;
          p = i;
        }
      }
      if max == A::zero() || !max.is_finite() {
        return Err(FactorizeError::Singular { pivot: k, });
      }

      if p != k {
        perm.swap(p, k);
        for j in 0..n {
          let t = lu[[k, j]];
          lu[[k, j]] = lu[[p, j]];
          lu[[p, j]] = t;
        }
      }

      let pivot = lu[[k, k]];
      for i in k + 1..n {
        let f = lu[[i, k]] / pivot;
        lu[[i, k]] = f;
        if f == A::zero() { continue; }
        for j in k + 1..n {
          let v = lu[[k, j]];
          lu[[i, j]] = lu[[i, j]] - f * v;
        }
      }
    }

    Ok(Lu { lu, perm, })
  }

  pub fn dim(&self) -> usize { self.perm.len() }

  pub fn solve<S>(&self, b: &ArrayBase<S, Ix2>) -> Result<Array<A, Ix2>>
    where S: Data<Elem = A>,
  {
    let n = self.dim();
    if b.dim().0 != n {
      let e = nd::ShapeError::from_kind(nd::ErrorKind::IncompatibleShape);
      return Err(e.into());
    }
    let cols = b.dim().1;

    let mut x = Array::zeros((n, cols));
    for (i, &p) in self.perm.iter().enumerate() {
      x.row_mut(i).assign(&b.row(p));
    }

    for c in 0..cols {
      for i in 0..n {
        let mut v = x[[i, c]];
        for k in 0..i {
          v = v - self.lu[[i, k]] * x[[k, c]];
        }
        x[[i, c]] = v;
      }
      for i in (0..n).rev() {
        let mut v = x[[i, c]];
        for k in i + 1..n {
          v = v - self.lu[[i, k]] * x[[k, c]];
        }
        x[[i, c]] = v / self.lu[[i, i]];
      }
    }

    Ok(x)
  }
}

/// Solves A X = B for a general square A.
pub fn solve<S1, S2>(a: &ArrayBase<S1, Ix2>, b: &ArrayBase<S2, Ix2>)
  -> Result<Array<S1::Elem, Ix2>>
  where S1: Data,
        S2: Data<Elem = S1::Elem>,
        S1::Elem: Scalar,
{
  Lu::factor(a)?.solve(b)
}

pub fn inv<S>(a: &ArrayBase<S, Ix2>) -> Result<Array<S::Elem, Ix2>>
  where S: Data,
        S::Elem: Scalar,
{
  let lu = Lu::factor(a)?;
  lu.solve(&Array::eye(lu.dim()))
}

#[test]
fn lu_solve_needs_pivoting() {
  use nd::arr2;

  let a = arr2(&[
    [0.0, 2.0, 1.0],
    [1.0, 1.0, 0.0],
    [3.0, 0.0, 1.0],
  ]);
  let x = arr2(&[
    [1.0, -1.0],
    [2.0, 0.5],
    [-3.0, 2.0],
  ]);
  let b = a.dot(&x);
  let solved = solve(&a, &b).unwrap();
  for (l, r) in solved.iter().zip(x.iter()) {
    assert!((l - r).abs() < 1e-12, "{} != {}", l, r);
  }
}

#[test]
fn lu_inverse() {
  use nd::arr2;

  let a = arr2(&[
    [2.0, 1.0],
    [7.0, 4.0],
  ]);
  let expected = arr2(&[
    [4.0, -1.0],
    [-7.0, 2.0],
  ]);
  let ai = inv(&a).unwrap();
  for (l, r) in ai.iter().zip(expected.iter()) {
    assert!((l - r).abs() < 1e-12);
  }
}

#[test]
fn lu_rejects_singular() {
  use nd::arr2;

  let a = arr2(&[
    [1.0, 2.0],
    [2.0, 4.0],
  ]);
  match Lu::factor(&a) {
    Err(FactorizeError::Singular { pivot, }) => assert_eq!(pivot, 1),
    other => panic!("expected failure, got {:?}", other),
  }
}
