use nd::{Array, ArrayBase, Data, Ix2, ShapeError, ErrorKind};
use num_traits::Zero;

use crate::{check_square, FactorizeError, Result, Scalar};

fn check_rhs(n: usize, rhs: (usize, usize)) -> Result<()> {
  if rhs.0 != n {
    return Err(ShapeError::from_kind(ErrorKind::IncompatibleShape).into());
  }
  Ok(())
}

/// Forward substitution, L X = B. Only the lower triangle of `l` is read.
pub fn solve_lower_triangular<S1, S2>(l: &ArrayBase<S1, Ix2>,
                                      b: &ArrayBase<S2, Ix2>)
  -> Result<Array<S1::Elem, Ix2>>
  where S1: Data,
        S2: Data<Elem = S1::Elem>,
        S1::Elem: Scalar,
{
  let n = check_square(l.dim())?;
  check_rhs(n, b.dim())?;

  let mut x = b.to_owned();
  for c in 0..x.dim().1 {
    for i in 0..n {
      let mut v = x[[i, c]];
      for k in 0..i {
        v = v - l[[i, k]] * x[[k, c]];
      }
      let pivot = l[[i, i]];
      if pivot == S1::Elem::zero() {
        return Err(FactorizeError::Singular { pivot: i, });
      }
      x[[i, c]] = v / pivot;
    }
  }

  Ok(x)
}

/// Back substitution, U X = B. Only the upper triangle of `u` is read.
pub fn solve_upper_triangular<S1, S2>(u: &ArrayBase<S1, Ix2>,
                                      b: &ArrayBase<S2, Ix2>)
  -> Result<Array<S1::Elem, Ix2>>
  where S1: Data,
        S2: Data<Elem = S1::Elem>,
        S1::Elem: Scalar,
{
  let n = check_square(u.dim())?;
  check_rhs(n, b.dim())?;

  let mut x = b.to_owned();
  for c in 0..x.dim().1 {
    for i in (0..n).rev() {
      let mut v = x[[i, c]];
      for k in i + 1..n {
        v = v - u[[i, k]] * x[[k, c]];
      }
      let pivot = u[[i, i]];
      if pivot == S1::Elem::zero() {
        return Err(FactorizeError::Singular { pivot: i, });
      }
      x[[i, c]] = v / pivot;
    }
  }

  Ok(x)
}

#[test]
fn triangular_round_trip() {
  use nd::arr2;

  let l = arr2(&[
    [2.0, 0.0, 0.0],
    [6.0, 1.0, 0.0],
    [-8.0, 5.0, 3.0],
  ]);
  let b = arr2(&[
    [2.0],
    [7.0],
    [0.0],
  ]);
  let x = solve_lower_triangular(&l, &b).unwrap();
  assert_eq!(x, arr2(&[[1.0], [1.0], [1.0]]));

  let x = solve_upper_triangular(&l.t(), &arr2(&[[0.0], [6.0], [3.0]])).unwrap();
  assert_eq!(x, arr2(&[[1.0], [1.0], [1.0]]));
}
