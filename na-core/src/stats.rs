use std::f64::consts::PI;

use nd::{ArrayView, Ix1, Ix2};
use nla::{cholesky_lower, solve_lower_triangular};

use crate::{check_dim, Result};

/// `log N(y; mean, cov)`.
pub fn mvn_log_prob(mean: ArrayView<f64, Ix1>,
                    cov: ArrayView<f64, Ix2>,
                    y: ArrayView<f64, Ix1>) -> Result<f64> {
  let n = mean.len();
  check_dim("mvn observation", n, y.len())?;
  check_dim("mvn covariance", n, cov.dim().0)?;

  let l = cholesky_lower(&cov)?;
  let r = (&y - &mean).into_shape((n, 1))?;
  let z = solve_lower_triangular(&l, &r)?;
  let maha = z.iter().map(|v| v * v).sum::<f64>();
  let log_det = l.diag().iter().map(|v| v.ln()).sum::<f64>();

  Ok(-0.5 * maha - log_det - 0.5 * (n as f64) * (2.0 * PI).ln())
}

pub fn normal_log_prob(mean: f64, var: f64, y: f64) -> f64 {
  let d = y - mean;
  -0.5 * (d * d / var + (2.0 * PI * var).ln())
}

/// `log(sum(exp(v)))`, `-inf` for an empty input.
pub fn logsumexp(v: ArrayView<f64, Ix1>) -> f64 {
  let max = v.fold(::std::f64::NEG_INFINITY, |m, &x| m.max(x));
  if !max.is_finite() {
    return max;
  }
  max + v.iter().map(|&x| (x - max).exp()).sum::<f64>().ln()
}

#[test]
fn mvn_matches_product_of_normals() {
  use nd::{arr1, arr2};

  let mean = arr1(&[1.0, -2.0]);
  let cov = arr2(&[
    [0.5, 0.0],
    [0.0, 2.0],
  ]);
  let y = arr1(&[1.3, 0.0]);
  let lp = mvn_log_prob(mean.view(), cov.view(), y.view()).unwrap();
  let expected = normal_log_prob(1.0, 0.5, 1.3) + normal_log_prob(-2.0, 2.0, 0.0);
  assert!((lp - expected).abs() < 1e-12);
}

#[test]
fn logsumexp_is_stable() {
  use nd::arr1;

  let v = arr1(&[1000.0, 1000.0]);
  assert!((logsumexp(v.view()) - (1000.0 + 2.0f64.ln())).abs() < 1e-9);
  let empty = arr1(&[]);
  assert_eq!(logsumexp(empty.view()), ::std::f64::NEG_INFINITY);
}
