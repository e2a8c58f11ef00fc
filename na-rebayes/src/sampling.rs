//! Draws from Gaussians with diagonal-plus-low-rank precision, without
//! forming the dense covariance.

use nd::{Array, ArrayBase, Axis, Data, Ix1, Ix2};
use nd::parallel::prelude::*;
use nla::inv_spd;

use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use rand_isaac::Isaac64Rng;

use crate::utils::{div_rows, Diagonal};
use crate::Result;

/// `n x D` draws from `N(0, (diag(d) + W W^T)^{-1})`.
///
/// Each draw `s = x - L W^T x + L e` with `x ~ N(0, diag(d)^{-1})`,
/// `e ~ N(0, I_L)` and `L = diag(d)^{-1} W (I + W^T diag(d)^{-1} W)^{-1}`.
/// Draws are generated in parallel, each from its own seed taken from
/// `rng`, so the result only depends on `rng`'s state.
pub fn sample_dlr<R, S>(rng: &mut R, w: &ArrayBase<S, Ix2>, d: &Diagonal<f64>, n: usize)
  -> Result<Array<f64, Ix2>>
  where R: Rng + ?Sized,
        S: Data<Elem = f64>,
{
  let (dim, rank) = w.dim();
  let wd = div_rows(w, d);
  let m = Array::<f64, Ix2>::eye(rank) + w.t().dot(&wd);
  let l = wd.dot(&inv_spd(&m)?);
  let scale = d.to_vec(dim).mapv(|v| 1.0 / v.sqrt());
  let wt = w.t().to_owned();

  let seeds: Vec<u64> = (0..n).map(|_| rng.gen()).collect();
  let mut out: Array<f64, Ix2> = Array::zeros((n, dim));
  out.axis_iter_mut(Axis(0))
    .into_par_iter()
    .zip(seeds.par_iter())
    .for_each(|(mut row, &seed)| {
      let mut rng = Isaac64Rng::seed_from_u64(seed);
      let x = scale.mapv(|s| {
        let z: f64 = StandardNormal.sample(&mut rng);
        s * z
      });
      let eps = (0..rank)
        .map(|_| -> f64 { StandardNormal.sample(&mut rng) })
        .collect::<Array<f64, Ix1>>();
      let s = &x - &l.dot(&(wt.dot(&x) - &eps));
      row.assign(&s);
    });

  Ok(out)
}

/// `n x D` draws from `N(mean, (diag(d) + W W^T)^{-1})`.
pub fn sample_gaussian_dlr<R, S1, S2>(rng: &mut R, mean: &ArrayBase<S1, Ix1>,
                                      w: &ArrayBase<S2, Ix2>, d: &Diagonal<f64>,
                                      n: usize)
  -> Result<Array<f64, Ix2>>
  where R: Rng + ?Sized,
        S1: Data<Elem = f64>,
        S2: Data<Elem = f64>,
{
  Ok(sample_dlr(rng, w, d, n)? + mean)
}
