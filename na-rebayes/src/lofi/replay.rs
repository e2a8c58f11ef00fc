//! Diagonal LoFi with a replay buffer: each new observation rewinds the
//! belief to before the oldest buffered observation and refits the whole
//! buffer, linearising the emission once at the current mean.

use std::collections::VecDeque;

use nd::{Array, ArrayView, Ix1, Ix2};
use tracing::trace;

use na_core::EmissionModel;

use crate::lofi::{LofiBel, LofiMethod, LofiParams, RebayesLofi};
use crate::{Belief, Error, Rebayes, RebayesParams, Result};

#[derive(Clone, Debug)]
pub struct ReplayLofiParams {
  pub lofi: LofiParams,
  pub buffer_size: usize,
  /// Passes over the buffer per observation.
  pub n_inner: usize,
}

impl ReplayLofiParams {
  pub fn validate(&self) -> Result<()> {
    self.lofi.validate()?;
    if self.buffer_size == 0 {
      return Err(Error::invalid("buffer_size", "must be at least 1"));
    }
    if self.n_inner == 0 {
      return Err(Error::invalid("n_inner", "must be at least 1"));
    }
    Ok(())
  }
}

#[derive(Clone, Debug)]
pub struct ReplayLofiBel {
  pub lofi: LofiBel,
  /// Where the emission was linearised for the last refit.
  pub mean_lin: Array<f64, Ix1>,
  /// The last `buffer_size` `(x, y)` pairs, oldest first.
  pub buffer: VecDeque<(Array<f64, Ix1>, Array<f64, Ix1>)>,
  /// `snapshots[i]` is the belief before `buffer[i]` was seen.
  pub snapshots: VecDeque<LofiBel>,
}

impl Belief for ReplayLofiBel {
  fn mean(&self) -> ArrayView<f64, Ix1> { self.lofi.mean.view() }
}

pub struct RebayesReplayLofi<M> {
  inner: RebayesLofi<M>,
  pub replay: ReplayLofiParams,
}

impl<M> RebayesReplayLofi<M>
  where M: EmissionModel,
{
  pub fn new(params: RebayesParams<M>, replay: ReplayLofiParams)
    -> Result<RebayesReplayLofi<M>>
  {
    replay.validate()?;
    let inner = RebayesLofi::new(params, replay.lofi.clone(), LofiMethod::Diagonal)?;
    Ok(RebayesReplayLofi { inner, replay, })
  }

  pub fn params(&self) -> &RebayesParams<M> { &self.inner.params }

  /// Refits the whole buffer starting from `start`, linearised at
  /// `mean_lin`. Every pass counts observations on from the current `nobs`
  /// rather than the snapshot's; overall the count advances by one.
  fn refit(&self, start: &LofiBel, mean_lin: &Array<f64, Ix1>, nobs: usize,
           buffer: &VecDeque<(Array<f64, Ix1>, Array<f64, Ix1>)>) -> Result<LofiBel>
  {
    let mut bel = start.clone();
    bel.nobs = nobs;
    for pass in 0..self.replay.n_inner {
      for (x, y) in buffer.iter() {
        let pred = self.inner.predict_state(&bel)?;
        bel = self.inner.condition(&pred, Some(mean_lin), x.view(), y.view())?;
      }
      bel.nobs = nobs;
      trace!(pass, len = buffer.len(), "replayed buffer");
    }
    if self.inner.params.adaptive_emission_cov {
      bel.nobs = nobs + 1;
    }
    Ok(bel)
  }
}

impl<M> Rebayes for RebayesReplayLofi<M>
  where M: EmissionModel,
{
  type Bel = ReplayLofiBel;

  fn init_bel(&self) -> Result<ReplayLofiBel> {
    let lofi = self.inner.init_bel()?;
    let mut snapshots = VecDeque::with_capacity(self.replay.buffer_size + 1);
    snapshots.push_back(lofi.clone());
    Ok(ReplayLofiBel {
      mean_lin: lofi.mean.clone(),
      lofi,
      buffer: VecDeque::with_capacity(self.replay.buffer_size + 1),
      snapshots,
    })
  }

  fn predict_state(&self, bel: &ReplayLofiBel) -> Result<ReplayLofiBel> {
    Ok(ReplayLofiBel {
      lofi: self.inner.predict_state(&bel.lofi)?,
      mean_lin: bel.mean_lin.clone(),
      buffer: bel.buffer.clone(),
      snapshots: bel.snapshots.clone(),
    })
  }

  fn predict_obs(&self, bel: &ReplayLofiBel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix1>>
  {
    self.inner.predict_obs(&bel.lofi, x)
  }

  fn predict_obs_cov(&self, bel: &ReplayLofiBel, x: ArrayView<f64, Ix1>)
    -> Result<Array<f64, Ix2>>
  {
    self.inner.predict_obs_cov(&bel.lofi, x)
  }

  fn update_state(&self, bel: &ReplayLofiBel, x: ArrayView<f64, Ix1>, y: ArrayView<f64, Ix1>)
    -> Result<ReplayLofiBel>
  {
    let mut buffer = bel.buffer.clone();
    let mut snapshots = bel.snapshots.clone();
    buffer.push_back((x.to_owned(), y.to_owned()));
    if buffer.len() > self.replay.buffer_size {
      buffer.pop_front();
      snapshots.pop_front();
    }

    let mean_lin = bel.lofi.mean.clone();
    let lofi = if buffer.len() < self.replay.buffer_size {
      self.inner.condition(&bel.lofi, Some(&mean_lin), x, y)?
    } else {
      let start = snapshots.front()
        .ok_or_else(|| Error::invalid("snapshots", "replay buffer lost its starting belief"))?;
      self.refit(start, &mean_lin, bel.lofi.nobs, &buffer)?
    };
    snapshots.push_back(lofi.clone());

    Ok(ReplayLofiBel { lofi, mean_lin, buffer, snapshots, })
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::test_util::*;
  use crate::utils::{make_2d_randn, Diagonal, PartialEqWithinTol};
  use na_core::{Activation, Mlp, MlpRegression};
  use nd::Axis;
  use rand::SeedableRng;
  use rand_isaac::Isaac64Rng;

  fn replay_params(buffer_size: usize, n_inner: usize) -> ReplayLofiParams {
    ReplayLofiParams {
      lofi: LofiParams::new(2),
      buffer_size,
      n_inner,
    }
  }

  #[test]
  fn single_pass_replay_of_a_linear_model_is_plain_lofi() {
    let (xs, ys) = linreg_data();
    let mut params = linreg_params();
    params.dynamics_weights = 0.99;
    params.dynamics_covariance = 1e-3;
    let lofi = RebayesLofi::new(params.clone(), LofiParams::new(2), LofiMethod::Diagonal)
      .unwrap();
    let replay = RebayesReplayLofi::new(params, replay_params(3, 1)).unwrap();

    let (plain, _) = lofi.scan(xs.view(), ys.view(), None, |s| Ok(s.bel.mean.clone()))
      .unwrap();
    let (replayed, means) = replay.scan(xs.view(), ys.view(), None, |s| {
      Ok(s.bel.lofi.mean.clone())
    }).unwrap();
    assert!(replayed.lofi.mean.partial_eq_within_tol(&plain.mean, 1e-6));
    assert_eq!(replayed.buffer.len(), 3);
    assert_eq!(replayed.snapshots.len(), 4);
    assert_eq!(means.len(), xs.dim().0);
  }

  #[test]
  fn unit_buffer_matches_plain_lofi_on_an_mlp() {
    let mut rng = Isaac64Rng::seed_from_u64(2);
    let mlp = Mlp::new(vec![2, 3, 1], Activation::Tanh).unwrap();
    let theta0 = mlp.init_params(&mut rng).unwrap();
    let params = RebayesParams::new(theta0, MlpRegression { mlp, obs_var: 0.2, });
    let xs = make_2d_randn((15, 2), Diagonal::Single(1.0), &mut rng);
    let ys = xs.map_axis(Axis(1), |x| x[0] * x[1]).insert_axis(Axis(1));

    let lofi = RebayesLofi::new(params.clone(), LofiParams::new(2), LofiMethod::Diagonal)
      .unwrap();
    let replay = RebayesReplayLofi::new(params, replay_params(1, 1)).unwrap();
    let (a, _) = lofi.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    let (b, _) = replay.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert!(b.lofi.mean.partial_eq_within_tol(&a.mean, 1e-9));
  }

  #[test]
  fn repeated_replay_counts_each_observation_once() {
    let (xs, ys) = linreg_data();
    let mut params = linreg_params();
    params.adaptive_emission_cov = true;
    let replay = RebayesReplayLofi::new(params, replay_params(4, 3)).unwrap();
    let (bel, _) = replay.scan(xs.view(), ys.view(), None, |_| Ok(())).unwrap();
    assert_eq!(bel.lofi.nobs, xs.dim().0);
    assert!(bel.lofi.mean.iter().all(|v| v.is_finite()));

    assert!(RebayesReplayLofi::new(linreg_params(), replay_params(0, 1)).is_err());
    assert!(RebayesReplayLofi::new(linreg_params(), replay_params(2, 0)).is_err());
  }

  #[test]
  fn replayed_noise_estimate_continues_the_running_mean() {
    let (xs, ys) = linreg_data();
    let mut params = linreg_params();
    params.adaptive_emission_cov = true;
    let replay = RebayesReplayLofi::new(params, replay_params(2, 1)).unwrap();

    let bel0 = replay.init_bel().unwrap();
    let pred0 = replay.predict_state(&bel0).unwrap();
    let bel1 = replay.update_state(&pred0, xs.row(5), ys.row(5)).unwrap();
    assert_eq!(bel1.lofi.nobs, 1);
    let pred1 = replay.predict_state(&bel1).unwrap();
    let bel2 = replay.update_state(&pred1, xs.row(6), ys.row(6)).unwrap();

    // the buffer is replayed from the prior, counting on from one observation
    let mean_lin = pred1.lofi.mean.clone();
    let mut b = bel0.lofi.clone();
    let mut r = b.obs_noise_var;
    for (n, t) in [5usize, 6].iter().enumerate() {
      let pred = replay.inner.predict_state(&b).unwrap();
      b = replay.inner.condition(&pred, Some(&mean_lin), xs.row(*t), ys.row(*t)).unwrap();
      let yhat = replay.params().emission.mean(b.mean.view(), xs.row(*t)).unwrap();
      let sqerr = (yhat[0] - ys[[*t, 0]]).powi(2);
      r += (sqerr - r) / (n + 2) as f64;
    }
    assert!((bel2.lofi.obs_noise_var - r).abs() < 1e-12 * r.max(1.0));
    assert_eq!(bel2.lofi.nobs, 2);
  }
}
