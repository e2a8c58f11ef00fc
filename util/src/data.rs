//! Synthetic streams for the demos. Each setup is plain data with sensible
//! defaults and turns into a `Dataset` deterministically from its seed.

use std::f64::consts::PI;

use nd::{Array, Axis, Ix1, Ix2};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal, Uniform};
use rand_isaac::Isaac64Rng;

/// Train rows arrive in order; test rows are indexed by the same clock.
#[derive(Clone, Debug)]
pub struct Dataset {
  pub x_train: Array<f64, Ix2>,
  pub y_train: Array<f64, Ix2>,
  pub x_test: Array<f64, Ix2>,
  pub y_test: Array<f64, Ix2>,
  /// Parameters that generated the data, when there are any.
  pub truth: Option<Array<f64, Ix1>>,
}

impl Dataset {
  pub fn input_dim(&self) -> usize { self.x_train.dim().1 }
  pub fn output_dim(&self) -> usize { self.y_train.dim().1 }

  /// Standardises the targets by the training mean and standard deviation
  /// and returns `(ymean, ystd)`.
  pub fn normalize_targets(&mut self) -> (f64, f64) {
    let n = self.y_train.len() as f64;
    let mean = self.y_train.sum() / n;
    let var = self.y_train.fold(0.0, |acc, &v| acc + (v - mean) * (v - mean)) / n;
    let std = if var > 0.0 { var.sqrt() } else { 1.0 };
    self.y_train.mapv_inplace(|v| (v - mean) / std);
    self.y_test.mapv_inplace(|v| (v - mean) / std);
    (mean, std)
  }
}

fn randn<R>(rng: &mut R, dim: (usize, usize)) -> Array<f64, Ix2>
  where R: Rng,
{
  Array::from_shape_simple_fn(dim, || StandardNormal.sample(&mut *rng))
}

/// `y = b + w.x + N(0, noise_std^2)` with `[b, w] ~ N(0, I)` and standard
/// normal inputs.
#[derive(Copy, Clone, Debug)]
pub struct LinregSetup {
  pub input_dim: usize,
  pub steps: usize,
  pub test_size: usize,
  pub noise_std: f64,
  pub seed: u64,
}
impl Default for LinregSetup {
  fn default() -> Self {
    LinregSetup {
      input_dim: 2,
      steps: 200,
      test_size: 100,
      noise_std: 0.3,
      seed: 0,
    }
  }
}

impl From<LinregSetup> for Dataset {
  fn from(setup: LinregSetup) -> Dataset {
    let mut rng = Isaac64Rng::seed_from_u64(setup.seed);
    let truth = randn(&mut rng, (setup.input_dim + 1, 1)).index_axis_move(Axis(1), 0);
    let mut make = |n: usize| {
      let x = randn(&mut rng, (n, setup.input_dim));
      let noise = randn(&mut rng, (n, 1)) * setup.noise_std;
      let y = x.dot(&truth.slice(nd::s![1..])) + truth[0];
      (x, y.insert_axis(Axis(1)) + noise)
    };
    let (x_train, y_train) = make(setup.steps);
    let (x_test, y_test) = make(setup.test_size);

    Dataset { x_train, y_train, x_test, y_test, truth: Some(truth), }
  }
}

/// `y = sin(x + phase(t)) + N(0, noise_std^2)`, `x ~ U(-3, 3)`, with the
/// phase drifting linearly to `drift` over the stream. Test row `i` sits at
/// train step `i * steps / test_size`.
#[derive(Copy, Clone, Debug)]
pub struct SineSetup {
  pub steps: usize,
  pub test_size: usize,
  pub noise_std: f64,
  pub drift: f64,
  pub seed: u64,
}
impl Default for SineSetup {
  fn default() -> Self {
    SineSetup {
      steps: 500,
      test_size: 200,
      noise_std: 0.1,
      drift: PI,
      seed: 0,
    }
  }
}

impl SineSetup {
  fn phase(&self, t: f64) -> f64 {
    self.drift * t / self.steps.max(1) as f64
  }
}

impl From<SineSetup> for Dataset {
  fn from(setup: SineSetup) -> Dataset {
    let mut rng = Isaac64Rng::seed_from_u64(setup.seed);
    let inputs = Uniform::new(-3.0, 3.0);

    let mut make = |n: usize, clock: f64| {
      let mut x = Array::zeros((n, 1));
      let mut y = Array::zeros((n, 1));
      for i in 0..n {
        let xi: f64 = inputs.sample(&mut rng);
        let z: f64 = StandardNormal.sample(&mut rng);
        x[[i, 0]] = xi;
        y[[i, 0]] = (xi + setup.phase(i as f64 * clock)).sin() + setup.noise_std * z;
      }
      (x, y)
    };
    let (x_train, y_train) = make(setup.steps, 1.0);
    let (x_test, y_test) = make(setup.test_size,
                                setup.steps as f64 / setup.test_size.max(1) as f64);

    Dataset { x_train, y_train, x_test, y_test, truth: None, }
  }
}

/// Two unit-variance blobs at `+/- separation / 2` on a line through the
/// origin that turns by `rotation` radians over the stream. Labels are
/// one-hot.
#[derive(Copy, Clone, Debug)]
pub struct BlobsSetup {
  pub steps: usize,
  pub test_size: usize,
  pub separation: f64,
  pub rotation: f64,
  pub seed: u64,
}
impl Default for BlobsSetup {
  fn default() -> Self {
    BlobsSetup {
      steps: 500,
      test_size: 200,
      separation: 4.0,
      rotation: PI / 2.0,
      seed: 0,
    }
  }
}

impl From<BlobsSetup> for Dataset {
  fn from(setup: BlobsSetup) -> Dataset {
    let mut rng = Isaac64Rng::seed_from_u64(setup.seed);
    let mut make = |n: usize, clock: f64| {
      let mut x = Array::zeros((n, 2));
      let mut y = Array::zeros((n, 2));
      for i in 0..n {
        let angle = setup.rotation * i as f64 * clock / setup.steps.max(1) as f64;
        let label = rng.gen_range(0..2usize);
        let sign = if label == 0 { -0.5 } else { 0.5 };
        let z0: f64 = StandardNormal.sample(&mut rng);
        let z1: f64 = StandardNormal.sample(&mut rng);
        x[[i, 0]] = sign * setup.separation * angle.cos() + z0;
        x[[i, 1]] = sign * setup.separation * angle.sin() + z1;
        y[[i, label]] = 1.0;
      }
      (x, y)
    };
    let (x_train, y_train) = make(setup.steps, 1.0);
    let (x_test, y_test) = make(setup.test_size,
                                setup.steps as f64 / setup.test_size.max(1) as f64);

    Dataset { x_train, y_train, x_test, y_test, truth: None, }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn linreg_is_reproducible() {
    let setup = LinregSetup { seed: 9, ..Default::default() };
    let a: Dataset = setup.into();
    let b: Dataset = setup.into();
    assert_eq!(a.x_train, b.x_train);
    assert_eq!(a.y_test, b.y_test);
    assert_eq!(a.x_train.dim(), (200, 2));
    assert_eq!(a.truth.as_ref().map(|t| t.len()), Some(3));
  }

  #[test]
  fn normalized_targets_are_standard() {
    let mut data: Dataset = SineSetup::default().into();
    let (mean, std) = data.normalize_targets();
    assert!(std > 0.0);
    assert!(mean.abs() < 1.0);
    let n = data.y_train.len() as f64;
    assert!((data.y_train.sum() / n).abs() < 1e-10);
    let var = data.y_train.fold(0.0, |acc, &v| acc + v * v) / n;
    assert!((var - 1.0).abs() < 1e-10);
  }

  #[test]
  fn blobs_are_one_hot() {
    let data: Dataset = BlobsSetup { steps: 50, test_size: 20, ..Default::default() }.into();
    assert_eq!(data.output_dim(), 2);
    for row in data.y_train.outer_iter() {
      assert_eq!(row.sum(), 1.0);
    }
    assert_eq!(data.x_test.dim(), (20, 2));
  }
}
