extern crate ndarray as nd;
extern crate pbr;
extern crate rand;
extern crate rand_distr;
extern crate rand_isaac;
extern crate serde;
extern crate thiserror;
extern crate toml;
extern crate tracing;
extern crate tracing_subscriber;

use nd::{Array, ArrayView, Axis, Ix1, Ix2};

pub use config::{AgentConfig, ConfigError, ShowdownConfig};
pub use data::Dataset;
pub use logger::init_logger;
pub use progress::{Reporting, ReportingIterator};

pub mod config;
pub mod data;
pub mod logger;
pub mod progress;

/// Per-step record of a run: the filtered mean, the one-step-ahead
/// prediction and a scalar metric.
#[derive(Clone, Debug)]
pub struct StateSteps {
  pub means: Array<f64, Ix2>,
  pub predictions: Array<f64, Ix2>,
  pub metric: Array<f64, Ix1>,
}
impl StateSteps {
  pub fn new(steps: usize, state_dim: usize, obs_dim: usize) -> StateSteps {
    StateSteps {
      means: Array::zeros((steps, state_dim)),
      predictions: Array::zeros((steps, obs_dim)),
      metric: Array::from_elem(steps, ::std::f64::NAN),
    }
  }

  pub fn steps(&self) -> usize { self.metric.len() }

  pub fn store_state(&mut self, step: usize, mean: ArrayView<f64, Ix1>,
                     prediction: ArrayView<f64, Ix1>, metric: f64) {
    self.means.index_axis_mut(Axis(0), step).assign(&mean);
    self.predictions.index_axis_mut(Axis(0), step).assign(&prediction);
    self.metric[step] = metric;
  }

  /// Mean of the metric over the last `n` steps (or all of them).
  pub fn trailing_metric(&self, n: usize) -> f64 {
    let len = self.steps();
    let n = n.min(len);
    if n == 0 {
      return ::std::f64::NAN;
    }
    self.metric.slice(nd::s![len - n..]).sum() / n as f64
  }
}

#[test]
fn state_steps_records_rows() {
  let mut states = StateSteps::new(3, 2, 1);
  for t in 0..3 {
    let mean = nd::arr1(&[t as f64, -(t as f64)]);
    let pred = nd::arr1(&[0.5 * t as f64]);
    states.store_state(t, mean.view(), pred.view(), t as f64);
  }
  assert_eq!(states.means.row(2).to_vec(), vec![2.0, -2.0]);
  assert_eq!(states.predictions[[1, 0]], 0.5);
  assert_eq!(states.trailing_metric(2), 1.5);
  assert_eq!(states.trailing_metric(10), 1.0);
}
