extern crate ndarray as nd;
extern crate na_core;
extern crate na_rebayes;
extern crate plot_helper;
extern crate rand;
extern crate rand_isaac;
extern crate thiserror;
extern crate tracing;
extern crate util;

use std::path::Path;
use std::time::{Duration, Instant};

use nd::{Array, Ix1};
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use thiserror::Error;
use tracing::{debug, info};

use na_core::{Activation, EmissionModel, Mlp, MlpRegression};
use na_rebayes::callbacks::RegressionEval;
use na_rebayes::kalman::{EkfMethod, RebayesEkf};
use na_rebayes::lofi::{Inflation, LofiMethod, LofiParams, RebayesLofi, RebayesReplayLofi,
                       ReplayLofiParams};
use na_rebayes::lrvga::{LrvgaParams, RebayesLrvga};
use na_rebayes::orfit::{OrfitParams, RebayesOrfit};
use na_rebayes::{Belief, Rebayes, RebayesParams};
use plot_helper::PlotError;
use util::config::{AgentConfig, ConfigError, EkfVariant, InflationKind, LofiVariant, Prior};

pub use util::data::{BlobsSetup, LinregSetup, SineSetup};
pub use util::{Dataset, StateSteps};

#[derive(Debug, Error)]
pub enum DemoError {
  #[error(transparent)]
  Rebayes(#[from] na_core::Error),
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error(transparent)]
  Plot(#[from] PlotError),
  #[error("logging setup failed: {0}")]
  Logger(String),
}

pub fn ekf_method(variant: EkfVariant) -> EkfMethod {
  match variant {
    EkfVariant::Fcekf => EkfMethod::Fcekf,
    EkfVariant::Vdekf => EkfMethod::Vdekf,
    EkfVariant::Fdekf => EkfMethod::Fdekf,
  }
}

pub fn lofi_method(variant: LofiVariant) -> LofiMethod {
  match variant {
    LofiVariant::Spherical => LofiMethod::Spherical,
    LofiVariant::Diagonal => LofiMethod::Diagonal,
    LofiVariant::Orthogonal => LofiMethod::Orthogonal,
  }
}

pub fn inflation(kind: InflationKind) -> Inflation {
  match kind {
    InflationKind::Bayesian => Inflation::Bayesian,
    InflationKind::Simple => Inflation::Simple,
    InflationKind::Hybrid => Inflation::Hybrid,
  }
}

pub fn rebayes_params<M>(prior: &Prior, initial_mean: Array<f64, Ix1>, emission: M)
  -> RebayesParams<M>
  where M: EmissionModel,
{
  let mut params = RebayesParams::new(initial_mean, emission);
  params.initial_covariance = prior.initial_covariance;
  params.dynamics_weights = prior.dynamics_weights;
  params.dynamics_covariance = prior.dynamics_covariance;
  params.adaptive_emission_cov = prior.adaptive_emission_cov;
  params.dynamics_covariance_inflation_factor = prior.inflation_factor;
  params
}

/// `[input, hidden.., 1]` ReLU network with LeCun-normal weights drawn from
/// `seed`. Returns the model and its initial parameters.
pub fn mlp_regression(input_dim: usize, hidden: &[usize], obs_var: f64, seed: u64)
  -> Result<(MlpRegression, Array<f64, Ix1>), DemoError>
{
  let mut dims = Vec::with_capacity(hidden.len() + 2);
  dims.push(input_dim);
  dims.extend_from_slice(hidden);
  dims.push(1);
  let mlp = Mlp::new(dims, Activation::Relu)?;
  let mut rng = Isaac64Rng::seed_from_u64(seed);
  let params = mlp.init_params(&mut rng)?;
  debug!(n_params = params.len(), "initialised mlp");
  Ok((MlpRegression { mlp, obs_var, }, params))
}

/// One agent's run over the training stream.
#[derive(Clone, Debug)]
pub struct AgentReport {
  pub name: String,
  pub method: &'static str,
  /// Per step: filtered mean, one-step-ahead prediction and test RMSE.
  pub history: StateSteps,
  /// RMSE of the one-step-ahead predictions over the whole stream.
  pub osa_rmse: f64,
  pub final_test_rmse: f64,
  pub elapsed: Duration,
}

/// Scans the training rows of `data` with `agent`, scoring the predictive
/// belief on the test set after every step. `norm` is the `(ymean, ystd)`
/// the targets were standardised with.
pub fn run_agent<R, M>(name: &str, method: &'static str, agent: &R, emission: &M,
                       data: &Dataset, norm: (f64, f64))
  -> Result<AgentReport, DemoError>
  where R: Rebayes,
        M: EmissionModel,
{
  let eval = RegressionEval::new(emission, data.x_test.view(), data.y_test.view())?
    .with_normalization(norm.0, norm.1);

  let start = Instant::now();
  let bel = agent.init_bel()?;
  let mut history = StateSteps::new(data.x_train.dim().0, bel.mean().len(),
                                    data.output_dim());
  let (_, metrics) = agent.scan(data.x_train.view(), data.y_train.view(), Some(bel), |step| {
    let m = eval.evaluate(&step)?;
    history.store_state(step.t, step.bel.mean(), step.pred_obs.view(), m.test);
    Ok(m)
  })?;
  let elapsed = start.elapsed();

  let osa_rmse = if metrics.is_empty() {
    ::std::f64::NAN
  } else {
    (metrics.iter().map(|m| m.osa * m.osa).sum::<f64>() / metrics.len() as f64).sqrt()
  };
  let final_test_rmse = metrics.last().map(|m| m.test).unwrap_or(::std::f64::NAN);
  info!(agent = name, osa_rmse, final_test_rmse, secs = elapsed.as_secs_f64(), "agent done");

  Ok(AgentReport {
    name: name.to_owned(),
    method,
    history,
    osa_rmse,
    final_test_rmse,
    elapsed,
  })
}

/// Builds the agent `config` describes around `emission`, starting every
/// estimator from `initial_mean`, and runs it on `data`.
pub fn build_and_run<M>(config: &AgentConfig, initial_mean: &Array<f64, Ix1>, emission: &M,
                        obs_var: f64, seed: u64, data: &Dataset, norm: (f64, f64))
  -> Result<AgentReport, DemoError>
  where M: EmissionModel + Clone,
{
  let name = config.name();
  let method = config.method();
  let params = |prior: &Prior| rebayes_params(prior, initial_mean.clone(), emission.clone());

  match config {
    AgentConfig::Ekf { variant, num_iter, prior, .. } => {
      let agent = RebayesEkf::new(params(prior), ekf_method(*variant))?
        .with_num_iter(*num_iter)?;
      run_agent(&name, method, &agent, emission, data, norm)
    },
    AgentConfig::Lofi { memory_size, variant, inflation: kind, steady_state, prior, .. } => {
      let mut lofi = LofiParams::new(*memory_size);
      lofi.inflation = inflation(*kind);
      lofi.steady_state = *steady_state;
      lofi.seed = seed;
      let agent = RebayesLofi::new(params(prior), lofi, lofi_method(*variant))?;
      run_agent(&name, method, &agent, emission, data, norm)
    },
    AgentConfig::ReplayLofi { memory_size, buffer_size, n_inner, inflation: kind, prior, .. } => {
      let mut lofi = LofiParams::new(*memory_size);
      lofi.inflation = inflation(*kind);
      lofi.seed = seed;
      let replay = ReplayLofiParams {
        lofi,
        buffer_size: *buffer_size,
        n_inner: *n_inner,
      };
      let agent = RebayesReplayLofi::new(params(prior), replay)?;
      run_agent(&name, method, &agent, emission, data, norm)
    },
    AgentConfig::Orfit { memory_size, sv_threshold, prior, .. } => {
      let mut orfit = OrfitParams::new(*memory_size);
      orfit.sv_threshold = *sv_threshold;
      let agent = RebayesOrfit::new(params(prior), orfit)?;
      run_agent(&name, method, &agent, emission, data, norm)
    },
    AgentConfig::Lrvga { dim_latent, sigma2_init, eps, n_inner, n_inner_fa, n_samples,
                         alpha, beta, .. } => {
      let mut lrvga = LrvgaParams::new(*dim_latent);
      lrvga.sigma2_init = *sigma2_init;
      lrvga.eps = *eps;
      lrvga.n_inner = *n_inner;
      lrvga.n_inner_fa = *n_inner_fa;
      lrvga.n_samples = *n_samples;
      lrvga.alpha = *alpha;
      lrvga.beta = *beta;
      lrvga.obs_std = obs_var.sqrt();
      lrvga.seed = seed;
      let agent = RebayesLrvga::new(initial_mean.clone(), emission.clone(), lrvga)?;
      run_agent(&name, method, &agent, emission, data, norm)
    },
  }
}

pub fn print_reports(reports: &[AgentReport]) {
  println!("{:<20} {:<12} {:>10} {:>10} {:>10}",
           "agent", "method", "osa rmse", "test rmse", "seconds");
  for r in reports.iter() {
    println!("{:<20} {:<12} {:>10.4} {:>10.4} {:>10.3}",
             r.name, r.method, r.osa_rmse, r.final_test_rmse, r.elapsed.as_secs_f64());
  }
}

/// Test RMSE against step for every agent, written to `dir/file`.
pub fn plot_reports(dir: &Path, file: &str, title: &str, reports: &[AgentReport])
  -> Result<(), DemoError>
{
  let series = reports.iter()
    .map(|r| (&r.name[..], r.history.metric.view()))
    .collect::<Vec<_>>();
  plot_helper::plot_series(&dir.join(file), title, "test rmse", &series)?;
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use na_core::LinearRegression;
  use util::ShowdownConfig;

  const AGENTS: &str = r#"
[[agents]]
method = "ekf"

[[agents]]
method = "lofi"
memory_size = 2
variant = "diagonal"

[[agents]]
method = "replay-lofi"
memory_size = 2
buffer_size = 3

[[agents]]
method = "orfit"
memory_size = 2

[[agents]]
method = "lrvga"
dim_latent = 2
"#;

  #[test]
  fn every_configured_agent_runs() {
    let config = ShowdownConfig::from_toml_str(AGENTS).unwrap();
    let setup = LinregSetup { steps: 30, test_size: 10, ..Default::default() };
    let mut data: Dataset = setup.into();
    let norm = data.normalize_targets();
    let model = LinearRegression { input_dim: setup.input_dim, obs_var: 0.1, };
    let mean = Array::zeros(model.state_dim());

    for agent in config.agents.iter() {
      let report = build_and_run(agent, &mean, &model, model.obs_var, 0, &data, norm).unwrap();
      assert_eq!(report.history.steps(), 30);
      assert_eq!(report.method, agent.method());
      assert!(report.osa_rmse.is_finite(), "{} diverged", report.name);
      assert!(report.final_test_rmse.is_finite(), "{} diverged", report.name);
    }
  }

  #[test]
  fn mlp_shapes() {
    let (model, params) = mlp_regression(1, &[4, 3], 0.1, 5).unwrap();
    assert_eq!(model.mlp.input_dim(), 1);
    assert_eq!(model.mlp.output_dim(), 1);
    assert_eq!(params.len(), model.mlp.n_params());
    let (_, again) = mlp_regression(1, &[4, 3], 0.1, 5).unwrap();
    assert_eq!(params, again);
  }
}
