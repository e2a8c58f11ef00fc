extern crate clap;
extern crate common;
extern crate ndarray as nd;
extern crate na_core;
extern crate na_rebayes;
extern crate tracing;
extern crate util;

use std::path::PathBuf;

use clap::Parser;
use nd::{Array, Array3, Axis};
use tracing::{error, info};

use common::*;
use na_core::LinearRegression;
use na_rebayes::kalman::{LinearGaussianSsm, PosteriorFiltered};
use util::config::{AgentConfig, EkfVariant, InflationKind, LofiVariant, Prior};
use util::{init_logger, Reporting};

#[derive(Parser)]
#[command(name = "linreg")]
#[command(about = "Online Bayesian linear regression, checked against the exact Kalman filter")]
struct Args {
  #[arg(long, default_value_t = 0)]
  seed: u64,

  #[arg(long, default_value_t = 200)]
  steps: usize,

  #[arg(long, default_value_t = 2)]
  input_dim: usize,

  /// Enable debug logging
  #[arg(short, long)]
  verbose: bool,

  /// Directory to write the test RMSE plot into
  #[arg(long)]
  plot: Option<PathBuf>,
}

/// Exact filtering posterior of the same regression under the unit prior.
fn kalman_reference(data: &Dataset, model: &LinearRegression)
  -> Result<PosteriorFiltered, DemoError>
{
  let d = model.state_dim();
  let steps = data.x_train.dim().0;
  let design = Array3::from_shape_fn((steps, 1, d), |(t, _, j)| {
    if j == 0 { 1.0 } else { data.x_train[[t, j - 1]] }
  });
  let ssm = LinearGaussianSsm {
    initial_mean: Array::zeros(d),
    initial_covariance: Array::eye(d),
    dynamics_weights: Array::eye(d),
    dynamics_covariance: Array::zeros((d, d)),
    emission_covariance: Array::eye(1) * model.obs_var,
  };
  Ok(ssm.filter(design.view(), data.y_train.view())?)
}

fn agents(state_dim: usize) -> Vec<AgentConfig> {
  let ekf = |name: &str, variant: EkfVariant| AgentConfig::Ekf {
    name: Some(name.to_owned()),
    variant,
    num_iter: 1,
    prior: Prior::default(),
  };
  vec![
    ekf("fcekf", EkfVariant::Fcekf),
    ekf("fdekf", EkfVariant::Fdekf),
    ekf("vdekf", EkfVariant::Vdekf),
    AgentConfig::Lofi {
      name: Some("lofi".to_owned()),
      memory_size: state_dim,
      variant: LofiVariant::Spherical,
      inflation: InflationKind::Bayesian,
      steady_state: false,
      prior: Prior::default(),
    },
    AgentConfig::Orfit {
      name: Some("orfit".to_owned()),
      memory_size: state_dim,
      sv_threshold: 0.0,
      prior: Prior::default(),
    },
  ]
}

fn run(args: &Args) -> Result<(), DemoError> {
  init_logger(args.verbose).map_err(|e| DemoError::Logger(e.to_string()))?;

  let setup = LinregSetup {
    input_dim: args.input_dim,
    steps: args.steps,
    seed: args.seed,
    ..Default::default()
  };
  let data: Dataset = setup.into();
  let model = LinearRegression {
    input_dim: setup.input_dim,
    obs_var: setup.noise_std * setup.noise_std,
  };
  let initial_mean = Array::zeros(model.state_dim());
  let norm = (0.0, 1.0);

  let kf = kalman_reference(&data, &model)?;
  let kf_mean = kf.filtered_means.index_axis(Axis(0), setup.steps - 1);
  info!(marginal_loglik = kf.marginal_loglik, "kalman reference done");

  let mut reports = Vec::new();
  for agent in agents(model.state_dim()).iter().reporting("agents", args.verbose) {
    reports.push(build_and_run(agent, &initial_mean, &model, model.obs_var, args.seed,
                               &data, norm)?);
  }

  print_reports(&reports);
  println!();
  println!("{:<20} {:>14} {:>14}", "agent", "|m - m_kf|", "|m - truth|");
  for r in reports.iter() {
    let mean = r.history.means.index_axis(Axis(0), setup.steps - 1);
    let to_kf = (&mean - &kf_mean).mapv(|v| v * v).sum().sqrt();
    let to_truth = data.truth.as_ref()
      .map(|w| (&mean - w).mapv(|v| v * v).sum().sqrt())
      .unwrap_or(::std::f64::NAN);
    println!("{:<20} {:>14.3e} {:>14.3e}", r.name, to_kf, to_truth);
  }

  if let Some(ref dir) = args.plot {
    plot_reports(dir, "linreg.png", "Online linear regression", &reports)?;
  }
  Ok(())
}

fn main() {
  let args = Args::parse();
  if args.steps == 0 {
    eprintln!("linreg: --steps must be at least 1");
    ::std::process::exit(2);
  }
  if let Err(e) = run(&args) {
    error!("{}", e);
    eprintln!("linreg: {}", e);
    ::std::process::exit(1);
  }
}
