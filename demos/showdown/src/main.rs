extern crate clap;
extern crate common;
extern crate tracing;
extern crate util;

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use common::*;
use util::{init_logger, Reporting, ShowdownConfig};

#[derive(Parser)]
#[command(name = "showdown")]
#[command(about = "Runs every configured agent on a drifting sine regression stream")]
struct Args {
  /// Path to the agent configuration file
  #[arg(short, long, default_value = "demos/showdown/configs/sine.toml")]
  config: PathBuf,

  /// Override the data seed from the config
  #[arg(long)]
  seed: Option<u64>,

  /// Override the number of training steps from the config
  #[arg(long)]
  steps: Option<usize>,

  /// Enable debug logging
  #[arg(short, long)]
  verbose: bool,

  /// Directory to write the test RMSE plot into
  #[arg(long)]
  plot: Option<PathBuf>,
}

fn load(args: &Args) -> Result<ShowdownConfig, DemoError> {
  let mut config = ShowdownConfig::load(&args.config)?;
  if let Some(seed) = args.seed {
    config.seed = seed;
  }
  if let Some(steps) = args.steps {
    config.steps = steps;
  }
  config.validate()?;
  Ok(config)
}

fn run(args: &Args) -> Result<(), DemoError> {
  init_logger(args.verbose).map_err(|e| DemoError::Logger(e.to_string()))?;
  info!(config = %args.config.display(), "loading configuration");
  let config = load(args)?;

  let setup = SineSetup {
    steps: config.steps,
    test_size: config.test_size,
    noise_std: config.noise_std,
    seed: config.seed,
    ..Default::default()
  };
  let mut data: Dataset = setup.into();
  let norm = data.normalize_targets();
  let obs_var = (config.noise_std / norm.1).powi(2);
  let (model, initial_mean) = mlp_regression(data.input_dim(), &config.hidden, obs_var,
                                             config.seed)?;
  info!(steps = config.steps, n_params = initial_mean.len(), agents = config.agents.len(),
        "starting showdown");

  let mut reports = Vec::with_capacity(config.agents.len());
  for agent in config.agents.iter().reporting("agents", args.verbose) {
    match build_and_run(agent, &initial_mean, &model, obs_var, config.seed, &data, norm) {
      Ok(report) => reports.push(report),
      Err(DemoError::Rebayes(e)) => {
        warn!(agent = %agent.name(), "agent failed: {}", e);
      },
      Err(e) => return Err(e),
    }
  }

  print_reports(&reports);
  if let Some(ref dir) = args.plot {
    plot_reports(dir, "showdown.png", "Drifting sine regression", &reports)?;
  }
  Ok(())
}

fn main() {
  let args = Args::parse();
  if let Err(e) = run(&args) {
    error!("{}", e);
    eprintln!("showdown: {}", e);
    ::std::process::exit(1);
  }
}
