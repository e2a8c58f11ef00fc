//! TOML description of an online-learning comparison: the data to generate
//! and the agents to run on it.
//!
//! ```toml
//! seed = 3
//! steps = 500
//!
//! [[agents]]
//! method = "lofi"
//! name = "lofi-10"
//! memory_size = 10
//! inflation = "hybrid"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("cannot read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("malformed configuration: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("invalid `{field}`: {reason}")]
  Invalid {
    field: String,
    reason: String,
  },
}

impl ConfigError {
  fn invalid<F, R>(field: F, reason: R) -> ConfigError
    where F: Into<String>,
          R: Into<String>,
  {
    ConfigError::Invalid {
      field: field.into(),
      reason: reason.into(),
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EkfVariant {
  Fcekf,
  Vdekf,
  Fdekf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LofiVariant {
  Spherical,
  Diagonal,
  Orthogonal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InflationKind {
  Bayesian,
  Simple,
  Hybrid,
}

fn default_ekf() -> EkfVariant { EkfVariant::Fcekf }
fn default_lofi() -> LofiVariant { LofiVariant::Spherical }
fn default_inflation() -> InflationKind { InflationKind::Bayesian }
fn default_one() -> usize { 1 }
fn default_unit() -> f64 { 1.0 }
fn default_inner() -> usize { 3 }
fn default_samples() -> usize { 6 }
fn default_eps() -> f64 { 1e-2 }

/// Settings every agent shares; flattened into each agent table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prior {
  #[serde(default = "default_unit")]
  pub initial_covariance: f64,
  #[serde(default = "default_unit")]
  pub dynamics_weights: f64,
  #[serde(default)]
  pub dynamics_covariance: f64,
  #[serde(default)]
  pub adaptive_emission_cov: bool,
  #[serde(default)]
  pub inflation_factor: f64,
}

impl Default for Prior {
  fn default() -> Prior {
    Prior {
      initial_covariance: 1.0,
      dynamics_weights: 1.0,
      dynamics_covariance: 0.0,
      adaptive_emission_cov: false,
      inflation_factor: 0.0,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "kebab-case")]
pub enum AgentConfig {
  Ekf {
    name: Option<String>,
    #[serde(default = "default_ekf")]
    variant: EkfVariant,
    #[serde(default = "default_one")]
    num_iter: usize,
    #[serde(flatten)]
    prior: Prior,
  },
  Lofi {
    name: Option<String>,
    memory_size: usize,
    #[serde(default = "default_lofi")]
    variant: LofiVariant,
    #[serde(default = "default_inflation")]
    inflation: InflationKind,
    #[serde(default)]
    steady_state: bool,
    #[serde(flatten)]
    prior: Prior,
  },
  ReplayLofi {
    name: Option<String>,
    memory_size: usize,
    buffer_size: usize,
    #[serde(default = "default_one")]
    n_inner: usize,
    #[serde(default = "default_inflation")]
    inflation: InflationKind,
    #[serde(flatten)]
    prior: Prior,
  },
  Orfit {
    name: Option<String>,
    memory_size: usize,
    #[serde(default)]
    sv_threshold: f64,
    #[serde(flatten)]
    prior: Prior,
  },
  Lrvga {
    name: Option<String>,
    dim_latent: usize,
    #[serde(default = "default_unit")]
    sigma2_init: f64,
    #[serde(default = "default_eps")]
    eps: f64,
    #[serde(default = "default_inner")]
    n_inner: usize,
    #[serde(default = "default_inner")]
    n_inner_fa: usize,
    #[serde(default = "default_samples")]
    n_samples: usize,
    #[serde(default = "default_unit")]
    alpha: f64,
    #[serde(default = "default_unit")]
    beta: f64,
  },
}

impl AgentConfig {
  pub fn method(&self) -> &'static str {
    match self {
      AgentConfig::Ekf { .. } => "ekf",
      AgentConfig::Lofi { .. } => "lofi",
      AgentConfig::ReplayLofi { .. } => "replay-lofi",
      AgentConfig::Orfit { .. } => "orfit",
      AgentConfig::Lrvga { .. } => "lrvga",
    }
  }

  /// The configured name, else the method name.
  pub fn name(&self) -> String {
    let name = match self {
      AgentConfig::Ekf { name, .. } |
      AgentConfig::Lofi { name, .. } |
      AgentConfig::ReplayLofi { name, .. } |
      AgentConfig::Orfit { name, .. } |
      AgentConfig::Lrvga { name, .. } => name,
    };
    name.clone().unwrap_or_else(|| self.method().to_string())
  }

  pub fn prior(&self) -> Option<&Prior> {
    match self {
      AgentConfig::Ekf { prior, .. } |
      AgentConfig::Lofi { prior, .. } |
      AgentConfig::ReplayLofi { prior, .. } |
      AgentConfig::Orfit { prior, .. } => Some(prior),
      AgentConfig::Lrvga { .. } => None,
    }
  }

  fn validate(&self, idx: usize) -> Result<(), ConfigError> {
    let field = |f: &str| format!("agents[{}].{}", idx, f);
    let positive = |f: &str, n: usize| {
      if n == 0 {
        Err(ConfigError::invalid(field(f), "must be at least 1"))
      } else {
        Ok(())
      }
    };

    if let Some(prior) = self.prior() {
      if !(prior.initial_covariance > 0.0) {
        return Err(ConfigError::invalid(field("initial_covariance"),
                                        format!("must be positive, got {}",
                                                prior.initial_covariance)));
      }
      if !(prior.dynamics_covariance >= 0.0) {
        return Err(ConfigError::invalid(field("dynamics_covariance"), "must be non-negative"));
      }
      if !(prior.inflation_factor >= 0.0) {
        return Err(ConfigError::invalid(field("inflation_factor"), "must be non-negative"));
      }
    }

    match self {
      AgentConfig::Ekf { num_iter, .. } => positive("num_iter", *num_iter),
      AgentConfig::Lofi { memory_size, .. } |
      AgentConfig::Orfit { memory_size, .. } => positive("memory_size", *memory_size),
      AgentConfig::ReplayLofi { memory_size, buffer_size, n_inner, .. } => {
        positive("memory_size", *memory_size)?;
        positive("buffer_size", *buffer_size)?;
        positive("n_inner", *n_inner)
      },
      AgentConfig::Lrvga { dim_latent, n_inner, n_inner_fa, n_samples, sigma2_init, eps, .. } => {
        positive("dim_latent", *dim_latent)?;
        positive("n_inner", *n_inner)?;
        positive("n_inner_fa", *n_inner_fa)?;
        positive("n_samples", *n_samples)?;
        if !(*sigma2_init > 0.0) {
          return Err(ConfigError::invalid(field("sigma2_init"), "must be positive"));
        }
        if !(*eps > 0.0 && *eps < 1.0) {
          return Err(ConfigError::invalid(field("eps"), "must lie in (0, 1)"));
        }
        Ok(())
      },
    }
  }
}

fn default_seed() -> u64 { 0 }
fn default_steps() -> usize { 500 }
fn default_noise_std() -> f64 { 0.1 }
fn default_hidden() -> Vec<usize> { vec![20] }
fn default_test_size() -> usize { 200 }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShowdownConfig {
  #[serde(default = "default_seed")]
  pub seed: u64,
  #[serde(default = "default_steps")]
  pub steps: usize,
  #[serde(default = "default_noise_std")]
  pub noise_std: f64,
  /// Hidden layer widths of the regression MLP.
  #[serde(default = "default_hidden")]
  pub hidden: Vec<usize>,
  #[serde(default = "default_test_size")]
  pub test_size: usize,
  pub agents: Vec<AgentConfig>,
}

impl ShowdownConfig {
  pub fn load<P>(path: P) -> Result<ShowdownConfig, ConfigError>
    where P: AsRef<Path>,
  {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(path = %path.display(), "loading configuration");
    ShowdownConfig::from_toml_str(&content)
  }

  /// Parses and validates.
  pub fn from_toml_str(content: &str) -> Result<ShowdownConfig, ConfigError> {
    let config: ShowdownConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.agents.is_empty() {
      return Err(ConfigError::invalid("agents", "at least one agent is required"));
    }
    if self.steps == 0 {
      return Err(ConfigError::invalid("steps", "must be at least 1"));
    }
    if self.test_size == 0 {
      return Err(ConfigError::invalid("test_size", "must be at least 1"));
    }
    if !(self.noise_std > 0.0) {
      return Err(ConfigError::invalid("noise_std",
                                      format!("must be positive, got {}", self.noise_std)));
    }
    if self.hidden.iter().any(|&h| h == 0) {
      return Err(ConfigError::invalid("hidden", "layer widths must be at least 1"));
    }
    for (i, agent) in self.agents.iter().enumerate() {
      agent.validate(i)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use std::io::Write;
  use tempfile::NamedTempFile;

  const SAMPLE: &str = r#"
seed = 7
steps = 100
hidden = [10, 10]

[[agents]]
method = "ekf"
variant = "fdekf"
initial_covariance = 0.5

[[agents]]
method = "lofi"
name = "lofi-5"
memory_size = 5
variant = "orthogonal"
inflation = "hybrid"
dynamics_weights = 0.999

[[agents]]
method = "replay-lofi"
memory_size = 5
buffer_size = 4

[[agents]]
method = "orfit"
memory_size = 8

[[agents]]
method = "lrvga"
dim_latent = 3
"#;

  #[test]
  fn parses_every_method() {
    let config = ShowdownConfig::from_toml_str(SAMPLE).unwrap();
    assert_eq!(config.seed, 7);
    assert_eq!(config.test_size, 200);
    assert_eq!(config.hidden, vec![10, 10]);
    let methods = config.agents.iter().map(|a| a.method()).collect::<Vec<_>>();
    assert_eq!(methods, vec!["ekf", "lofi", "replay-lofi", "orfit", "lrvga"]);

    match &config.agents[0] {
      AgentConfig::Ekf { variant, num_iter, prior, .. } => {
        assert_eq!(*variant, EkfVariant::Fdekf);
        assert_eq!(*num_iter, 1);
        assert_eq!(prior.initial_covariance, 0.5);
      },
      other => panic!("unexpected agent {:?}", other),
    }
    match &config.agents[1] {
      AgentConfig::Lofi { inflation, prior, variant, .. } => {
        assert_eq!(*inflation, InflationKind::Hybrid);
        assert_eq!(*variant, LofiVariant::Orthogonal);
        assert_eq!(prior.dynamics_weights, 0.999);
      },
      other => panic!("unexpected agent {:?}", other),
    }
    assert_eq!(config.agents[1].name(), "lofi-5");
    assert_eq!(config.agents[2].name(), "replay-lofi");
  }

  #[test]
  fn rejects_bad_configurations() {
    assert!(ShowdownConfig::from_toml_str("agents = []").is_err());

    let unknown = "[[agents]]\nmethod = \"lofi\"\nmemory_size = 2\ninflation = \"wild\"\n";
    assert!(matches!(ShowdownConfig::from_toml_str(unknown), Err(ConfigError::Parse(_))));

    let method = "[[agents]]\nmethod = \"ukf\"\n";
    assert!(matches!(ShowdownConfig::from_toml_str(method), Err(ConfigError::Parse(_))));

    let memory = "[[agents]]\nmethod = \"orfit\"\nmemory_size = 0\n";
    match ShowdownConfig::from_toml_str(memory) {
      Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "agents[0].memory_size"),
      other => panic!("expected a validation error, got {:?}", other),
    }

    let cov = "[[agents]]\nmethod = \"ekf\"\ninitial_covariance = -1.0\n";
    assert!(ShowdownConfig::from_toml_str(cov).is_err());
  }

  #[test]
  fn loads_from_disk() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(SAMPLE.as_bytes()).unwrap();
    let config = ShowdownConfig::load(file.path()).unwrap();
    assert_eq!(config.agents.len(), 5);

    let missing = file.path().with_extension("missing");
    assert!(matches!(ShowdownConfig::load(&missing), Err(ConfigError::Io { .. })));
  }
}
