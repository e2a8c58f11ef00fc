
use nla::FactorizeError;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error(transparent)]
  Factorize(#[from] FactorizeError),
  #[error("shape error: {0}")]
  Shape(#[from] nd::ShapeError),
  #[error("{what}: expected dimension {expected}, got {actual}")]
  Dimension {
    what: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("invalid parameter `{name}`: {reason}")]
  InvalidParameter {
    name: &'static str,
    reason: String,
  },
  #[error("non-finite value in {what}")]
  NonFinite { what: &'static str },
}

impl Error {
  pub fn invalid<T>(name: &'static str, reason: T) -> Error
    where T: Into<String>,
  {
    Error::InvalidParameter {
      name,
      reason: reason.into(),
    }
  }
}

pub fn check_dim(what: &'static str, expected: usize, actual: usize) -> Result<()> {
  if expected != actual {
    return Err(Error::Dimension { what, expected, actual, });
  }
  Ok(())
}
