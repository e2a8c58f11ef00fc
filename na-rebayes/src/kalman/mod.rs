
pub use self::ekf::{Covariance, EkfBel, EkfMethod, RebayesEkf};
pub use self::kf::{LinearGaussianSsm, PosteriorFiltered};

pub mod ekf;
pub mod kf;
