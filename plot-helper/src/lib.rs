extern crate gnuplot;
extern crate ndarray as nd;

use std::path::Path;

use gnuplot::{AxesCommon, Figure, PlotOption};
use nd::{ArrayView, Ix1};
use thiserror::Error;

const WIDTH: u32 = 1024;
const HEIGHT: u32 = 640;

#[derive(Debug, Error)]
pub enum PlotError {
  #[error("gnuplot failed to write {path}: {reason}")]
  Gnuplot { path: String, reason: String },
  #[error("series `{name}` has {got} points, expected {expected}")]
  Length { name: String, expected: usize, got: usize },
}

fn save(mut fig: Figure, path: &Path) -> Result<(), PlotError> {
  fig.save_to_png(path, WIDTH, HEIGHT)
    .map_err(|e| PlotError::Gnuplot {
      path: path.display().to_string(),
      reason: format!("{:?}", e),
    })?;
  tracing::info!(path = %path.display(), "wrote plot");
  Ok(())
}

/// One line per named series against the step index, e.g. running RMSE of
/// several agents.
pub fn plot_series(path: &Path, title: &str, ylabel: &str,
                   series: &[(&str, ArrayView<f64, Ix1>)])
  -> Result<(), PlotError>
{
  let mut fig = Figure::new();
  {
    let axes = fig.axes2d();
    axes.set_title(title, &[]);
    axes.set_x_label("step, t", &[]);
    axes.set_y_label(ylabel, &[]);
    for &(name, ref values) in series.iter() {
      axes.lines(0..values.len(), values.iter(), &[PlotOption::Caption(name)]);
    }
  }
  save(fig, path)
}

/// Scatter of the data with the fitted curves on top. Each fit is drawn in
/// the order given, so `x` should be sorted.
pub fn plot_fit(path: &Path, title: &str,
                data: (ArrayView<f64, Ix1>, ArrayView<f64, Ix1>),
                fits: &[(&str, ArrayView<f64, Ix1>, ArrayView<f64, Ix1>)])
  -> Result<(), PlotError>
{
  check_len("data", data.0.len(), data.1.len())?;
  for &(name, ref x, ref y) in fits.iter() {
    check_len(name, x.len(), y.len())?;
  }

  let mut fig = Figure::new();
  {
    let axes = fig.axes2d();
    axes.set_title(title, &[]);
    axes.set_x_label("x", &[]);
    axes.set_y_label("y", &[]);
    axes.points(data.0.iter(), data.1.iter(),
                &[PlotOption::Caption("observations"), PlotOption::PointSymbol('x')]);
    for &(name, ref x, ref y) in fits.iter() {
      axes.lines(x.iter(), y.iter(), &[PlotOption::Caption(name)]);
    }
  }
  save(fig, path)
}

fn check_len(name: &str, expected: usize, got: usize) -> Result<(), PlotError> {
  if expected != got {
    return Err(PlotError::Length { name: name.to_owned(), expected, got, });
  }
  Ok(())
}

#[test]
fn mismatched_fit_is_rejected_before_plotting() {
  let x = nd::arr1(&[0.0, 1.0, 2.0]);
  let y = nd::arr1(&[0.0, 1.0]);
  let err = plot_fit(Path::new("unused.png"), "t", (x.view(), x.view()),
                     &[("bad", x.view(), y.view())])
    .unwrap_err();
  match err {
    PlotError::Length { expected: 3, got: 2, .. } => {}
    e => panic!("unexpected error {}", e),
  }
}
