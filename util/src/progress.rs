use std::borrow::Cow;
use std::io::Stdout;
use std::iter::ExactSizeIterator;
use std::time::Duration;

use pbr::ProgressBar;

/// Wraps an iterator with a terminal progress bar that finishes with a
/// "done" line once the inner iterator is exhausted. With `quiet` the bar
/// is never drawn.
pub struct ReportingIterator<I>
  where I: ExactSizeIterator,
{
  name: Cow<'static, str>,
  progress: Option<ProgressBar<Stdout>>,
  inner: I,
}
impl<I> ReportingIterator<I>
  where I: ExactSizeIterator,
{
  pub fn new(inner: I, name: Cow<'static, str>, quiet: bool) -> ReportingIterator<I> {
    let progress = if quiet {
      None
    } else {
      let mut p = ProgressBar::new(inner.len() as u64);
      p.show_speed = true;
      p.show_percent = true;
      p.show_counter = true;
      p.show_time_left = true;
      p.set_max_refresh_rate(Some(Duration::from_millis(100)));
      p.message(&format!("{}: ", name));
      Some(p)
    };

    ReportingIterator { name, progress, inner, }
  }
}

impl<I> Iterator for ReportingIterator<I>
  where I: ExactSizeIterator,
{
  type Item = I::Item;
  fn next(&mut self) -> Option<Self::Item> {
    let next = self.inner.next();
    if let Some(ref mut p) = self.progress {
      match next {
        Some(_) => { p.inc(); },
        None => {
          p.finish_println(&format!("{} done!\n", self.name));
        },
      }
    }
    if next.is_none() {
      self.progress = None;
    }
    next
  }

  fn size_hint(&self) -> (usize, Option<usize>) { self.inner.size_hint() }
}

impl<I> ExactSizeIterator for ReportingIterator<I>
  where I: ExactSizeIterator,
{ }

pub trait Reporting: ExactSizeIterator + Sized {
  fn reporting<N>(self, name: N, quiet: bool) -> ReportingIterator<Self>
    where N: Into<Cow<'static, str>>,
  {
    ReportingIterator::new(self, name.into(), quiet)
  }
}
impl<I> Reporting for I
  where I: ExactSizeIterator,
{ }

#[test]
fn quiet_iteration_passes_items_through() {
  let items = (0..5).reporting("count", true).collect::<Vec<_>>();
  assert_eq!(items, vec![0, 1, 2, 3, 4]);
  assert_eq!((0..7).reporting("len", true).len(), 7);
}
