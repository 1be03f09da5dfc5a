//! Small shared helpers.

use rayon::prelude::*;
use sframe_error::Result;

/// Run `f(i)` for `i in 0..n` across the worker pool, propagating the
/// first error.
///
/// This is the data-parallel fan-out primitive used for per-segment and
/// per-partition work. Blocking I/O inside `f` blocks that worker only.
pub fn parallel_for<F>(n: usize, f: F) -> Result<()>
where
    F: Fn(usize) -> Result<()> + Send + Sync,
{
    (0..n).into_par_iter().try_for_each(|i| f(i))
}

/// Like [`parallel_for`] but collects each task's output in index order.
pub fn parallel_map<T, F>(n: usize, f: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Send + Sync,
{
    (0..n).into_par_iter().map(|i| f(i)).collect()
}
