use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use tokio::time::Instant;

/// A predicate evaluated before every loop iteration. The loop ends as soon as any of
/// its conditions returns `false`.
///
/// Conditions are shared: handing the same [`max_executions`] condition to several
/// loops limits their combined number of iterations.
pub type Condition = Arc<dyn Fn() -> bool + Send + Sync>;

/// True until `limit` has elapsed since the condition was created.
pub fn time_limit(limit: Duration) -> Condition {
    let start = Instant::now();
    Arc::new(move || start.elapsed() < limit)
}

/// True for the first `times` evaluations, false afterwards.
pub fn max_executions(times: u64) -> Condition {
    let counter = AtomicU64::new(0);
    Arc::new(move || counter.fetch_add(1, Ordering::Relaxed) < times)
}

/// Wrap any closure as a [`Condition`].
pub fn condition<F>(f: F) -> Condition
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}
