//! Staggered sample collection
//!
//! One sampling window is a batch of tasks scheduled at `i * interval` from
//! the window start. A single permit serializes them so no two samples ever
//! overlap, and the batch is joined before the caller continues.

use crate::error::CollectionError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error};

/// Number of samples that fit in `window` at `interval`, at least one
pub fn sample_count(window: Duration, interval: Duration) -> usize {
    if interval.is_zero() {
        return 1;
    }
    ((window.as_millis() / interval.as_millis()) as usize).max(1)
}

/// Run `samples` collections of `task`, staggered by `interval`.
///
/// `on_sample` sees each result as it completes. The first failure aborts
/// every outstanding task and is returned; otherwise results come back in
/// schedule order.
pub async fn run_staggered<T, F, Fut, S>(
    samples: usize,
    interval: Duration,
    task: F,
    mut on_sample: S,
) -> Result<Vec<T>, CollectionError>
where
    T: Send + 'static,
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T, CollectionError>> + Send + 'static,
    S: FnMut(usize, &T),
{
    let start = Instant::now();
    let worker = Arc::new(Semaphore::new(1));
    let mut tasks = JoinSet::new();

    for i in 0..samples {
        let at = start + interval * i as u32;
        let worker = worker.clone();
        let sample = task(i);
        tasks.spawn(async move {
            sleep_until(at).await;
            let _permit = worker
                .acquire_owned()
                .await
                .map_err(|e| CollectionError::Task(e.to_string()))?;
            sample.await.map(|value| (i, value))
        });
    }

    let mut results = Vec::with_capacity(samples);
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| CollectionError::Task(e.to_string()))
            .and_then(|r| r);

        match outcome {
            Ok((i, value)) => {
                debug!(sample = i, of = samples, "Collected sample");
                on_sample(i, &value);
                results.push((i, value));
            }
            Err(e) => {
                error!(error = %e, "Error from scheduled sample, aborting the round");
                tasks.abort_all();
                return Err(e);
            }
        }
    }

    results.sort_by_key(|(i, _)| *i);
    Ok(results.into_iter().map(|(_, value)| value).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_sample_count() {
        assert_eq!(sample_count(Duration::from_secs(300), Duration::from_secs(15)), 20);
        assert_eq!(sample_count(Duration::from_secs(1800), Duration::from_secs(15)), 120);
        assert_eq!(sample_count(Duration::from_secs(10), Duration::from_secs(15)), 1);
    }

    #[tokio::test]
    async fn test_results_in_schedule_order() {
        let mut seen = Vec::new();
        let results = run_staggered(
            5,
            Duration::from_millis(2),
            |i| async move { Ok(i * 10) },
            |i, _| seen.push(i),
        )
        .await
        .unwrap();

        assert_eq!(results, vec![0, 10, 20, 30, 40]);
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_samples_never_overlap() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = run_staggered(
            4,
            Duration::ZERO,
            |_| {
                let running = running.clone();
                let peak = peak.clone();
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(results.len(), 4);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_failure_aborts_round() {
        let completed = Arc::new(AtomicUsize::new(0));

        let result = run_staggered(
            10,
            Duration::from_millis(20),
            |i| {
                let completed = completed.clone();
                async move {
                    if i == 1 {
                        return Err(CollectionError::Source("bmc unreachable".into()));
                    }
                    completed.fetch_add(1, Ordering::SeqCst);
                    Ok(i)
                }
            },
            |_, _| {},
        )
        .await;

        assert!(matches!(result, Err(CollectionError::Source(_))));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(completed.load(Ordering::SeqCst) < 9);
    }
}
