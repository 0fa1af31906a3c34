//! Bounded concurrent execution of one task's file jobs.
//!
//! Keeps at most `concurrency` jobs in flight; when one finishes, the next
//! item is started until the iterator is drained. The first job error stops
//! new starts, the remaining in-flight jobs are drained with their errors
//! swallowed, and the first error is re-raised. Stop signals pass through
//! unchanged so the scheduler can tell a pause/cancel from a failure.

use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use std::future::Future;

use crate::stop::StopToken;

/// Ceiling on per-task file concurrency regardless of policy.
pub const MAX_FILE_CONCURRENCY: usize = 16;

/// Run `f` over `items` with at most `concurrency` invocations in flight.
///
/// Jobs start in iteration order; completion order is unspecified. The stop
/// token is polled before each start and after each completion. `on_error`
/// fires once, before the drain, so the caller can tear down shared
/// resources and unblock siblings.
pub async fn for_each_concurrent<T, F, Fut>(
    items: impl IntoIterator<Item = T>,
    concurrency: usize,
    stop: &StopToken,
    on_error: impl FnOnce(),
    mut f: F,
) -> Result<()>
where
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let concurrency = concurrency.clamp(1, MAX_FILE_CONCURRENCY);
    let mut items = items.into_iter();
    let mut in_flight = FuturesUnordered::new();
    let mut first_err: Option<anyhow::Error> = None;
    let mut on_error = Some(on_error);

    loop {
        while first_err.is_none() && in_flight.len() < concurrency {
            stop.check()?;
            match items.next() {
                Some(item) => in_flight.push(f(item)),
                None => break,
            }
        }
        let Some(result) = in_flight.next().await else {
            break;
        };
        match result {
            Ok(()) => {
                if first_err.is_none() {
                    stop.check()?;
                }
            }
            Err(e) => {
                if first_err.is_none() {
                    if let Some(hook) = on_error.take() {
                        hook();
                    }
                    first_err = Some(e);
                }
                // Later errors are side effects of the first; swallow them.
            }
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
