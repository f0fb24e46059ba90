use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder, Retryable};
use tracing::warn;

use crate::bus::BusError;
use crate::config::RetrySettings;
use crate::observability::metrics::Metrics;
use crate::store::{StoreError, Versioned};

pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Transient for BusError {
    fn is_transient(&self) -> bool {
        BusError::is_transient(self)
    }
}

#[derive(Clone)]
pub struct RetryPolicy {
    settings: RetrySettings,
    metrics: Metrics,
}

impl RetryPolicy {
    pub fn new(settings: RetrySettings, metrics: Metrics) -> Self {
        Self { settings, metrics }
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.settings.min_delay)
            .with_max_delay(self.settings.max_delay)
            .with_max_times(self.settings.max_times)
            .with_jitter()
    }

    fn record_retry(&self, operation: &'static str, error: &dyn Display, delay: Duration) {
        self.metrics
            .collaborator_retries_total
            .with_label_values(&[operation])
            .inc();
        warn!(
            operation,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );
    }

    pub async fn transient<T, E, F, Fut>(&self, operation: &'static str, op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        op.retry(self.backoff())
            .when(|err: &E| err.is_transient())
            .notify(|err: &E, delay: Duration| self.record_retry(operation, err, delay))
            .await
    }

    pub async fn commit_conditional<T, U, UFut, L, LFut>(
        &self,
        operation: &'static str,
        updated: &T,
        expected: u64,
        mut update: U,
        mut load: L,
    ) -> Result<(), StoreError>
    where
        T: Versioned + PartialEq,
        U: FnMut() -> UFut,
        UFut: Future<Output = Result<(), StoreError>>,
        L: FnMut() -> LFut,
        LFut: Future<Output = Result<Option<T>, StoreError>>,
    {
        let mut backoff = self.backoff().build();

        loop {
            let err = match update().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };

            let stored = self.transient(operation, &mut load).await?;
            match stored {
                None => return Err(StoreError::NotFound(format!("aggregate {}", updated.id()))),
                Some(current) if current == *updated => return Ok(()),
                Some(current) if current.version() == expected => {
                    let Some(delay) = backoff.next() else {
                        return Err(err);
                    };
                    self.record_retry(operation, &err, delay);
                    tokio::time::sleep(delay).await;
                }
                Some(current) => {
                    return Err(StoreError::VersionConflict {
                        id: updated.id(),
                        expected,
                        found: current.version(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use std::sync::Mutex;

    use uuid::Uuid;

    use super::RetryPolicy;
    use crate::config::RetrySettings;
    use crate::observability::metrics::Metrics;
    use crate::store::{StoreError, Versioned};

    #[derive(Debug, Clone, PartialEq)]
    struct Doc {
        id: Uuid,
        version: u64,
        body: &'static str,
    }

    impl Versioned for Doc {
        fn id(&self) -> Uuid {
            self.id
        }

        fn version(&self) -> u64 {
            self.version
        }
    }

    fn doc(version: u64, body: &'static str) -> Doc {
        Doc {
            id: Uuid::from_u128(1),
            version,
            body,
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Unavailable("connection reset".to_string())
    }

    fn policy(max_times: usize) -> RetryPolicy {
        RetryPolicy::new(
            RetrySettings {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_times,
            },
            Metrics::new(),
        )
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<u32, StoreError> = policy(4)
            .transient("load", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Unavailable("timeout".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = policy(4)
            .transient("load", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::NotFound("booking request".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let result: Result<(), StoreError> = policy(2)
            .transient("load", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".to_string()))
            })
            .await;

        assert_eq!(result, Err(StoreError::Unavailable("down".to_string())));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn ambiguous_write_that_landed_counts_as_committed() {
        let stored = Mutex::new(doc(1, "pending"));
        let next = doc(2, "accepted");
        let counter = AtomicUsize::new(0);
        let (store, calls, target) = (&stored, &counter, &next);

        let result = policy(4)
            .commit_conditional(
                "update",
                &next,
                1,
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    *store.lock().unwrap() = target.clone();
                    Err(unavailable())
                },
                move || async move { Ok(Some(store.lock().unwrap().clone())) },
            )
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*stored.lock().unwrap(), next);
    }

    #[tokio::test]
    async fn ambiguous_write_is_not_reissued_after_another_writer() {
        let stored = Mutex::new(doc(1, "pending"));
        let next = doc(2, "accepted by A");
        let counter = AtomicUsize::new(0);
        let (store, calls) = (&stored, &counter);

        let result = policy(4)
            .commit_conditional(
                "update",
                &next,
                1,
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // our write is lost, a competing one lands
                    *store.lock().unwrap() = doc(2, "accepted by B");
                    Err(unavailable())
                },
                move || async move { Ok(Some(store.lock().unwrap().clone())) },
            )
            .await;

        assert_eq!(
            result,
            Err(StoreError::VersionConflict {
                id: Uuid::from_u128(1),
                expected: 1,
                found: 2,
            })
        );
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(stored.lock().unwrap().body, "accepted by B");
    }

    #[tokio::test]
    async fn lost_write_is_reissued_while_version_is_unchanged() {
        let stored = Mutex::new(doc(1, "pending"));
        let next = doc(2, "accepted");
        let counter = AtomicUsize::new(0);
        let (store, calls, target) = (&stored, &counter, &next);

        let result = policy(4)
            .commit_conditional(
                "update",
                &next,
                1,
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(unavailable());
                    }
                    *store.lock().unwrap() = target.clone();
                    Ok(())
                },
                move || async move { Ok(Some(store.lock().unwrap().clone())) },
            )
            .await;

        assert_eq!(result, Ok(()));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(*stored.lock().unwrap(), next);
    }

    #[tokio::test]
    async fn permanent_write_failure_skips_the_reread() {
        let loads = AtomicUsize::new(0);
        let reads = &loads;
        let next = doc(2, "accepted");

        let result = policy(4)
            .commit_conditional(
                "update",
                &next,
                1,
                || async { Err(StoreError::NotFound("doc".to_string())) },
                move || async move {
                    reads.fetch_add(1, Ordering::SeqCst);
                    Ok(None::<Doc>)
                },
            )
            .await;

        assert_eq!(result, Err(StoreError::NotFound("doc".to_string())));
        assert_eq!(loads.load(Ordering::SeqCst), 0);
    }
}
