// Coalesced refresh: one in-flight fetch per cache, late callers share its outcome

use std::future::Future;

use parking_lot::Mutex;
use tokio::sync::watch;

use vesta_common::VestaError;

type Outcome = Option<Result<(), VestaError>>;

/// Single-flight guard for a cache refresh
#[derive(Default)]
pub(crate) struct SingleFlight {
    in_flight: Mutex<Option<watch::Receiver<Outcome>>>,
}

/// Clears the in-flight slot when the leader finishes or is cancelled
struct SlotGuard<'a> {
    flight: &'a SingleFlight,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        *self.flight.in_flight.lock() = None;
    }
}

enum Role {
    Leader(watch::Sender<Outcome>),
    Follower(watch::Receiver<Outcome>),
}

impl SingleFlight {
    /// Run `fetch` unless a run is already in flight, in which case wait for
    /// that run instead. Returns the outcome and whether it was shared.
    pub(crate) async fn run<F, Fut>(&self, fetch: F) -> (Result<(), VestaError>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), VestaError>>,
    {
        let mut fetch = Some(fetch);
        loop {
            let role = {
                let mut slot = self.in_flight.lock();
                match slot.as_ref() {
                    Some(rx) => Role::Follower(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        *slot = Some(rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let Some(fetch) = fetch.take() else {
                        return (
                            Err(VestaError::Internal("refresh already consumed".to_string())),
                            false,
                        );
                    };
                    let guard = SlotGuard { flight: self };
                    let result = fetch().await;
                    drop(guard);
                    let _ = tx.send(Some(result.clone()));
                    return (result, false);
                }
                Role::Follower(mut rx) => {
                    let outcome = match rx.wait_for(Option::is_some).await {
                        Ok(outcome) => outcome.clone(),
                        // leader was cancelled before finishing; try again
                        Err(_) => continue,
                    };
                    match outcome {
                        Some(result) => return (result, true),
                        None => continue,
                    }
                }
            }
        }
    }

    /// Like `run`, but a caller that only shared a fetch already in flight runs
    /// one more, so every commit finished before the call is observed
    pub(crate) async fn run_latest<F, Fut>(&self, fetch: F) -> Result<(), VestaError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), VestaError>>,
    {
        let (result, shared) = self.run(&fetch).await;
        if shared {
            self.run(&fetch).await.0
        } else {
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_fetch() {
        let flight = Arc::new(SingleFlight::default());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let flight = flight.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                flight
                    .run(|| async {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            }));
        }

        let mut shared = 0;
        for handle in handles {
            let (result, was_shared) = handle.await.unwrap();
            assert!(result.is_ok());
            if was_shared {
                shared += 1;
            }
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(shared, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_followers_see_leader_error() {
        let flight = Arc::new(SingleFlight::default());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(|| async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Err(VestaError::Persistence("disk full".to_string()))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let (result, shared) = flight.run(|| async { Ok(()) }).await;
        assert!(shared);
        assert!(matches!(result, Err(VestaError::Persistence(_))));
        assert!(leader.await.unwrap().0.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_latest_refetches_after_sharing() {
        let flight = Arc::new(SingleFlight::default());
        let fetches = Arc::new(AtomicUsize::new(0));

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(|| async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let counted = fetches.clone();
        flight
            .run_latest(|| {
                let counted = counted.clone();
                async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await
            .unwrap();
        assert!(!leader.await.unwrap().1);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slot_released_after_run() {
        let flight = SingleFlight::default();
        let (result, shared) = flight
            .run(|| async { Err(VestaError::StoreLayer("boom".to_string())) })
            .await;
        assert!(!shared);
        assert!(result.is_err());

        // a later run starts a fresh fetch
        let (result, shared) = flight.run(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert!(!shared);
    }
}
