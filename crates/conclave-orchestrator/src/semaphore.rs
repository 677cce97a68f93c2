//! Counting semaphore with a strictly FIFO wait queue
//!
//! Unlike `tokio::sync::Semaphore` this one can be reset and reports how many
//! callers are queued, which the review loop admission control relies on.
//!
//! A permit returned by [`Semaphore::release`] goes straight to the oldest
//! waiter; `available` only grows when nobody is waiting.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Point-in-time view of a semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphoreState {
    pub available: usize,
    pub max_permits: usize,
    pub queued: usize,
}

struct Inner {
    available: usize,
    max_permits: usize,
    waiters: VecDeque<oneshot::Sender<()>>,
}

impl Inner {
    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|tx| !tx.is_closed()).count()
    }
}

pub struct Semaphore {
    inner: Mutex<Inner>,
}

impl Semaphore {
    pub fn new(max_permits: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                available: max_permits,
                max_permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Wait for a permit
    ///
    /// The caller owns the permit until it calls [`Self::release`]. Dropping
    /// the future before it completes gives up its place in the queue.
    pub async fn acquire(&self) {
        let rx = {
            let mut inner = self.lock();
            if inner.available > 0 && inner.waiters.is_empty() {
                inner.available -= 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(tx);
            rx
        };

        let mut pending = PendingAcquire {
            rx: Some(rx),
            semaphore: self,
        };
        if let Some(rx) = pending.rx.as_mut() {
            // A closed sender means the queue was dropped by reset
            let _ = rx.await;
        }
        pending.rx = None;
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        if inner.available > 0 && inner.live_waiters() == 0 {
            inner.available -= 1;
            true
        } else {
            false
        }
    }

    /// Return a permit, handing it to the oldest live waiter if there is one
    pub fn release(&self) {
        let mut inner = self.lock();
        while let Some(tx) = inner.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
        if inner.available < inner.max_permits {
            inner.available += 1;
        } else {
            debug!("Semaphore release ignored: all {} permits free", inner.max_permits);
        }
    }

    /// Run `f` while holding a permit
    ///
    /// The permit is released however `f` finishes, and its output is
    /// returned unchanged.
    pub async fn execute<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        let _permit = HeldPermit { semaphore: self };
        f().await
    }

    /// Force every permit free and wake every waiter
    ///
    /// Work that already holds a permit keeps running; its later release is
    /// absorbed once all permits are free.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let woken = inner.waiters.len();
        for tx in inner.waiters.drain(..) {
            let _ = tx.send(());
        }
        inner.available = inner.max_permits;
        if woken > 0 {
            warn!("Semaphore reset released {} queued waiters", woken);
        }
    }

    pub fn state(&self) -> SemaphoreState {
        let inner = self.lock();
        SemaphoreState {
            available: inner.available,
            max_permits: inner.max_permits,
            queued: inner.live_waiters(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Queue slot of a suspended `acquire`
///
/// If the future is dropped after a permit was handed to it but before it
/// observed the grant, the permit is passed on.
struct PendingAcquire<'a> {
    rx: Option<oneshot::Receiver<()>>,
    semaphore: &'a Semaphore,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                self.semaphore.release();
            }
        }
    }
}

struct HeldPermit<'a> {
    semaphore: &'a Semaphore,
}

impl Drop for HeldPermit<'_> {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::ConclaveError;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    async fn wait_for_queued(semaphore: &Semaphore, queued: usize) {
        while semaphore.state().queued < queued {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_exhausted_semaphore_refuses_try_acquire() {
        let semaphore = Semaphore::new(3);
        for _ in 0..3 {
            semaphore.acquire().await;
        }

        assert_eq!(semaphore.state().available, 0);
        assert!(!semaphore.try_acquire());
        assert_eq!(semaphore.state().available, 0);

        semaphore.release();
        assert!(semaphore.try_acquire());
    }

    #[tokio::test]
    async fn test_waiters_granted_in_arrival_order() {
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.acquire().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        for n in 1..=3 {
            let sem = semaphore.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                sem.acquire().await;
                let _ = tx.send(n);
            });
            wait_for_queued(&semaphore, n).await;
        }
        assert_eq!(semaphore.state().queued, 3);

        for expected in 1..=3 {
            semaphore.release();
            assert_eq!(rx.recv().await, Some(expected));
            // Hand-off keeps the permit count unchanged
            assert_eq!(semaphore.state().available, 0);
        }

        semaphore.release();
        assert_eq!(
            semaphore.state(),
            SemaphoreState {
                available: 1,
                max_permits: 1,
                queued: 0
            }
        );
    }

    #[tokio::test]
    async fn test_try_acquire_does_not_jump_the_queue() {
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.acquire().await;

        let sem = semaphore.clone();
        let waiter = tokio::spawn(async move { sem.acquire().await });
        wait_for_queued(&semaphore, 1).await;

        semaphore.release();
        assert!(!semaphore.try_acquire());
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_releases_on_error() {
        let semaphore = Semaphore::new(2);

        let result: Result<(), ConclaveError> = semaphore
            .execute(|| async { Err(ConclaveError::Execution("boom".into())) })
            .await;

        assert!(matches!(result, Err(ConclaveError::Execution(ref m)) if m == "boom"));
        assert_eq!(semaphore.state().available, 2);

        let value = semaphore.execute(|| async { 42 }).await;
        assert_eq!(value, 42);
        assert_eq!(semaphore.state().available, 2);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.acquire().await;

        let sem = semaphore.clone();
        let waiter = tokio::spawn(async move { sem.acquire().await });
        wait_for_queued(&semaphore, 1).await;

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(semaphore.state().queued, 0);

        semaphore.release();
        assert_eq!(semaphore.state().available, 1);
    }

    #[tokio::test]
    async fn test_reset_wakes_waiters() {
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.acquire().await;

        let mut handles = Vec::new();
        for n in 1..=2 {
            let sem = semaphore.clone();
            handles.push(tokio::spawn(async move { sem.acquire().await }));
            wait_for_queued(&semaphore, n).await;
        }

        semaphore.reset();
        for handle in handles {
            handle.await.unwrap();
        }

        let state = semaphore.state();
        assert_eq!(state.available, 1);
        assert_eq!(state.queued, 0);

        // Late release from the pre-reset holder is absorbed
        semaphore.release();
        assert_eq!(semaphore.state().available, 1);
    }
}
