//! Per-user session lock.
//!
//! Many exchanges for *different* users may be in flight at once, but
//! exchanges for the *same* user are strictly serialized: at most one live
//! [`SessionHandle`] exists per user at any time.
//!
//! The handle wraps an owned tokio mutex guard, so the lock is released when
//! the handle is dropped -- including when the task holding it panics or is
//! aborted.  [`SessionHandle::release`] exists for call sites that want to
//! release explicitly before the handle goes out of scope; calling it twice
//! is a logged no-op.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Identifies one end user of the assistant.
pub type UserId = i64;

/// Proof that the caller holds the session lock for one user.
///
/// Dropping the handle releases the lock.
#[derive(Debug)]
pub struct SessionHandle {
    user_id: UserId,
    lock_token: u64,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SessionHandle {
    /// The user this handle serializes.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Monotonic token identifying this acquisition, for log correlation.
    pub fn lock_token(&self) -> u64 {
        self.lock_token
    }

    /// Release the lock now instead of waiting for drop.
    ///
    /// Idempotent-safe: a second release is a no-op.
    pub fn release(&mut self) {
        match self.guard.take() {
            Some(guard) => {
                drop(guard);
                tracing::debug!(
                    user_id = self.user_id,
                    lock_token = self.lock_token,
                    "session lock released"
                );
            }
            None => {
                tracing::debug!(
                    user_id = self.user_id,
                    lock_token = self.lock_token,
                    "session lock already released; ignoring"
                );
            }
        }
    }
}

/// Per-user mutual-exclusion gate.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across tasks.
#[derive(Debug, Clone, Default)]
pub struct SessionLock {
    inner: Arc<SessionLockInner>,
}

#[derive(Debug, Default)]
struct SessionLockInner {
    /// One mutex per user, created lazily on first acquire.
    locks: DashMap<UserId, Arc<Mutex<()>>>,

    /// Source of lock tokens for log correlation.
    next_token: AtomicU64,
}

impl SessionLock {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling task until no other task holds the lock for
    /// `user_id`, then return a handle proving exclusive access.
    pub async fn acquire(&self, user_id: UserId) -> SessionHandle {
        let mutex = self
            .inner
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.lock_owned().await;
        let lock_token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(user_id, lock_token, "session lock acquired");

        SessionHandle {
            user_id,
            lock_token,
            guard: Some(guard),
        }
    }

    /// Attempt to acquire without waiting.  Returns `None` if another task
    /// holds the lock for this user.
    pub fn try_acquire(&self, user_id: UserId) -> Option<SessionHandle> {
        let mutex = self
            .inner
            .locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = mutex.try_lock_owned().ok()?;
        let lock_token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(user_id, lock_token, "session lock acquired (try)");

        Some(SessionHandle {
            user_id,
            lock_token,
            guard: Some(guard),
        })
    }

    /// Whether the lock for `user_id` is currently held by someone.
    pub fn is_held(&self, user_id: UserId) -> bool {
        self.inner
            .locks
            .get(&user_id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_same_user() {
        let lock = SessionLock::new();

        let handle = lock.acquire(7).await;
        assert!(lock.is_held(7));
        assert!(lock.try_acquire(7).is_none());

        drop(handle);
        assert!(!lock.is_held(7));
        assert!(lock.try_acquire(7).is_some());
    }

    #[tokio::test]
    async fn different_users_do_not_contend() {
        let lock = SessionLock::new();

        let _a = lock.acquire(1).await;
        let _b = lock.acquire(2).await;

        assert!(lock.is_held(1));
        assert!(lock.is_held(2));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let lock = SessionLock::new();

        let mut handle = lock.acquire(3).await;
        handle.release();
        assert!(!lock.is_held(3));

        // Second release must be a harmless no-op.
        handle.release();
        assert!(!lock.is_held(3));
    }

    #[tokio::test]
    async fn panic_in_holder_releases_lock() {
        let lock = SessionLock::new();

        let l = lock.clone();
        let task = tokio::spawn(async move {
            let _handle = l.acquire(9).await;
            panic!("exchange blew up");
        });
        assert!(task.await.is_err());

        // The panicked task's handle was dropped during unwind, so a new
        // acquire must succeed promptly.
        let acquired = tokio::time::timeout(Duration::from_secs(1), lock.acquire(9)).await;
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn at_most_one_live_handle_per_user() {
        let lock = SessionLock::new();
        let holders = Arc::new(AtomicU64::new(0));
        let max_seen = Arc::new(AtomicU64::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            let holders = Arc::clone(&holders);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                let _handle = lock.acquire(42).await;
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.expect("holder task should not panic");
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
