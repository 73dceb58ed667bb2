//! Reader/writer coordination between index queries and index rebuilds.
//!
//! One logical mutex plus a reader counter:
//! - a reader takes the mutex only long enough to bump the counter
//! - a writer takes the mutex and keeps it for the whole write session,
//!   waiting first for in-flight readers to drain
//!
//! While a writer waits for the drain the mutex is free, so readers that keep
//! arriving before the writer gets hold of it are still admitted. A writer can
//! be delayed indefinitely by a steady trickle of such readers. Once the writer
//! holds the mutex, every new reader and writer blocks behind it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct LockState {
    writer: bool,
    readers: usize,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<LockState>,
    changed: Condvar,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until `ready` holds, honoring `blocking` and the optional deadline.
    fn wait_until<'a>(
        &'a self,
        mut guard: MutexGuard<'a, LockState>,
        blocking: bool,
        deadline: Option<Instant>,
        ready: impl Fn(&LockState) -> bool,
    ) -> (MutexGuard<'a, LockState>, bool) {
        loop {
            if ready(&guard) {
                return (guard, true);
            }
            if !blocking {
                return (guard, false);
            }

            guard = match deadline {
                None => self
                    .changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return (guard, false);
                    }
                    self.changed
                        .wait_timeout(guard, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Shared handle to a single-writer/multi-reader lock.
///
/// Cloning is cheap and every clone refers to the same lock.
#[derive(Clone, Debug, Default)]
pub struct CoordinationLock {
    inner: Arc<Inner>,
}

/// How to acquire a [`CoordinationLock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOptions {
    pub exclusive: bool,
    pub blocking: bool,
    /// `None` waits forever. Ignored when `blocking` is false.
    pub timeout: Option<Duration>,
}

impl LockOptions {
    pub fn read(timeout: Option<Duration>) -> Self {
        Self {
            exclusive: false,
            blocking: true,
            timeout,
        }
    }

    pub fn write(timeout: Option<Duration>) -> Self {
        Self {
            exclusive: true,
            blocking: true,
            timeout,
        }
    }

    pub fn non_blocking(self) -> Self {
        Self {
            blocking: false,
            ..self
        }
    }
}

impl CoordinationLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reader. Returns `false` on contention when not blocking, or
    /// when the timeout elapses while a writer holds the lock.
    pub fn acquire_read(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let guard = self.inner.lock_state();
        let (mut guard, acquired) =
            self.inner
                .wait_until(guard, blocking, deadline, |state| !state.writer);

        if acquired {
            guard.readers += 1;
        }
        acquired
    }

    pub fn release_read(&self) {
        let mut guard = self.inner.lock_state();
        if guard.readers == 0 {
            log::warn!("release_read called without an active reader");
            return;
        }

        guard.readers -= 1;
        if guard.readers == 0 {
            self.inner.changed.notify_all();
        }
    }

    /// Take the lock exclusively. On success the caller holds it until
    /// [`release_write`](Self::release_write). The timeout covers both getting
    /// the mutex and waiting for active readers to finish.
    pub fn acquire_write(&self, blocking: bool, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let guard = self.inner.lock_state();
        let (mut guard, acquired) = self.inner.wait_until(guard, blocking, deadline, |state| {
            !state.writer && state.readers == 0
        });

        if acquired {
            guard.writer = true;
        }
        acquired
    }

    pub fn release_write(&self) {
        let mut guard = self.inner.lock_state();
        if !guard.writer {
            log::warn!("release_write called without holding the write lock");
            return;
        }

        guard.writer = false;
        self.inner.changed.notify_all();
    }

    /// Acquire according to `opts`; the returned guard releases on drop.
    pub fn acquire(&self, opts: LockOptions) -> Option<LockGuard> {
        let acquired = if opts.exclusive {
            self.acquire_write(opts.blocking, opts.timeout)
        } else {
            self.acquire_read(opts.blocking, opts.timeout)
        };

        acquired.then(|| LockGuard {
            lock: self.clone(),
            exclusive: opts.exclusive,
        })
    }

    /// Run `body` while holding the lock. Returns `None` without running the
    /// body when the lock could not be acquired.
    pub fn with_lock<R>(&self, opts: LockOptions, body: impl FnOnce() -> R) -> Option<R> {
        let _guard = self.acquire(opts)?;
        Some(body())
    }

    /// Number of readers currently inside.
    pub fn readers(&self) -> usize {
        self.inner.lock_state().readers
    }

    pub fn is_write_locked(&self) -> bool {
        self.inner.lock_state().writer
    }
}

/// Held read or write access to a [`CoordinationLock`].
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard {
    lock: CoordinationLock,
    exclusive: bool,
}

impl LockGuard {
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.exclusive {
            self.lock.release_write();
        } else {
            self.lock.release_read();
        }
    }
}
