//! Write-preferring reader-writer lock with upgrade and downgrade.
//!
//! Two counters track reader traffic: `entries` counts readers that have
//! passed the turnstile, `exits` counts readers that have left. Each counter
//! is only mutated behind its own gate. A writer closes the turnstile and
//! keeps it closed for its whole critical section, so once a writer is
//! waiting no new reader can get in. The writer proceeds when
//! `entries == exits`.
//!
//! Release operations never suspend, so they are plain functions. This lets
//! guards release from `Drop`.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};

/// State guarded by the exit gate.
#[derive(Debug, Default)]
struct ExitGate {
    exits: u64,
    writer_waiting: bool,
}

/// Point-in-time view of a lock, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Readers currently inside (`entries - exits`)
    pub active_readers: u64,
    /// A writer holds the lock
    pub writer_active: bool,
    /// A writer holds the turnstile and waits for readers to drain
    pub writer_waiting: bool,
}

/// Asynchronous upgradable reader-writer lock.
///
/// Waiting parks the task, never the thread. Writers are strictly
/// serialized by the turnstile; readers run concurrently with each other.
pub struct UpgradableRwLock {
    /// Turnstile. One permit; held by writers across calls.
    entry_gate: Semaphore,
    /// Only incremented while holding the turnstile.
    entries: AtomicU64,
    /// Short critical sections only, never held across an await.
    exit_gate: Mutex<ExitGate>,
    /// Signalled once by the last departing reader when a writer waits.
    drained: Semaphore,
    writer_active: AtomicBool,
}

impl UpgradableRwLock {
    /// Creates an unlocked lock.
    pub fn new() -> Self {
        Self {
            entry_gate: Semaphore::new(1),
            entries: AtomicU64::new(0),
            exit_gate: Mutex::new(ExitGate::default()),
            drained: Semaphore::new(0),
            writer_active: AtomicBool::new(false),
        }
    }

    /// Acquires a shared read lock.
    ///
    /// Suspends only while a writer holds or waits on the turnstile.
    /// Cancel-safe: nothing is recorded until the turnstile is passed.
    pub async fn acquire_read(&self) {
        let _turnstile = self.pass_turnstile().await;
        self.entries.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a read lock, waking a draining writer if this was the last reader.
    pub fn release_read(&self) {
        let mut gate = self.exit_gate.lock();
        gate.exits += 1;
        debug_assert!(
            gate.exits <= self.entries.load(Ordering::Acquire),
            "read released more often than acquired"
        );

        // While a writer waits it holds the turnstile, so `entries` is frozen.
        if gate.writer_waiting && self.entries.load(Ordering::Acquire) == gate.exits {
            gate.writer_waiting = false;
            self.drained.add_permits(1);
        }
    }

    /// Acquires the exclusive write lock.
    ///
    /// Closes the turnstile first, then waits for outstanding readers to
    /// leave. If the wait is cancelled the turnstile is reopened and any
    /// drain signal already sent is consumed, so the counters stay balanced.
    pub async fn acquire_write(&self) {
        self.pass_turnstile().await.forget();
        self.drain_readers().await;
        self.writer_active.store(true, Ordering::Release);
    }

    /// Releases the write lock and reopens the turnstile.
    pub fn release_write(&self) {
        self.writer_active.store(false, Ordering::Release);
        self.entry_gate.add_permits(1);
    }

    /// Converts a held write lock into a read lock.
    ///
    /// The caller is registered as a reader before the turnstile reopens, so
    /// no other writer can get in between.
    pub fn downgrade_write_to_read(&self) {
        self.writer_active.store(false, Ordering::Release);
        self.entries.fetch_add(1, Ordering::AcqRel);
        self.entry_gate.add_permits(1);
    }

    /// Converts a held read lock into a write lock.
    ///
    /// The caller's read is retired as soon as this is called, before the
    /// returned future is polled, and only then does it queue on the
    /// turnstile. Two readers upgrading at once therefore cannot wait on each
    /// other, but another writer may run first: callers must re-check
    /// whatever they observed under the read lock. If the returned future is
    /// dropped before completion the caller holds nothing.
    pub fn upgrade_read_to_write(&self) -> impl Future<Output = ()> + '_ {
        self.release_read();
        self.acquire_write()
    }

    /// Returns the current reader/writer counts.
    pub fn snapshot(&self) -> LockSnapshot {
        let gate = self.exit_gate.lock();
        LockSnapshot {
            active_readers: self.entries.load(Ordering::Acquire) - gate.exits,
            writer_active: self.writer_active.load(Ordering::Acquire),
            writer_waiting: gate.writer_waiting,
        }
    }

    async fn pass_turnstile(&self) -> SemaphorePermit<'_> {
        match self.entry_gate.acquire().await {
            Ok(permit) => permit,
            Err(_) => unreachable!("lock turnstile is never closed"),
        }
    }

    /// Waits until no readers remain. Caller holds the turnstile.
    async fn drain_readers(&self) {
        {
            let mut gate = self.exit_gate.lock();
            if self.entries.load(Ordering::Acquire) == gate.exits {
                return;
            }
            gate.writer_waiting = true;
        }

        DrainWait {
            lock: self,
            signal: Some(Box::pin(self.drained.acquire())),
        }
        .await;
    }
}

impl Default for UpgradableRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UpgradableRwLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradableRwLock")
            .field("state", &self.snapshot())
            .finish()
    }
}

type DrainSignal<'a> =
    Pin<Box<dyn Future<Output = Result<SemaphorePermit<'a>, AcquireError>> + Send + 'a>>;

/// A writer's wait for the last reader to leave.
///
/// If dropped before the signal arrives it undoes the writer's turnstile
/// state. The inner acquire is dropped first so that a signal already
/// handed to it is returned to the semaphore and can be swallowed here.
struct DrainWait<'a> {
    lock: &'a UpgradableRwLock,
    signal: Option<DrainSignal<'a>>,
}

impl Future for DrainWait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let polled = match self.signal.as_mut() {
            Some(signal) => signal.as_mut().poll(cx),
            None => return Poll::Ready(()),
        };

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(permit)) => {
                permit.forget();
                self.signal = None;
                Poll::Ready(())
            }
            Poll::Ready(Err(_)) => unreachable!("drain signal is never closed"),
        }
    }
}

impl Drop for DrainWait<'_> {
    fn drop(&mut self) {
        let Some(signal) = self.signal.take() else {
            return;
        };
        drop(signal);

        {
            let mut gate = self.lock.exit_gate.lock();
            if gate.writer_waiting {
                gate.writer_waiting = false;
            } else if let Ok(permit) = self.lock.drained.try_acquire() {
                // Last reader already signalled; swallow it so the next
                // writer does not wake early.
                permit.forget();
            }
        }

        tracing::trace!("Writer cancelled while draining readers; reopening turnstile");
        self.lock.entry_gate.add_permits(1);
    }
}
