//! Bounded connection pool: caps concurrency to upstream MCP servers, queues
//! overflow requests FIFO, supports a graceful drain.
//!
//! No direct teacher analogue — `oxicrab` never needed to bound concurrency
//! to a fleet of child processes this way. Built from first principles with
//! the crates the teacher already depends on for async coordination: a
//! `oneshot` channel per waiter rather than polling, matching the
//! "event-driven notification, never polling" invariant.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::errors::BrokerError;

const DEFAULT_MAX: usize = 8;
const DEFAULT_WAITER_TIMEOUT: Duration = Duration::from_secs(5);

/// What a queued waiter is told when it's dequeued.
enum WaiterSignal {
    /// A slot was granted; `active` has already been incremented for it.
    Granted,
    /// The pool started draining before this waiter reached the front.
    Draining,
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<WaiterSignal>,
}

struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
    draining: bool,
    next_waiter_id: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub active: usize,
    pub max: usize,
    pub waiting: usize,
    pub draining: bool,
}

/// An acquired slot. Must be passed to `release` (or `execute` used
/// instead) — the pool has no way to reclaim a forgotten slot.
pub struct Slot<'a> {
    pool: &'a ConnectionPool,
}

pub struct ConnectionPool {
    max: usize,
    waiter_timeout: Duration,
    state: Mutex<State>,
}

impl ConnectionPool {
    pub fn new(max: usize) -> Self {
        Self::with_timeout(max, DEFAULT_WAITER_TIMEOUT)
    }

    pub fn with_timeout(max: usize, waiter_timeout: Duration) -> Self {
        Self {
            max: max.max(1),
            waiter_timeout,
            state: Mutex::new(State {
                active: 0,
                waiters: VecDeque::new(),
                draining: false,
                next_waiter_id: 0,
            }),
        }
    }

    /// Acquire a slot, queueing FIFO if the pool is at capacity.
    pub async fn acquire(&self) -> Result<Slot<'_>, BrokerError> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.draining {
                return Err(BrokerError::PoolDraining);
            }
            if state.active < self.max {
                state.active += 1;
                return Ok(Slot { pool: self });
            }
            let id = state.next_waiter_id;
            state.next_waiter_id += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            (rx, id)
        };

        let (rx, id) = rx;

        match tokio::time::timeout(self.waiter_timeout, rx).await {
            Ok(Ok(WaiterSignal::Granted)) => Ok(Slot { pool: self }),
            Ok(Ok(WaiterSignal::Draining)) => Err(BrokerError::PoolDraining),
            Ok(Err(_)) => Err(BrokerError::QueueTimeout),
            Err(_) => {
                // Remove ourselves from the queue so a later release/drain
                // never tries to signal a receiver nobody is listening on.
                // If we'd already been popped, `rx` would have resolved
                // above instead of timing out, so this is always a clean
                // removal.
                let mut state = self.state.lock().await;
                state.waiters.retain(|w| w.id != id);
                Err(BrokerError::QueueTimeout)
            }
        }
    }

    pub async fn release(&self, slot: Slot<'_>) {
        drop(slot);
        self.release_inner().await;
    }

    async fn release_inner(&self) {
        let mut state = self.state.lock().await;
        state.active = state.active.saturating_sub(1);
        while let Some(waiter) = state.waiters.pop_front() {
            state.active += 1;
            if waiter.tx.send(WaiterSignal::Granted).is_ok() {
                return;
            }
            // Receiver already timed out and dropped; reclaim the slot we
            // just granted and try the next waiter in line.
            state.active = state.active.saturating_sub(1);
        }
        debug!(active = state.active, "connection released, no waiters queued");
    }

    /// Acquire, run `f`, always release — propagating `f`'s result or error.
    pub async fn execute<F, Fut, T>(&self, f: F) -> Result<T, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BrokerError>>,
    {
        let slot = self.acquire().await?;
        let result = f().await;
        self.release(slot).await;
        result
    }

    /// Mark draining, reject queued waiters, wait for `active == 0` or
    /// `timeout` to elapse. Always returns normally.
    pub async fn drain(&self, timeout: Duration) {
        {
            let mut state = self.state.lock().await;
            state.draining = true;
            for waiter in state.waiters.drain(..) {
                let _ = waiter.tx.send(WaiterSignal::Draining);
            }
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let state = self.state.lock().await;
                if state.active == 0 {
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("pool drain timed out with active connections still outstanding");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn get_stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            active: state.active,
            max: self.max,
            waiting: state.waiters.len(),
            draining: state.draining,
        }
    }

    pub async fn is_at_capacity(&self) -> bool {
        let state = self.state.lock().await;
        state.active >= self.max
    }

    pub async fn is_draining(&self) -> bool {
        self.state.lock().await.draining
    }

    /// Reset to a fresh, non-draining, empty state.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.active = 0;
        state.waiters.clear();
        state.draining = false;
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX)
    }
}
