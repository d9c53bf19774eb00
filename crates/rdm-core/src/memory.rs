//! Bounded memory budget shared across downloads.
//!
//! Chunks reserve bytes before their piece fetches are dispatched and return
//! them after the decoded data is written, so total buffer memory stays under
//! `memory_budget` no matter how many downloads run concurrently.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::oneshot;

use crate::error::DownloadError;

struct Waiter {
    amount: u64,
    tx: oneshot::Sender<()>,
}

struct MemState {
    in_use: u64,
    waiters: VecDeque<Waiter>,
    shutdown: bool,
}

/// Byte-budget semaphore with FIFO wakeup.
///
/// Waiters are served strictly in arrival order: a large request at the head
/// of the queue blocks smaller ones behind it, which keeps starvation out at
/// the cost of some idle budget. A request larger than the whole budget can
/// never be satisfied and is rejected outright; outstanding bytes never
/// exceed the budget.
pub struct MemoryManager {
    budget: u64,
    state: Mutex<MemState>,
}

impl MemoryManager {
    pub fn new(budget: u64) -> Self {
        Self {
            budget,
            state: Mutex::new(MemState {
                in_use: 0,
                waiters: VecDeque::new(),
                shutdown: false,
            }),
        }
    }

    /// Reserve `amount` bytes, waiting until they are available. Fails when
    /// the manager has been shut down, or immediately when `amount` exceeds
    /// the whole budget. Callers must pair every granted request with exactly
    /// one `release` of the same amount.
    pub async fn request(&self, amount: u64) -> Result<(), DownloadError> {
        if amount > self.budget {
            return Err(DownloadError::InvalidParameters(format!(
                "memory request of {} bytes exceeds budget of {}",
                amount, self.budget
            )));
        }
        let rx = {
            let mut st = self.state.lock().unwrap();
            if st.shutdown {
                return Err(DownloadError::MemoryDenied);
            }
            if st.waiters.is_empty() && self.fits(&st, amount) {
                st.in_use += amount;
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            st.waiters.push_back(Waiter { amount, tx });
            rx
        };
        match rx.await {
            Ok(()) => Ok(()),
            Err(_) => Err(DownloadError::MemoryDenied),
        }
    }

    /// Return `amount` bytes and wake one waiter (FIFO) if the head of the
    /// queue now fits.
    pub fn release(&self, amount: u64) {
        let mut st = self.state.lock().unwrap();
        st.in_use = st.in_use.saturating_sub(amount);
        self.wake(&mut st);
    }

    /// Bytes currently reserved. Never exceeds the budget.
    pub fn outstanding(&self) -> u64 {
        self.state.lock().unwrap().in_use
    }

    /// Deny all pending and future requests. Outstanding reservations are
    /// unaffected and may still be released.
    pub fn shutdown(&self) {
        let mut st = self.state.lock().unwrap();
        st.shutdown = true;
        // Dropping the senders fails every parked `request`.
        st.waiters.clear();
    }

    fn fits(&self, st: &MemState, amount: u64) -> bool {
        st.in_use + amount <= self.budget
    }

    // Wakes at most one waiter per call. Waiters whose receiver was dropped
    // are no longer waiting; they are discarded so a cancelled request
    // cannot swallow the wake.
    fn wake(&self, st: &mut MemState) {
        while let Some(amount) = st.waiters.front().map(|w| w.amount) {
            if !self.fits(st, amount) {
                break;
            }
            let w = st.waiters.pop_front().unwrap();
            if w.tx.send(()).is_ok() {
                st.in_use += w.amount;
                break;
            }
        }
    }
}
