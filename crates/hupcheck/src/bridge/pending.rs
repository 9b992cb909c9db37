//! Pending call table for the caller side of the bridge.
//!
//! One mutex guards the whole table. The receiver stores results under the
//! lock and then wakes every waiter; each waiter rechecks its own id. A
//! waiter enables its `Notified` future before looking at the table, so a
//! result that lands between the check and the await still wakes it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use super::protocol::{CallId, CallResult};

/// Why a waiter gave up without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFailure {
    /// The inbound stream ended before the result arrived.
    Closed,
    /// The deadline passed; the slot has been removed.
    TimedOut,
    /// No slot was registered for this id.
    Unknown,
}

#[derive(Default)]
struct TableState {
    slots: HashMap<CallId, Option<CallResult>>,
    /// Startup announcements received but not yet consumed.
    startups: usize,
    closed: bool,
}

#[derive(Default)]
pub struct PendingCalls {
    state: Mutex<TableState>,
    changed: Notify,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TableState> {
        // A panicking waiter cannot leave the map half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a slot before the call is written.
    ///
    /// Returns false when the channel is already closed.
    pub fn register(&self, id: CallId) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        state.slots.insert(id, None);
        true
    }

    /// Store a result delivered by the receiver and wake all waiters.
    ///
    /// Returns false if nobody is waiting for this id (abandoned or never
    /// sent); the result is dropped.
    pub fn complete(&self, result: CallResult) -> bool {
        let stored = {
            let mut state = self.lock();
            if result.is_startup() {
                state.startups += 1;
                true
            } else {
                match state.slots.get_mut(&result.id) {
                    Some(slot) if slot.is_none() => {
                        *slot = Some(result);
                        true
                    }
                    Some(_) => {
                        tracing::warn!(id = %result.id, "Duplicate result for call, dropping");
                        false
                    }
                    None => false,
                }
            }
        };
        if stored {
            self.changed.notify_waiters();
        }
        stored
    }

    /// Mark the channel closed; every current and future waiter fails.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of calls still waiting for a result.
    pub fn outstanding(&self) -> usize {
        self.lock().slots.values().filter(|s| s.is_none()).count()
    }

    /// Remove a slot without waiting. Returns the result if it already landed.
    pub fn abandon(&self, id: CallId) -> Option<CallResult> {
        self.lock().slots.remove(&id).flatten()
    }

    /// Wait for the result of `id`, removing the slot when it is consumed.
    pub async fn wait(&self, id: CallId) -> Result<CallResult, WaitFailure> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                let ready = match state.slots.get(&id) {
                    None => return Err(WaitFailure::Unknown),
                    Some(slot) => slot.is_some(),
                };
                if ready {
                    if let Some(Some(result)) = state.slots.remove(&id) {
                        return Ok(result);
                    }
                } else if state.closed {
                    state.slots.remove(&id);
                    return Err(WaitFailure::Closed);
                }
            }

            notified.await;
        }
    }

    /// Like [`wait`](Self::wait) with a deadline.
    ///
    /// On expiry the slot is taken out under the lock: a result that raced
    /// in just before is returned, otherwise the call is abandoned and any
    /// later result for it is dropped by [`complete`](Self::complete).
    pub async fn wait_timeout(
        &self,
        id: CallId,
        timeout: Duration,
    ) -> Result<CallResult, WaitFailure> {
        match tokio::time::timeout(timeout, self.wait(id)).await {
            Ok(outcome) => outcome,
            Err(_) => self.abandon(id).ok_or(WaitFailure::TimedOut),
        }
    }

    /// Consume one startup announcement, waiting for it if necessary.
    pub async fn wait_startup(&self) -> Result<(), WaitFailure> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.startups > 0 {
                    state.startups -= 1;
                    return Ok(());
                }
                if state.closed {
                    return Err(WaitFailure::Closed);
                }
            }

            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    #[tokio::test]
    async fn result_before_wait_is_kept() {
        let table = PendingCalls::new();
        let id = CallId::new();
        assert!(table.register(id));
        assert!(table.complete(CallResult::value(id, json!(1))));

        let result = table.wait(id).await.unwrap();
        assert_eq!(result.id, id);
        assert_eq!(table.outstanding(), 0);
        assert!(table.abandon(id).is_none());
    }

    #[tokio::test]
    async fn waiters_only_take_their_own_result() {
        let table = Arc::new(PendingCalls::new());
        let ids: Vec<CallId> = (0..16).map(|_| CallId::new()).collect();
        for id in &ids {
            table.register(*id);
        }

        let mut waiters = Vec::new();
        for (i, id) in ids.iter().copied().enumerate() {
            let table = Arc::clone(&table);
            waiters.push(tokio::spawn(async move {
                let result = table.wait(id).await.unwrap();
                (i, result)
            }));
        }

        // Deliver in reverse order.
        for (i, id) in ids.iter().enumerate().rev() {
            assert!(table.complete(CallResult::value(*id, json!(i))));
        }

        for waiter in waiters {
            let (i, result) = waiter.await.unwrap();
            assert_eq!(result.id, ids[i]);
            assert_eq!(result.outcome.into_result().unwrap(), json!(i));
        }
        assert_eq!(table.outstanding(), 0);
    }

    #[tokio::test]
    async fn close_fails_outstanding_and_future_calls() {
        let table = Arc::new(PendingCalls::new());
        let id = CallId::new();
        table.register(id);

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait(id).await })
        };
        tokio::task::yield_now().await;
        table.close();

        assert_eq!(waiter.await.unwrap().unwrap_err(), WaitFailure::Closed);
        assert!(!table.register(CallId::new()));
        assert!(table.is_closed());
    }

    #[tokio::test]
    async fn result_delivered_before_close_still_wins() {
        let table = PendingCalls::new();
        let id = CallId::new();
        table.register(id);
        table.complete(CallResult::value(id, json!("late")));
        table.close();

        let result = table.wait(id).await.unwrap();
        assert_eq!(result.outcome.into_result().unwrap(), json!("late"));
    }

    #[tokio::test]
    async fn timeout_abandons_slot_and_drops_late_result() {
        let table = PendingCalls::new();
        let id = CallId::new();
        table.register(id);

        let err = table
            .wait_timeout(id, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, WaitFailure::TimedOut);
        assert_eq!(table.outstanding(), 0);

        assert!(!table.complete(CallResult::value(id, json!("too late"))));
    }

    #[tokio::test]
    async fn unknown_ids_are_dropped() {
        let table = PendingCalls::new();
        assert!(!table.complete(CallResult::value(CallId::new(), json!(null))));
        assert_eq!(
            table.wait(CallId::new()).await.unwrap_err(),
            WaitFailure::Unknown
        );
    }

    #[tokio::test]
    async fn startup_announcements_are_counted() {
        let table = Arc::new(PendingCalls::new());
        table.complete(CallResult::startup());
        table.wait_startup().await.unwrap();

        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.wait_startup().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        table.complete(CallResult::startup());
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn startup_wait_fails_on_close() {
        let table = PendingCalls::new();
        table.close();
        assert_eq!(table.wait_startup().await.unwrap_err(), WaitFailure::Closed);
    }
}
