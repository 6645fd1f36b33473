//! Cancellable rendezvous scope shared by every unit of a session.
//!
//! Units never hand results back to the scheduler. A producer `put`s a fact
//! under a key and any consumer blocked in `get` on that key wakes up. Facts
//! are keyed by session id plus key, so sessions sharing a scope never see
//! each other's facts.
//!
//! Cancellation is terminal: once a branch is cancelled every pending and
//! future `get` resolves to the type's default value without waiting.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TaskError;
use crate::session::SessionId;

type Fact = Arc<dyn Any + Send + Sync>;
type Slot = Arc<watch::Sender<Option<Fact>>>;

#[derive(Default)]
struct Facts {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Facts {
    fn slot(&self, key: String) -> Slot {
        self.slots
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(watch::channel(None).0))
            .clone()
    }
}

#[derive(Clone)]
pub struct Branch {
    facts: Arc<Facts>,
    token: CancellationToken,
    timeout: Duration,
}

impl Branch {
    /// A root scope whose reads give up after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            facts: Arc::default(),
            token: CancellationToken::new(),
            timeout,
        }
    }

    /// A descendant scope: it sees the same facts and is cancelled together
    /// with its parent, but cancelling it leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            facts: self.facts.clone(),
            token: self.token.child_token(),
            timeout: self.timeout,
        }
    }

    fn composite(session: &SessionId, key: &str) -> String {
        format!("{session}/{}", key.trim())
    }

    pub fn put<T: Any + Send + Sync>(&self, session: &SessionId, key: &str, value: T) {
        let slot = self.facts.slot(Self::composite(session, key));
        slot.send_replace(Some(Arc::new(value)));
    }

    /// Wait for the fact under `key`. Cancellation, the timeout ceiling or a
    /// fact of another type all produce `T::default()`.
    pub async fn get<T: Any + Clone + Default>(&self, session: &SessionId, key: &str) -> T {
        match self.await_fact(session, key).await {
            Ok(fact) => match fact.downcast_ref::<T>() {
                Some(value) => value.clone(),
                None => {
                    warn!(%session, key, "fact has an unexpected type");
                    T::default()
                }
            },
            Err(e) => {
                debug!(%session, key, "rendezvous gave up: {e}");
                T::default()
            }
        }
    }

    /// The current fact under `key`, if any, without waiting.
    pub fn peek<T: Any + Clone>(&self, session: &SessionId, key: &str) -> Option<T> {
        if self.is_cancelled() {
            return None;
        }
        let slot = self.facts.slot(Self::composite(session, key));
        let current = slot.borrow().clone();
        current.and_then(|fact| fact.downcast_ref::<T>().cloned())
    }

    async fn await_fact(&self, session: &SessionId, key: &str) -> Result<Fact, TaskError> {
        if self.token.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        let mut rx = self.facts.slot(Self::composite(session, key)).subscribe();
        let present = async {
            rx.wait_for(Option::is_some)
                .await
                .map(|current| (*current).clone())
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TaskError::Cancelled),
            waited = tokio::time::timeout(self.timeout, present) => match waited {
                Ok(Ok(Some(fact))) => Ok(fact),
                // The sender lives as long as `self.facts`, so a closed
                // channel only happens while tearing down.
                Ok(_) => Err(TaskError::Cancelled),
                Err(_) => Err(TaskError::RendezvousTimeout {
                    key: key.to_string(),
                    after: self.timeout,
                }),
            },
        }
    }

    /// Drop every fact of `session`. Readers already waiting keep their
    /// subscription and only see the branch being cancelled or the timeout.
    pub fn forget(&self, session: &SessionId) {
        let prefix = format!("{session}/");
        self.facts.slots.lock().retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the branch is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn branch() -> Branch {
        Branch::new(Duration::from_secs(600))
    }

    #[tokio::test]
    async fn put_then_get_returns_without_waiting() {
        let b = branch();
        let s = SessionId::new();
        b.put(&s, "ready", true);

        let started = Instant::now();
        assert!(b.get::<bool>(&s, "ready").await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn get_wakes_on_later_put() {
        let b = branch();
        let s = SessionId::new();
        let reader = {
            let (b, s) = (b.clone(), s.clone());
            tokio::spawn(async move { b.get::<String>(&s, "path").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        b.put(&s, "path", "a.mp4".to_string());

        assert_eq!(reader.await.unwrap(), "a.mp4");
    }

    #[tokio::test]
    async fn cancel_releases_pending_readers_with_default() {
        let b = branch();
        let s = SessionId::new();
        let reader = {
            let (b, s) = (b.clone(), s.clone());
            tokio::spawn(async move { b.get::<bool>(&s, "never-written").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        b.cancel();
        assert!(!reader.await.unwrap());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn reads_after_cancel_are_default_even_when_written() {
        let b = branch();
        let s = SessionId::new();
        b.put(&s, "count", 7usize);
        b.cancel();
        b.cancel();

        assert_eq!(b.get::<usize>(&s, "count").await, 0);
        assert_eq!(b.peek::<usize>(&s, "count"), None);
    }

    #[tokio::test]
    async fn timeout_ceiling_yields_default() {
        let b = Branch::new(Duration::from_millis(30));
        let s = SessionId::new();
        assert_eq!(b.get::<u64>(&s, "size").await, 0);
    }

    #[tokio::test]
    async fn later_put_wins_for_later_readers() {
        let b = branch();
        let s = SessionId::new();
        b.put(&s, "n", 1u32);
        assert_eq!(b.get::<u32>(&s, "n").await, 1);
        b.put(&s, "n", 2u32);
        assert_eq!(b.get::<u32>(&s, "n").await, 2);
    }

    #[tokio::test]
    async fn sessions_do_not_collide() {
        let b = branch();
        let (one, two) = (SessionId::new(), SessionId::new());
        b.put(&one, "ready", true);
        assert_eq!(b.peek::<bool>(&two, "ready"), None);
        assert_eq!(b.peek::<bool>(&one, "ready"), Some(true));

        b.put(&two, "ready", false);
        b.forget(&one);
        assert_eq!(b.peek::<bool>(&one, "ready"), None);
        assert_eq!(b.peek::<bool>(&two, "ready"), Some(false));
    }

    #[tokio::test]
    async fn mismatched_type_is_default() {
        let b = branch();
        let s = SessionId::new();
        b.put(&s, "ready", "yes");
        assert!(!b.get::<bool>(&s, "ready").await);
    }

    #[tokio::test]
    async fn child_shares_facts_and_follows_parent_cancel() {
        let parent = branch();
        let child = parent.child();
        let s = SessionId::new();
        child.put(&s, "ready", true);
        assert_eq!(parent.peek::<bool>(&s, "ready"), Some(true));

        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }
}
