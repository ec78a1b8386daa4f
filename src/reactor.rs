// src/reactor.rs
//
// Cooperative time base for the motion pipeline. All waiting goes through
// the reactor so tests can drive the whole stack on tokio's paused clock.
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

/// Sentinel print/reactor time meaning "never".
pub const NEVER: f64 = 9_999_999_999_999_999.9;

#[derive(Clone)]
pub struct Reactor {
    start: Instant,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Monotonic event time in seconds since reactor creation.
    pub fn monotonic(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Sleep until the given event time, returning the time actually reached.
    pub async fn pause(&self, until: f64) -> f64 {
        let now = self.monotonic();
        if until > now && until < NEVER {
            tokio::time::sleep(Duration::from_secs_f64(until - now)).await;
        }
        self.monotonic()
    }
}

/// One-shot completion. Multiple clones observe the same slot; the first
/// `complete` wins and later ones are ignored.
pub struct Completion<T: Clone> {
    tx: Arc<watch::Sender<Option<T>>>,
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> Clone for Completion<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Completion<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Completion<T> {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn complete(&self, value: T) {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(value);
                true
            } else {
                false
            }
        });
    }

    /// True once a value has been posted.
    pub fn test(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn get(&self) -> Option<T> {
        self.rx.borrow().clone()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.rx.clone();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                // All senders gone without a value; nothing will ever arrive.
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Wait until the value arrives or the reactor reaches `deadline`.
    pub async fn wait_until(&self, reactor: &Reactor, deadline: f64) -> Option<T> {
        tokio::select! {
            value = self.wait() => Some(value),
            _ = reactor.pause(deadline) => self.get(),
        }
    }
}

/// Build a completion that fires when every child fires. A child posting
/// `true` (error) completes the parent immediately.
pub fn multi_complete(children: Vec<Completion<bool>>) -> Completion<()> {
    let parent: Completion<()> = Completion::new();
    for child in &children {
        let child = child.clone();
        let parent = parent.clone();
        tokio::spawn(async move {
            if child.wait().await {
                parent.complete(());
            }
        });
    }
    let parent_all = parent.clone();
    tokio::spawn(async move {
        futures::future::join_all(children.iter().map(|c| c.wait())).await;
        parent_all.complete(());
    });
    parent
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn completion_fires_once() {
        let c: Completion<u32> = Completion::new();
        assert!(!c.test());
        c.complete(7);
        c.complete(9);
        assert_eq!(c.wait().await, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_times_out() {
        let reactor = Reactor::new();
        let c: Completion<u32> = Completion::new();
        let got = c.wait_until(&reactor, reactor.monotonic() + 0.5).await;
        assert!(got.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn multi_complete_waits_for_all() {
        let a: Completion<bool> = Completion::new();
        let b: Completion<bool> = Completion::new();
        let all = multi_complete(vec![a.clone(), b.clone()]);
        tokio::task::yield_now().await;
        assert!(!all.test());
        a.complete(false);
        tokio::task::yield_now().await;
        assert!(!all.test());
        b.complete(false);
        all.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn multi_complete_errors_early() {
        let a: Completion<bool> = Completion::new();
        let b: Completion<bool> = Completion::new();
        let all = multi_complete(vec![a.clone(), b.clone()]);
        a.complete(true);
        all.wait().await;
        assert!(!b.test());
    }
}
