//! Leader-gated periodic reconciliation
//!
//! Some housekeeping must run on exactly one controller at a time. A
//! [`LeaderReconciler`] wraps a [`Reconcile`] task and ticks it on an
//! interval, but only while the leadership watch reads true. Demotion
//! takes effect at the next tick; no work is cancelled mid-flight.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::component::Component;
use crate::token::TokenStore;
use crate::Result;

const RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// A unit of singleton housekeeping
#[async_trait]
pub trait Reconcile: Send + Sync {
    fn name(&self) -> &str;

    async fn reconcile(&self) -> Result<()>;
}

/// Runs a reconcile task only while this node leads
pub struct LeaderReconciler {
    task: Arc<dyn Reconcile>,
    leadership: watch::Receiver<bool>,
}

impl LeaderReconciler {
    pub fn new(task: Arc<dyn Reconcile>, leadership: watch::Receiver<bool>) -> Self {
        Self { task, leadership }
    }
}

#[async_trait]
impl Component for LeaderReconciler {
    fn name(&self) -> &str {
        "reconciler"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let leadership = self.leadership.clone();
        let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if !*leadership.borrow() {
                        debug!(task = %self.task.name(), "not leader, skipping reconcile");
                        continue;
                    }
                    if let Err(e) = self.task.reconcile().await {
                        // Reconciliation is retried on the next tick; a
                        // failure here is never fatal to the node.
                        tracing::warn!(task = %self.task.name(), error = %e, "reconcile failed");
                    }
                }
            }
        }
    }
}

/// Prunes expired join tokens from the store
pub struct TokenSweeper {
    tokens: Arc<TokenStore>,
}

impl TokenSweeper {
    pub fn new(tokens: Arc<TokenStore>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Reconcile for TokenSweeper {
    fn name(&self) -> &str {
        "token-sweeper"
    }

    async fn reconcile(&self) -> Result<()> {
        let removed = self.tokens.sweep_expired();
        if removed > 0 {
            info!(removed = removed, "pruned expired join tokens");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::token::TokenRole;

    use super::*;

    struct Counter {
        ticks: AtomicU32,
    }

    #[async_trait]
    impl Reconcile for Counter {
        fn name(&self) -> &str {
            "counter"
        }
        async fn reconcile(&self) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Story: A follower's reconciler ticks but does no work
    #[tokio::test(start_paused = true)]
    async fn story_follower_does_nothing() {
        let counter = Arc::new(Counter {
            ticks: AtomicU32::new(0),
        });
        let (_tx, rx) = watch::channel(false);
        let reconciler = LeaderReconciler::new(counter.clone(), rx);

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let handle = tokio::spawn(async move { reconciler.run(stop).await });

        tokio::time::sleep(RECONCILE_INTERVAL * 3).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(counter.ticks.load(Ordering::SeqCst), 0);
    }

    /// Story: Leadership turns the ticks into work
    #[tokio::test(start_paused = true)]
    async fn story_leader_reconciles() {
        let counter = Arc::new(Counter {
            ticks: AtomicU32::new(0),
        });
        let (_tx, rx) = watch::channel(true);
        let reconciler = LeaderReconciler::new(counter.clone(), rx);

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let handle = tokio::spawn(async move { reconciler.run(stop).await });

        tokio::time::sleep(RECONCILE_INTERVAL * 3 + Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert!(counter.ticks.load(Ordering::SeqCst) >= 3);
    }

    /// Story: The token sweeper removes only what has expired
    #[tokio::test]
    async fn story_sweeper_prunes_expired_tokens() {
        let store = Arc::new(TokenStore::new());
        store.insert("fresh", TokenRole::Worker, Duration::from_secs(600));
        store.insert("stale", TokenRole::Worker, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        let sweeper = TokenSweeper::new(store.clone());
        sweeper.reconcile().await.unwrap();

        assert_eq!(store.validate("fresh"), Some(TokenRole::Worker));
        assert_eq!(store.validate("stale"), None);
    }
}
