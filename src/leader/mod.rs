//! Leader election over a shared lease
//!
//! One controller at a time runs singleton duties (reconcilers, cluster
//! housekeeping). Election is a compare-and-swap loop over a single
//! lease in a shared store: acquire it when free or expired, renew it
//! while held, and demote immediately when a renewal fails. The design
//! is fail-safe toward followership; a brief leaderless gap is always
//! preferred over two leaders.
//!
//! Single-controller deployments use [`NoopElector`], which reports
//! permanent leadership without touching any store.

pub mod lease;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::Component;
use crate::Result;

use lease::{Lease, LeaseStore, LeaseStoreError};

/// Name of the controller lease in the store
const LEASE_NAME: &str = "keel-ctrl";

/// How long a lease stays valid after a renewal
const LEASE_DURATION: Duration = Duration::from_secs(15);

/// How often the elector attempts to acquire or renew
const RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Leadership transition broadcast to interested components
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeadershipEvent {
    Acquired,
    Lost,
}

/// Common surface of the real and no-op electors
pub trait Elector: Component {
    /// Whether this node currently believes it leads
    fn is_leader(&self) -> bool;

    /// Watch channel carrying the current leadership belief
    fn leadership(&self) -> watch::Receiver<bool>;

    /// Subscribe to leadership transitions
    fn events(&self) -> broadcast::Receiver<LeadershipEvent>;
}

/// Pick the elector for a deployment
///
/// No external address means a single controller, which leads
/// unconditionally. With an external address the lease loop runs, but
/// today it is backed by a process-local store: controllers do not yet
/// contend for one shared lease, and each node holds its own. That
/// limitation is announced loudly at startup instead of silently handing
/// every node a lease.
pub fn elector_for(external_address: &str, identity: &str) -> Arc<dyn Elector> {
    if external_address.is_empty() {
        info!("no external address configured, assuming sole leadership");
        Arc::new(NoopElector::new())
    } else {
        warn!(
            external_address = %external_address,
            "leader election is backed by a process-local lease store; \
             singleton duties are not exclusive across controllers until \
             a shared store is configured"
        );
        Arc::new(LeaseElector::new(
            identity,
            Arc::new(lease::InMemoryLeaseStore::new()),
        ))
    }
}

/// Lease-based elector
///
/// Runs a tick loop: when not leading, try to take the lease (create it,
/// or CAS over an expired one); when leading, renew it. Any failure while
/// leading demotes on the spot.
pub struct LeaseElector {
    identity: String,
    store: Arc<dyn LeaseStore>,
    leader_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<LeadershipEvent>,
}

impl LeaseElector {
    pub fn new(identity: impl Into<String>, store: Arc<dyn LeaseStore>) -> Self {
        let (leader_tx, _) = watch::channel(false);
        let (event_tx, _) = broadcast::channel(16);
        Self {
            identity: identity.into(),
            store,
            leader_tx,
            event_tx,
        }
    }

    fn fresh_lease(&self) -> Lease {
        Lease {
            holder_identity: self.identity.clone(),
            lease_duration: LEASE_DURATION,
            renew_time: Utc::now(),
            resource_version: 0,
        }
    }

    /// One election tick. Returns the new leadership belief.
    ///
    /// Exposed to the module for deterministic testing; the run loop just
    /// calls this on an interval.
    fn tick(&self, was_leader: bool) -> bool {
        let now_leader = if was_leader {
            self.renew()
        } else {
            self.acquire()
        };

        if now_leader != was_leader {
            let event = if now_leader {
                info!(identity = %self.identity, "acquired leadership");
                LeadershipEvent::Acquired
            } else {
                warn!(identity = %self.identity, "lost leadership, demoting");
                LeadershipEvent::Lost
            };
            let _ = self.leader_tx.send(now_leader);
            let _ = self.event_tx.send(event);
        }
        now_leader
    }

    fn acquire(&self) -> bool {
        match self.store.get(LEASE_NAME) {
            Ok(current) => {
                if current.holder_identity == self.identity || current.expired(Utc::now()) {
                    // Take over our own stale lease or anyone's expired one,
                    // conditioned on the version we just read.
                    match self
                        .store
                        .update(LEASE_NAME, self.fresh_lease(), current.resource_version)
                    {
                        Ok(_) => true,
                        Err(e) => {
                            debug!(identity = %self.identity, error = %e, "lease takeover lost");
                            false
                        }
                    }
                } else {
                    false
                }
            }
            Err(LeaseStoreError::NotFound(_)) => match self.store.create(LEASE_NAME, self.fresh_lease()) {
                Ok(_) => true,
                Err(e) => {
                    debug!(identity = %self.identity, error = %e, "lease creation lost");
                    false
                }
            },
            Err(e) => {
                debug!(identity = %self.identity, error = %e, "lease store unreachable");
                false
            }
        }
    }

    fn renew(&self) -> bool {
        let current = match self.store.get(LEASE_NAME) {
            Ok(l) => l,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "renewal read failed");
                return false;
            }
        };
        if current.holder_identity != self.identity {
            // Someone else took the lease; local belief was stale.
            return false;
        }
        match self
            .store
            .update(LEASE_NAME, self.fresh_lease(), current.resource_version)
        {
            Ok(_) => true,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "renewal write failed");
                false
            }
        }
    }
}

#[async_trait]
impl Component for LeaseElector {
    fn name(&self) -> &str {
        "leader-elector"
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(RENEW_INTERVAL);
        let mut leading = false;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    leading = self.tick(leading);
                }
            }
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        // Drop the claim locally; the lease itself simply expires.
        if *self.leader_tx.borrow() {
            let _ = self.leader_tx.send(false);
            let _ = self.event_tx.send(LeadershipEvent::Lost);
        }
        Ok(())
    }
}

impl Elector for LeaseElector {
    fn is_leader(&self) -> bool {
        *self.leader_tx.borrow()
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.event_tx.subscribe()
    }
}

/// Elector for single-controller deployments
///
/// Used when the cluster has no external address to coordinate through:
/// this node is the only controller, so it leads unconditionally.
pub struct NoopElector {
    leader_tx: watch::Sender<bool>,
    event_tx: broadcast::Sender<LeadershipEvent>,
}

impl NoopElector {
    pub fn new() -> Self {
        let (leader_tx, _) = watch::channel(true);
        let (event_tx, _) = broadcast::channel(16);
        Self {
            leader_tx,
            event_tx,
        }
    }
}

impl Default for NoopElector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Component for NoopElector {
    fn name(&self) -> &str {
        "leader-elector"
    }

    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        let _ = self.event_tx.send(LeadershipEvent::Acquired);
        Ok(())
    }
}

impl Elector for NoopElector {
    fn is_leader(&self) -> bool {
        true
    }

    fn leadership(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    fn events(&self) -> broadcast::Receiver<LeadershipEvent> {
        self.event_tx.subscribe()
    }
}
