//! Component capability interface and lifecycle manager
//!
//! Every subsystem of the node (certificate bootstrap, storage engine,
//! join API, leader elector, reconcilers) implements [`Component`] and is
//! registered with a [`Manager`]. The manager owns ordering:
//!
//! - sync components complete Init, in registration order, before
//!   anything else is touched (trust establishment happens here)
//! - async components then Init and Run concurrently; one failing does
//!   not stop the others
//! - Stop walks the registry in reverse, collecting errors instead of
//!   short-circuiting, and is idempotent
//!
//! Health is polled per component purely for observability; an unhealthy
//! component is logged, never aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::Result;

/// Interval between health polls for a running component
const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Upper bound on a single health check
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Capability interface implemented by every managed subsystem
///
/// All methods except `name` default to no-ops so a component only
/// implements the capabilities its role needs; the manager never
/// inspects the concrete type.
#[async_trait]
pub trait Component: Send + Sync {
    /// Unique name within a manager instance
    fn name(&self) -> &str;

    /// One-time initialization: directories, certificates, trust material
    async fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Long-running work. Implementations either start background work and
    /// return, or loop until the token is cancelled.
    async fn run(&self, _cancel: CancellationToken) -> Result<()> {
        Ok(())
    }

    /// Graceful shutdown. Must be safe to call more than once.
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    /// Bounded readiness probe, polled periodically for observability
    async fn healthy(&self) -> Result<()> {
        Ok(())
    }
}

/// Lifecycle state of one registered component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Registered, not yet initialized
    Registered,
    /// Init completed
    Initialized,
    /// Run invoked
    Running,
    /// Init or Run returned an error; the component is out of service
    /// but the rest of the system keeps going
    Failed,
    /// Stop completed
    Stopped,
}

struct Registration {
    component: Arc<dyn Component>,
    sync: bool,
}

/// Component lifecycle manager
///
/// Drives Init/Start/Stop across the ordered registry. Construct once,
/// register everything, then `init` + `start`.
pub struct Manager {
    components: Vec<Registration>,
    started: bool,
    states: Arc<Mutex<HashMap<String, LifecycleState>>>,
    health_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Manager {
    /// Create an empty manager
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
            started: false,
            states: Arc::new(Mutex::new(HashMap::new())),
            health_tasks: Vec::new(),
        }
    }

    /// Register a component. Sync components must complete Init before
    /// any component's Run begins.
    ///
    /// Registration after `start` is a programming error and is rejected.
    pub fn register(&mut self, component: Arc<dyn Component>, sync: bool) -> Result<()> {
        if self.started {
            return Err(Error::invalid_state(format!(
                "cannot register {} after the manager has started",
                component.name()
            )));
        }
        debug!(component = %component.name(), sync = sync, "registered component");
        self.components.push(Registration { component, sync });
        Ok(())
    }

    /// Initialize every sync component, in registration order
    ///
    /// The first failure aborts immediately: nothing may run before trust
    /// establishment completes.
    pub async fn init(&self) -> Result<()> {
        for reg in self.components.iter().filter(|r| r.sync) {
            let name = reg.component.name().to_string();
            info!(component = %name, "initializing sync component");
            reg.component.init().await.map_err(|e| {
                error!(component = %name, error = %e, "sync component init failed, aborting startup");
                e
            })?;
            self.set_state(&name, LifecycleState::Initialized).await;
        }
        Ok(())
    }

    /// Initialize the remaining (async) components, then invoke Run
    /// concurrently for every component
    ///
    /// A failure in one async component's Init or Run marks that component
    /// Failed and is logged; start itself still succeeds. A degraded
    /// control plane is preferable to a total halt.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<()> {
        self.started = true;

        for reg in self.components.iter().filter(|r| !r.sync) {
            let name = reg.component.name().to_string();
            match reg.component.init().await {
                Ok(()) => self.set_state(&name, LifecycleState::Initialized).await,
                Err(e) => {
                    error!(component = %name, error = %e, "component init failed");
                    self.set_state(&name, LifecycleState::Failed).await;
                }
            }
        }

        for reg in &self.components {
            let name = reg.component.name().to_string();
            if self.state(&name).await == Some(LifecycleState::Failed) {
                continue;
            }

            let component = reg.component.clone();
            let states = self.states.clone();
            let run_cancel = cancel.clone();
            self.set_state(&name, LifecycleState::Running).await;
            tokio::spawn(async move {
                if let Err(e) = component.run(run_cancel).await {
                    error!(component = %component.name(), error = %e, "component run failed");
                    states
                        .lock()
                        .await
                        .insert(component.name().to_string(), LifecycleState::Failed);
                }
            });

            self.health_tasks
                .push(spawn_health_poller(reg.component.clone(), cancel.clone()));
        }

        info!(count = self.components.len(), "all components started");
        Ok(())
    }

    /// Stop every component in reverse registration order
    ///
    /// Errors are collected, not short-circuited; a second call is a
    /// no-op for components already stopped.
    pub async fn stop(&mut self) -> Result<()> {
        for task in self.health_tasks.drain(..) {
            task.abort();
        }

        let mut failures = Vec::new();
        for reg in self.components.iter().rev() {
            let name = reg.component.name().to_string();
            if self.state(&name).await == Some(LifecycleState::Stopped) {
                debug!(component = %name, "already stopped, skipping");
                continue;
            }

            info!(component = %name, "stopping component");
            if let Err(e) = reg.component.stop().await {
                warn!(component = %name, error = %e, "component stop failed, continuing");
                failures.push(format!("{}: {}", name, e));
            }
            self.set_state(&name, LifecycleState::Stopped).await;
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Stop { failures })
        }
    }

    /// Current lifecycle state of a component, if registered
    pub async fn state(&self, name: &str) -> Option<LifecycleState> {
        self.states.lock().await.get(name).copied()
    }

    async fn set_state(&self, name: &str, state: LifecycleState) {
        self.states.lock().await.insert(name.to_string(), state);
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// Poll `healthy()` until cancelled, logging failures
///
/// Never feeds back into lifecycle decisions: a component that reports
/// unhealthy keeps running.
fn spawn_health_poller(
    component: Arc<dyn Component>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so components get a
        // moment to come up before their first probe.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, component.healthy()).await {
                        Ok(Ok(())) => debug!(component = %component.name(), "healthy"),
                        Ok(Err(e)) => {
                            warn!(component = %component.name(), error = %e, "health check failed")
                        }
                        Err(_) => {
                            warn!(component = %component.name(), "health check timed out")
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use super::*;

    /// Test component that records which lifecycle methods ran and can be
    /// told to fail at a given phase.
    struct Probe {
        name: String,
        inits: AtomicU32,
        runs: AtomicU32,
        stops: AtomicU32,
        fail_init: bool,
        fail_run: bool,
        init_order: Arc<Mutex<Vec<String>>>,
    }

    impl Probe {
        fn new(name: &str, order: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                inits: AtomicU32::new(0),
                runs: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                fail_init: false,
                fail_run: false,
                init_order: order,
            })
        }

        fn failing_init(name: &str, order: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                inits: AtomicU32::new(0),
                runs: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                fail_init: true,
                fail_run: false,
                init_order: order,
            })
        }

        fn failing_run(name: &str, order: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                inits: AtomicU32::new(0),
                runs: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                fail_init: false,
                fail_run: true,
                init_order: order,
            })
        }
    }

    #[async_trait]
    impl Component for Probe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn init(&self) -> Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            self.init_order.lock().await.push(self.name.clone());
            if self.fail_init {
                return Err(Error::config(format!("{} init failed", self.name)));
            }
            Ok(())
        }

        async fn run(&self, _cancel: CancellationToken) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_run {
                return Err(Error::transient(format!("{} run failed", self.name)));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    // ==========================================================================
    // Story Tests: Startup Ordering
    // ==========================================================================
    //
    // The only ordering the system guarantees: all sync Inits complete, in
    // registration order, before any async component is touched. These
    // tests pin that guarantee down.

    /// Story: Sync components initialize strictly before async ones
    #[tokio::test]
    async fn story_sync_inits_run_first_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();

        let async_a = Probe::new("async-a", order.clone());
        let sync_a = Probe::new("sync-a", order.clone());
        let sync_b = Probe::new("sync-b", order.clone());

        // Register async first to prove ordering comes from the sync flag,
        // not registration position alone.
        manager.register(async_a.clone(), false).unwrap();
        manager.register(sync_a.clone(), true).unwrap();
        manager.register(sync_b.clone(), true).unwrap();

        manager.init().await.unwrap();
        assert_eq!(*order.lock().await, vec!["sync-a", "sync-b"]);

        manager.start(CancellationToken::new()).await.unwrap();
        assert_eq!(
            *order.lock().await,
            vec!["sync-a", "sync-b", "async-a"],
            "async init happens only during start"
        );
    }

    /// Story: A sync Init failure aborts startup before async components
    ///
    /// Trust establishment failed; nothing else may start.
    #[tokio::test]
    async fn story_sync_failure_prevents_async_init() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();

        let bad_sync = Probe::failing_init("ca-sync", order.clone());
        let async_c = Probe::new("api", order.clone());

        manager.register(bad_sync, true).unwrap();
        manager.register(async_c.clone(), false).unwrap();

        assert!(manager.init().await.is_err());
        assert_eq!(async_c.inits.load(Ordering::SeqCst), 0);
    }

    /// Story: One async failure does not stop the others
    ///
    /// A degraded control plane is preferable to a total halt: the failed
    /// component is marked Failed, the rest keep serving.
    #[tokio::test]
    async fn story_async_failures_are_isolated() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();

        let bad = Probe::failing_run("dns", order.clone());
        let good = Probe::new("scheduler", order.clone());

        manager.register(bad.clone(), false).unwrap();
        manager.register(good.clone(), false).unwrap();

        manager.init().await.unwrap();
        manager.start(CancellationToken::new()).await.unwrap();

        // Give spawned run tasks a beat to execute.
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(good.runs.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state("dns").await, Some(LifecycleState::Failed));
        assert_eq!(
            manager.state("scheduler").await,
            Some(LifecycleState::Running)
        );
    }

    /// Story: An async Init failure skips that component's Run only
    #[tokio::test]
    async fn story_async_init_failure_skips_run() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();

        let bad = Probe::failing_init("metrics", order.clone());
        let good = Probe::new("konnectivity", order.clone());

        manager.register(bad.clone(), false).unwrap();
        manager.register(good.clone(), false).unwrap();

        manager.init().await.unwrap();
        manager.start(CancellationToken::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(bad.runs.load(Ordering::SeqCst), 0);
        assert_eq!(good.runs.load(Ordering::SeqCst), 1);
    }

    // ==========================================================================
    // Story Tests: Shutdown
    // ==========================================================================

    /// Story: Stop walks components in reverse registration order and is
    /// idempotent
    #[tokio::test]
    async fn story_stop_is_reverse_ordered_and_idempotent() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();

        let a = Probe::new("a", order.clone());
        let b = Probe::new("b", order.clone());

        manager.register(a.clone(), true).unwrap();
        manager.register(b.clone(), false).unwrap();

        manager.init().await.unwrap();
        manager.start(CancellationToken::new()).await.unwrap();

        manager.stop().await.unwrap();
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);

        // Second stop is a per-component no-op.
        manager.stop().await.unwrap();
        assert_eq!(a.stops.load(Ordering::SeqCst), 1);
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
    }

    /// Story: Stop collects failures rather than giving up at the first
    #[tokio::test]
    async fn story_stop_collects_all_failures() {
        struct BadStop;

        #[async_trait]
        impl Component for BadStop {
            fn name(&self) -> &str {
                "bad-stop"
            }
            async fn stop(&self) -> Result<()> {
                Err(Error::transient("process would not die"))
            }
        }

        struct GoodStop {
            stopped: Arc<AtomicBool>,
        }

        #[async_trait]
        impl Component for GoodStop {
            fn name(&self) -> &str {
                "good-stop"
            }
            async fn stop(&self) -> Result<()> {
                self.stopped.store(true, Ordering::SeqCst);
                Ok(())
            }
        }

        let stopped = Arc::new(AtomicBool::new(false));
        let mut manager = Manager::new();
        // good-stop registered first: it is stopped last, proving we kept
        // going past bad-stop's failure.
        manager
            .register(
                Arc::new(GoodStop {
                    stopped: stopped.clone(),
                }),
                false,
            )
            .unwrap();
        manager.register(Arc::new(BadStop), false).unwrap();

        manager.init().await.unwrap();
        manager.start(CancellationToken::new()).await.unwrap();

        let err = manager.stop().await.unwrap_err();
        assert!(err.to_string().contains("bad-stop"));
        assert!(stopped.load(Ordering::SeqCst), "later components still stopped");
    }

    /// Story: Registration after start is rejected
    #[tokio::test]
    async fn story_no_registration_after_start() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut manager = Manager::new();
        manager
            .register(Probe::new("early", order.clone()), false)
            .unwrap();

        manager.init().await.unwrap();
        manager.start(CancellationToken::new()).await.unwrap();

        let err = manager
            .register(Probe::new("late", order.clone()), false)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
