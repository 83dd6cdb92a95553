//! Concrete node components wired into the lifecycle manager

pub mod ca_syncer;
pub mod certificates;
pub mod reconciler;
pub mod storage;

use std::sync::Mutex;

/// State handed from the join phase to the storage engine
///
/// When this node joins an existing cluster, the sync-phase CA syncer
/// learns the storage peer list from the join API; the storage component
/// reads it later when building the engine's argument list. Absent means
/// this node bootstraps a fresh cluster.
#[derive(Default)]
pub struct JoinContext {
    initial_cluster: Mutex<Option<Vec<String>>>,
}

impl JoinContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_initial_cluster(&self, members: Vec<String>) {
        *self
            .initial_cluster
            .lock()
            .expect("join context mutex poisoned") = Some(members);
    }

    pub fn initial_cluster(&self) -> Option<Vec<String>> {
        self.initial_cluster
            .lock()
            .expect("join context mutex poisoned")
            .clone()
    }
}
