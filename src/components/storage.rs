//! Embedded storage engine (etcd) under supervision
//!
//! The storage engine is an external binary run under the process
//! supervisor. The argument list depends on how this node came to exist:
//!
//! - fresh first controller: a single-member initial cluster
//! - joined controller: the peer list learned at join time, with the
//!   cluster state marked `existing`
//! - restart of either: the data directory already holds a database, so
//!   no membership flags are passed at all and the engine recovers from
//!   its own state
//!
//! The database-file check is what makes a crashed join retry safe: once
//! the engine has persisted state, membership is never renegotiated.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::component::Component;
use crate::config::{KeelVars, StorageSpec};
use crate::error::Error;
use crate::pki::{CertManager, Request};
use crate::supervisor::{ProcessSpec, Supervisor, SupervisorStatus};
use crate::Result;

use super::JoinContext;

const CLIENT_URL: &str = "https://127.0.0.1:2379";

pub struct StorageEngine {
    vars: KeelVars,
    spec: StorageSpec,
    node_name: String,
    cert_manager: Arc<CertManager>,
    join_ctx: Arc<JoinContext>,
    supervisor: Mutex<Option<Arc<Supervisor>>>,
}

impl StorageEngine {
    pub fn new(
        vars: KeelVars,
        spec: StorageSpec,
        node_name: String,
        cert_manager: Arc<CertManager>,
        join_ctx: Arc<JoinContext>,
    ) -> Self {
        Self {
            vars,
            spec,
            node_name,
            cert_manager,
            join_ctx,
            supervisor: Mutex::new(None),
        }
    }

    /// Path whose existence proves the engine has joined and persisted
    fn db_path(&self) -> PathBuf {
        self.vars.etcd_data_dir.join("member").join("snap").join("db")
    }

    /// Assemble the engine's argument list for the node's situation
    fn build_args(&self) -> Vec<String> {
        let peer_url = self.spec.peer_url();
        let mut args = vec![
            format!("--data-dir={}", self.vars.etcd_data_dir.display()),
            format!("--listen-client-urls={}", CLIENT_URL),
            format!("--advertise-client-urls={}", CLIENT_URL),
            format!("--listen-peer-urls={}", peer_url),
            format!("--initial-advertise-peer-urls={}", peer_url),
            format!("--name={}", self.node_name),
            format!(
                "--cert-file={}",
                self.vars.etcd_cert_dir.join("server.crt").display()
            ),
            format!(
                "--key-file={}",
                self.vars.etcd_cert_dir.join("server.key").display()
            ),
            format!(
                "--trusted-ca-file={}",
                self.vars.ca_cert_path().display()
            ),
            format!(
                "--peer-cert-file={}",
                self.vars.etcd_cert_dir.join("peer.crt").display()
            ),
            format!(
                "--peer-key-file={}",
                self.vars.etcd_cert_dir.join("peer.key").display()
            ),
            format!(
                "--peer-trusted-ca-file={}",
                self.vars.ca_cert_path().display()
            ),
            "--peer-client-cert-auth=true".to_string(),
        ];

        if self.db_path().exists() {
            // Membership is already settled in the database; passing
            // initial-cluster flags again would be ignored at best.
            debug!("existing database found, omitting membership flags");
        } else if let Some(members) = self.join_ctx.initial_cluster() {
            args.push(format!("--initial-cluster={}", members.join(",")));
            args.push("--initial-cluster-state=existing".to_string());
        } else {
            args.push(format!("--initial-cluster={}={}", self.node_name, peer_url));
        }
        args
    }
}

#[async_trait]
impl Component for StorageEngine {
    fn name(&self) -> &str {
        "storage"
    }

    async fn init(&self) -> Result<()> {
        crate::config::init_directory(&self.vars.etcd_data_dir, 0o700)?;
        crate::config::init_directory(&self.vars.etcd_cert_dir, 0o711)?;

        let peer_host = self
            .spec
            .peer_address
            .split(':')
            .next()
            .unwrap_or("127.0.0.1")
            .to_string();
        let hostnames = vec![
            peer_host,
            "127.0.0.1".to_string(),
            "localhost".to_string(),
        ];

        self.cert_manager.ensure_certificate(
            &Request {
                name: "etcd/server".to_string(),
                cn: "etcd-server".to_string(),
                o: "keel".to_string(),
                hostnames: hostnames.clone(),
            },
            "ca",
            "etcd",
        )?;
        self.cert_manager.ensure_certificate(
            &Request {
                name: "etcd/peer".to_string(),
                cn: "etcd-peer".to_string(),
                o: "keel".to_string(),
                hostnames,
            },
            "ca",
            "etcd",
        )?;
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let args = self.build_args();
        info!(name = %self.node_name, "starting storage engine");

        let spec = ProcessSpec::new("etcd", self.vars.bin_dir.join("etcd"))
            .args(args)
            .log_path(self.vars.run_dir.join("etcd.log"));
        let supervisor = Arc::new(Supervisor::new(spec));
        supervisor.start().await?;
        let mut status = supervisor.status();
        *self.supervisor.lock().await = Some(supervisor);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = status.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    let current = status.borrow().clone();
                    if let SupervisorStatus::Exhausted { restarts } = current {
                        return Err(Error::SupervisionExhausted {
                            name: "etcd".to_string(),
                            restarts,
                        });
                    }
                }
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.stop().await?;
        }
        Ok(())
    }

    async fn healthy(&self) -> Result<()> {
        tokio::net::TcpStream::connect("127.0.0.1:2379")
            .await
            .map_err(|e| Error::transient(format!("storage client port unreachable: {e}")))?;
        Ok(())
    }
}
