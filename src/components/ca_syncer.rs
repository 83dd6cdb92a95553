//! Trust establishment for joining controllers
//!
//! Runs in the sync phase, before any other component touches disk or
//! network. Given a join token, it fetches the cluster CA over the
//! pinned channel and persists it; given none, it does nothing and lets
//! the certificate component mint a fresh CA. Existing CA material on
//! disk always wins over a token: a node that already belongs to a
//! cluster never re-fetches trust.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::component::Component;
use crate::config::KeelVars;
use crate::join::JoinClient;
use crate::pki;
use crate::token::JoinToken;
use crate::Result;

use super::JoinContext;

pub struct CaSyncer {
    vars: KeelVars,
    token: Option<JoinToken>,
    peer_url: String,
    join_ctx: Arc<JoinContext>,
}

impl CaSyncer {
    pub fn new(
        vars: KeelVars,
        token: Option<JoinToken>,
        peer_url: String,
        join_ctx: Arc<JoinContext>,
    ) -> Self {
        Self {
            vars,
            token,
            peer_url,
            join_ctx,
        }
    }
}

#[async_trait]
impl Component for CaSyncer {
    fn name(&self) -> &str {
        "ca-syncer"
    }

    async fn init(&self) -> Result<()> {
        let token = match &self.token {
            Some(t) => t,
            None => return Ok(()),
        };

        if self.vars.has_ca_material() {
            // First writer wins. Trust material on disk predates this
            // token and must not be replaced by anything from the network.
            warn!(
                path = %self.vars.ca_cert_path().display(),
                "CA material already present, ignoring join token"
            );
            return Ok(());
        }

        info!(peers = ?token.server_urls, "joining existing cluster");
        let client = JoinClient::new(token)?;
        let response = client.join_controller(&self.peer_url).await?;

        pki::write_private(&self.vars.ca_key_path(), response.ca_key.as_bytes())?;
        pki::write_public(&self.vars.ca_cert_path(), response.ca_cert.as_bytes())?;
        info!(
            members = response.initial_cluster.len(),
            "cluster CA persisted, storage peers recorded"
        );
        self.join_ctx.set_initial_cluster(response.initial_cluster);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::CertificateAuthority;
    use crate::token::TokenRole;

    fn test_vars() -> (tempfile::TempDir, KeelVars) {
        let tmp = tempfile::tempdir().unwrap();
        let vars = KeelVars::new(tmp.path().join("data"));
        vars.init_directories().unwrap();
        (tmp, vars)
    }

    /// Story: Without a token, trust establishment is a no-op
    #[tokio::test]
    async fn story_no_token_no_action() {
        let (_tmp, vars) = test_vars();
        let syncer = CaSyncer::new(
            vars.clone(),
            None,
            "https://10.0.0.2:2380".to_string(),
            Arc::new(JoinContext::new()),
        );
        syncer.init().await.unwrap();
        assert!(!vars.has_ca_material());
    }

    /// Story: Existing CA material beats a join token
    ///
    /// The operator passed a token to a node that already holds trust
    /// material. Nothing is fetched, nothing overwritten, no network
    /// traffic at all: the token's endpoints point at an unreachable
    /// address and init still succeeds instantly.
    #[tokio::test]
    async fn story_existing_ca_wins_over_token() {
        let (_tmp, vars) = test_vars();
        let ca = CertificateAuthority::new("existing-ca").unwrap();
        pki::write_private(&vars.ca_key_path(), ca.ca_key_pem().as_bytes()).unwrap();
        pki::write_public(&vars.ca_cert_path(), ca.ca_cert_pem().as_bytes()).unwrap();

        let token = JoinToken::issue(
            TokenRole::Controller,
            vec!["https://192.0.2.1:9443".to_string()],
            ca.ca_cert_pem(),
        )
        .unwrap();

        let ctx = Arc::new(JoinContext::new());
        let syncer = CaSyncer::new(
            vars.clone(),
            Some(token),
            "https://10.0.0.2:2380".to_string(),
            ctx.clone(),
        );
        syncer.init().await.unwrap();

        let on_disk = std::fs::read_to_string(vars.ca_cert_path()).unwrap();
        assert_eq!(on_disk, ca.ca_cert_pem());
        assert!(ctx.initial_cluster().is_none());
    }
}
