//! Certificate bootstrap
//!
//! Sync-phase component that guarantees the cluster CA and the node's
//! serving certificates exist before anything runs. On a fresh first
//! controller this is where the CA is minted; on a joined controller the
//! CA syncer has already written the CA and this component only issues
//! leaves against it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::component::Component;
use crate::config::{ClusterConfig, KeelVars};
use crate::kubeconfig;
use crate::pki::{self, CertManager, Request};
use crate::Result;

const CA_NAME: &str = "ca";
const CA_COMMON_NAME: &str = "keel-ca";

pub struct Certificates {
    cert_manager: Arc<CertManager>,
    config: ClusterConfig,
    vars: KeelVars,
}

impl Certificates {
    pub fn new(cert_manager: Arc<CertManager>, config: ClusterConfig, vars: KeelVars) -> Self {
        Self {
            cert_manager,
            config,
            vars,
        }
    }
}

#[async_trait]
impl Component for Certificates {
    fn name(&self) -> &str {
        "certificates"
    }

    async fn init(&self) -> Result<()> {
        self.cert_manager.ensure_ca(CA_NAME, CA_COMMON_NAME)?;

        self.cert_manager.ensure_certificate(
            &Request {
                name: "server".to_string(),
                cn: "keel-api".to_string(),
                o: "keel".to_string(),
                hostnames: self.config.api.all_sans(),
            },
            CA_NAME,
            "root",
        )?;

        let admin = self.cert_manager.ensure_certificate(
            &Request {
                name: "admin".to_string(),
                cn: "keel-admin".to_string(),
                o: "system:masters".to_string(),
                hostnames: vec![],
            },
            CA_NAME,
            "root",
        )?;

        // The operator credential: client-certificate auth against the
        // API server, written alongside the certs it is built from.
        let ca_cert = std::fs::read_to_string(self.vars.ca_cert_path())?;
        let admin_conf = kubeconfig::admin_kubeconfig(
            &self.config.api.api_address_url(),
            &ca_cert,
            &admin.cert_pem,
            &admin.key_pem,
        )
        .to_yaml()?;
        pki::write_private(&self.vars.admin_kubeconfig_path, admin_conf.as_bytes())?;

        Ok(())
    }
}
