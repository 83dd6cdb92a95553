//! Bootstrap credential rendering
//!
//! Workers receive a kubeconfig-shaped credential: the API server
//! address, the cluster CA, and a bearer token. The structure is the
//! standard kubeconfig layout so any client tooling can consume it
//! directly.

use serde::{Deserialize, Serialize};

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::Error;
use crate::Result;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Kubeconfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub contexts: Vec<NamedContext>,
    #[serde(rename = "current-context")]
    pub current_context: String,
    pub users: Vec<NamedUser>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub server: String,
    #[serde(rename = "certificate-authority-data")]
    pub certificate_authority_data: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct User {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(
        rename = "client-certificate-data",
        skip_serializing_if = "Option::is_none"
    )]
    pub client_certificate_data: Option<String>,
    #[serde(rename = "client-key-data", skip_serializing_if = "Option::is_none")]
    pub client_key_data: Option<String>,
}

fn kubeconfig_for(server: &str, ca_cert_pem: &str, user_name: &str, user: User) -> Kubeconfig {
    Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: "keel".to_string(),
            cluster: Cluster {
                server: server.to_string(),
                certificate_authority_data: STANDARD.encode(ca_cert_pem),
            },
        }],
        contexts: vec![NamedContext {
            name: "keel".to_string(),
            context: Context {
                cluster: "keel".to_string(),
                user: user_name.to_string(),
            },
        }],
        current_context: "keel".to_string(),
        users: vec![NamedUser {
            name: user_name.to_string(),
            user,
        }],
    }
}

/// Render a bootstrap kubeconfig for a joining worker
pub fn bootstrap_kubeconfig(server: &str, ca_cert_pem: &str, token: &str) -> Kubeconfig {
    kubeconfig_for(
        server,
        ca_cert_pem,
        "kubelet-bootstrap",
        User {
            token: Some(token.to_string()),
            client_certificate_data: None,
            client_key_data: None,
        },
    )
}

/// Render the admin kubeconfig from the admin client certificate
pub fn admin_kubeconfig(
    server: &str,
    ca_cert_pem: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
) -> Kubeconfig {
    kubeconfig_for(
        server,
        ca_cert_pem,
        "admin",
        User {
            token: None,
            client_certificate_data: Some(STANDARD.encode(client_cert_pem)),
            client_key_data: Some(STANDARD.encode(client_key_pem)),
        },
    )
}

impl Kubeconfig {
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| Error::serialization(e.to_string()))
    }
}
