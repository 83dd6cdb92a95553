//! Joining an existing cluster
//!
//! The client side of the bootstrap-trust protocol: decode a join token,
//! build an HTTPS client that trusts only the CA pinned inside it, and
//! fetch the material the node's role needs. Controllers receive the CA
//! key pair plus the storage peer list; workers receive a bootstrap
//! credential. Transient network failures are retried on a short fixed
//! schedule; anything the server rejects outright is terminal.

pub mod server;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Error;
use crate::token::JoinToken;
use crate::Result;

/// Attempts made against the join API before giving up
const JOIN_RETRY_ATTEMPTS: u32 = 20;

/// Fixed pause between join attempts
const JOIN_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Per-request timeout against the join API
const JOIN_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// What a joining controller asks for
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaRequest {
    /// The joiner's storage peer URL, registered with the cluster
    pub peer_url: String,
}

/// What a joining controller receives
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaResponse {
    /// Cluster CA certificate, PEM
    pub ca_cert: String,
    /// Cluster CA private key, PEM
    pub ca_key: String,
    /// Storage peers, `name=url` pairs including the joiner itself
    pub initial_cluster: Vec<String>,
}

/// HTTPS client pinned to the CA a join token vouches for
pub struct JoinClient {
    client: reqwest::Client,
    server_urls: Vec<String>,
    secret: String,
}

impl JoinClient {
    /// Build a client from a decoded token
    ///
    /// The token's embedded CA becomes the one and only trust root; no
    /// system roots, no hostname exceptions.
    pub fn new(token: &JoinToken) -> Result<Self> {
        if token.server_urls.is_empty() {
            return Err(Error::config("join token carries no endpoints"));
        }
        let root = reqwest::Certificate::from_pem(token.ca_cert.as_bytes())
            .map_err(|e| Error::config(format!("invalid CA certificate in token: {e}")))?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .timeout(JOIN_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::config(format!("failed to build join client: {e}")))?;
        Ok(Self {
            client,
            server_urls: token.server_urls.clone(),
            secret: token.token.clone(),
        })
    }

    /// Register as a controller and fetch the cluster's trust material
    pub async fn join_controller(&self, peer_url: &str) -> Result<CaResponse> {
        let body = CaRequest {
            peer_url: peer_url.to_string(),
        };
        retry_transient(JOIN_RETRY_ATTEMPTS, JOIN_RETRY_DELAY, || async {
            self.post_json("v1/ca", &body).await
        })
        .await
    }

    /// Fetch a worker bootstrap credential (kubeconfig YAML)
    pub async fn fetch_bootstrap_config(&self) -> Result<String> {
        retry_transient(JOIN_RETRY_ATTEMPTS, JOIN_RETRY_DELAY, || async {
            let resp = self
                .get("v1/bootstrap")
                .await?
                .text()
                .await
                .map_err(|e| Error::transient(format!("reading bootstrap body: {e}")))?;
            Ok(resp)
        })
        .await
    }

    async fn post_json<B: Serialize, T: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let url = self.endpoint(path);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.secret)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::transient(format!("POST {url}: {e}")))?;
        classify_status(&url, resp.status())?;
        resp.json::<T>()
            .await
            .map_err(|e| Error::config(format!("invalid response from {url}: {e}")))
    }

    async fn get(&self, path: &str) -> Result<reqwest::Response> {
        let url = self.endpoint(path);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.secret)
            .send()
            .await
            .map_err(|e| Error::transient(format!("GET {url}: {e}")))?;
        classify_status(&url, resp.status())?;
        Ok(resp)
    }

    fn endpoint(&self, path: &str) -> String {
        // Endpoints beyond the first are future work for multi-server
        // tokens; today the first URL is authoritative. Non-emptiness is
        // checked at construction.
        let base = self.server_urls[0].trim_end_matches('/');
        format!("{base}/{path}")
    }
}

/// Sort an HTTP status into transient or terminal
///
/// Server-side trouble (5xx) is worth another attempt; a 4xx means the
/// request itself is wrong and repeating it cannot help.
fn classify_status(url: &str, status: reqwest::StatusCode) -> Result<()> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() {
        Err(Error::transient(format!("{url} returned {status}")))
    } else {
        Err(Error::config(format!("{url} rejected request: {status}")))
    }
}

/// Retry `op` on transient errors only, up to `attempts` tries with a
/// fixed `delay` between them
///
/// The final transient error is returned as-is when the budget runs out.
/// Non-transient errors propagate immediately without sleeping.
pub async fn retry_transient<T, F, Fut>(attempts: u32, delay: Duration, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(attempt = attempt, max = attempts, error = %e, "transient failure, will retry");
                last = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => {
                debug!(error = %e, "terminal failure, not retrying");
                return Err(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| Error::transient("retry budget exhausted")))
}
