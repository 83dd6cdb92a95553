//! Join API server
//!
//! The server side of the bootstrap-trust protocol, served over TLS with
//! a certificate issued by the cluster CA (the same CA every join token
//! pins). Both endpoints authenticate with a bearer secret from an
//! outstanding join token:
//!
//! - `POST /v1/ca` — controller join: registers the caller's storage
//!   peer and returns the CA key pair plus the full peer list
//! - `GET /v1/bootstrap` — worker join: returns a bootstrap credential

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::Component;
use crate::error::Error;
use crate::kubeconfig;
use crate::pki::{CertManager, Request};
use crate::token::{TokenRole, TokenStore};
use crate::Result;

use super::{CaRequest, CaResponse};

/// Join endpoint errors
#[derive(Debug, Error)]
pub enum JoinApiError {
    /// Missing authorization header
    #[error("missing authorization header")]
    MissingAuth,

    /// Invalid, expired, or wrong-role token
    #[error("invalid or expired token")]
    InvalidToken,

    /// Trust material is not available on this node
    #[error("CA material unavailable: {0}")]
    CaUnavailable(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for JoinApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            JoinApiError::MissingAuth => (StatusCode::UNAUTHORIZED, self.to_string()),
            JoinApiError::InvalidToken => (StatusCode::FORBIDDEN, self.to_string()),
            JoinApiError::CaUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            JoinApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Registry of known storage peers, `name -> peer URL`
///
/// Seeded with the local node; controller joins add themselves before
/// receiving the list back.
pub struct PeerRegistry {
    peers: DashMap<String, String>,
}

impl PeerRegistry {
    pub fn new(local_name: &str, local_peer_url: &str) -> Self {
        let peers = DashMap::new();
        peers.insert(local_name.to_string(), local_peer_url.to_string());
        Self { peers }
    }

    /// Register a peer, returning the full `name=url` list afterward
    pub fn register(&self, peer_url: &str) -> Vec<String> {
        let name = peer_name(peer_url);
        self.peers.insert(name, peer_url.to_string());
        self.initial_cluster()
    }

    /// Current `name=url` pairs, sorted for stable output
    pub fn initial_cluster(&self) -> Vec<String> {
        let mut entries: Vec<String> = self
            .peers
            .iter()
            .map(|e| format!("{}={}", e.key(), e.value()))
            .collect();
        entries.sort();
        entries
    }
}

/// Derive a member name from a peer URL's host
fn peer_name(peer_url: &str) -> String {
    peer_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .split(':')
        .next()
        .unwrap_or(peer_url)
        .replace('.', "-")
}

/// Shared state behind the join endpoints
pub struct JoinState {
    pub tokens: Arc<TokenStore>,
    pub peers: Arc<PeerRegistry>,
    /// Cluster CA certificate, PEM
    pub ca_cert: String,
    /// Cluster CA private key, PEM
    pub ca_key: String,
    /// API server URL placed in worker bootstrap credentials
    pub api_server_url: String,
    /// Token registry file, re-read when an unknown secret is presented
    pub token_registry: Option<std::path::PathBuf>,
}

/// Extract the bearer secret from request headers
fn extract_bearer(headers: &HeaderMap) -> std::result::Result<String, JoinApiError> {
    let value = headers
        .get("authorization")
        .ok_or(JoinApiError::MissingAuth)?
        .to_str()
        .map_err(|_| JoinApiError::InvalidToken)?;
    value
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
        .ok_or(JoinApiError::InvalidToken)
}

/// Validate the bearer against the token store for a specific role
fn authorize(
    state: &JoinState,
    headers: &HeaderMap,
    wanted: TokenRole,
) -> std::result::Result<String, JoinApiError> {
    let secret = extract_bearer(headers)?;
    let mut role = state.tokens.validate(&secret);
    if role.is_none() {
        // The secret may have been issued by a separate process since we
        // last read the registry.
        if let Some(path) = &state.token_registry {
            if let Err(e) = state.tokens.reload(path) {
                warn!(error = %e, "token registry reload failed");
            }
            role = state.tokens.validate(&secret);
        }
    }
    match role {
        Some(role) if role == wanted => Ok(secret),
        Some(other) => {
            warn!(presented = %other, required = %wanted, "token role mismatch");
            Err(JoinApiError::InvalidToken)
        }
        None => Err(JoinApiError::InvalidToken),
    }
}

/// `POST /v1/ca` — controller join
async fn ca_handler(
    State(state): State<Arc<JoinState>>,
    headers: HeaderMap,
    Json(request): Json<CaRequest>,
) -> std::result::Result<Json<CaResponse>, JoinApiError> {
    debug!(peer_url = %request.peer_url, "controller join request received");
    authorize(&state, &headers, TokenRole::Controller)?;

    let initial_cluster = state.peers.register(&request.peer_url);
    info!(
        peer_url = %request.peer_url,
        members = initial_cluster.len(),
        "controller joined"
    );

    Ok(Json(CaResponse {
        ca_cert: state.ca_cert.clone(),
        ca_key: state.ca_key.clone(),
        initial_cluster,
    }))
}

/// `GET /v1/bootstrap` — worker join
async fn bootstrap_handler(
    State(state): State<Arc<JoinState>>,
    headers: HeaderMap,
) -> std::result::Result<String, JoinApiError> {
    debug!("worker bootstrap request received");
    let secret = authorize(&state, &headers, TokenRole::Worker)?;

    let credential =
        kubeconfig::bootstrap_kubeconfig(&state.api_server_url, &state.ca_cert, &secret);
    info!("worker bootstrap credential issued");
    credential
        .to_yaml()
        .map_err(|e| JoinApiError::Internal(e.to_string()))
}

/// Build the join API router
pub fn join_router(state: Arc<JoinState>) -> axum::Router {
    axum::Router::new()
        .route("/v1/ca", post(ca_handler))
        .route("/v1/bootstrap", get(bootstrap_handler))
        .with_state(state)
}

/// Component serving the join API over TLS
pub struct JoinServer {
    state: Arc<JoinState>,
    cert_manager: Arc<CertManager>,
    bind_addr: SocketAddr,
    sans: Vec<String>,
}

impl JoinServer {
    pub fn new(
        state: Arc<JoinState>,
        cert_manager: Arc<CertManager>,
        bind_addr: SocketAddr,
        sans: Vec<String>,
    ) -> Self {
        Self {
            state,
            cert_manager,
            bind_addr,
            sans,
        }
    }
}

#[async_trait]
impl Component for JoinServer {
    fn name(&self) -> &str {
        "join-server"
    }

    async fn init(&self) -> Result<()> {
        // The serving certificate comes from the same CA the tokens pin.
        self.cert_manager.ensure_certificate(
            &Request {
                name: "join-server".to_string(),
                cn: "keel-join-server".to_string(),
                o: "keel".to_string(),
                hostnames: self.sans.clone(),
            },
            "ca",
            "root",
        )?;
        Ok(())
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let cert = self.cert_manager.read_certificate("join-server")?;
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem(
            cert.cert_pem.into_bytes(),
            cert.key_pem.into_bytes(),
        )
        .await
        .map_err(|e| Error::config(format!("invalid join server TLS material: {e}")))?;

        let router = join_router(self.state.clone());
        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        });

        info!(addr = %self.bind_addr, "join API listening");
        axum_server::bind_rustls(self.bind_addr, tls)
            .handle(handle)
            .serve(router.into_make_service())
            .await
            .map_err(|e| Error::config(format!("join server failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    use crate::pki::CertificateAuthority;

    use super::*;

    fn test_state() -> Arc<JoinState> {
        let ca = CertificateAuthority::new("test-ca").unwrap();
        let tokens = Arc::new(TokenStore::new());
        tokens.insert("ctrl-secret", TokenRole::Controller, Duration::from_secs(60));
        tokens.insert("worker-secret", TokenRole::Worker, Duration::from_secs(60));
        Arc::new(JoinState {
            tokens,
            peers: Arc::new(PeerRegistry::new("node-1", "https://10.0.0.1:2380")),
            ca_cert: ca.ca_cert_pem().to_string(),
            ca_key: ca.ca_key_pem().to_string(),
            api_server_url: "https://10.0.0.1:6443".to_string(),
            token_registry: None,
        })
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap()
            .to_vec()
    }

    // ==========================================================================
    // Integration Tests: Controller Join
    // ==========================================================================

    /// Integration test: a controller join returns trust material and the
    /// peer list including the joiner
    #[tokio::test]
    async fn integration_controller_join_success() {
        let state = test_state();
        let router = join_router(state);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/v1/ca")
            .header("authorization", "Bearer ctrl-secret")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&CaRequest {
                    peer_url: "https://10.0.0.2:2380".to_string(),
                })
                .unwrap(),
            ))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let ca: CaResponse = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(ca.ca_cert.contains("BEGIN CERTIFICATE"));
        assert!(ca.ca_key.contains("PRIVATE KEY"));
        assert_eq!(ca.initial_cluster.len(), 2);
        assert!(ca
            .initial_cluster
            .iter()
            .any(|m| m.ends_with("=https://10.0.0.2:2380")));
    }

    /// Integration test: a worker token cannot fetch CA material
    #[tokio::test]
    async fn integration_worker_token_rejected_for_ca() {
        let state = test_state();
        let router = join_router(state);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/v1/ca")
            .header("authorization", "Bearer worker-secret")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::to_vec(&CaRequest {
                    peer_url: "https://10.0.0.2:2380".to_string(),
                })
                .unwrap(),
            ))
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    /// Integration test: missing auth is 401
    #[tokio::test]
    async fn integration_missing_auth() {
        let state = test_state();
        let router = join_router(state);

        let request = HttpRequest::builder()
            .method("GET")
            .uri("/v1/bootstrap")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    // ==========================================================================
    // Integration Tests: Worker Bootstrap
    // ==========================================================================

    /// Integration test: a worker join yields a usable credential
    #[tokio::test]
    async fn integration_worker_bootstrap_success() {
        let state = test_state();
        let router = join_router(state);

        let request = HttpRequest::builder()
            .method("GET")
            .uri("/v1/bootstrap")
            .header("authorization", "Bearer worker-secret")
            .body(Body::empty())
            .unwrap();

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let yaml = String::from_utf8(body_bytes(response).await).unwrap();
        let kc = crate::kubeconfig::Kubeconfig::from_yaml(&yaml).unwrap();
        assert_eq!(kc.clusters[0].cluster.server, "https://10.0.0.1:6443");
        assert_eq!(kc.users[0].user.token.as_deref(), Some("worker-secret"));
    }

    /// Story: Peer names derive from the URL host
    #[test]
    fn story_peer_names() {
        assert_eq!(peer_name("https://10.0.0.2:2380"), "10-0-0-2");
        assert_eq!(peer_name("https://etcd-1.internal:2380"), "etcd-1-internal");
    }

    /// Story: Registering the same peer twice keeps one entry
    #[test]
    fn story_peer_registration_is_idempotent() {
        let registry = PeerRegistry::new("node-1", "https://10.0.0.1:2380");
        registry.register("https://10.0.0.2:2380");
        let members = registry.register("https://10.0.0.2:2380");
        assert_eq!(members.len(), 2);
    }
}
