//! Join tokens: issuance, encoding, and trust pinning
//!
//! A join token is the single secret a new node needs. It carries the
//! join endpoints, a bearer secret, and the cluster CA certificate
//! together with that certificate's fingerprint. Decoding re-hashes the
//! embedded certificate and refuses any token whose fingerprint does not
//! match, so a tampered or spliced token fails before a single byte is
//! sent to the network.

use std::time::{Duration, SystemTime};

use aws_lc_rs::digest;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pki;

/// Current token wire format version
const TOKEN_VERSION: u32 = 1;

/// Byte length of the generated bearer secret
const SECRET_LEN: usize = 32;

/// Default token lifetime when issuance does not specify one
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(10 * 60);

/// Role a token entitles its bearer to join as
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenRole {
    /// Joins the control plane: receives CA key material and storage peers
    Controller,
    /// Joins as a workload node: receives a bootstrap credential only
    Worker,
}

impl std::fmt::Display for TokenRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenRole::Controller => write!(f, "controller"),
            TokenRole::Worker => write!(f, "worker"),
        }
    }
}

impl std::str::FromStr for TokenRole {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(TokenRole::Controller),
            "worker" => Ok(TokenRole::Worker),
            other => Err(TokenError::Malformed(format!("unknown role {other:?}"))),
        }
    }
}

/// Token failures
///
/// All of these are fatal to a join attempt; none are retried.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token fingerprint mismatch: embedded CA does not match pin")]
    FingerprintMismatch,

    #[error("unsupported token version {0}")]
    UnsupportedVersion(u32),
}

/// Decoded join token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JoinToken {
    /// Wire format version
    pub v: u32,
    /// Role the bearer joins as
    pub role: TokenRole,
    /// Join API endpoints, tried in order
    pub server_urls: Vec<String>,
    /// Bearer secret presented to the join API
    pub token: String,
    /// Cluster CA certificate, PEM
    pub ca_cert: String,
    /// URL-safe base64 of the SHA-256 of the CA certificate's DER
    pub ca_fingerprint: String,
}

impl JoinToken {
    /// Issue a token for `role` against the given CA and endpoints
    pub fn issue(
        role: TokenRole,
        server_urls: Vec<String>,
        ca_cert_pem: &str,
    ) -> Result<Self, TokenError> {
        if server_urls.is_empty() {
            return Err(TokenError::Malformed("no join endpoints".to_string()));
        }
        let fingerprint = ca_fingerprint(ca_cert_pem)?;
        let mut secret = [0u8; SECRET_LEN];
        aws_lc_rs::rand::fill(&mut secret)
            .map_err(|_| TokenError::Malformed("secret generation failed".to_string()))?;
        Ok(Self {
            v: TOKEN_VERSION,
            role,
            server_urls,
            token: URL_SAFE_NO_PAD.encode(secret),
            ca_cert: ca_cert_pem.to_string(),
            ca_fingerprint: fingerprint,
        })
    }

    /// Serialize to the opaque wire form handed to operators
    pub fn encode(&self) -> Result<String, TokenError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| TokenError::Malformed(format!("serialization failed: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(json))
    }

    /// Parse the wire form and verify the embedded CA against its pin
    ///
    /// Any structural defect or fingerprint mismatch is terminal; callers
    /// must not retry decode failures.
    pub fn decode(encoded: &str) -> Result<Self, TokenError> {
        let json = URL_SAFE_NO_PAD
            .decode(encoded.trim())
            .map_err(|e| TokenError::Malformed(format!("invalid base64: {e}")))?;
        let token: JoinToken = serde_json::from_slice(&json)
            .map_err(|e| TokenError::Malformed(format!("invalid structure: {e}")))?;

        if token.v != TOKEN_VERSION {
            return Err(TokenError::UnsupportedVersion(token.v));
        }
        if token.server_urls.is_empty() {
            return Err(TokenError::Malformed("no join endpoints".to_string()));
        }

        let actual = ca_fingerprint(&token.ca_cert)?;
        if actual != token.ca_fingerprint {
            return Err(TokenError::FingerprintMismatch);
        }
        Ok(token)
    }
}

/// Fingerprint of a PEM certificate: URL-safe base64 of the SHA-256 of
/// its DER encoding
pub fn ca_fingerprint(cert_pem: &str) -> Result<String, TokenError> {
    let der = pki::parse_pem(cert_pem)
        .map_err(|e| TokenError::Malformed(format!("invalid CA certificate: {e}")))?;
    let hash = digest::digest(&digest::SHA256, &der);
    Ok(URL_SAFE_NO_PAD.encode(hash.as_ref()))
}

/// Hash a bearer secret for storage and lookup
///
/// Raw secrets never live in the store; both sides of the comparison
/// are hashed.
pub fn hash_secret(secret: &str) -> String {
    let hash = digest::digest(&digest::SHA256, secret.as_bytes());
    URL_SAFE_NO_PAD.encode(hash.as_ref())
}

/// What the join API knows about an outstanding token
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenRecord {
    pub role: TokenRole,
    pub expires_at: SystemTime,
}

/// In-memory registry of outstanding join tokens, keyed by secret hash
pub struct TokenStore {
    records: DashMap<String, TokenRecord>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
        }
    }

    /// Register a token's secret for later validation
    pub fn insert(&self, secret: &str, role: TokenRole, ttl: Duration) {
        self.records.insert(
            hash_secret(secret),
            TokenRecord {
                role,
                expires_at: SystemTime::now() + ttl,
            },
        );
    }

    /// Validate a presented secret, returning its role when valid
    ///
    /// Expired entries are removed on the way out.
    pub fn validate(&self, secret: &str) -> Option<TokenRole> {
        let key = hash_secret(secret);
        let record = self.records.get(&key)?;
        if record.expires_at < SystemTime::now() {
            drop(record);
            self.records.remove(&key);
            return None;
        }
        Some(record.role)
    }

    /// Invalidate a secret
    pub fn revoke(&self, secret: &str) {
        self.records.remove(&hash_secret(secret));
    }

    /// Drop every expired record, returning how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = SystemTime::now();
        let before = self.records.len();
        self.records.retain(|_, record| record.expires_at >= now);
        before - self.records.len()
    }

    /// Load records from the registry file, merging into the store
    ///
    /// Token issuance runs in a separate process from the join server;
    /// the registry file is how the two meet. A missing file is an empty
    /// registry, not an error.
    pub fn reload(&self, path: &std::path::Path) -> crate::Result<()> {
        let data = match std::fs::read(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let records: std::collections::HashMap<String, TokenRecord> =
            serde_json::from_slice(&data)
                .map_err(|e| crate::Error::serialization(format!("token registry: {e}")))?;
        for (hash, record) in records {
            self.records.insert(hash, record);
        }
        Ok(())
    }

    /// Persist the current records to the registry file, mode 0600
    pub fn save(&self, path: &std::path::Path) -> crate::Result<()> {
        let records: std::collections::HashMap<String, TokenRecord> = self
            .records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        let data = serde_json::to_vec_pretty(&records)
            .map_err(|e| crate::Error::serialization(format!("token registry: {e}")))?;
        crate::pki::write_private(path, &data).map_err(crate::Error::from)
    }
}

impl Default for TokenStore {
    fn default() -> Self {
        Self::new()
    }
}
