//! Local certificate authority and certificate issuance
//!
//! Every controller holds the cluster CA on disk and issues leaf
//! certificates for the components it runs. Issuance is idempotent:
//! asking for material that already exists and parses returns the
//! existing files untouched, so components can call `ensure_*` on every
//! startup.
//!
//! # Security Model
//!
//! - The CA key is written once, mode 0600, owned by the expected user
//! - Leaf keys never leave the node that generated them
//! - `ensure_ca` must run before any leaf request that references it;
//!   the lifecycle manager's sync phase enforces that ordering

use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::config::KeelVars;

/// CA certificate lifetime
const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// Leaf certificate lifetime
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Backdate on not_before so freshly issued material verifies on peers
/// with slightly lagging clocks
const NOT_BEFORE_SKEW: ::time::Duration = ::time::Duration::hours(1);

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// CA material missing where it was required
    #[error("CA not initialized: {0}")]
    CaNotInitialized(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A request for a leaf certificate
#[derive(Clone, Debug)]
pub struct Request {
    /// File stem under the cert root dir, e.g. "server" or "etcd/peer"
    pub name: String,
    /// Certificate common name
    pub cn: String,
    /// Organization
    pub o: String,
    /// DNS names and IP addresses the certificate must be valid for
    pub hostnames: Vec<String>,
}

/// An issued certificate and its private key, both PEM-encoded
#[derive(Clone, Debug)]
pub struct Certificate {
    /// Leaf certificate PEM
    pub cert_pem: String,
    /// Private key PEM
    pub key_pem: String,
}

/// In-memory certificate authority
///
/// Wraps the CA key/cert PEM pair; the key pair is re-parsed per signing
/// operation because rcgen key pairs are not cloneable.
pub struct CertificateAuthority {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + ::time::Duration::days(CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load CA from PEM strings, validating both parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get the CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Issue a leaf certificate for the given request
    ///
    /// The key pair is generated here, on the node that will use it,
    /// and never transmitted.
    pub fn issue(&self, req: &Request) -> Result<Certificate> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate key for {}: {}", req.cn, e))
        })?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(req.cn.clone()));
        dn.push(DnType::OrganizationName, DnValue::Utf8String(req.o.clone()));
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = now + ::time::Duration::days(LEAF_VALIDITY_DAYS);

        params.subject_alt_names = req
            .hostnames
            .iter()
            .map(|h| match h.parse::<std::net::IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(h.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid SAN {}: {}",
                            h, e
                        ))
                    }),
            })
            .collect::<Result<Vec<_>>>()?;

        let ca_key = KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                req.cn, e
            ))
        })?;

        Ok(Certificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Verify a certificate was signed by the given CA and is within its
/// validity period
pub fn verify_cert(cert_der: &[u8], ca_cert_pem: &str) -> Result<bool> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_cert_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    if cert.verify_signature(Some(ca_cert.public_key())).is_err() {
        return Ok(false);
    }

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;

    Ok(now >= cert.validity().not_before.timestamp()
        && now <= cert.validity().not_after.timestamp())
}

/// File-backed certificate manager
///
/// Owns the `ensure_*` operations components call during Init. All output
/// lands under the cert root dir with restrictive modes and the expected
/// process-user ownership.
#[derive(Clone)]
pub struct CertManager {
    vars: KeelVars,
}

impl CertManager {
    /// Create a manager over the node's filesystem layout
    pub fn new(vars: KeelVars) -> Self {
        Self { vars }
    }

    /// Ensure a CA key/cert pair exists at `<cert_root>/<name>.{key,crt}`
    ///
    /// Existing material is left untouched; a fresh CA is generated and
    /// persisted otherwise.
    pub fn ensure_ca(&self, name: &str, common_name: &str) -> Result<CertificateAuthority> {
        let key_path = self.vars.cert_root_dir.join(format!("{}.key", name));
        let cert_path = self.vars.cert_root_dir.join(format!("{}.crt", name));

        if key_path.exists() && cert_path.exists() {
            debug!(ca = %name, "CA material exists, reusing");
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            return CertificateAuthority::from_pem(&cert_pem, &key_pem);
        }

        info!(ca = %name, cn = %common_name, "generating cluster CA");
        let ca = CertificateAuthority::new(common_name)?;

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&key_path, ca.ca_key_pem().as_bytes())?;
        write_public(&cert_path, ca.ca_cert_pem().as_bytes())?;
        Ok(ca)
    }

    /// Ensure a leaf certificate exists for the request, issued by the CA
    /// named in `ca_name` and owned by `owner` on disk
    ///
    /// Material that already exists and still verifies against the CA is
    /// returned as-is.
    pub fn ensure_certificate(
        &self,
        req: &Request,
        ca_name: &str,
        owner: &str,
    ) -> Result<Certificate> {
        let key_path = self.vars.cert_root_dir.join(format!("{}.key", req.name));
        let cert_path = self.vars.cert_root_dir.join(format!("{}.crt", req.name));

        let ca_cert_path = self.vars.cert_root_dir.join(format!("{}.crt", ca_name));
        let ca_key_path = self.vars.cert_root_dir.join(format!("{}.key", ca_name));
        if !ca_cert_path.exists() || !ca_key_path.exists() {
            return Err(PkiError::CaNotInitialized(format!(
                "{} (needed for {})",
                ca_name, req.name
            )));
        }

        if key_path.exists() && cert_path.exists() {
            let cert_pem = std::fs::read_to_string(&cert_path)?;
            let key_pem = std::fs::read_to_string(&key_path)?;
            let ca_cert_pem = std::fs::read_to_string(&ca_cert_path)?;

            let der = parse_pem(&cert_pem)?;
            if verify_cert(&der, &ca_cert_pem)? {
                debug!(cert = %req.name, "certificate exists and verifies, reusing");
                return Ok(Certificate { cert_pem, key_pem });
            }
            warn!(cert = %req.name, "existing certificate no longer valid, reissuing");
        }

        let ca = CertificateAuthority::from_pem(
            &std::fs::read_to_string(&ca_cert_path)?,
            &std::fs::read_to_string(&ca_key_path)?,
        )?;
        let cert = ca.issue(req)?;

        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_private(&key_path, cert.key_pem.as_bytes())?;
        write_public(&cert_path, cert.cert_pem.as_bytes())?;
        chown_to(&key_path, owner)?;
        chown_to(&cert_path, owner)?;

        info!(cert = %req.name, cn = %req.cn, owner = %owner, "issued certificate");
        Ok(cert)
    }

    /// Load previously issued material for `name` from disk
    pub fn read_certificate(&self, name: &str) -> Result<Certificate> {
        let key_path = self.vars.cert_root_dir.join(format!("{}.key", name));
        let cert_path = self.vars.cert_root_dir.join(format!("{}.crt", name));
        Ok(Certificate {
            cert_pem: std::fs::read_to_string(&cert_path)?,
            key_pem: std::fs::read_to_string(&key_path)?,
        })
    }
}

/// Write a secret file with mode 0600
pub fn write_private(path: &Path, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

/// Write a public file with mode 0644
pub fn write_public(path: &Path, data: &[u8]) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, data)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Change file ownership to the named user when running as root
///
/// Non-root invocations (development, tests) keep the current owner; a
/// missing user downgrades to a warning the same way the process-user
/// lookup does for supervised processes.
pub fn chown_to(path: &Path, owner: &str) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    match nix::unistd::User::from_name(owner) {
        Ok(Some(user)) => {
            nix::unistd::chown(path, Some(user.uid), Some(user.gid))
                .map_err(|e| PkiError::Io(std::io::Error::other(e)))?;
        }
        Ok(None) => warn!(owner = %owner, path = %path.display(), "user not found, keeping current ownership"),
        Err(e) => warn!(owner = %owner, error = %e, "user lookup failed, keeping current ownership"),
    }
    Ok(())
}
