//! Node configuration and well-known filesystem layout
//!
//! Configuration is an explicit value constructed once (from YAML plus CLI
//! flags) and passed by ownership into the manager, supervisor, and join
//! protocol constructors. There is no global mutable configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::Result;

/// Default API server port
pub const DEFAULT_API_PORT: u16 = 6443;

/// Default port for the controller join API
///
/// This is where new nodes call in with a join token to fetch CA material
/// (controllers) or a bootstrap credential (workers).
pub const DEFAULT_JOIN_PORT: u16 = 9443;

/// Cluster configuration loaded from the YAML config file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    /// API server reachability
    pub api: ApiSpec,
    /// Storage engine selection and addressing
    pub storage: StorageSpec,
}

/// API server addressing
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ApiSpec {
    /// Local address the API server binds to
    pub address: String,
    /// Externally reachable address shared by all controllers, if any.
    /// When set, controllers run real leader election; when empty, a
    /// single-controller deployment is assumed.
    pub external_address: String,
    /// Extra subject alternative names for the server certificate
    pub sans: Vec<String>,
}

impl Default for ApiSpec {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            external_address: String::new(),
            sans: Vec::new(),
        }
    }
}

impl ApiSpec {
    /// URL clients use to reach the API server
    pub fn api_address_url(&self) -> String {
        let host = if self.external_address.is_empty() {
            &self.address
        } else {
            &self.external_address
        };
        format!("https://{}:{}", host, DEFAULT_API_PORT)
    }

    /// URL joining controllers use to reach the join API
    pub fn join_address_url(&self) -> String {
        let host = if self.external_address.is_empty() {
            &self.address
        } else {
            &self.external_address
        };
        format!("https://{}:{}", host, DEFAULT_JOIN_PORT)
    }

    /// All names the server certificate must be valid for
    pub fn all_sans(&self) -> Vec<String> {
        let mut sans = vec![
            "127.0.0.1".to_string(),
            "localhost".to_string(),
            self.address.clone(),
        ];
        if !self.external_address.is_empty() {
            sans.push(self.external_address.clone());
        }
        sans.extend(self.sans.iter().cloned());
        sans.dedup();
        sans
    }
}

/// Storage engine selection
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSpec {
    /// Storage backend type; only "etcd" is managed
    #[serde(rename = "type")]
    pub type_: String,
    /// Address this node advertises to storage peers
    pub peer_address: String,
}

impl Default for StorageSpec {
    fn default() -> Self {
        Self {
            type_: "etcd".to_string(),
            peer_address: "127.0.0.1".to_string(),
        }
    }
}

impl StorageSpec {
    /// Peer URL this node advertises to the rest of the storage cluster
    pub fn peer_url(&self) -> String {
        format!("https://{}:2380", self.peer_address)
    }
}

impl ClusterConfig {
    /// Load configuration from a YAML file, or defaults when `path` is None
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let cfg = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    Error::config(format!("failed to read config file {}: {}", p.display(), e))
                })?;
                serde_yaml::from_str(&content)
                    .map_err(|e| Error::config(format!("invalid config file: {}", e)))?
            }
            None => Self::default(),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration before any component touches it
    pub fn validate(&self) -> Result<()> {
        if self.api.address.is_empty() {
            return Err(Error::config("api.address must not be empty"));
        }
        if self.storage.type_ != "etcd" {
            return Err(Error::config(format!(
                "unsupported storage type: {}",
                self.storage.type_
            )));
        }
        if self.storage.peer_address.is_empty() {
            return Err(Error::config("storage.peerAddress must not be empty"));
        }
        Ok(())
    }
}

/// Well-known paths derived from the data directory
///
/// Directories are created early, with restrictive modes, before any
/// component runs.
#[derive(Clone, Debug)]
pub struct KeelVars {
    /// Root data directory
    pub data_dir: PathBuf,
    /// Control-plane certificates (CA, API server, admin)
    pub cert_root_dir: PathBuf,
    /// Storage engine certificates
    pub etcd_cert_dir: PathBuf,
    /// Storage engine database
    pub etcd_data_dir: PathBuf,
    /// Runtime state: pid files and per-process log sinks
    pub run_dir: PathBuf,
    /// Staged binaries for supervised processes
    pub bin_dir: PathBuf,
    /// Admin kubeconfig written once certificates exist
    pub admin_kubeconfig_path: PathBuf,
}

impl KeelVars {
    /// Derive the layout from a data directory
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            cert_root_dir: data_dir.join("pki"),
            etcd_cert_dir: data_dir.join("pki").join("etcd"),
            etcd_data_dir: data_dir.join("etcd"),
            run_dir: data_dir.join("run"),
            bin_dir: data_dir.join("bin"),
            admin_kubeconfig_path: data_dir.join("pki").join("admin.conf"),
            data_dir,
        }
    }

    /// Path to the cluster CA certificate
    pub fn ca_cert_path(&self) -> PathBuf {
        self.cert_root_dir.join("ca.crt")
    }

    /// Path to the cluster CA private key
    pub fn ca_key_path(&self) -> PathBuf {
        self.cert_root_dir.join("ca.key")
    }

    /// Whether this node already holds cluster CA material.
    ///
    /// Presence of both key and cert means the node has joined (or
    /// initialized) a cluster before, and the join protocol is skipped.
    pub fn has_ca_material(&self) -> bool {
        self.ca_key_path().exists() && self.ca_cert_path().exists()
    }

    /// Path to the join token registry shared between issuance and the
    /// join server
    pub fn token_registry_path(&self) -> PathBuf {
        self.data_dir.join("tokens.json")
    }

    /// Create all directories with their expected modes
    pub fn init_directories(&self) -> Result<()> {
        init_directory(&self.data_dir, 0o755)?;
        init_directory(&self.cert_root_dir, 0o751)?;
        init_directory(&self.etcd_cert_dir, 0o711)?;
        init_directory(&self.etcd_data_dir, 0o700)?;
        init_directory(&self.run_dir, 0o755)?;
        init_directory(&self.bin_dir, 0o755)?;
        Ok(())
    }
}

/// Create a directory (and parents) with the given POSIX mode
pub fn init_directory(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: A config file with only overrides inherits every default
    ///
    /// Operators typically set just the external address; everything else
    /// must come from defaults.
    #[test]
    fn story_partial_config_gets_defaults() {
        let cfg: ClusterConfig = serde_yaml::from_str(
            r#"
api:
  externalAddress: 10.0.0.5
"#,
        )
        .unwrap();

        assert_eq!(cfg.api.external_address, "10.0.0.5");
        assert_eq!(cfg.api.address, "127.0.0.1");
        assert_eq!(cfg.storage.type_, "etcd");
        assert!(cfg.validate().is_ok());
    }

    /// Story: Validation rejects storage backends we do not manage
    #[test]
    fn story_unknown_storage_type_rejected() {
        let cfg: ClusterConfig = serde_yaml::from_str(
            r#"
storage:
  type: raft
"#,
        )
        .unwrap();

        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unsupported storage type"));
    }

    /// Story: The external address decides which URL peers are given
    #[test]
    fn story_external_address_wins_for_urls() {
        let mut api = ApiSpec::default();
        api.address = "192.168.1.10".to_string();
        assert_eq!(api.api_address_url(), "https://192.168.1.10:6443");
        assert_eq!(api.join_address_url(), "https://192.168.1.10:9443");

        api.external_address = "lb.example.com".to_string();
        assert_eq!(api.api_address_url(), "https://lb.example.com:6443");
        assert_eq!(api.join_address_url(), "https://lb.example.com:9443");
        assert!(api.all_sans().contains(&"lb.example.com".to_string()));
    }

    /// Story: The data directory fans out into the well-known layout
    #[test]
    fn story_vars_derive_well_known_paths() {
        let vars = KeelVars::new("/var/lib/keel");

        assert_eq!(vars.ca_cert_path(), PathBuf::from("/var/lib/keel/pki/ca.crt"));
        assert_eq!(vars.ca_key_path(), PathBuf::from("/var/lib/keel/pki/ca.key"));
        assert!(vars.etcd_data_dir.ends_with("etcd"));
        assert!(!vars.has_ca_material());
    }

    /// Story: Directory initialization applies restrictive modes
    #[test]
    fn story_directories_created_with_modes() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let vars = KeelVars::new(tmp.path().join("data"));
        vars.init_directories().unwrap();

        let mode = std::fs::metadata(&vars.etcd_data_dir)
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700, "etcd data dir must be private");
    }
}
