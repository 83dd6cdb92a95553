//! Keel - control-plane bootstrap and orchestration engine
//!
//! Keel turns a bare host into a cluster controller: it establishes the
//! cluster's trust material, runs the storage engine under supervision,
//! serves the join API that other nodes bootstrap through, and elects a
//! single leader for cluster-wide housekeeping.
//!
//! # Architecture
//!
//! Everything the node runs is a [`component::Component`] registered
//! with a [`component::Manager`]. Sync components (trust establishment,
//! certificates) complete initialization in order before any async
//! component starts; async components then run concurrently and fail
//! independently. Shutdown walks the registry in reverse.
//!
//! # Modules
//!
//! - [`component`] - Component trait and lifecycle manager
//! - [`supervisor`] - External process supervision with bounded restart
//! - [`leader`] - Lease-based leader election
//! - [`token`] - Join token issuance and trust pinning
//! - [`join`] - Join protocol client and server
//! - [`pki`] - Cluster CA and certificate issuance
//! - [`components`] - Concrete node components
//! - [`config`] - Cluster configuration and filesystem layout
//! - [`kubeconfig`] - Bootstrap credential rendering
//! - [`error`] - Error types

pub mod component;
pub mod components;
pub mod config;
pub mod error;
pub mod join;
pub mod kubeconfig;
pub mod leader;
pub mod pki;
pub mod supervisor;
pub mod token;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
