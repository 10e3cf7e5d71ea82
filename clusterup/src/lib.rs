//! clusterup: single-host bootstrap installer for a self-hosted cluster
//! stack.
//!
//! The installer turns a fresh Linux host into a cluster node: wildcard
//! certificates via DNS validation, a WireGuard-based VPN mesh
//! (coordinator plus local agent), the k3s distribution joined over that
//! mesh, and a fixed set of in-cluster add-ons. Everything runs through a
//! provisioning sequencer whose steps skip themselves when already
//! satisfied, so a failed run can simply be re-run.

pub mod certs;
pub mod config;
pub mod errors;
pub mod fetch;
pub mod installer;
pub mod k8s;
pub mod proc;
pub mod sequencer;
pub mod system;
pub mod vpn;

pub use config::{InstallParams, InstallerConfig};
pub use errors::{InstallerError, InstallerResult};
pub use installer::Installer;
pub use sequencer::{SequenceReport, StepStatus};
