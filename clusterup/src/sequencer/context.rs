//! Shared installation context.
//!
//! Holds the immutable configuration plus the named output slots steps
//! populate for later steps (certificate paths, VPN keys, generated
//! credentials). Slots are write-once per run; readers fail with a
//! missing-output error when the producing step has not run.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::InstallerConfig;
use crate::errors::{InstallerError, InstallerResult};

/// Certificate/key pair at the serving location, produced by the
/// certificate issuance step.
#[derive(Debug, Clone)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Shared context for one sequencer run.
pub struct InstallContext {
    pub config: InstallerConfig,

    // Output slots, in production order.
    pub cert_paths: Option<CertPaths>,
    /// Control-plane API key, stored in the cluster secret for later use.
    pub vpn_api_key: Option<String>,
    /// Pre-authorization key nodes join the mesh with.
    pub vpn_preauth_key: Option<String>,
    pub dashboard_password: Option<String>,
    pub cache_password: Option<String>,
    pub metrics_db_user: Option<String>,
    pub metrics_db_password: Option<String>,
}

pub type InstallCtx = Arc<Mutex<InstallContext>>;

impl InstallContext {
    pub fn new(config: InstallerConfig) -> Self {
        Self {
            config,
            cert_paths: None,
            vpn_api_key: None,
            vpn_preauth_key: None,
            dashboard_password: None,
            cache_password: None,
            metrics_db_user: None,
            metrics_db_password: None,
        }
    }

    pub fn shared(config: InstallerConfig) -> InstallCtx {
        Arc::new(Mutex::new(Self::new(config)))
    }

    pub fn require_cert_paths(&self) -> InstallerResult<CertPaths> {
        self.cert_paths
            .clone()
            .ok_or_else(|| InstallerError::MissingOutput("certificate issuance".to_string()))
    }

    pub fn require_vpn_api_key(&self) -> InstallerResult<String> {
        self.vpn_api_key
            .clone()
            .ok_or_else(|| InstallerError::MissingOutput("control-plane bootstrap".to_string()))
    }
}
