//! Installer configuration.
//!
//! All paths, versions, retry budgets, and timeouts live here as an explicit,
//! immutable value constructed once per invocation. Nothing in the installer
//! reads process-wide mutable state.

use std::path::PathBuf;
use std::time::Duration;

/// Credentials and identity supplied on the command line.
#[derive(Debug, Clone)]
pub struct InstallParams {
    /// Public DNS name of this host; also the certificate domain.
    pub host_url: String,
    /// ACME contact email.
    pub email: String,
    /// Container registry the cluster pulls private images from.
    pub registry_url: String,
    /// Token used both for the package registry and the image registry.
    pub access_key: String,
    /// GoDaddy DNS API key for the DNS-01 challenge.
    pub godaddy_access_key: String,
    /// GoDaddy DNS API secret for the DNS-01 challenge.
    pub godaddy_secret: String,
}

/// Filesystem locations the installer reads and writes.
#[derive(Debug, Clone)]
pub struct InstallerPaths {
    /// Directory the ACME client writes freshly issued material into.
    pub cert_staging_dir: PathBuf,
    /// Directory services load certificates from.
    pub cert_serving_dir: PathBuf,
    /// Persisted renewal request, consumed by `renew-certs`.
    pub renewal_metadata_file: PathBuf,
    /// lego binary.
    pub lego_binary: PathBuf,
    /// Coordination server config installed by its package.
    pub headscale_config: PathBuf,
    /// Generated default access-control policy.
    pub headscale_acl: PathBuf,
    /// Cron drop-in that triggers unattended renewal.
    pub cron_file: PathBuf,
    /// k3s kubeconfig.
    pub kubeconfig: PathBuf,
    /// k3s agent join token, written by the k3s installer.
    pub node_token: PathBuf,
    /// NFS export directory backing the storage provisioner.
    pub storage_export_dir: PathBuf,
    /// NFS exports table.
    pub exports_file: PathBuf,
    /// Environment file consumed by the node-scheduler service.
    pub scheduler_env_file: PathBuf,
}

impl Default for InstallerPaths {
    fn default() -> Self {
        Self {
            cert_staging_dir: PathBuf::from("/usr/local/src/orig_certs"),
            cert_serving_dir: PathBuf::from("/usr/local/src/certs"),
            renewal_metadata_file: PathBuf::from("/usr/local/src/orig_certs/renewal_details.json"),
            lego_binary: PathBuf::from("/usr/local/bin/lego"),
            headscale_config: PathBuf::from("/etc/headscale/config.yaml"),
            headscale_acl: PathBuf::from("/etc/headscale/acl.json"),
            cron_file: PathBuf::from("/etc/cron.d/clusterup-renew"),
            kubeconfig: PathBuf::from("/etc/rancher/k3s/k3s.yaml"),
            node_token: PathBuf::from("/var/lib/rancher/k3s/server/agent-token"),
            storage_export_dir: PathBuf::from("/var/share-storage"),
            exports_file: PathBuf::from("/etc/exports"),
            scheduler_env_file: PathBuf::from("/etc/clusterup-scheduler/env.cfg"),
        }
    }
}

/// Immutable installer configuration, passed into the sequencer at
/// construction time.
#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub params: InstallParams,
    pub paths: InstallerPaths,

    /// Port the VPN coordination server listens on.
    pub vpn_port: u16,
    /// Namespace owning cluster-level secrets and add-ons.
    pub cluster_namespace: String,
    /// Default VPN principal that owns joined nodes.
    pub vpn_user: String,

    /// Versions of the packaged components.
    pub headscale_version: String,
    pub tailscale_version: String,
    pub k3s_version: String,
    pub scheduler_version: String,

    /// Base URL of the generic package registry the custom debs live in.
    pub package_base_url: String,
    /// Static tailscale release tarball.
    pub tailscale_tarball_url: String,
    /// k3s installer script.
    pub k3s_installer_url: String,

    /// Attempts per certificate issuance/renewal.
    pub cert_retry_budget: u32,
    /// DNS propagation timeout handed to the ACME client, in seconds.
    pub dns_propagation_timeout_secs: u64,
    /// Upper bound on waiting for the metrics capability after k3s install.
    pub cluster_startup_timeout: Duration,
    /// Upper bound on waiting for the dashboard endpoint.
    pub dashboard_startup_timeout: Duration,
    /// Upper bound on waiting for a systemd unit to report active.
    pub service_startup_timeout: Duration,
}

impl InstallerConfig {
    pub fn new(params: InstallParams) -> Self {
        Self {
            params,
            paths: InstallerPaths::default(),
            vpn_port: 30000,
            cluster_namespace: "clusterup-system".to_string(),
            vpn_user: "cluster-user".to_string(),
            headscale_version: "1.0.0".to_string(),
            tailscale_version: "1.56.1".to_string(),
            k3s_version: "v1.27.9+k3s1".to_string(),
            scheduler_version: "1.0.0".to_string(),
            package_base_url: "https://gitlab.com/api/v4/projects/54080196/packages/generic"
                .to_string(),
            tailscale_tarball_url: "https://pkgs.tailscale.com/stable/tailscale_1.56.1_amd64.tgz"
                .to_string(),
            k3s_installer_url: "https://get.k3s.io".to_string(),
            cert_retry_budget: 5,
            dns_propagation_timeout_secs: 600,
            cluster_startup_timeout: Duration::from_secs(600),
            dashboard_startup_timeout: Duration::from_secs(600),
            service_startup_timeout: Duration::from_secs(60),
        }
    }

    /// Paths of the cert/key pair at the serving location for our domain.
    pub fn serving_cert_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.paths.cert_serving_dir.join("certificates");
        (
            dir.join(format!("{}.crt", self.params.host_url)),
            dir.join(format!("{}.key", self.params.host_url)),
        )
    }

    /// URL of a custom-built deb in the generic package registry.
    pub fn package_url(&self, name: &str, version: &str) -> String {
        format!(
            "{}/{name}/{version}/{name}-{version}-amd64.deb",
            self.package_base_url
        )
    }

    /// Control server URL nodes use when joining the VPN.
    pub fn vpn_server_url(&self) -> String {
        format!("https://{}:{}", self.params.host_url, self.vpn_port)
    }

    pub fn dashboard_url(&self) -> String {
        format!("https://dashboard.{}", self.params.host_url)
    }
}
