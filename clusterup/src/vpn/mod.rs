//! VPN mesh bring-up: headscale coordination server and tailscale joiner.
//!
//! Two independent step groups. The server step consumes the certificate
//! step's output slots to configure TLS, and creates the default
//! access-control policy and the default cluster principal on first install.

pub mod acl;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::InstallerConfig;
use crate::errors::{InstallerError, InstallerResult};
use crate::fetch;
use crate::proc::{CommandRunner, CommandSpec, SharedRunner};
use crate::sequencer::{InstallCtx, ProvisionStep, Readiness};
use crate::system::{PackageManager, ServiceManager};

pub const COORDINATOR_UNIT: &str = "headscale";
pub const JOINER_UNIT: &str = "tailscaled";

/// Defaults the headscale package ships with, rewritten on install.
const DEFAULT_SERVER_URL: &str = "server_url: http://127.0.0.1:8080";
const DEFAULT_LISTEN_ADDR: &str = "listen_addr: 127.0.0.1:8080";
const DEFAULT_ACL_PATH: &str = "acl_policy_path: \"\"";
const DEFAULT_TLS_CERT: &str = "tls_cert_path: \"\"";
const DEFAULT_TLS_KEY: &str = "tls_key_path: \"\"";

/// Rewrite the packaged coordination-server config for this host: public
/// server URL, wildcard listen address, ACL policy path, and TLS material.
pub fn rewrite_coordinator_config(
    packaged: &str,
    host_url: &str,
    vpn_port: u16,
    acl_path: &Path,
    cert: &Path,
    key: &Path,
) -> String {
    packaged
        .replace(
            DEFAULT_SERVER_URL,
            &format!("server_url: https://{host_url}:{vpn_port}"),
        )
        .replace(
            DEFAULT_LISTEN_ADDR,
            &format!("listen_addr: 0.0.0.0:{vpn_port}"),
        )
        .replace(
            DEFAULT_ACL_PATH,
            &format!("acl_policy_path: {}", acl_path.display()),
        )
        .replace(
            DEFAULT_TLS_CERT,
            &format!("tls_cert_path: {}", cert.display()),
        )
        .replace(DEFAULT_TLS_KEY, &format!("tls_key_path: {}", key.display()))
}

/// Create a control-plane API key via the coordination server CLI.
/// The key is the last line of the command's output.
pub async fn create_api_key(runner: &dyn CommandRunner) -> InstallerResult<String> {
    let output = runner
        .run_checked(&CommandSpec::new("headscale").args(["apikeys", "create"]))
        .await?;
    output
        .last_stdout_line()
        .map(str::to_string)
        .ok_or_else(|| InstallerError::Internal("apikeys create produced no output".to_string()))
}

/// Create a pre-authorization key for `user`; nodes join the mesh with it.
pub async fn create_preauth_key(
    runner: &dyn CommandRunner,
    user: &str,
) -> InstallerResult<String> {
    let output = runner
        .run_checked(&CommandSpec::new("headscale").args(["preauthkeys", "create", "-u", user]))
        .await?;
    output
        .last_stdout_line()
        .map(str::to_string)
        .ok_or_else(|| {
            InstallerError::Internal("preauthkeys create produced no output".to_string())
        })
}

/// Filesystem destinations for the joiner agent bundle.
#[derive(Debug, Clone)]
pub struct JoinerLayout {
    pub cli_bin: PathBuf,
    pub daemon_bin: PathBuf,
    pub unit_file: PathBuf,
    pub defaults_file: PathBuf,
}

impl Default for JoinerLayout {
    fn default() -> Self {
        Self {
            cli_bin: PathBuf::from("/usr/bin/tailscale"),
            daemon_bin: PathBuf::from("/usr/sbin/tailscaled"),
            unit_file: PathBuf::from("/etc/systemd/system/tailscaled.service"),
            defaults_file: PathBuf::from("/etc/default/tailscaled"),
        }
    }
}

/// Unpack the static joiner tarball and install its binaries and systemd
/// units into `layout`.
pub fn install_joiner_bundle(
    tarball: &Path,
    version: &str,
    layout: &JoinerLayout,
) -> InstallerResult<()> {
    let staging = tempfile::tempdir()?;
    let file = std::fs::File::open(tarball)?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    archive.unpack(staging.path())?;

    let bundle = staging.path().join(format!("tailscale_{version}_amd64"));

    let copies = [
        (bundle.join("tailscale"), &layout.cli_bin, 0o755),
        (bundle.join("tailscaled"), &layout.daemon_bin, 0o755),
        (
            bundle.join("systemd").join("tailscaled.service"),
            &layout.unit_file,
            0o644,
        ),
        (
            bundle.join("systemd").join("tailscaled.defaults"),
            &layout.defaults_file,
            0o644,
        ),
    ];

    for (src, dst, mode) in copies {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, dst)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dst, std::fs::Permissions::from_mode(mode))?;
        }
        #[cfg(not(unix))]
        let _ = mode;
    }

    Ok(())
}

/// Step: install and start the coordination server.
///
/// Precondition: the service is already active. Action: download and install
/// the package, write the default ACL policy, rewrite the packaged config
/// with this host's URL and the issued TLS material, start the service, and
/// create the default cluster principal. Readiness: the unit reports active.
pub struct InstallCoordinatorStep {
    runner: SharedRunner,
    http: reqwest::Client,
    systemd: ServiceManager,
    apt: PackageManager,
    readiness: Readiness,
}

impl InstallCoordinatorStep {
    pub fn new(runner: SharedRunner, http: reqwest::Client, config: &InstallerConfig) -> Self {
        Self {
            systemd: ServiceManager::new(runner.clone()),
            apt: PackageManager::new(runner.clone()),
            runner,
            http,
            readiness: Readiness::new(config.service_startup_timeout, Duration::from_secs(1)),
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for InstallCoordinatorStep {
    fn name(&self) -> &str {
        "install-vpn-coordinator"
    }

    async fn precondition(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.systemd.is_active(COORDINATOR_UNIT).await
    }

    async fn check_dependencies(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        ctx.lock().await.require_cert_paths().map(|_| ())
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let (config, certs) = {
            let ctx = ctx.lock().await;
            (ctx.config.clone(), ctx.require_cert_paths()?)
        };

        let staging = tempfile::tempdir()?;
        let deb = staging.path().join("headscale.deb");
        let url = config.package_url("headscale", &config.headscale_version);
        fetch::download(&self.http, &url, Some(&config.params.access_key), &deb).await?;

        self.apt.install_deb(&deb).await?;
        self.systemd.enable(COORDINATOR_UNIT).await?;

        tracing::info!(path = %config.paths.headscale_acl.display(), "writing default ACL policy");
        if let Some(parent) = config.paths.headscale_acl.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &config.paths.headscale_acl,
            acl::default_policy(&config.vpn_user),
        )?;

        let packaged = std::fs::read_to_string(&config.paths.headscale_config)?;
        let rewritten = rewrite_coordinator_config(
            &packaged,
            &config.params.host_url,
            config.vpn_port,
            &config.paths.headscale_acl,
            &certs.cert,
            &certs.key,
        );
        std::fs::write(&config.paths.headscale_config, rewritten)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &config.paths.headscale_config,
                std::fs::Permissions::from_mode(0o600),
            )?;
        }

        self.systemd.start(COORDINATOR_UNIT).await?;

        self.runner
            .run_checked(
                &CommandSpec::new("headscale").args(["users", "create", &config.vpn_user]),
            )
            .await?;
        Ok(())
    }

    fn readiness(&self) -> Option<Readiness> {
        Some(self.readiness)
    }

    async fn ready(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.systemd.is_active(COORDINATOR_UNIT).await
    }
}

/// Step: install and start the joiner agent.
pub struct InstallJoinerStep {
    http: reqwest::Client,
    systemd: ServiceManager,
    layout: JoinerLayout,
    readiness: Readiness,
}

impl InstallJoinerStep {
    pub fn new(runner: SharedRunner, http: reqwest::Client, config: &InstallerConfig) -> Self {
        Self {
            systemd: ServiceManager::new(runner),
            http,
            layout: JoinerLayout::default(),
            readiness: Readiness::new(config.service_startup_timeout, Duration::from_secs(1)),
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for InstallJoinerStep {
    fn name(&self) -> &str {
        "install-vpn-joiner"
    }

    async fn precondition(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.systemd.is_active(JOINER_UNIT).await
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let config = ctx.lock().await.config.clone();

        // Some base images ship the unit masked.
        self.systemd.unmask(JOINER_UNIT).await?;

        let staging = tempfile::tempdir()?;
        let tarball = staging.path().join("tailscale.tgz");
        fetch::download(&self.http, &config.tailscale_tarball_url, None, &tarball).await?;

        install_joiner_bundle(&tarball, &config.tailscale_version, &self.layout)?;

        self.systemd.daemon_reload().await?;
        self.systemd.enable(JOINER_UNIT).await?;
        self.systemd.start(JOINER_UNIT).await?;
        Ok(())
    }

    fn readiness(&self) -> Option<Readiness> {
        Some(self.readiness)
    }

    async fn ready(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.systemd.is_active(JOINER_UNIT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::test_support::RecordingRunner;
    use std::sync::Arc;

    const PACKAGED_CONFIG: &str = "\
server_url: http://127.0.0.1:8080
listen_addr: 127.0.0.1:8080
acl_policy_path: \"\"
tls_cert_path: \"\"
tls_key_path: \"\"
noise:
  private_key_path: /var/lib/headscale/noise_private.key
";

    #[test]
    fn config_rewrite_replaces_every_default() {
        let rewritten = rewrite_coordinator_config(
            PACKAGED_CONFIG,
            "cluster.example.com",
            30000,
            Path::new("/etc/headscale/acl.json"),
            Path::new("/usr/local/src/certs/certificates/cluster.example.com.crt"),
            Path::new("/usr/local/src/certs/certificates/cluster.example.com.key"),
        );

        assert!(rewritten.contains("server_url: https://cluster.example.com:30000"));
        assert!(rewritten.contains("listen_addr: 0.0.0.0:30000"));
        assert!(rewritten.contains("acl_policy_path: /etc/headscale/acl.json"));
        assert!(rewritten.contains(
            "tls_cert_path: /usr/local/src/certs/certificates/cluster.example.com.crt"
        ));
        assert!(rewritten.contains(
            "tls_key_path: /usr/local/src/certs/certificates/cluster.example.com.key"
        ));
        // Untouched lines survive.
        assert!(rewritten.contains("noise_private.key"));
        assert!(!rewritten.contains("127.0.0.1:8080"));
    }

    #[tokio::test]
    async fn generated_keys_come_from_the_last_output_line() {
        let runner = RecordingRunner::with_responses(vec![(
            0,
            "2024/01/01 00:00:00 some log line\nAPIKEY-abcdef\n".to_string(),
        )]);

        let key = create_api_key(&runner).await.unwrap();
        assert_eq!(key, "APIKEY-abcdef");

        let calls = runner.recorded();
        assert_eq!(calls[0].program, "headscale");
        assert_eq!(calls[0].args, vec!["apikeys", "create"]);
    }

    #[tokio::test]
    async fn preauth_key_is_scoped_to_the_cluster_user() {
        let runner = RecordingRunner::with_responses(vec![(0, "PREAUTH-123\n".to_string())]);

        let key = create_preauth_key(&runner, "cluster-user").await.unwrap();
        assert_eq!(key, "PREAUTH-123");
        assert_eq!(
            runner.recorded()[0].args,
            vec!["preauthkeys", "create", "-u", "cluster-user"]
        );
    }

    #[tokio::test]
    async fn empty_key_output_is_an_error() {
        let runner = RecordingRunner::with_responses(vec![(0, "\n\n".to_string())]);
        assert!(create_api_key(&runner).await.is_err());
    }

    #[test]
    fn joiner_bundle_lands_in_layout_destinations() {
        let src = tempfile::tempdir().unwrap();
        let bundle = src.path().join("tailscale_1.56.1_amd64");
        std::fs::create_dir_all(bundle.join("systemd")).unwrap();
        std::fs::write(bundle.join("tailscale"), b"cli").unwrap();
        std::fs::write(bundle.join("tailscaled"), b"daemon").unwrap();
        std::fs::write(bundle.join("systemd/tailscaled.service"), b"[Unit]").unwrap();
        std::fs::write(bundle.join("systemd/tailscaled.defaults"), b"FLAGS=").unwrap();

        let tarball = src.path().join("tailscale.tgz");
        let file = std::fs::File::create(&tarball).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        builder
            .append_dir_all("tailscale_1.56.1_amd64", &bundle)
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dst = tempfile::tempdir().unwrap();
        let layout = JoinerLayout {
            cli_bin: dst.path().join("bin/tailscale"),
            daemon_bin: dst.path().join("sbin/tailscaled"),
            unit_file: dst.path().join("systemd/tailscaled.service"),
            defaults_file: dst.path().join("default/tailscaled"),
        };

        install_joiner_bundle(&tarball, "1.56.1", &layout).unwrap();

        assert_eq!(std::fs::read(&layout.cli_bin).unwrap(), b"cli");
        assert_eq!(std::fs::read(&layout.daemon_bin).unwrap(), b"daemon");
        assert_eq!(std::fs::read(&layout.unit_file).unwrap(), b"[Unit]");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&layout.cli_bin)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
