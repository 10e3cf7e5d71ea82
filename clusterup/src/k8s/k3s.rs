//! k3s bring-up: storage prerequisite, distribution install over the VPN,
//! and the cluster secrets later nodes bootstrap from.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::InstallerConfig;
use crate::errors::InstallerResult;
use crate::fetch;
use crate::proc::{CommandSpec, SharedRunner, run_shell_script};
use crate::sequencer::{InstallCtx, ProvisionStep, Readiness};
use crate::system::{PackageManager, ServiceManager, primary_interface_ip};
use crate::vpn;

use super::kube::{Kubectl, node_token, remote_kubeconfig_b64};

const NFS_UNIT: &str = "nfs-kernel-server";

/// Step: NFS server backing the storage provisioner.
pub struct InstallStorageServerStep {
    runner: SharedRunner,
    systemd: ServiceManager,
    apt: PackageManager,
}

impl InstallStorageServerStep {
    pub fn new(runner: SharedRunner) -> Self {
        Self {
            systemd: ServiceManager::new(runner.clone()),
            apt: PackageManager::new(runner.clone()),
            runner,
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for InstallStorageServerStep {
    fn name(&self) -> &str {
        "install-storage-server"
    }

    async fn precondition(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.systemd.is_active(NFS_UNIT).await
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let config = ctx.lock().await.config.clone();

        self.apt.update().await?;
        self.apt.install(NFS_UNIT).await?;
        self.systemd.start(NFS_UNIT).await?;

        std::fs::create_dir_all(&config.paths.storage_export_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            // The provisioner creates per-claim directories as arbitrary uids.
            std::fs::set_permissions(
                &config.paths.storage_export_dir,
                std::fs::Permissions::from_mode(0o777),
            )?;
        }

        std::fs::write(
            &config.paths.exports_file,
            format!(
                "{} *(rw,sync,no_subtree_check,no_root_squash)\n",
                config.paths.storage_export_dir.display()
            ),
        )?;

        self.runner
            .run_checked(&CommandSpec::new("exportfs").arg("-a"))
            .await?;
        Ok(())
    }
}

/// Step: install the k3s distribution, joined to the VPN mesh.
///
/// Precondition: the control plane already responds and its metrics
/// capability is queryable. Action: mint a control-plane API key and a
/// pre-authorization key, then run the distribution installer script with
/// the VPN join parameters. Readiness: the metrics capability becomes
/// queryable.
pub struct BootstrapControlPlaneStep {
    runner: SharedRunner,
    http: reqwest::Client,
    kubectl: Kubectl,
    readiness: Readiness,
}

impl BootstrapControlPlaneStep {
    pub fn new(runner: SharedRunner, http: reqwest::Client, config: &InstallerConfig) -> Self {
        Self {
            kubectl: Kubectl::new(runner.clone(), config.paths.kubeconfig.clone()),
            runner,
            http,
            readiness: Readiness::new(config.cluster_startup_timeout, Duration::from_millis(500)),
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for BootstrapControlPlaneStep {
    fn name(&self) -> &str {
        "bootstrap-control-plane"
    }

    async fn precondition(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        Ok(self.kubectl.client_present().await? && self.kubectl.metrics_available().await?)
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let config = ctx.lock().await.config.clone();

        let api_key = vpn::create_api_key(self.runner.as_ref()).await?;
        let preauth_key =
            vpn::create_preauth_key(self.runner.as_ref(), &config.vpn_user).await?;
        {
            let mut ctx = ctx.lock().await;
            ctx.vpn_api_key = Some(api_key);
            ctx.vpn_preauth_key = Some(preauth_key.clone());
        }

        // The agent must not already hold a mesh session when k3s brings up
        // its own; ignore failure when the agent was never up.
        let _ = self
            .runner
            .run_ok(&CommandSpec::new("tailscale").arg("down"))
            .await;

        let external_ip = primary_interface_ip()?;

        let staging = tempfile::tempdir()?;
        let script = staging.path().join("k3s-install.sh");
        fetch::download(&self.http, &config.k3s_installer_url, None, &script).await?;

        let server_exec = format!(
            "server --disable=servicelb,traefik,local-storage --disable-scheduler \
             --node-label clusterup.persistent_node=True \
             --node-external-ip={external_ip} --flannel-external-ip \
             --cluster-cidr=10.42.0.0/16 --service-cidr=10.43.0.0/16 \
             --vpn-auth=name=tailscale,joinKey={preauth_key},controlServerURL={}",
            config.vpn_server_url()
        );

        let env = [
            (
                "K3S_URL".to_string(),
                format!("https://{}:6443", config.params.host_url),
            ),
            ("INSTALL_K3S_VERSION".to_string(), config.k3s_version.clone()),
            ("INSTALL_K3S_EXEC".to_string(), server_exec),
        ]
        .into_iter()
        .collect();

        run_shell_script(self.runner.as_ref(), &script, env).await?;
        Ok(())
    }

    fn readiness(&self) -> Option<Readiness> {
        Some(self.readiness)
    }

    async fn ready(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.kubectl.metrics_available().await
    }
}

/// Step: namespace plus the secrets worker nodes and in-cluster components
/// bootstrap from.
///
/// Precondition: the `server-details` secret already exists, so a re-run
/// against a provisioned host skips this step even though the bootstrap
/// step (its key producer) was also skipped.
pub struct CreateClusterSecretsStep {
    kubectl: Kubectl,
}

impl CreateClusterSecretsStep {
    pub fn new(runner: SharedRunner, config: &InstallerConfig) -> Self {
        Self {
            kubectl: Kubectl::new(runner, config.paths.kubeconfig.clone()),
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for CreateClusterSecretsStep {
    fn name(&self) -> &str {
        "create-cluster-secrets"
    }

    async fn precondition(&self, ctx: &InstallCtx) -> InstallerResult<bool> {
        let ns = ctx.lock().await.config.cluster_namespace.clone();
        self.kubectl.secret_exists(&ns, "server-details").await
    }

    async fn check_dependencies(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        ctx.lock().await.require_vpn_api_key().map(|_| ())
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let (config, api_key) = {
            let ctx = ctx.lock().await;
            (ctx.config.clone(), ctx.require_vpn_api_key()?)
        };

        let ns = &config.cluster_namespace;
        self.kubectl.create_namespace(ns).await?;

        let token = node_token(&config.paths.node_token)?;
        let kubeconfig =
            remote_kubeconfig_b64(&config.paths.kubeconfig, &config.params.host_url)?;

        self.kubectl
            .create_opaque_secret(
                ns,
                "server-details",
                &[
                    ("vpn-token", api_key.as_str()),
                    ("host-source-dns-name", config.params.host_url.as_str()),
                    ("k3s-node-token", token.as_str()),
                    ("kubernetes-config-file", kubeconfig.as_str()),
                ],
            )
            .await?;

        self.kubectl
            .create_image_pull_secret(
                ns,
                "registry-credentials",
                &config.params.registry_url,
                "usr",
                &config.params.access_key,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstallParams, InstallerConfig};
    use crate::proc::test_support::RecordingRunner;
    use crate::sequencer::InstallContext;
    use std::sync::Arc;

    fn config() -> InstallerConfig {
        InstallerConfig::new(InstallParams {
            host_url: "cluster.example.com".to_string(),
            email: "ops@example.com".to_string(),
            registry_url: "registry.example.com".to_string(),
            access_key: "token".to_string(),
            godaddy_access_key: "gd-key".to_string(),
            godaddy_secret: "gd-secret".to_string(),
        })
    }

    #[tokio::test]
    async fn storage_step_writes_exports_and_reexports() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config();
        config.paths.storage_export_dir = dir.path().join("share-storage");
        config.paths.exports_file = dir.path().join("exports");

        let runner = Arc::new(RecordingRunner::default());
        let step = InstallStorageServerStep::new(runner.clone());
        let ctx = InstallContext::shared(config.clone());

        step.action(&ctx).await.unwrap();

        let exports = std::fs::read_to_string(&config.paths.exports_file).unwrap();
        assert!(exports.contains("*(rw,sync,no_subtree_check,no_root_squash)"));
        assert!(config.paths.storage_export_dir.is_dir());

        let programs: Vec<String> = runner
            .recorded()
            .into_iter()
            .map(|spec| spec.program)
            .collect();
        assert_eq!(programs, vec!["apt-get", "apt-get", "systemctl", "exportfs"]);
    }

    #[tokio::test]
    async fn existing_server_details_secret_satisfies_the_secrets_step() {
        let runner = Arc::new(RecordingRunner::default());
        let step = CreateClusterSecretsStep::new(runner.clone(), &config());
        let ctx = InstallContext::shared(config());

        assert!(step.precondition(&ctx).await.unwrap());

        let calls = runner.recorded();
        assert_eq!(
            calls[0].args,
            vec!["get", "secret", "server-details", "--namespace", "clusterup-system"]
        );
    }

    #[tokio::test]
    async fn missing_server_details_secret_leaves_the_step_unsatisfied() {
        let runner = Arc::new(RecordingRunner::with_responses(vec![(1, String::new())]));
        let step = CreateClusterSecretsStep::new(runner, &config());
        let ctx = InstallContext::shared(config());

        assert!(!step.precondition(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn secrets_step_requires_the_bootstrap_outputs() {
        let runner = Arc::new(RecordingRunner::default());
        let step = CreateClusterSecretsStep::new(runner, &config());
        let ctx = InstallContext::shared(config());

        let err = step.check_dependencies(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("must run first"));
    }
}
