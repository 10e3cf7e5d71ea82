//! Custom node-scheduler service install.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::InstallerConfig;
use crate::errors::InstallerResult;
use crate::fetch;
use crate::proc::SharedRunner;
use crate::sequencer::{InstallCtx, ProvisionStep, Readiness};
use crate::system::{PackageManager, ServiceManager};

pub const SCHEDULER_UNIT: &str = "clusterup-scheduler";

/// Environment file the scheduler service reads at startup.
pub fn scheduler_env(kubeconfig: &std::path::Path, host_url: &str) -> String {
    format!(
        "KUBECONFIG={}\nCLUSTER_ACCESS_URL=https://cluster-access.{host_url}\n",
        kubeconfig.display()
    )
}

/// Step: install and start the node scheduler.
///
/// The cluster runs with the distribution scheduler disabled; this service
/// takes over pod placement, reading cluster access details from its
/// environment file.
pub struct InstallSchedulerStep {
    http: reqwest::Client,
    systemd: ServiceManager,
    apt: PackageManager,
    readiness: Readiness,
}

impl InstallSchedulerStep {
    pub fn new(runner: SharedRunner, http: reqwest::Client, config: &InstallerConfig) -> Self {
        Self {
            systemd: ServiceManager::new(runner.clone()),
            apt: PackageManager::new(runner),
            http,
            readiness: Readiness::new(config.service_startup_timeout, Duration::from_secs(1)),
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for InstallSchedulerStep {
    fn name(&self) -> &str {
        "install-node-scheduler"
    }

    async fn precondition(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.systemd.is_active(SCHEDULER_UNIT).await
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let config = ctx.lock().await.config.clone();

        let staging = tempfile::tempdir()?;
        let deb = staging.path().join("scheduler.deb");
        let url = config.package_url(SCHEDULER_UNIT, &config.scheduler_version);
        fetch::download(&self.http, &url, Some(&config.params.access_key), &deb).await?;

        self.apt.install_deb(&deb).await?;
        self.systemd.enable(SCHEDULER_UNIT).await?;

        if let Some(parent) = config.paths.scheduler_env_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            &config.paths.scheduler_env_file,
            scheduler_env(&config.paths.kubeconfig, &config.params.host_url),
        )?;

        self.systemd.start(SCHEDULER_UNIT).await?;
        Ok(())
    }

    fn readiness(&self) -> Option<Readiness> {
        Some(self.readiness)
    }

    async fn ready(&self, _ctx: &InstallCtx) -> InstallerResult<bool> {
        self.systemd.is_active(SCHEDULER_UNIT).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn env_file_points_scheduler_at_cluster_access() {
        let env = scheduler_env(Path::new("/etc/rancher/k3s/k3s.yaml"), "cluster.example.com");
        assert_eq!(
            env,
            "KUBECONFIG=/etc/rancher/k3s/k3s.yaml\nCLUSTER_ACCESS_URL=https://cluster-access.cluster.example.com\n"
        );
    }
}
