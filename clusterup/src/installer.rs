//! Top-level installer: assembles the step lists and runs the sequencer.
//!
//! `install` provisions the host end to end (certificates, VPN mesh,
//! node scheduler, cluster bring-up); `renew_certs` runs only the
//! certificate renewal step from persisted metadata. Both are safe to
//! re-run: satisfied steps are skipped and work resumes from the first
//! unsatisfied one.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::certs::{IssueCertificatesStep, RenewCertificatesStep};
use crate::config::InstallerConfig;
use crate::k8s::{
    ApplyAddonManifestsStep, BootstrapControlPlaneStep, CreateClusterSecretsStep,
    InstallSchedulerStep, InstallStorageServerStep,
};
use crate::proc::{HostCommandRunner, SharedRunner};
use crate::sequencer::{ExecutionPlan, InstallContext, InstallCtx, SequenceReport, Sequencer};
use crate::vpn::{InstallCoordinatorStep, InstallJoinerStep};

pub struct Installer {
    runner: SharedRunner,
    http: reqwest::Client,
    sequencer: Sequencer,
}

impl Installer {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_runner(Arc::new(HostCommandRunner), cancel)
    }

    pub fn with_runner(runner: SharedRunner, cancel: CancellationToken) -> Self {
        Self {
            runner,
            http: reqwest::Client::new(),
            sequencer: Sequencer::with_cancellation(cancel),
        }
    }

    /// Full provisioning sequence, in dependency order.
    fn install_plan(&self, config: &InstallerConfig) -> ExecutionPlan<InstallCtx> {
        ExecutionPlan::new(vec![
            Box::new(IssueCertificatesStep::new(self.runner.clone(), config)),
            Box::new(InstallCoordinatorStep::new(
                self.runner.clone(),
                self.http.clone(),
                config,
            )),
            Box::new(InstallJoinerStep::new(
                self.runner.clone(),
                self.http.clone(),
                config,
            )),
            Box::new(InstallSchedulerStep::new(
                self.runner.clone(),
                self.http.clone(),
                config,
            )),
            Box::new(InstallStorageServerStep::new(self.runner.clone())),
            Box::new(BootstrapControlPlaneStep::new(
                self.runner.clone(),
                self.http.clone(),
                config,
            )),
            Box::new(CreateClusterSecretsStep::new(self.runner.clone(), config)),
            Box::new(ApplyAddonManifestsStep::new(
                self.runner.clone(),
                self.http.clone(),
                config,
            )),
        ])
    }

    /// Provision this host into a cluster node.
    pub async fn install(&self, config: InstallerConfig) -> SequenceReport {
        let ctx = InstallContext::shared(config);
        let plan = self.install_plan(&ctx.lock().await.config.clone());
        let report = self.sequencer.run(plan, &ctx).await;

        if report.success() {
            let ctx = ctx.lock().await;
            if let Some(password) = &ctx.dashboard_password {
                // Surfaced once; afterwards it only lives in the cluster.
                tracing::info!(password = %password, "dashboard initial password");
            }
            tracing::info!("host provisioned");
        }
        report
    }

    /// Renew certificates using the metadata persisted at install time.
    pub async fn renew_certs(&self, config: InstallerConfig) -> SequenceReport {
        let ctx = InstallContext::shared(config);
        let plan: ExecutionPlan<InstallCtx> = ExecutionPlan::new(vec![Box::new(
            RenewCertificatesStep::new(self.runner.clone(), &ctx.lock().await.config.clone()),
        )]);
        self.sequencer.run(plan, &ctx).await
    }
}
