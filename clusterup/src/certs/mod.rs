//! TLS certificate issuance and renewal through the lego ACME client,
//! using the DNS-01 challenge against GoDaddy DNS.
//!
//! Issuance persists the renewal request to disk so a later unattended
//! `renew-certs` invocation can reconstruct it, and registers a monthly
//! cron job at a randomized minute/hour.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::InstallerConfig;
use crate::errors::{InstallerError, InstallerResult};
use crate::proc::{CommandSpec, SharedRunner};
use crate::sequencer::{CertPaths, InstallCtx, ProvisionStep};
use crate::system::{CronSchedule, register_cron_job};
use async_trait::async_trait;

/// Everything needed to re-run issuance unattended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenewalMetadata {
    pub godaddy_api_key: String,
    pub godaddy_api_secret: String,
    pub email: String,
    pub domain: String,
    pub issued_at: DateTime<Utc>,
}

impl RenewalMetadata {
    pub fn from_config(config: &InstallerConfig) -> Self {
        Self {
            godaddy_api_key: config.params.godaddy_access_key.clone(),
            godaddy_api_secret: config.params.godaddy_secret.clone(),
            email: config.params.email.clone(),
            domain: config.params.host_url.clone(),
            issued_at: Utc::now(),
        }
    }

    pub fn persist(&self, path: &Path) -> InstallerResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> InstallerResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|_| {
            InstallerError::Config(format!(
                "no renewal metadata at {}; run `install` first",
                path.display()
            ))
        })?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// Wrapper around the lego CLI. Credentials travel through the environment
/// map, never through an interpolated command line.
#[derive(Clone)]
pub struct LegoClient {
    runner: SharedRunner,
    binary: PathBuf,
    staging_dir: PathBuf,
    propagation_timeout_secs: u64,
}

impl LegoClient {
    pub fn new(runner: SharedRunner, config: &InstallerConfig) -> Self {
        Self {
            runner,
            binary: config.paths.lego_binary.clone(),
            staging_dir: config.paths.cert_staging_dir.clone(),
            propagation_timeout_secs: config.dns_propagation_timeout_secs,
        }
    }

    fn base_spec(&self, meta: &RenewalMetadata) -> CommandSpec {
        CommandSpec::new(self.binary.display().to_string())
            .args(["--path", &self.staging_dir.display().to_string()])
            .args(["--email", &meta.email])
            .args(["--dns", "godaddy"])
            .args(["--domains", &meta.domain])
            .arg("--accept-tos")
            .env("GODADDY_API_KEY", &meta.godaddy_api_key)
            .env("GODADDY_API_SECRET", &meta.godaddy_api_secret)
            .env(
                "GODADDY_PROPAGATION_TIMEOUT",
                self.propagation_timeout_secs.to_string(),
            )
    }

    /// One issuance attempt. The DNS propagation wait happens inside lego.
    pub async fn issue(&self, meta: &RenewalMetadata) -> InstallerResult<()> {
        self.runner
            .run_checked(&self.base_spec(meta).arg("run"))
            .await?;
        Ok(())
    }

    /// One renewal attempt against previously issued material.
    pub async fn renew(&self, meta: &RenewalMetadata) -> InstallerResult<()> {
        self.runner
            .run_checked(&self.base_spec(meta).arg("renew"))
            .await?;
        Ok(())
    }
}

/// Copy freshly issued cert/key from the ACME staging directory to the
/// serving location other services load them from.
pub fn promote_certificates(
    staging_dir: &Path,
    serving_dir: &Path,
    domain: &str,
) -> InstallerResult<CertPaths> {
    let src_dir = staging_dir.join("certificates");
    let dst_dir = serving_dir.join("certificates");
    std::fs::create_dir_all(&dst_dir)?;

    let cert = dst_dir.join(format!("{domain}.crt"));
    let key = dst_dir.join(format!("{domain}.key"));

    std::fs::copy(src_dir.join(format!("{domain}.crt")), &cert)?;
    std::fs::copy(src_dir.join(format!("{domain}.key")), &key)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&cert, std::fs::Permissions::from_mode(0o644))?;
        std::fs::set_permissions(&key, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(CertPaths { cert, key })
}

/// Command line the cron job runs for unattended renewal.
fn renew_command() -> String {
    let exe = std::env::current_exe()
        .unwrap_or_else(|_| PathBuf::from("/usr/local/bin/clusterup"));
    format!("{} renew-certs", exe.display())
}

/// Step: issue certificates for the host domain.
///
/// Precondition: cert and key already exist at the serving location.
/// Action (retried up to the configured budget): run DNS-01 issuance, then
/// persist renewal metadata, promote the material, and register the monthly
/// renewal cron job. The certificate paths land in the context for the VPN
/// server step.
pub struct IssueCertificatesStep {
    runner: SharedRunner,
    retry_budget: u32,
}

impl IssueCertificatesStep {
    pub fn new(runner: SharedRunner, config: &InstallerConfig) -> Self {
        Self {
            runner,
            retry_budget: config.cert_retry_budget,
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for IssueCertificatesStep {
    fn name(&self) -> &str {
        "issue-certificates"
    }

    async fn precondition(&self, ctx: &InstallCtx) -> InstallerResult<bool> {
        let mut ctx = ctx.lock().await;
        let (cert, key) = ctx.config.serving_cert_paths();
        if cert.is_file() && key.is_file() {
            // Later steps still need the paths when issuance is skipped.
            ctx.cert_paths = Some(CertPaths { cert, key });
            return Ok(true);
        }
        Ok(false)
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let config = ctx.lock().await.config.clone();
        let meta = RenewalMetadata::from_config(&config);
        let lego = LegoClient::new(self.runner.clone(), &config);

        lego.issue(&meta).await?;

        meta.persist(&config.paths.renewal_metadata_file)?;
        let paths = promote_certificates(
            &config.paths.cert_staging_dir,
            &config.paths.cert_serving_dir,
            &meta.domain,
        )?;

        let schedule = CronSchedule::monthly_randomized(&mut rand::thread_rng());
        register_cron_job(&config.paths.cron_file, &schedule, &renew_command())?;

        ctx.lock().await.cert_paths = Some(paths);
        Ok(())
    }

    fn retry_budget(&self) -> u32 {
        self.retry_budget
    }
}

/// Step: renew previously issued certificates from persisted metadata.
/// Used by the unattended `renew-certs` invocation.
pub struct RenewCertificatesStep {
    runner: SharedRunner,
    retry_budget: u32,
}

impl RenewCertificatesStep {
    pub fn new(runner: SharedRunner, config: &InstallerConfig) -> Self {
        Self {
            runner,
            retry_budget: config.cert_retry_budget,
        }
    }
}

#[async_trait]
impl ProvisionStep<InstallCtx> for RenewCertificatesStep {
    fn name(&self) -> &str {
        "renew-certificates"
    }

    async fn action(&self, ctx: &InstallCtx) -> InstallerResult<()> {
        let config = ctx.lock().await.config.clone();
        let meta = RenewalMetadata::load(&config.paths.renewal_metadata_file)?;
        let lego = LegoClient::new(self.runner.clone(), &config);

        lego.renew(&meta).await?;

        let paths = promote_certificates(
            &config.paths.cert_staging_dir,
            &config.paths.cert_serving_dir,
            &meta.domain,
        )?;
        ctx.lock().await.cert_paths = Some(paths);
        Ok(())
    }

    fn retry_budget(&self) -> u32 {
        self.retry_budget
    }
}
