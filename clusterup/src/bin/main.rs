use anyhow::bail;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use clusterup::{InstallParams, Installer, InstallerConfig};

#[derive(Parser)]
#[command(name = "clusterup", version, about = "Bootstrap a self-hosted cluster node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision this host: certificates, VPN mesh, cluster, add-ons.
    Install {
        /// Public DNS name of this host.
        server_url: String,
        /// ACME contact email.
        email: String,
        /// Container registry for private images.
        registry_url: String,
        /// Token for the package and image registries.
        access_key: String,
        /// GoDaddy DNS API key.
        godaddy_access_key: String,
        /// GoDaddy DNS API secret.
        godaddy_secret: String,
    },
    /// Renew certificates from the request persisted at install time.
    RenewCerts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, stopping after the current attempt");
                cancel.cancel();
            }
        });
    }

    let installer = Installer::new(cancel);
    let report = match cli.command {
        Command::Install {
            server_url,
            email,
            registry_url,
            access_key,
            godaddy_access_key,
            godaddy_secret,
        } => {
            let config = InstallerConfig::new(InstallParams {
                host_url: server_url,
                email,
                registry_url,
                access_key,
                godaddy_access_key,
                godaddy_secret,
            });
            installer.install(config).await
        }
        Command::RenewCerts => {
            // Everything renewal needs is in the persisted metadata file;
            // the params here only seed paths and defaults.
            let config = InstallerConfig::new(InstallParams {
                host_url: String::new(),
                email: String::new(),
                registry_url: String::new(),
                access_key: String::new(),
                godaddy_access_key: String::new(),
                godaddy_secret: String::new(),
            });
            installer.renew_certs(config).await
        }
    };

    if let Some(message) = report.failure_message() {
        bail!(message);
    }
    Ok(())
}
