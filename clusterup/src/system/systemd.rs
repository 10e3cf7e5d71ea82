//! systemd service management.

use crate::errors::InstallerResult;
use crate::proc::{CommandSpec, SharedRunner};

/// Thin wrapper over `systemctl`.
#[derive(Clone)]
pub struct ServiceManager {
    runner: SharedRunner,
}

impl ServiceManager {
    pub fn new(runner: SharedRunner) -> Self {
        Self { runner }
    }

    /// Is the unit currently active? Used as the "already installed"
    /// precondition for every service-shaped step.
    pub async fn is_active(&self, unit: &str) -> InstallerResult<bool> {
        self.runner
            .run_ok(&CommandSpec::new("systemctl").args(["is-active", "--quiet", unit]))
            .await
    }

    pub async fn enable(&self, unit: &str) -> InstallerResult<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").args(["enable", unit]))
            .await?;
        Ok(())
    }

    pub async fn start(&self, unit: &str) -> InstallerResult<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").args(["start", unit]))
            .await?;
        Ok(())
    }

    /// Some images ship the joiner agent masked; unmask before enabling.
    pub async fn unmask(&self, unit: &str) -> InstallerResult<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").args(["unmask", unit]))
            .await?;
        Ok(())
    }

    pub async fn daemon_reload(&self) -> InstallerResult<()> {
        self.runner
            .run_checked(&CommandSpec::new("systemctl").arg("daemon-reload"))
            .await?;
        Ok(())
    }
}
