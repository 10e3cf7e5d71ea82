//! Debian package management.

use std::path::Path;

use crate::errors::InstallerResult;
use crate::proc::{CommandSpec, SharedRunner};

/// apt/dpkg operations.
#[derive(Clone)]
pub struct PackageManager {
    runner: SharedRunner,
}

impl PackageManager {
    pub fn new(runner: SharedRunner) -> Self {
        Self { runner }
    }

    pub async fn update(&self) -> InstallerResult<()> {
        self.runner
            .run_checked(
                &CommandSpec::new("apt-get")
                    .arg("update")
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            )
            .await?;
        Ok(())
    }

    pub async fn install(&self, package: &str) -> InstallerResult<()> {
        self.runner
            .run_checked(
                &CommandSpec::new("apt-get")
                    .args(["install", "-y", package])
                    .env("DEBIAN_FRONTEND", "noninteractive"),
            )
            .await?;
        Ok(())
    }

    /// Install a downloaded `.deb`.
    pub async fn install_deb(&self, path: &Path) -> InstallerResult<()> {
        self.runner
            .run_checked(
                &CommandSpec::new("dpkg")
                    .arg("--install")
                    .arg(path.display().to_string()),
            )
            .await?;
        Ok(())
    }
}
