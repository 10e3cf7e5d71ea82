//! Cluster bring-up: k3s, cluster secrets, add-on manifests, and the
//! custom node scheduler.

pub mod k3s;
pub mod kube;
pub mod manifests;
pub mod scheduler;

pub use k3s::{BootstrapControlPlaneStep, CreateClusterSecretsStep, InstallStorageServerStep};
pub use manifests::ApplyAddonManifestsStep;
pub use scheduler::InstallSchedulerStep;
