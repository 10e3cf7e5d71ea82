//! Host-level capabilities: service manager, package manager, cron, and
//! network identity. All of them go through [`crate::proc::CommandRunner`]
//! so installer logic stays testable without touching the host.

mod apt;
mod cron;
mod net;
mod systemd;

pub use apt::PackageManager;
pub use cron::{CronSchedule, register_cron_job};
pub use net::primary_interface_ip;
pub use systemd::ServiceManager;
