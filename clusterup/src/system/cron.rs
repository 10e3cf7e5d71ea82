//! Unattended-renewal scheduling via a cron drop-in.

use std::path::Path;

use rand::Rng;

use crate::errors::InstallerResult;

/// A classic five-field cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    pub minute: u8,
    pub hour: u8,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
}

impl CronSchedule {
    /// Monthly schedule on the 20th, at a minute/hour randomized per host so
    /// a fleet of installations does not renew in the same instant.
    pub fn monthly_randomized<R: Rng>(rng: &mut R) -> Self {
        Self {
            minute: rng.gen_range(0..60),
            hour: rng.gen_range(0..24),
            day_of_month: "20".to_string(),
            month: "*".to_string(),
            day_of_week: "*".to_string(),
        }
    }
}

impl std::fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
        )
    }
}

/// Write a `/etc/cron.d` drop-in running `command` as root on `schedule`.
/// Overwrites any previous registration, so re-running the installer keeps a
/// single job.
pub fn register_cron_job(
    cron_file: &Path,
    schedule: &CronSchedule,
    command: &str,
) -> InstallerResult<()> {
    if let Some(parent) = cron_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let contents = format!("{schedule} root {command}\n");
    std::fs::write(cron_file, contents)?;
    tracing::info!(file = %cron_file.display(), schedule = %schedule, "registered cron job");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_renders_five_fields() {
        let schedule = CronSchedule {
            minute: 7,
            hour: 3,
            day_of_month: "20".to_string(),
            month: "*".to_string(),
            day_of_week: "*".to_string(),
        };
        assert_eq!(schedule.to_string(), "7 3 20 * *");
    }

    #[test]
    fn randomized_schedule_stays_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..100 {
            let schedule = CronSchedule::monthly_randomized(&mut rng);
            assert!(schedule.minute < 60);
            assert!(schedule.hour < 24);
            assert_eq!(schedule.day_of_month, "20");
        }
    }

    #[test]
    fn drop_in_contains_schedule_user_and_command() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("clusterup-renew");
        let schedule = CronSchedule {
            minute: 12,
            hour: 4,
            day_of_month: "20".to_string(),
            month: "*".to_string(),
            day_of_week: "*".to_string(),
        };

        register_cron_job(&file, &schedule, "/usr/local/bin/clusterup renew-certs").unwrap();

        let contents = std::fs::read_to_string(&file).unwrap();
        assert_eq!(
            contents,
            "12 4 20 * * root /usr/local/bin/clusterup renew-certs\n"
        );
    }
}
