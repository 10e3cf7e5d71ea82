//! Step trait for the provisioning sequencer.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::InstallerResult;

/// Polling parameters for a step's readiness predicate.
///
/// The deadline is inclusive: the predicate is evaluated before the deadline
/// check each iteration, so a predicate that becomes true at exactly the
/// timeout is still treated as satisfied.
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Readiness {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

/// One unit of idempotent provisioning work.
///
/// Preconditions and readiness predicates are pure queries against external
/// state; only `action` may have side effects.
#[async_trait]
pub trait ProvisionStep<Ctx>: Send + Sync {
    /// Human-readable step name, used in logs and the sequence report.
    fn name(&self) -> &str;

    /// Is the step's target state already in place? Satisfied preconditions
    /// skip the step entirely. Errors are treated as "not satisfied".
    async fn precondition(&self, _ctx: &Ctx) -> InstallerResult<bool> {
        Ok(false)
    }

    /// Verify that every context slot this step reads was populated by an
    /// earlier step. Runs before the action so a missing dependency fails
    /// the step without side effects.
    async fn check_dependencies(&self, _ctx: &Ctx) -> InstallerResult<()> {
        Ok(())
    }

    /// Perform the step's side-effecting work.
    async fn action(&self, ctx: &Ctx) -> InstallerResult<()>;

    /// Number of action attempts before the step is declared failed.
    /// Treated as a minimum of 1.
    fn retry_budget(&self) -> u32 {
        1
    }

    /// Polling parameters, if this step must wait for an asynchronous
    /// external condition after its action succeeds.
    fn readiness(&self) -> Option<Readiness> {
        None
    }

    /// Readiness predicate, polled per [`ProvisionStep::readiness`].
    async fn ready(&self, _ctx: &Ctx) -> InstallerResult<bool> {
        Ok(true)
    }
}

pub type BoxedStep<Ctx> = Box<dyn ProvisionStep<Ctx>>;
