//! Idempotent, retryable multi-step provisioning sequencer.
//!
//! The three concrete installers (certificates, VPN, cluster) are each an
//! ordered list of [`ProvisionStep`]s executed by the [`Sequencer`]:
//!
//! ```text
//! for each step in order:
//!   precondition true?            -> record Skipped, continue
//!   action, up to retry_budget    -> all attempts fail: abort sequence
//!   readiness predicate declared? -> poll until true or timeout
//!                                    (timeout aborts like an action failure)
//! ```
//!
//! Steps never re-enter a terminal state: `PENDING -> SKIPPED`,
//! `PENDING -> RUNNING -> SUCCEEDED`, or `PENDING -> RUNNING -> FAILED`,
//! where `FAILED` aborts the remainder of the sequence.

mod context;
mod plan;
mod report;
mod runner;
mod step;

pub use context::{CertPaths, InstallContext, InstallCtx};
pub use plan::ExecutionPlan;
pub use report::{SequenceReport, StepOutcome, StepStatus};
pub use runner::Sequencer;
pub use step::{BoxedStep, ProvisionStep, Readiness};
