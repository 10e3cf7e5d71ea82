//! Sequencer execution loop.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::plan::ExecutionPlan;
use super::report::{SequenceReport, StepOutcome, StepStatus};
use super::step::{ProvisionStep, Readiness};
use crate::errors::{InstallerError, InstallerResult};

/// Executes an [`ExecutionPlan`] strictly in order, skipping steps whose
/// precondition already holds and aborting at the first failure.
///
/// Safe to invoke repeatedly against the same host: a re-run skips the
/// already-satisfied prefix and resumes from the first unsatisfied step.
pub struct Sequencer {
    cancel: CancellationToken,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Token to wire process termination signals into; every retry attempt
    /// and readiness poll iteration observes it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run all steps in order and report the outcome of each.
    pub async fn run<Ctx>(&self, plan: ExecutionPlan<Ctx>, ctx: &Ctx) -> SequenceReport {
        let total_start = Instant::now();
        let mut report = SequenceReport::default();

        for step in plan.into_steps() {
            let outcome = self.run_step(step.as_ref(), ctx).await;
            let failed = outcome.status == StepStatus::Failed;
            if failed {
                tracing::error!(
                    step = %outcome.name,
                    reason = outcome.message.as_deref().unwrap_or("unknown"),
                    "step failed, aborting sequence"
                );
            }
            report.steps.push(outcome);
            if failed {
                break;
            }
        }

        report.total_duration_ms = total_start.elapsed().as_millis();
        report
    }

    async fn run_step<Ctx>(&self, step: &dyn ProvisionStep<Ctx>, ctx: &Ctx) -> StepOutcome {
        let name = step.name().to_string();
        let start = Instant::now();

        // Precondition errors are treated as "not satisfied", never fatal.
        match step.precondition(ctx).await {
            Ok(true) => {
                tracing::info!(step = %name, "already satisfied, skipping");
                return StepOutcome {
                    name,
                    status: StepStatus::Skipped,
                    attempts: 0,
                    duration_ms: start.elapsed().as_millis(),
                    message: None,
                };
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(step = %name, error = %e, "precondition check failed, treating as unsatisfied");
            }
        }

        // Missing dependencies fail the step before any side effect.
        if let Err(e) = step.check_dependencies(ctx).await {
            return StepOutcome {
                name,
                status: StepStatus::Failed,
                attempts: 0,
                duration_ms: start.elapsed().as_millis(),
                message: Some(e.to_string()),
            };
        }

        tracing::info!(step = %name, "running");

        let budget = step.retry_budget().max(1);
        let mut attempts = 0;
        let mut last_error: Option<InstallerError> = None;

        while attempts < budget {
            if self.cancel.is_cancelled() {
                last_error = Some(InstallerError::Cancelled);
                break;
            }

            attempts += 1;
            match step.action(ctx).await {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        step = %name,
                        attempt = attempts,
                        budget,
                        error = %e,
                        "step attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            let failure = InstallerError::ActionFailed {
                step: name.clone(),
                attempts,
                reason: e.to_string(),
            };
            return StepOutcome {
                name,
                status: StepStatus::Failed,
                attempts,
                duration_ms: start.elapsed().as_millis(),
                message: Some(failure.to_string()),
            };
        }

        if let Some(readiness) = step.readiness()
            && let Err(e) = self.await_readiness(step, ctx, readiness).await
        {
            return StepOutcome {
                name,
                status: StepStatus::Failed,
                attempts,
                duration_ms: start.elapsed().as_millis(),
                message: Some(e.to_string()),
            };
        }

        tracing::info!(step = %name, attempts, "succeeded");
        StepOutcome {
            name,
            status: StepStatus::Succeeded,
            attempts,
            duration_ms: start.elapsed().as_millis(),
            message: None,
        }
    }

    /// Poll the step's readiness predicate until it holds or the timeout
    /// elapses. The deadline is inclusive: the predicate is evaluated before
    /// the deadline check, so a predicate turning true at exactly the
    /// timeout still passes. Cancellation is observed at every iteration.
    async fn await_readiness<Ctx>(
        &self,
        step: &dyn ProvisionStep<Ctx>,
        ctx: &Ctx,
        readiness: Readiness,
    ) -> InstallerResult<()> {
        let start = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                return Err(InstallerError::Cancelled);
            }

            match step.ready(ctx).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(step = %step.name(), error = %e, "readiness probe errored, retrying");
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= readiness.timeout {
                return Err(InstallerError::ReadinessTimeout {
                    step: step.name().to_string(),
                    timeout: readiness.timeout,
                });
            }

            let remaining = readiness.timeout - elapsed;
            let pause = readiness.poll_interval.min(remaining);
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(InstallerError::Cancelled),
                _ = tokio::time::sleep(pause.max(Duration::from_millis(1))) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::step::BoxedStep;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Mutex;

    type TestCtx = Arc<Mutex<HashMap<String, String>>>;

    fn ctx() -> TestCtx {
        Arc::new(Mutex::new(HashMap::new()))
    }

    /// Scripted step driven entirely by its fields.
    struct Scripted {
        name: &'static str,
        satisfied: bool,
        /// Number of leading action attempts that fail.
        fail_first: u32,
        budget: u32,
        action_calls: Arc<AtomicU32>,
        /// Key/value written into the context on action success.
        writes: Option<(&'static str, &'static str)>,
        readiness: Option<Readiness>,
        /// Poll count (1-based) at which the readiness predicate turns true;
        /// `u32::MAX` means never.
        ready_on_poll: u32,
        polls: Arc<AtomicU32>,
    }

    impl Scripted {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                satisfied: false,
                fail_first: 0,
                budget: 1,
                action_calls: Arc::new(AtomicU32::new(0)),
                writes: None,
                readiness: None,
                ready_on_poll: 1,
                polls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn satisfied(mut self) -> Self {
            self.satisfied = true;
            self
        }

        fn failing(mut self, times: u32) -> Self {
            self.fail_first = times;
            self
        }

        fn budget(mut self, budget: u32) -> Self {
            self.budget = budget;
            self
        }

        fn writes(mut self, key: &'static str, value: &'static str) -> Self {
            self.writes = Some((key, value));
            self
        }

        fn readiness(mut self, timeout_ms: u64, interval_ms: u64, ready_on_poll: u32) -> Self {
            self.readiness = Some(Readiness::new(
                Duration::from_millis(timeout_ms),
                Duration::from_millis(interval_ms),
            ));
            self.ready_on_poll = ready_on_poll;
            self
        }

        fn calls(&self) -> Arc<AtomicU32> {
            Arc::clone(&self.action_calls)
        }
    }

    #[async_trait]
    impl ProvisionStep<TestCtx> for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn precondition(&self, _ctx: &TestCtx) -> InstallerResult<bool> {
            Ok(self.satisfied)
        }

        async fn action(&self, ctx: &TestCtx) -> InstallerResult<()> {
            let attempt = self.action_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_first {
                return Err(InstallerError::Internal(format!(
                    "scripted failure on attempt {attempt}"
                )));
            }
            if let Some((key, value)) = self.writes {
                ctx.lock().await.insert(key.to_string(), value.to_string());
            }
            Ok(())
        }

        fn retry_budget(&self) -> u32 {
            self.budget
        }

        fn readiness(&self) -> Option<Readiness> {
            self.readiness
        }

        async fn ready(&self, _ctx: &TestCtx) -> InstallerResult<bool> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(poll >= self.ready_on_poll)
        }
    }

    /// Step whose dependency check always fails.
    struct NeedsMissingSlot {
        action_calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ProvisionStep<TestCtx> for NeedsMissingSlot {
        fn name(&self) -> &str {
            "needs-missing-slot"
        }

        async fn check_dependencies(&self, _ctx: &TestCtx) -> InstallerResult<()> {
            Err(InstallerError::MissingOutput("earlier step".to_string()))
        }

        async fn action(&self, _ctx: &TestCtx) -> InstallerResult<()> {
            self.action_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn satisfied_steps_are_skipped_and_suffix_runs() {
        let skipped = Scripted::new("a").satisfied();
        let skipped_calls = skipped.calls();
        let runs = Scripted::new("b");
        let run_calls = runs.calls();

        let plan: ExecutionPlan<TestCtx> =
            ExecutionPlan::new(vec![Box::new(skipped), Box::new(runs)]);
        let report = Sequencer::new().run(plan, &ctx()).await;

        assert!(report.success());
        assert_eq!(report.outcome("a").unwrap().status, StepStatus::Skipped);
        assert_eq!(report.outcome("b").unwrap().status, StepStatus::Succeeded);
        assert_eq!(skipped_calls.load(Ordering::SeqCst), 0);
        assert_eq!(run_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn first_failure_aborts_remaining_steps() {
        let failing = Scripted::new("k").failing(10).budget(2);
        let never_runs = Scripted::new("after-k");
        let never_calls = never_runs.calls();

        let plan: ExecutionPlan<TestCtx> =
            ExecutionPlan::new(vec![Box::new(failing), Box::new(never_runs)]);
        let report = Sequencer::new().run(plan, &ctx()).await;

        assert!(!report.success());
        assert_eq!(report.failed_step().unwrap().name, "k");
        assert!(report.outcome("after-k").is_none());
        assert_eq!(never_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retry_budget_is_respected() {
        let step = Scripted::new("flaky").failing(2).budget(3);
        let calls = step.calls();

        let plan: ExecutionPlan<TestCtx> = ExecutionPlan::new(vec![Box::new(step)]);
        let report = Sequencer::new().run(plan, &ctx()).await;

        assert!(report.success());
        let outcome = report.outcome("flaky").unwrap();
        assert_eq!(outcome.status, StepStatus::Succeeded);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_true_at_exact_deadline_is_inclusive() {
        // Polls land at t = 0, 100, 200, 300 ms with a 300 ms timeout; the
        // predicate turns true on the fourth poll, exactly at the deadline.
        let step = Scripted::new("slow-ready").readiness(300, 100, 4);

        let plan: ExecutionPlan<TestCtx> = ExecutionPlan::new(vec![Box::new(step)]);
        let report = Sequencer::new().run(plan, &ctx()).await;

        assert!(report.success());
        assert_eq!(
            report.outcome("slow-ready").unwrap().status,
            StepStatus::Succeeded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn readiness_never_true_times_out_and_fails_step() {
        let step = Scripted::new("never-ready").readiness(300, 100, u32::MAX);

        let plan: ExecutionPlan<TestCtx> = ExecutionPlan::new(vec![Box::new(step)]);
        let report = Sequencer::new().run(plan, &ctx()).await;

        assert!(!report.success());
        let failed = report.failed_step().unwrap();
        assert_eq!(failed.name, "never-ready");
        assert!(failed.message.as_ref().unwrap().contains("ready"));
    }

    #[tokio::test]
    async fn outputs_propagate_to_later_steps_and_caller() {
        struct ReadsSlot;

        #[async_trait]
        impl ProvisionStep<TestCtx> for ReadsSlot {
            fn name(&self) -> &str {
                "reader"
            }

            async fn action(&self, ctx: &TestCtx) -> InstallerResult<()> {
                let map = ctx.lock().await;
                match map.get("generated-password").map(String::as_str) {
                    Some("s3cret") => Ok(()),
                    other => Err(InstallerError::Internal(format!(
                        "unexpected slot value: {other:?}"
                    ))),
                }
            }
        }

        let writer = Scripted::new("writer").writes("generated-password", "s3cret");
        let shared = ctx();

        let plan: ExecutionPlan<TestCtx> =
            ExecutionPlan::new(vec![Box::new(writer), Box::new(ReadsSlot)]);
        let report = Sequencer::new().run(plan, &shared).await;

        assert!(report.success());
        assert_eq!(
            shared.lock().await.get("generated-password").unwrap(),
            "s3cret"
        );
    }

    #[tokio::test]
    async fn missing_dependency_fails_before_action() {
        let calls = Arc::new(AtomicU32::new(0));
        let step = NeedsMissingSlot {
            action_calls: Arc::clone(&calls),
        };

        let plan: ExecutionPlan<TestCtx> = ExecutionPlan::new(vec![Box::new(step)]);
        let report = Sequencer::new().run(plan, &ctx()).await;

        let failed = report.failed_step().unwrap();
        assert_eq!(failed.name, "needs-missing-slot");
        assert_eq!(failed.attempts, 0);
        assert!(failed.message.as_ref().unwrap().contains("must run first"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_sequencer_fails_current_step() {
        let step = Scripted::new("never-starts");
        let calls = step.calls();

        let sequencer = Sequencer::new();
        sequencer.cancellation_token().cancel();

        let plan: ExecutionPlan<TestCtx> = ExecutionPlan::new(vec![Box::new(step)]);
        let report = sequencer.run(plan, &ctx()).await;

        assert!(!report.success());
        assert!(
            report
                .failed_step()
                .unwrap()
                .message
                .as_ref()
                .unwrap()
                .contains("cancelled")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    // End-to-end scenario: A succeeds, B is skipped, C exhausts 3 attempts.
    #[tokio::test]
    async fn mixed_sequence_reports_failing_step_by_name() {
        let a = Scripted::new("a");
        let a_calls = a.calls();
        let b = Scripted::new("b").satisfied();
        let c = Scripted::new("c").failing(u32::MAX).budget(3);
        let c_calls = c.calls();

        let plan: ExecutionPlan<TestCtx> =
            ExecutionPlan::new(vec![Box::new(a), Box::new(b), Box::new(c)]);
        let report = Sequencer::new().run(plan, &ctx()).await;

        assert!(!report.success());
        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(report.outcome("a").unwrap().status, StepStatus::Succeeded);
        assert_eq!(report.outcome("b").unwrap().status, StepStatus::Skipped);
        assert_eq!(c_calls.load(Ordering::SeqCst), 3);
        let failed = report.failed_step().unwrap();
        assert_eq!(failed.name, "c");
        assert_eq!(failed.attempts, 3);
        assert!(report.failure_message().unwrap().contains("`c`"));
    }
}
