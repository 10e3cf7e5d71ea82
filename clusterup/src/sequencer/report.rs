//! Outcome types produced by the sequencer.

/// Terminal state of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// Precondition was already satisfied; action never invoked.
    Skipped,
    Succeeded,
    /// Action exhausted its retry budget, a dependency was missing, or the
    /// readiness predicate timed out. Aborts the sequence.
    Failed,
}

/// Outcome of executing one step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub name: String,
    pub status: StepStatus,
    /// Action attempts made (0 for skipped steps and dependency failures).
    pub attempts: u32,
    pub duration_ms: u128,
    /// Diagnostic for failed steps.
    pub message: Option<String>,
}

/// Outcome of an entire sequencer run.
#[derive(Debug, Clone, Default)]
pub struct SequenceReport {
    pub steps: Vec<StepOutcome>,
    pub total_duration_ms: u128,
}

impl SequenceReport {
    pub fn success(&self) -> bool {
        self.failed_step().is_none()
    }

    /// The step that aborted the sequence, if any. At most one step can
    /// fail since the sequencer stops at the first failure.
    pub fn failed_step(&self) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|step| step.status == StepStatus::Failed)
    }

    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Human-readable statement of which stage failed and why.
    pub fn failure_message(&self) -> Option<String> {
        self.failed_step().map(|step| {
            format!(
                "stage `{}` failed: {}",
                step.name,
                step.message.as_deref().unwrap_or("unknown error")
            )
        })
    }
}
