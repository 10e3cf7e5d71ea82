//! Ordered step list.

use super::step::BoxedStep;

/// An ordered sequence of provisioning steps.
///
/// Step order, retry policy, and readiness parameters are data carried by
/// the steps themselves; the plan only fixes their order.
pub struct ExecutionPlan<Ctx> {
    steps: Vec<BoxedStep<Ctx>>,
}

impl<Ctx> ExecutionPlan<Ctx> {
    pub fn new(steps: Vec<BoxedStep<Ctx>>) -> Self {
        Self { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub(super) fn into_steps(self) -> Vec<BoxedStep<Ctx>> {
        self.steps
    }
}
