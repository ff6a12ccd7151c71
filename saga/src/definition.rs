//! Saga definitions.
//!
//! A definition is an ordered list of steps, each with an optional
//! compensation, a retry budget and a reply timeout. Instances of a
//! definition are driven by the orchestrator.

use std::time::Duration;

/// One step of a saga.
#[derive(Clone, Debug)]
pub struct StepDef {
    /// Forward command name, e.g. `confirm-booking`
    pub name: &'static str,
    /// Compensation command name; `None` means nothing to undo
    pub compensation: Option<&'static str>,
    /// Dispatch attempts before the step counts as permanently failed
    pub max_retries: u32,
    /// Reply deadline per dispatch
    pub timeout: Duration,
}

/// An ordered saga definition.
#[derive(Clone, Debug)]
pub struct SagaDefinition {
    /// Definition name; also selects the command/reply topics
    pub name: &'static str,
    /// Steps in forward order
    pub steps: Vec<StepDef>,
}

impl SagaDefinition {
    /// The step at `index`, if the definition has one.
    #[must_use]
    pub fn step(&self, index: u32) -> Option<&StepDef> {
        self.steps.get(index as usize)
    }

    /// Whether `index` is the last forward step.
    #[must_use]
    pub fn is_last_step(&self, index: u32) -> bool {
        (index as usize) + 1 == self.steps.len()
    }
}

/// The post-payment workflow: on `payment.success`, confirm the booking,
/// issue the tickets, notify the user. Compensations undo in reverse.
#[must_use]
pub fn post_payment() -> SagaDefinition {
    SagaDefinition {
        name: "post-payment",
        steps: vec![
            StepDef {
                name: "confirm-booking",
                compensation: Some("release-booking"),
                max_retries: 3,
                timeout: Duration::from_secs(30),
            },
            StepDef {
                name: "issue-tickets",
                compensation: Some("void-tickets"),
                max_retries: 3,
                timeout: Duration::from_secs(30),
            },
            StepDef {
                name: "notify-user",
                compensation: None,
                max_retries: 3,
                timeout: Duration::from_secs(30),
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_payment_shape() {
        let def = post_payment();
        assert_eq!(def.name, "post-payment");
        assert_eq!(def.steps.len(), 3);
        assert!(def.is_last_step(2));
        assert!(!def.is_last_step(0));
        assert_eq!(def.step(0).map(|s| s.name), Some("confirm-booking"));
        assert_eq!(
            def.step(1).and_then(|s| s.compensation),
            Some("void-tickets")
        );
        assert!(def.step(2).is_some_and(|s| s.compensation.is_none()));
        assert!(def.step(3).is_none());
    }
}
