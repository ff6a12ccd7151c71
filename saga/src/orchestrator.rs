//! The saga orchestrator.
//!
//! Stateless driver of [`SagaInstance`] rows: it dispatches step
//! commands, consumes replies, and walks compensations in reverse when a
//! forward step permanently fails. Because replies are keyed by saga id,
//! one consumer owns any given instance. There is never more than one
//! writer, and concurrent step failures collapse to whichever reply lands
//! first.
//!
//! Crash recovery is a scan: every instance still `running` or
//! `compensating` gets its current step re-dispatched. Executors dedupe
//! on the step idempotency key, so re-dispatch is safe.

use crate::definition::SagaDefinition;
use crate::messages::{SagaCommand, SagaReply};
use chrono::Utc;
use rushtix_core::saga::{SagaStepRecord, StepOutcome};
use rushtix_core::{Clock, DomainError, EventPublisher, SagaId, SagaInstance, SagaStatus, SagaStore};
use rushtix_redpanda::topics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Key inside `SagaInstance::data` holding compensation progress.
const COMPENSATION_KEY: &str = "_compensation";

/// Rows examined per timeout sweep.
const TIMEOUT_SWEEP_LIMIT: u32 = 100;

/// Rows examined per recovery scan.
const RECOVERY_SCAN_LIMIT: u32 = 1000;

/// Drives saga instances to completion or compensation.
pub struct Orchestrator {
    store: Arc<dyn SagaStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    definitions: HashMap<&'static str, SagaDefinition>,
}

impl Orchestrator {
    /// Create an orchestrator with the given definitions registered.
    #[must_use]
    pub fn new(
        store: Arc<dyn SagaStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        definitions: Vec<SagaDefinition>,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            definitions: definitions.into_iter().map(|d| (d.name, d)).collect(),
        }
    }

    /// Start a new instance of `name` and dispatch its first step.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Internal`] for an unknown definition, or
    /// storage/bus failures.
    pub async fn start(
        &self,
        name: &str,
        data: serde_json::Value,
    ) -> Result<SagaId, DomainError> {
        let def = self
            .definitions
            .get(name)
            .ok_or_else(|| DomainError::Internal(format!("unknown saga definition: {name}")))?;

        let now = self.clock.now();
        let mut instance = SagaInstance {
            id: SagaId::new(),
            name: def.name.to_string(),
            status: SagaStatus::Running,
            current_step: 0,
            data,
            started_at: now,
            completed_at: None,
            error: None,
            steps: Vec::new(),
        };

        self.store.insert(&instance).await?;

        let first = def
            .step(0)
            .ok_or_else(|| DomainError::Internal(format!("saga {name} has no steps")))?
            .name;
        self.dispatch(&mut instance, def, 0, first, 0).await?;
        self.store.update(&instance).await?;

        tracing::info!(saga_id = %instance.id, saga = name, "saga started");
        Ok(instance.id)
    }

    /// Apply an executor reply to its instance.
    ///
    /// Stale or duplicate replies (wrong step, already-finished instance)
    /// are ignored; redelivery is expected.
    ///
    /// # Errors
    ///
    /// Returns storage/bus failures; malformed replies are dropped.
    pub async fn handle_reply(&self, reply: &SagaReply) -> Result<(), DomainError> {
        let Some(mut instance) = self.store.get(reply.saga_id).await? else {
            tracing::warn!(saga_id = %reply.saga_id, "reply for unknown saga");
            return Ok(());
        };

        if !instance.status.is_in_flight() {
            tracing::debug!(saga_id = %instance.id, status = instance.status.as_str(), "reply after terminal status, ignoring");
            return Ok(());
        }

        let Some(def) = self.definitions.get(instance.name.as_str()).cloned() else {
            return Err(DomainError::Internal(format!(
                "saga {} references unknown definition {}",
                instance.id, instance.name
            )));
        };

        let matches_current = instance
            .steps
            .iter()
            .any(|s| {
                s.step_index == instance.current_step
                    && s.step_name == reply.step_name
                    && s.finished_at.is_none()
            });
        if reply.step_index != instance.current_step || !matches_current {
            tracing::debug!(
                saga_id = %instance.id,
                reply_step = %reply.step_name,
                current_step = instance.current_step,
                "stale saga reply, ignoring"
            );
            return Ok(());
        }

        let outcome = if reply.success {
            StepOutcome::Succeeded
        } else {
            StepOutcome::Failed {
                error_code: reply
                    .error_code
                    .clone()
                    .unwrap_or_else(|| "UNKNOWN".to_string()),
            }
        };

        self.advance(&mut instance, &def, outcome).await?;
        self.store.update(&instance).await?;
        Ok(())
    }

    /// Fail in-flight steps whose reply deadline passed.
    ///
    /// # Errors
    ///
    /// Returns storage/bus failures.
    pub async fn sweep_timeouts(&self) -> Result<usize, DomainError> {
        let now = self.clock.now();
        let timed_out = self.store.find_timed_out(now, TIMEOUT_SWEEP_LIMIT).await?;
        let count = timed_out.len();

        for mut instance in timed_out {
            let Some(def) = self.definitions.get(instance.name.as_str()).cloned() else {
                tracing::error!(saga_id = %instance.id, name = %instance.name, "timed-out saga has unknown definition");
                continue;
            };
            tracing::warn!(
                saga_id = %instance.id,
                step = instance.current_step,
                "saga step timed out"
            );
            metrics::counter!("saga.step_timeouts").increment(1);
            self.advance(&mut instance, &def, StepOutcome::TimedOut)
                .await?;
            self.store.update(&instance).await?;
        }

        Ok(count)
    }

    /// Re-dispatch the current step of every in-flight instance.
    ///
    /// Run once at startup; idempotency keys make duplicates harmless.
    ///
    /// # Errors
    ///
    /// Returns storage/bus failures.
    pub async fn recover(&self) -> Result<usize, DomainError> {
        let in_flight = self.store.find_in_flight(RECOVERY_SCAN_LIMIT).await?;
        let count = in_flight.len();

        for mut instance in in_flight {
            let Some(def) = self.definitions.get(instance.name.as_str()).cloned() else {
                tracing::error!(saga_id = %instance.id, name = %instance.name, "in-flight saga has unknown definition");
                continue;
            };
            let current = instance.current_step;
            let Some(record) = instance
                .steps
                .iter()
                .find(|s| s.step_index == current && s.finished_at.is_none())
                .cloned()
            else {
                continue;
            };

            tracing::info!(saga_id = %instance.id, step = %record.step_name, "re-dispatching saga step after restart");
            self.dispatch(&mut instance, &def, current, &record.step_name, record.retry_count)
                .await?;
            self.store.update(&instance).await?;
        }

        Ok(count)
    }

    /// Timeout sweeper loop. Returns when `shutdown` flips to `true`.
    pub async fn run_timeout_sweeper(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep_timeouts().await {
                        tracing::error!(error = %e, "saga timeout sweep failed");
                    }
                }
            }
        }
    }

    /// Progress an instance after its current step finished with
    /// `outcome`.
    async fn advance(
        &self,
        instance: &mut SagaInstance,
        def: &SagaDefinition,
        outcome: StepOutcome,
    ) -> Result<(), DomainError> {
        let now = self.clock.now();
        let current = instance.current_step;

        let (record_name, retry_count) = {
            let Some(record) = instance
                .steps
                .iter_mut()
                .find(|s| s.step_index == current && s.finished_at.is_none())
            else {
                return Ok(());
            };
            record.finished_at = Some(now);
            record.outcome = Some(outcome.clone());
            (record.step_name.clone(), record.retry_count)
        };

        let step = def.step(current).ok_or_else(|| {
            DomainError::Internal(format!(
                "saga {} step {current} outside definition",
                instance.id
            ))
        })?;

        match instance.status {
            SagaStatus::Running => match outcome {
                StepOutcome::Succeeded => {
                    if def.is_last_step(current) {
                        instance.status = SagaStatus::Completed;
                        instance.completed_at = Some(now);
                        metrics::counter!("saga.completed", "name" => instance.name.clone())
                            .increment(1);
                        tracing::info!(saga_id = %instance.id, "saga completed");
                    } else {
                        let next = current + 1;
                        let next_name = def
                            .step(next)
                            .ok_or_else(|| {
                                DomainError::Internal(format!(
                                    "saga {} has no step {next}",
                                    instance.id
                                ))
                            })?
                            .name;
                        self.dispatch(instance, def, next, next_name, 0).await?;
                    }
                }
                StepOutcome::Failed { ref error_code } => {
                    if retry_count < step.max_retries {
                        self.dispatch(instance, def, current, &record_name, retry_count + 1)
                            .await?;
                    } else {
                        self.begin_compensation(instance, def, error_code.clone(), now)
                            .await?;
                    }
                }
                StepOutcome::TimedOut => {
                    if retry_count < step.max_retries {
                        self.dispatch(instance, def, current, &record_name, retry_count + 1)
                            .await?;
                    } else {
                        self.begin_compensation(instance, def, "STEP_TIMEOUT".to_string(), now)
                            .await?;
                    }
                }
            },
            SagaStatus::Compensating => {
                if let StepOutcome::Failed { ref error_code } = outcome {
                    if retry_count < step.max_retries {
                        self.dispatch(instance, def, current, &record_name, retry_count + 1)
                            .await?;
                        return Ok(());
                    }
                    // A compensation that keeps failing cannot block the
                    // rest of the walk; record it and move on.
                    tracing::error!(
                        saga_id = %instance.id,
                        step = %record_name,
                        error_code = %error_code,
                        "compensation failed permanently"
                    );
                    metrics::counter!("saga.compensation_failures").increment(1);
                } else if let StepOutcome::TimedOut = outcome {
                    if retry_count < step.max_retries {
                        self.dispatch(instance, def, current, &record_name, retry_count + 1)
                            .await?;
                        return Ok(());
                    }
                    tracing::error!(saga_id = %instance.id, step = %record_name, "compensation timed out permanently");
                }
                self.continue_compensation(instance, def).await?;
            }
            SagaStatus::Pending
            | SagaStatus::Completed
            | SagaStatus::Failed
            | SagaStatus::Compensated => {}
        }

        Ok(())
    }

    /// Switch to compensation: plan the reverse walk over completed
    /// steps with a compensation and dispatch the first one.
    async fn begin_compensation(
        &self,
        instance: &mut SagaInstance,
        def: &SagaDefinition,
        error_code: String,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), DomainError> {
        instance.error = Some(error_code.clone());

        let mut plan: Vec<u32> = instance
            .steps
            .iter()
            .filter(|s| {
                matches!(s.outcome, Some(StepOutcome::Succeeded))
                    && s.step_index < instance.current_step
                    && def.step(s.step_index).is_some_and(|d| d.compensation.is_some())
            })
            .map(|s| s.step_index)
            .collect();
        plan.sort_unstable_by(|a, b| b.cmp(a));

        if plan.is_empty() {
            instance.status = SagaStatus::Failed;
            instance.completed_at = Some(now);
            metrics::counter!("saga.failed", "name" => instance.name.clone()).increment(1);
            tracing::warn!(saga_id = %instance.id, error = %error_code, "saga failed with nothing to compensate");
            return Ok(());
        }

        instance.status = SagaStatus::Compensating;
        Self::set_compensation_state(instance, &plan, 0);
        metrics::counter!("saga.compensating", "name" => instance.name.clone()).increment(1);
        tracing::warn!(
            saga_id = %instance.id,
            error = %error_code,
            steps = plan.len(),
            "saga compensating"
        );

        self.dispatch_compensation(instance, def, plan[0]).await
    }

    /// Move to the next compensation target, or finish.
    async fn continue_compensation(
        &self,
        instance: &mut SagaInstance,
        def: &SagaDefinition,
    ) -> Result<(), DomainError> {
        let Some((plan, pos)) = Self::compensation_state(instance) else {
            return Err(DomainError::Internal(format!(
                "saga {} compensating without a plan",
                instance.id
            )));
        };

        let next = pos + 1;
        if next >= plan.len() {
            instance.status = SagaStatus::Compensated;
            instance.completed_at = Some(self.clock.now());
            metrics::counter!("saga.compensated", "name" => instance.name.clone()).increment(1);
            tracing::info!(saga_id = %instance.id, "saga compensated");
            return Ok(());
        }

        Self::set_compensation_state(instance, &plan, next);
        self.dispatch_compensation(instance, def, plan[next]).await
    }

    async fn dispatch_compensation(
        &self,
        instance: &mut SagaInstance,
        def: &SagaDefinition,
        step_index: u32,
    ) -> Result<(), DomainError> {
        let name = def
            .step(step_index)
            .and_then(|s| s.compensation)
            .ok_or_else(|| {
                DomainError::Internal(format!(
                    "saga {} step {step_index} has no compensation",
                    instance.id
                ))
            })?;
        self.dispatch(instance, def, step_index, name, 0).await
    }

    /// Write (or reset) the step record and publish the command.
    async fn dispatch(
        &self,
        instance: &mut SagaInstance,
        def: &SagaDefinition,
        step_index: u32,
        command_name: &str,
        retry_count: u32,
    ) -> Result<(), DomainError> {
        let step = def.step(step_index).ok_or_else(|| {
            DomainError::Internal(format!(
                "saga {} step {step_index} outside definition",
                instance.id
            ))
        })?;

        let now = self.clock.now();
        let timeout_at = now + chrono::Duration::from_std(step.timeout).unwrap_or_default();

        let record = SagaStepRecord {
            step_index,
            step_name: command_name.to_string(),
            started_at: now,
            timeout_at,
            finished_at: None,
            outcome: None,
            retry_count,
        };
        if let Some(existing) = instance
            .steps
            .iter_mut()
            .find(|s| s.step_index == step_index)
        {
            *existing = record;
        } else {
            instance.steps.push(record);
        }
        instance.current_step = step_index;

        let command = SagaCommand {
            saga_id: instance.id,
            saga_name: instance.name.clone(),
            step_name: command_name.to_string(),
            step_index,
            idempotency_key: instance.step_idempotency_key(command_name),
            timeout_at,
            retry_count,
            max_retries: step.max_retries,
            data: instance.data.clone(),
        };

        let envelope = command.envelope(now)?;
        self.publisher
            .publish(
                &topics::saga_commands(&instance.name),
                &instance.id.to_string(),
                &envelope,
            )
            .await?;

        metrics::counter!("saga.steps_dispatched", "step" => command_name.to_string())
            .increment(1);
        tracing::debug!(
            saga_id = %instance.id,
            step = %command_name,
            retry = retry_count,
            "saga step dispatched"
        );
        Ok(())
    }

    fn compensation_state(instance: &SagaInstance) -> Option<(Vec<u32>, usize)> {
        let state = instance.data.get(COMPENSATION_KEY)?;
        let plan: Vec<u32> = serde_json::from_value(state.get("plan")?.clone()).ok()?;
        let pos = state.get("pos")?.as_u64()? as usize;
        Some((plan, pos))
    }

    fn set_compensation_state(instance: &mut SagaInstance, plan: &[u32], pos: usize) {
        if let serde_json::Value::Object(map) = &mut instance.data {
            map.insert(
                COMPENSATION_KEY.to_string(),
                serde_json::json!({"plan": plan, "pos": pos}),
            );
        }
    }
}
