// Execution Scheduler - polls for due executions and drives them through
// the Step Interpreter.
//
// Each worker is an independent poll loop. Claiming is done through the
// store's leased batch claim, so any number of workers can run against the
// same database. All write-backs are guarded on status = 'running'; a
// guarded write that affects zero rows means cancellation won the race and
// the tick's result is dropped.

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::interpreter::{StepInterpreter, TickOutcome};
use super::model::{ExecutionStatus, WorkflowExecution};
use super::store::WorkflowStore;
use super::triggers::TriggerEvaluator;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub concurrency: usize,
    pub lease: Duration,
    pub max_step_retries: u32,
    pub retry_backoff: Duration,
}

pub struct ExecutionScheduler {
    store: Arc<WorkflowStore>,
    interpreter: Arc<StepInterpreter>,
    worker_id: String,
    config: SchedulerConfig,
}

impl ExecutionScheduler {
    pub fn new(
        store: Arc<WorkflowStore>,
        interpreter: Arc<StepInterpreter>,
        worker_id: String,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            interpreter,
            worker_id,
            config,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            "Scheduler worker {} started (poll every {:?}, batch {})",
            self.worker_id, self.config.poll_interval, self.config.batch_size
        );
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if let Err(e) = self.poll_once().await {
                error!("Worker {} poll failed: {}", self.worker_id, e);
            }
        }
    }

    pub async fn poll_once(&self) -> Result<(), super::error::EngineError> {
        let claimed = self
            .store
            .claim_due(
                &self.worker_id,
                self.config.batch_size,
                self.config.lease,
                Utc::now(),
            )
            .await?;

        stream::iter(claimed)
            .for_each_concurrent(self.config.concurrency, |execution| async move {
                self.drive(execution).await;
            })
            .await;

        Ok(())
    }

    /// Tick one claimed execution and write the result back. Errors here
    /// never escape to the poll loop; they fail the execution instead.
    async fn drive(&self, mut execution: WorkflowExecution) {
        let compiled = match self.store.compiled(execution.workflow_id).await {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!(
                    "Execution {} has no usable workflow definition: {}",
                    execution.id, e
                );
                let _ = self
                    .store
                    .mark_failed(execution.id, &execution.context, &e.to_string())
                    .await;
                return;
            }
        };

        let tick = match self
            .interpreter
            .tick(&compiled, &mut execution, Utc::now())
            .await
        {
            Ok(tick) => tick,
            Err(e) => {
                error!("Execution {} tick failed: {}", execution.id, e);
                let _ = self
                    .store
                    .mark_failed(execution.id, &execution.context, &e.to_string())
                    .await;
                return;
            }
        };

        let persisted = match tick.outcome {
            TickOutcome::Advanced | TickOutcome::Waiting | TickOutcome::Completed => {
                execution.reset_retries();
                match self.store.persist_step_result(&execution).await {
                    Ok(persisted) => persisted,
                    Err(e) => {
                        error!("Failed to persist execution {}: {}", execution.id, e);
                        return;
                    }
                }
            }
            TickOutcome::ActionFailed {
                ref step_id,
                ref message,
            } => {
                let attempt = execution.retry_count() + 1;
                if attempt >= self.config.max_step_retries {
                    warn!(
                        "Execution {} step '{}' failed {} times, giving up: {}",
                        execution.id, step_id, attempt, message
                    );
                    let failure = super::error::EngineError::ActionExecution {
                        step_id: step_id.clone(),
                        message: message.clone(),
                    };
                    match self
                        .store
                        .mark_failed(execution.id, &execution.context, &failure.to_string())
                        .await
                    {
                        Ok(persisted) => persisted,
                        Err(e) => {
                            error!("Failed to fail execution {}: {}", execution.id, e);
                            return;
                        }
                    }
                } else {
                    execution.set_retry_count(attempt);
                    execution.next_step_at =
                        Some(Utc::now() + backoff(self.config.retry_backoff, attempt));
                    debug!(
                        "Execution {} step '{}' failed (attempt {}), retrying at {:?}",
                        execution.id, step_id, attempt, execution.next_step_at
                    );
                    match self.store.persist_step_result(&execution).await {
                        Ok(persisted) => persisted,
                        Err(e) => {
                            error!("Failed to persist execution {}: {}", execution.id, e);
                            return;
                        }
                    }
                }
            }
        };

        if !persisted {
            // A concurrent cancel (or a lapsed lease reclaimed elsewhere)
            // took the row out from under us.
            debug!(
                "Discarding stale tick result for execution {}",
                execution.id
            );
            return;
        }

        if !tick.logs.is_empty() {
            if let Err(e) = self.store.append_logs(execution.id, &tick.logs).await
            {
                error!("Failed to write logs for execution {}: {}", execution.id, e);
            }
        }

        if execution.status == ExecutionStatus::Completed {
            if let Err(e) = self.store.bump_completed(execution.workflow_id).await {
                error!(
                    "Failed to bump completion counter for workflow {}: {}",
                    execution.workflow_id, e
                );
            }
        }
    }
}

/// Exponential backoff for step retries: base, 2x base, 4x base, ...
fn backoff(base: Duration, attempt: u32) -> chrono::Duration {
    let shift = attempt.saturating_sub(1).min(10);
    chrono::Duration::from_std(base.saturating_mul(1u32 << shift))
        .unwrap_or_else(|_| chrono::Duration::seconds(i32::MAX as i64))
}

/// Schedule-trigger ticker. Runs beside the worker pool and fires cron
/// triggers that came due since the previous tick.
pub async fn run_schedule_loop(evaluator: Arc<TriggerEvaluator>, every: Duration) {
    info!("Schedule trigger loop started (tick every {:?})", every);
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_tick = Utc::now();

    loop {
        interval.tick().await;
        let now = Utc::now();
        match evaluator.process_schedule_tick(last_tick, now).await {
            Ok(enrolled) if !enrolled.is_empty() => {
                info!("Schedule tick enrolled {} executions", enrolled.len());
            }
            Ok(_) => {}
            Err(e) => error!("Schedule tick failed: {}", e),
        }
        last_tick = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_per_attempt() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, 1), chrono::Duration::seconds(30));
        assert_eq!(backoff(base, 2), chrono::Duration::seconds(60));
        assert_eq!(backoff(base, 3), chrono::Duration::seconds(120));
        assert_eq!(backoff(base, 4), chrono::Duration::seconds(240));
    }

    #[test]
    fn test_backoff_is_capped() {
        let base = Duration::from_secs(30);
        assert_eq!(backoff(base, 100), backoff(base, 11));
    }
}
