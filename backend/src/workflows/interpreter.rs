// Step Interpreter - advances one execution through its step graph.
//
// A tick drains every consecutively-due step (action steps make the
// execution immediately due again), stopping at a delay suspension, a
// terminal state, or an action failure. Suspension is the natural tick
// boundary: a waiting execution holds no worker resource, it is simply not
// due until next_step_at.

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};
use tracing::debug;

use super::collaborators::{Channel, Collaborators, DeliveryStatus, OutboundMessage};
use super::conditions::evaluate_expression;
use super::error::{EngineError, EngineResult};
use super::model::{
    parse_duration, CompiledWorkflow, ExecutionStatus, LogStatus, Step, StepKind,
    WorkflowExecution,
};
use super::template;

/// Steps drained in a single tick are bounded so a pathological graph of
/// zero-delay steps cannot pin a worker.
const MAX_STEPS_PER_TICK: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// State advanced; the execution is due again at next_step_at.
    Advanced,
    /// Suspended on a delay until next_step_at.
    Waiting,
    /// No next step resolvable; the run is complete.
    Completed,
    /// An action step failed. State did not advance; the scheduler owns the
    /// retry/backoff decision.
    ActionFailed { step_id: String, message: String },
}

#[derive(Debug, Clone)]
pub struct Tick {
    pub outcome: TickOutcome,
    pub logs: Vec<NewLogEntry>,
}

/// A log row produced by this tick, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
    pub step_id: String,
    pub step_type: &'static str,
    pub status: LogStatus,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

enum ActionOutcome {
    Success(serde_json::Value),
    /// Logged as failed but the execution still advances (webhook non-2xx).
    SoftFail {
        message: String,
        output: serde_json::Value,
    },
    Fail(String),
}

struct ActionAttempt {
    input: serde_json::Value,
    unresolved: Vec<String>,
    outcome: ActionOutcome,
}

pub struct StepInterpreter {
    collaborators: Collaborators,
    action_timeout: Duration,
}

impl StepInterpreter {
    pub fn new(collaborators: Collaborators, action_timeout: Duration) -> Self {
        Self {
            collaborators,
            action_timeout,
        }
    }

    /// Advance `execution` as far as it can go at `now`. The caller persists
    /// the mutated execution and the returned log rows.
    pub async fn tick(
        &self,
        compiled: &CompiledWorkflow,
        execution: &mut WorkflowExecution,
        now: DateTime<Utc>,
    ) -> EngineResult<Tick> {
        let mut logs = Vec::new();

        for _ in 0..MAX_STEPS_PER_TICK {
            let current_id = match execution.current_step_id.clone() {
                Some(id) => id,
                None => {
                    let mainline = compiled.mainline();
                    if mainline.is_empty() {
                        complete(execution, now);
                        return Ok(Tick {
                            outcome: TickOutcome::Completed,
                            logs,
                        });
                    }
                    execution.set_pending_queue(vec![mainline[1..].to_vec()]);
                    execution.current_step_id = Some(mainline[0].clone());
                    mainline[0].clone()
                }
            };

            let step = compiled
                .step(&current_id)
                .ok_or_else(|| EngineError::UnknownStep(current_id.clone()))?;

            let resuming = execution.waiting_step() == Some(current_id.as_str());

            if !resuming {
                // Gate before delay: a skipped step never waits.
                if let Some(gate) = &step.conditions {
                    if !evaluate_expression(gate, &execution.context) {
                        logs.push(NewLogEntry {
                            step_id: step.id.clone(),
                            step_type: step.kind.type_name(),
                            status: LogStatus::Skipped,
                            input: serde_json::json!({ "condition": gate }),
                            output: serde_json::json!({ "reason": "conditions_not_met" }),
                            error_message: None,
                            executed_at: now,
                            duration_ms: 0,
                        });
                        if !advance(execution, now) {
                            return Ok(Tick {
                                outcome: TickOutcome::Completed,
                                logs,
                            });
                        }
                        continue;
                    }
                }

                if let Some(delay) = effective_delay(step) {
                    let duration =
                        parse_duration(delay).map_err(EngineError::GraphIntegrity)?;
                    execution.set_waiting_step(&step.id);
                    execution.next_step_at = Some(now + duration);
                    debug!(
                        "Execution {} waiting on step '{}' until {:?}",
                        execution.id, step.id, execution.next_step_at
                    );
                    return Ok(Tick {
                        outcome: TickOutcome::Waiting,
                        logs,
                    });
                }
            } else {
                execution.clear_waiting_step();
            }

            match &step.kind {
                StepKind::Delay { duration } => {
                    logs.push(NewLogEntry {
                        step_id: step.id.clone(),
                        step_type: step.kind.type_name(),
                        status: LogStatus::Success,
                        input: serde_json::json!({ "duration": duration }),
                        output: serde_json::json!({ "waited": duration }),
                        error_message: None,
                        executed_at: now,
                        duration_ms: 0,
                    });
                }
                StepKind::IfElse {
                    condition,
                    if_steps,
                    else_steps,
                } => {
                    let condition_met = evaluate_expression(condition, &execution.context);
                    let (taken, bypassed) = if condition_met {
                        (if_steps, else_steps)
                    } else {
                        (else_steps, if_steps)
                    };

                    for skipped_id in bypassed {
                        let step_type = compiled
                            .step(skipped_id)
                            .map(|s| s.kind.type_name())
                            .unwrap_or("unknown");
                        logs.push(NewLogEntry {
                            step_id: skipped_id.clone(),
                            step_type,
                            status: LogStatus::Skipped,
                            input: serde_json::Value::Object(Default::default()),
                            output: serde_json::json!({ "reason": "branch_not_taken" }),
                            error_message: None,
                            executed_at: now,
                            duration_ms: 0,
                        });
                    }

                    execution.push_branch_frame(taken.clone());
                    logs.push(NewLogEntry {
                        step_id: step.id.clone(),
                        step_type: step.kind.type_name(),
                        status: LogStatus::Success,
                        input: serde_json::json!({ "condition": condition }),
                        output: serde_json::json!({ "condition_met": condition_met }),
                        error_message: None,
                        executed_at: now,
                        duration_ms: 0,
                    });
                }
                _ => {
                    let started = Instant::now();
                    let attempt = self.run_action(step, execution, now).await;
                    let duration_ms = started.elapsed().as_millis() as i64;

                    match attempt.outcome {
                        ActionOutcome::Success(mut output) => {
                            flag_unresolved(&mut output, &attempt.unresolved);
                            logs.push(NewLogEntry {
                                step_id: step.id.clone(),
                                step_type: step.kind.type_name(),
                                status: LogStatus::Success,
                                input: attempt.input,
                                output,
                                error_message: None,
                                executed_at: now,
                                duration_ms,
                            });
                        }
                        ActionOutcome::SoftFail {
                            message,
                            mut output,
                        } => {
                            flag_unresolved(&mut output, &attempt.unresolved);
                            logs.push(NewLogEntry {
                                step_id: step.id.clone(),
                                step_type: step.kind.type_name(),
                                status: LogStatus::Failed,
                                input: attempt.input,
                                output,
                                error_message: Some(message),
                                executed_at: now,
                                duration_ms,
                            });
                        }
                        ActionOutcome::Fail(message) => {
                            logs.push(NewLogEntry {
                                step_id: step.id.clone(),
                                step_type: step.kind.type_name(),
                                status: LogStatus::Failed,
                                input: attempt.input,
                                output: serde_json::Value::Object(Default::default()),
                                error_message: Some(message.clone()),
                                executed_at: now,
                                duration_ms,
                            });
                            return Ok(Tick {
                                outcome: TickOutcome::ActionFailed {
                                    step_id: step.id.clone(),
                                    message,
                                },
                                logs,
                            });
                        }
                    }
                }
            }

            if !advance(execution, now) {
                return Ok(Tick {
                    outcome: TickOutcome::Completed,
                    logs,
                });
            }
        }

        Ok(Tick {
            outcome: TickOutcome::Advanced,
            logs,
        })
    }

    async fn run_action(
        &self,
        step: &Step,
        execution: &WorkflowExecution,
        now: DateTime<Utc>,
    ) -> ActionAttempt {
        let context = &execution.context;
        let key = format!("{}:{}", execution.id, step.id);

        match &step.kind {
            StepKind::SendEmail { to, subject, body } => {
                let to = template::render(to, context);
                let subject = template::render(subject, context);
                let body = template::render(body, context);
                let mut unresolved = to.unresolved.clone();
                unresolved.extend(subject.unresolved.clone());
                unresolved.extend(body.unresolved.clone());

                let input = serde_json::json!({
                    "to": to.text, "subject": subject.text, "body": body.text
                });
                let message = OutboundMessage {
                    subject: Some(subject.text),
                    body: body.text,
                    variables: Default::default(),
                };
                let outcome = self
                    .deliver(Channel::Email, &to.text, message, &key)
                    .await;
                ActionAttempt {
                    input,
                    unresolved,
                    outcome,
                }
            }
            StepKind::SendSms { to, body } => {
                let to = template::render(to, context);
                let body = template::render(body, context);
                let mut unresolved = to.unresolved.clone();
                unresolved.extend(body.unresolved.clone());

                let input = serde_json::json!({ "to": to.text, "body": body.text });
                let message = OutboundMessage {
                    subject: None,
                    body: body.text,
                    variables: Default::default(),
                };
                let outcome = self.deliver(Channel::Sms, &to.text, message, &key).await;
                ActionAttempt {
                    input,
                    unresolved,
                    outcome,
                }
            }
            StepKind::SendForm { to, form_id } => {
                let to = template::render(to, context);
                let form_id = template::render(form_id, context);
                let mut unresolved = to.unresolved.clone();
                unresolved.extend(form_id.unresolved.clone());

                let input = serde_json::json!({ "to": to.text, "form_id": form_id.text });
                let message = OutboundMessage {
                    subject: None,
                    body: String::new(),
                    variables: [("form_id".to_string(), form_id.text)].into(),
                };
                let outcome = self.deliver(Channel::Form, &to.text, message, &key).await;
                ActionAttempt {
                    input,
                    unresolved,
                    outcome,
                }
            }
            StepKind::AddTag { tag } => {
                let tag = template::render(tag, context);
                let input = serde_json::json!({ "tag": tag.text });
                let outcome = match tokio::time::timeout(
                    self.action_timeout,
                    self.collaborators.records.add_tag(
                        &execution.entity_type,
                        execution.entity_id,
                        &tag.text,
                    ),
                )
                .await
                {
                    Ok(Ok(())) => ActionOutcome::Success(serde_json::json!({ "tagged": true })),
                    Ok(Err(e)) => ActionOutcome::Fail(e.to_string()),
                    Err(_) => ActionOutcome::Fail(timeout_message(self.action_timeout)),
                };
                ActionAttempt {
                    input,
                    unresolved: tag.unresolved,
                    outcome,
                }
            }
            StepKind::UpdateRecord { field, value } => {
                let (value, unresolved) = template::render_value(value, context);
                let input = serde_json::json!({ "field": field, "value": value });
                let outcome = match tokio::time::timeout(
                    self.action_timeout,
                    self.collaborators.records.update_field(
                        &execution.entity_type,
                        execution.entity_id,
                        field,
                        &value,
                    ),
                )
                .await
                {
                    Ok(Ok(())) => ActionOutcome::Success(serde_json::json!({ "updated": true })),
                    Ok(Err(e)) => ActionOutcome::Fail(e.to_string()),
                    Err(_) => ActionOutcome::Fail(timeout_message(self.action_timeout)),
                };
                ActionAttempt {
                    input,
                    unresolved,
                    outcome,
                }
            }
            StepKind::Webhook { url, payload } => {
                let url = template::render(url, context);
                let (payload, mut unresolved) = template::render_value(payload, context);
                unresolved.extend(url.unresolved.clone());

                let input = serde_json::json!({ "url": url.text, "payload": payload });
                let outcome = match self
                    .collaborators
                    .webhooks
                    .post(&url.text, &payload, self.action_timeout)
                    .await
                {
                    Ok(response) if (200..300).contains(&response.status) => {
                        ActionOutcome::Success(serde_json::json!({
                            "status_code": response.status,
                            "body": truncate(&response.body),
                        }))
                    }
                    // Non-2xx is a failed step with no retry; the run moves on.
                    Ok(response) => ActionOutcome::SoftFail {
                        message: format!("webhook returned status {}", response.status),
                        output: serde_json::json!({
                            "status_code": response.status,
                            "body": truncate(&response.body),
                        }),
                    },
                    Err(e) => ActionOutcome::Fail(e.to_string()),
                };
                ActionAttempt {
                    input,
                    unresolved,
                    outcome,
                }
            }
            StepKind::CreateTask {
                title,
                assignee,
                due_in,
            } => {
                let title = template::render(title, context);
                let due_at = due_in
                    .as_deref()
                    .and_then(|d| parse_duration(d).ok())
                    .map(|d| now + d);
                let input = serde_json::json!({
                    "title": title.text, "assignee": assignee, "due_at": due_at
                });
                let outcome = match tokio::time::timeout(
                    self.action_timeout,
                    self.collaborators.tasks.create(
                        &execution.entity_type,
                        execution.entity_id,
                        &title.text,
                        *assignee,
                        due_at,
                    ),
                )
                .await
                {
                    Ok(Ok(task_id)) => {
                        ActionOutcome::Success(serde_json::json!({ "task_id": task_id }))
                    }
                    Ok(Err(e)) => ActionOutcome::Fail(e.to_string()),
                    Err(_) => ActionOutcome::Fail(timeout_message(self.action_timeout)),
                };
                ActionAttempt {
                    input,
                    unresolved: title.unresolved,
                    outcome,
                }
            }
            StepKind::EnrollInWorkflow { workflow_id } => {
                let input = serde_json::json!({ "workflow_id": workflow_id });
                let outcome = match self
                    .collaborators
                    .enroller
                    .enroll(
                        *workflow_id,
                        &execution.entity_type,
                        execution.entity_id,
                        seed_context(execution),
                    )
                    .await
                {
                    Ok(enrolled) => ActionOutcome::Success(
                        serde_json::json!({ "enrolled_execution_id": enrolled }),
                    ),
                    Err(e) => ActionOutcome::Fail(e.to_string()),
                };
                ActionAttempt {
                    input,
                    unresolved: Vec::new(),
                    outcome,
                }
            }
            StepKind::Delay { .. } | StepKind::IfElse { .. } => ActionAttempt {
                input: serde_json::Value::Object(Default::default()),
                unresolved: Vec::new(),
                outcome: ActionOutcome::Fail("not an action step".to_string()),
            },
        }
    }

    async fn deliver(
        &self,
        channel: Channel,
        to: &str,
        message: OutboundMessage,
        idempotency_key: &str,
    ) -> ActionOutcome {
        match tokio::time::timeout(
            self.action_timeout,
            self.collaborators
                .messaging
                .send(channel, to, message, idempotency_key),
        )
        .await
        {
            Ok(Ok(DeliveryStatus::Sent)) => {
                ActionOutcome::Success(serde_json::json!({ "delivery": "sent" }))
            }
            Ok(Ok(DeliveryStatus::Queued)) => {
                ActionOutcome::Success(serde_json::json!({ "delivery": "queued" }))
            }
            Ok(Ok(DeliveryStatus::Rejected)) => {
                ActionOutcome::Fail(format!("delivery to '{}' rejected", to))
            }
            Ok(Err(e)) => ActionOutcome::Fail(e.to_string()),
            Err(_) => ActionOutcome::Fail(timeout_message(self.action_timeout)),
        }
    }
}

/// Effective suspension for a step: a delay step's own duration, otherwise
/// the optional step-level delay.
fn effective_delay(step: &Step) -> Option<&str> {
    match &step.kind {
        StepKind::Delay { duration } => Some(duration),
        _ => step.delay.as_deref(),
    }
}

/// Move to the next pending step. Returns false when the run is complete.
fn advance(execution: &mut WorkflowExecution, now: DateTime<Utc>) -> bool {
    match execution.pop_next_step() {
        Some(next) => {
            execution.current_step_id = Some(next);
            execution.next_step_at = Some(now);
            true
        }
        None => {
            complete(execution, now);
            false
        }
    }
}

fn complete(execution: &mut WorkflowExecution, now: DateTime<Utc>) {
    execution.status = ExecutionStatus::Completed;
    execution.completed_at = Some(now);
    execution.next_step_at = None;
    execution.clear_waiting_step();
}

fn flag_unresolved(output: &mut serde_json::Value, unresolved: &[String]) {
    if unresolved.is_empty() {
        return;
    }
    if let Some(map) = output.as_object_mut() {
        map.insert(
            "unresolved_paths".to_string(),
            serde_json::json!(unresolved),
        );
    }
}

/// Seed context for a sub-workflow enrollment: the parent's context minus
/// engine bookkeeping keys.
fn seed_context(execution: &WorkflowExecution) -> serde_json::Map<String, serde_json::Value> {
    execution
        .context
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(k, _)| !k.starts_with("__"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn timeout_message(timeout: Duration) -> String {
    format!("action timed out after {}s", timeout.as_secs())
}

fn truncate(body: &str) -> String {
    const MAX: usize = 2048;
    if body.len() <= MAX {
        return body.to_string();
    }
    // Cut on a char boundary so multi-byte responses never panic the slice.
    let mut end = MAX;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}
