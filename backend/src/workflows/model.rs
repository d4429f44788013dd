// Workflow Model - definitions, executions, and the compiled step graph

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use super::conditions::ConditionGroup;
use super::error::{EngineError, EngineResult};

/// Context keys the engine itself maintains inside an execution's context.
/// Everything else in the context map is enrollment seed data.
pub const PENDING_QUEUE_KEY: &str = "__queue";
pub const WAITING_STEP_KEY: &str = "__waiting";
pub const RETRY_COUNT_KEY: &str = "__retries";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, sqlx::Type)]
#[sqlx(type_name = "workflow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, sqlx::Type)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, sqlx::Type)]
#[sqlx(type_name = "step_log_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, sqlx::Type)]
#[sqlx(type_name = "enrollment_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentType {
    #[default]
    Automatic,
    Manual,
}

/// How a workflow starts runs. Schedule triggers name their target entity in
/// the trigger config; event and form triggers take it from the event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    Event {
        event_type: String,
        #[serde(default)]
        conditions: Option<ConditionGroup>,
    },
    Schedule {
        cron: String,
        entity_type: String,
        entity_id: Uuid,
        #[serde(default)]
        conditions: Option<ConditionGroup>,
    },
    Manual,
    FormSubmitted {
        #[serde(default)]
        form_id: Option<String>,
        #[serde(default)]
        conditions: Option<ConditionGroup>,
    },
}

/// One node in a workflow. The `delay` field suspends the step before it
/// acts; `conditions` gates it (evaluated before the delay, so a skipped
/// step never waits).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "config", rename_all = "snake_case")]
pub enum StepKind {
    SendEmail {
        to: String,
        subject: String,
        body: String,
    },
    SendSms {
        to: String,
        body: String,
    },
    SendForm {
        to: String,
        form_id: String,
    },
    AddTag {
        tag: String,
    },
    UpdateRecord {
        field: String,
        value: serde_json::Value,
    },
    Webhook {
        url: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    CreateTask {
        title: String,
        #[serde(default)]
        assignee: Option<Uuid>,
        #[serde(default)]
        due_in: Option<String>,
    },
    EnrollInWorkflow {
        workflow_id: Uuid,
    },
    Delay {
        duration: String,
    },
    IfElse {
        condition: String,
        #[serde(default)]
        if_steps: Vec<String>,
        #[serde(default)]
        else_steps: Vec<String>,
    },
}

impl StepKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::SendEmail { .. } => "send_email",
            Self::SendSms { .. } => "send_sms",
            Self::SendForm { .. } => "send_form",
            Self::AddTag { .. } => "add_tag",
            Self::UpdateRecord { .. } => "update_record",
            Self::Webhook { .. } => "webhook",
            Self::CreateTask { .. } => "create_task",
            Self::EnrollInWorkflow { .. } => "enroll_in_workflow",
            Self::Delay { .. } => "delay",
            Self::IfElse { .. } => "if_else",
        }
    }
}

/// Parse a delay duration of the form `<n><suffix>` with suffix m/h/d.
pub fn parse_duration(spec: &str) -> Result<Duration, String> {
    let spec = spec.trim();
    if spec.len() < 2 {
        return Err(format!("invalid duration '{}'", spec));
    }
    let (amount, suffix) = spec.split_at(spec.len() - 1);
    let amount: i64 = amount
        .parse()
        .map_err(|_| format!("invalid duration amount '{}'", spec))?;
    if amount < 0 {
        return Err(format!("negative duration '{}'", spec));
    }
    match suffix {
        "m" => Ok(Duration::minutes(amount)),
        "h" => Ok(Duration::hours(amount)),
        "d" => Ok(Duration::days(amount)),
        _ => Err(format!("unknown duration suffix in '{}'", spec)),
    }
}

/// Organization-scoped workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trigger: Trigger,
    pub steps: Vec<Step>,
    pub enrollment_type: EnrollmentType,
    pub re_enrollment: bool,
    pub status: WorkflowStatus,
    pub total_enrolled: i64,
    pub total_completed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Raw database row; trigger and steps are stored as jsonb.
#[derive(Debug, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub trigger: serde_json::Value,
    pub steps: serde_json::Value,
    pub enrollment_type: EnrollmentType,
    pub re_enrollment: bool,
    pub status: WorkflowStatus,
    pub total_enrolled: i64,
    pub total_completed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<WorkflowRow> for Workflow {
    type Error = EngineError;

    fn try_from(row: WorkflowRow) -> EngineResult<Self> {
        Ok(Workflow {
            id: row.id,
            org_id: row.org_id,
            name: row.name,
            description: row.description,
            trigger: serde_json::from_value(row.trigger)?,
            steps: serde_json::from_value(row.steps)?,
            enrollment_type: row.enrollment_type,
            re_enrollment: row.re_enrollment,
            status: row.status,
            total_enrolled: row.total_enrolled,
            total_completed: row.total_completed,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl Workflow {
    /// Validate the step graph and resolve branch targets to array indices.
    /// Runs at activation; the interpreter never re-validates at runtime.
    pub fn compile(self) -> EngineResult<CompiledWorkflow> {
        let mut index = HashMap::with_capacity(self.steps.len());

        for (pos, step) in self.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(EngineError::GraphIntegrity(format!(
                    "step at position {} has an empty id",
                    pos
                )));
            }
            if index.insert(step.id.clone(), pos).is_some() {
                return Err(EngineError::GraphIntegrity(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
        }

        for step in &self.steps {
            if let Some(delay) = &step.delay {
                parse_duration(delay).map_err(EngineError::GraphIntegrity)?;
            }
            match &step.kind {
                StepKind::Delay { duration } => {
                    parse_duration(duration).map_err(EngineError::GraphIntegrity)?;
                }
                StepKind::CreateTask {
                    due_in: Some(due_in),
                    ..
                } => {
                    parse_duration(due_in).map_err(EngineError::GraphIntegrity)?;
                }
                StepKind::IfElse {
                    if_steps,
                    else_steps,
                    ..
                } => {
                    for target in if_steps.iter().chain(else_steps) {
                        if !index.contains_key(target) {
                            return Err(EngineError::GraphIntegrity(format!(
                                "step '{}' branches to unknown step '{}'",
                                step.id, target
                            )));
                        }
                    }
                }
                _ => {}
            }
        }

        // Steps reachable only through a branch are not part of the
        // top-level sequence; they run when an if_else pushes them.
        let mut branch_targets: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            if let StepKind::IfElse {
                if_steps,
                else_steps,
                ..
            } = &step.kind
            {
                branch_targets.extend(if_steps.iter().map(String::as_str));
                branch_targets.extend(else_steps.iter().map(String::as_str));
            }
        }
        let mainline: Vec<String> = self
            .steps
            .iter()
            .filter(|step| !branch_targets.contains(step.id.as_str()))
            .map(|step| step.id.clone())
            .collect();
        drop(branch_targets);

        Ok(CompiledWorkflow {
            workflow: self,
            index,
            mainline,
        })
    }
}

/// A validated workflow with O(1) step-id lookup.
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    workflow: Workflow,
    index: HashMap<String, usize>,
    mainline: Vec<String>,
}

impl CompiledWorkflow {
    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn steps(&self) -> &[Step] {
        &self.workflow.steps
    }

    /// Top-level execution order: every step except branch targets.
    pub fn mainline(&self) -> &[String] {
        &self.mainline
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&pos| &self.workflow.steps[pos])
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }
}

/// One run of a workflow against a single entity. Never deleted; terminal
/// rows are kept as history.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub status: ExecutionStatus,
    pub current_step_id: Option<String>,
    pub context: serde_json::Value,
    pub next_step_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(skip_serializing)]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing)]
    pub leased_by: Option<String>,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: Uuid,
        entity_type: &str,
        entity_id: Uuid,
        seed_context: serde_json::Map<String, serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            entity_type: entity_type.to_string(),
            entity_id,
            status: ExecutionStatus::Running,
            current_step_id: None,
            context: serde_json::Value::Object(seed_context),
            next_step_at: Some(now),
            started_at: now,
            completed_at: None,
            error_message: None,
            lease_expires_at: None,
            leased_by: None,
        }
    }

    fn context_get(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.as_object().and_then(|map| map.get(key))
    }

    fn context_set(&mut self, key: &str, value: serde_json::Value) {
        if let Some(map) = self.context.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }

    fn context_remove(&mut self, key: &str) {
        if let Some(map) = self.context.as_object_mut() {
            map.remove(key);
        }
    }

    /// Pending step-id frames, top of stack last. Persisted inside the
    /// context so branch state survives the round trip between ticks.
    pub fn pending_queue(&self) -> Vec<Vec<String>> {
        self.context_get(PENDING_QUEUE_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn set_pending_queue(&mut self, queue: Vec<Vec<String>>) {
        // unwrap: Vec<Vec<String>> always serializes
        self.context_set(PENDING_QUEUE_KEY, serde_json::to_value(queue).unwrap());
    }

    pub fn push_branch_frame(&mut self, steps: Vec<String>) {
        if steps.is_empty() {
            return;
        }
        let mut queue = self.pending_queue();
        queue.push(steps);
        self.set_pending_queue(queue);
    }

    /// Pop the next pending step id, discarding exhausted frames.
    pub fn pop_next_step(&mut self) -> Option<String> {
        let mut queue = self.pending_queue();
        let mut next = None;
        while let Some(frame) = queue.last_mut() {
            if frame.is_empty() {
                queue.pop();
                continue;
            }
            next = Some(frame.remove(0));
            break;
        }
        while matches!(queue.last(), Some(frame) if frame.is_empty()) {
            queue.pop();
        }
        self.set_pending_queue(queue);
        next
    }

    pub fn waiting_step(&self) -> Option<&str> {
        self.context_get(WAITING_STEP_KEY).and_then(|v| v.as_str())
    }

    pub fn set_waiting_step(&mut self, step_id: &str) {
        self.context_set(WAITING_STEP_KEY, serde_json::Value::String(step_id.into()));
    }

    pub fn clear_waiting_step(&mut self) {
        self.context_remove(WAITING_STEP_KEY);
    }

    /// Consecutive action failures for the current step.
    pub fn retry_count(&self) -> u32 {
        self.context_get(RETRY_COUNT_KEY)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }

    pub fn set_retry_count(&mut self, count: u32) {
        self.context_set(RETRY_COUNT_KEY, serde_json::json!(count));
    }

    pub fn reset_retries(&mut self) {
        if self.retry_count() > 0 {
            self.context_remove(RETRY_COUNT_KEY);
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Append-only record of one step attempt. A retried step inserts a new row
/// with the same step_id; rows are never updated in place. `seq` is assigned
/// at insert and orders rows as the interpreter emitted them, since every
/// entry from one tick shares the same `executed_at`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowExecutionLog {
    pub id: Uuid,
    pub seq: i64,
    pub execution_id: Uuid,
    pub step_id: String,
    pub step_type: String,
    pub status: LogStatus,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub error_message: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow_with_steps(steps: Vec<Step>) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: "Test".to_string(),
            description: None,
            trigger: Trigger::Manual,
            steps,
            enrollment_type: EnrollmentType::Automatic,
            re_enrollment: false,
            status: WorkflowStatus::Draft,
            total_enrolled: 0,
            total_completed: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn step(id: &str, kind: StepKind) -> Step {
        Step {
            id: id.to_string(),
            kind,
            delay: None,
            conditions: None,
        }
    }

    #[test]
    fn test_step_wire_shape() {
        let json = serde_json::json!({
            "id": "welcome",
            "type": "send_email",
            "config": {
                "to": "{{camper.email}}",
                "subject": "Welcome to camp",
                "body": "Hi {{camper.first_name}}!"
            }
        });

        let step: Step = serde_json::from_value(json).unwrap();
        assert_eq!(step.id, "welcome");
        assert_eq!(step.kind.type_name(), "send_email");

        let back = serde_json::to_value(&step).unwrap();
        assert_eq!(back["type"], "send_email");
        assert_eq!(back["config"]["subject"], "Welcome to camp");
    }

    #[test]
    fn test_trigger_wire_shape() {
        let json = serde_json::json!({
            "type": "event",
            "event_type": "registration_created"
        });
        let trigger: Trigger = serde_json::from_value(json).unwrap();
        assert!(matches!(trigger, Trigger::Event { ref event_type, .. } if event_type == "registration_created"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("2h").unwrap(), Duration::hours(2));
        assert_eq!(parse_duration("0m").unwrap(), Duration::zero());
        assert_eq!(parse_duration("1d").unwrap(), Duration::days(1));
        assert!(parse_duration("2w").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("-1h").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_compile_rejects_unknown_branch_target() {
        let workflow = workflow_with_steps(vec![
            step(
                "branch",
                StepKind::IfElse {
                    condition: "{{age}} > 12".to_string(),
                    if_steps: vec!["missing".to_string()],
                    else_steps: vec![],
                },
            ),
            step(
                "tag",
                StepKind::AddTag {
                    tag: "teen".to_string(),
                },
            ),
        ]);

        let err = workflow.compile().unwrap_err();
        assert!(matches!(err, EngineError::GraphIntegrity(_)));
    }

    #[test]
    fn test_compile_rejects_duplicate_step_ids() {
        let workflow = workflow_with_steps(vec![
            step("a", StepKind::AddTag { tag: "x".into() }),
            step("a", StepKind::AddTag { tag: "y".into() }),
        ]);
        assert!(matches!(
            workflow.compile(),
            Err(EngineError::GraphIntegrity(_))
        ));
    }

    #[test]
    fn test_compile_rejects_bad_delay() {
        let workflow = workflow_with_steps(vec![step(
            "wait",
            StepKind::Delay {
                duration: "soon".to_string(),
            },
        )]);
        assert!(matches!(
            workflow.compile(),
            Err(EngineError::GraphIntegrity(_))
        ));
    }

    #[test]
    fn test_compile_resolves_branch_indices() {
        let workflow = workflow_with_steps(vec![
            step(
                "branch",
                StepKind::IfElse {
                    condition: "{{age}} > 12".to_string(),
                    if_steps: vec!["tag".to_string()],
                    else_steps: vec![],
                },
            ),
            step("tag", StepKind::AddTag { tag: "teen".into() }),
        ]);

        let compiled = workflow.compile().unwrap();
        assert_eq!(compiled.step_index("branch"), Some(0));
        assert_eq!(compiled.step_index("tag"), Some(1));
        assert!(compiled.step("missing").is_none());
    }

    #[test]
    fn test_mainline_excludes_branch_targets() {
        let workflow = workflow_with_steps(vec![
            step(
                "branch",
                StepKind::IfElse {
                    condition: "{{age}} > 12".to_string(),
                    if_steps: vec!["teen".to_string()],
                    else_steps: vec!["kid".to_string()],
                },
            ),
            step("done", StepKind::AddTag { tag: "done".into() }),
            step("teen", StepKind::AddTag { tag: "teen".into() }),
            step("kid", StepKind::AddTag { tag: "kid".into() }),
        ]);

        let compiled = workflow.compile().unwrap();
        assert_eq!(compiled.mainline(), ["branch", "done"]);
    }

    #[test]
    fn test_pending_queue_round_trip() {
        let mut execution = WorkflowExecution::new(
            Uuid::new_v4(),
            "camper",
            Uuid::new_v4(),
            serde_json::Map::new(),
            Utc::now(),
        );

        execution.set_pending_queue(vec![vec!["b".into(), "c".into()]]);
        execution.push_branch_frame(vec!["x".into()]);

        assert_eq!(execution.pop_next_step().as_deref(), Some("x"));
        assert_eq!(execution.pop_next_step().as_deref(), Some("b"));
        assert_eq!(execution.pop_next_step().as_deref(), Some("c"));
        assert_eq!(execution.pop_next_step(), None);
    }

    #[test]
    fn test_retry_counter_lives_in_context() {
        let mut execution = WorkflowExecution::new(
            Uuid::new_v4(),
            "camper",
            Uuid::new_v4(),
            serde_json::Map::new(),
            Utc::now(),
        );
        assert_eq!(execution.retry_count(), 0);
        execution.set_retry_count(2);
        assert_eq!(execution.retry_count(), 2);

        // survives serialization between ticks
        let json = serde_json::to_value(&execution.context).unwrap();
        assert_eq!(json[RETRY_COUNT_KEY], 2);

        execution.reset_retries();
        assert_eq!(execution.retry_count(), 0);
    }
}
