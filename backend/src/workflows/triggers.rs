// Trigger Evaluator - matches business events and schedule ticks against
// active workflow definitions and hands matches to the Enrollment Manager.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::enrollment::EnrollmentManager;
use super::error::{EngineError, EngineResult};
use super::model::{Trigger, Workflow};
use super::store::WorkflowStore;

/// An inbound business event, scoped to one tenant and one entity.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    pub org_id: Uuid,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new(
        org_id: Uuid,
        event_type: &str,
        entity_type: &str,
        entity_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            org_id,
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id,
            payload,
            occurred_at: Utc::now(),
        }
    }

    pub fn registration_created(
        org_id: Uuid,
        registration_id: Uuid,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(org_id, "registration.created", "registration", registration_id, payload)
    }

    pub fn camper_created(org_id: Uuid, camper_id: Uuid, payload: serde_json::Value) -> Self {
        Self::new(org_id, "camper.created", "camper", camper_id, payload)
    }

    pub fn form_submitted(
        org_id: Uuid,
        form_id: &str,
        entity_type: &str,
        entity_id: Uuid,
        mut payload: serde_json::Value,
    ) -> Self {
        if let Some(map) = payload.as_object_mut() {
            map.insert("form_id".to_string(), serde_json::json!(form_id));
        }
        Self::new(org_id, "form.submitted", entity_type, entity_id, payload)
    }

    pub fn invoice_overdue(org_id: Uuid, invoice_id: Uuid, payload: serde_json::Value) -> Self {
        Self::new(org_id, "invoice.overdue", "invoice", invoice_id, payload)
    }

    pub fn payment_received(org_id: Uuid, invoice_id: Uuid, payload: serde_json::Value) -> Self {
        Self::new(org_id, "payment.received", "invoice", invoice_id, payload)
    }

    /// Context seeded into executions started by this event.
    pub fn seed_context(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut seed = self
            .payload
            .as_object()
            .cloned()
            .unwrap_or_default();
        seed.insert("event_type".to_string(), serde_json::json!(self.event_type));
        seed.insert("entity_type".to_string(), serde_json::json!(self.entity_type));
        seed.insert("entity_id".to_string(), serde_json::json!(self.entity_id));
        seed
    }
}

/// Does this workflow's trigger match the event? A condition that cannot be
/// evaluated is an error for this workflow only.
pub fn workflow_matches(workflow: &Workflow, event: &TriggerEvent) -> EngineResult<bool> {
    match &workflow.trigger {
        Trigger::Event {
            event_type,
            conditions,
        } => {
            if event_type != &event.event_type {
                return Ok(false);
            }
            evaluate_conditions(conditions.as_ref(), &event.payload)
        }
        Trigger::FormSubmitted {
            form_id,
            conditions,
        } => {
            if event.event_type != "form.submitted" {
                return Ok(false);
            }
            if let Some(wanted) = form_id {
                let submitted = event.payload.get("form_id").and_then(|v| v.as_str());
                if submitted != Some(wanted.as_str()) {
                    return Ok(false);
                }
            }
            evaluate_conditions(conditions.as_ref(), &event.payload)
        }
        // Schedule fires from the ticker; manual only via the enroll endpoint.
        Trigger::Schedule { .. } | Trigger::Manual => Ok(false),
    }
}

fn evaluate_conditions(
    conditions: Option<&super::conditions::ConditionGroup>,
    payload: &serde_json::Value,
) -> EngineResult<bool> {
    match conditions {
        Some(group) => group
            .evaluate(payload)
            .map_err(EngineError::ConditionEvaluation),
        None => Ok(true),
    }
}

/// Did the cron expression fire in the half-open window (last_tick, now]?
pub fn schedule_due(
    cron_expr: &str,
    last_tick: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, String> {
    let schedule = Schedule::from_str(cron_expr)
        .map_err(|e| format!("invalid cron expression '{}': {}", cron_expr, e))?;
    Ok(schedule
        .after(&last_tick)
        .next()
        .map(|occurrence| occurrence <= now)
        .unwrap_or(false))
}

/// Seed context handed to executions enrolled by a schedule trigger.
fn schedule_seed(
    entity_type: &str,
    entity_id: Uuid,
) -> serde_json::Map<String, serde_json::Value> {
    [
        ("entity_type".to_string(), serde_json::json!(entity_type)),
        ("entity_id".to_string(), serde_json::json!(entity_id)),
    ]
    .into_iter()
    .collect()
}

pub struct TriggerEvaluator {
    store: Arc<WorkflowStore>,
    enrollments: Arc<EnrollmentManager>,
}

impl TriggerEvaluator {
    pub fn new(store: Arc<WorkflowStore>, enrollments: Arc<EnrollmentManager>) -> Self {
        Self { store, enrollments }
    }

    /// Match an event against every active workflow in its org. One bad
    /// definition never blocks enrollment into the others.
    pub async fn process_event(&self, event: &TriggerEvent) -> EngineResult<Vec<Uuid>> {
        let workflows = self.store.active_workflows(event.org_id).await?;
        let mut enrolled = Vec::new();

        for workflow in workflows {
            match workflow_matches(&workflow, event) {
                Ok(true) => match self
                    .enrollments
                    .enroll(
                        workflow.id,
                        &event.entity_type,
                        event.entity_id,
                        event.seed_context(),
                    )
                    .await
                {
                    Ok(Some(execution_id)) => enrolled.push(execution_id),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            "Enrollment into workflow {} failed for event '{}': {}",
                            workflow.id, event.event_type, e
                        );
                    }
                },
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Trigger conditions for workflow {} could not be evaluated: {}",
                        workflow.id, e
                    );
                }
            }
        }

        debug!(
            "Event '{}' for {} {} enrolled {} executions",
            event.event_type,
            event.entity_type,
            event.entity_id,
            enrolled.len()
        );
        Ok(enrolled)
    }

    /// Fire schedule triggers whose cron expression came due since the last
    /// tick. Re-enrollment rules keep an already-running execution from
    /// being duplicated by consecutive ticks.
    pub async fn process_schedule_tick(
        &self,
        last_tick: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<Uuid>> {
        let workflows = self.store.active_scheduled_workflows().await?;
        let mut enrolled = Vec::new();

        for workflow in workflows {
            let Trigger::Schedule {
                cron,
                entity_type,
                entity_id,
                conditions,
            } = &workflow.trigger
            else {
                continue;
            };

            match schedule_due(cron, last_tick, now) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    warn!("Schedule trigger for workflow {} skipped: {}", workflow.id, e);
                    continue;
                }
            }

            let seed = schedule_seed(entity_type, *entity_id);

            if let Some(group) = conditions {
                match group.evaluate(&serde_json::Value::Object(seed.clone())) {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(e) => {
                        warn!(
                            "Schedule conditions for workflow {} could not be evaluated: {}",
                            workflow.id, e
                        );
                        continue;
                    }
                }
            }

            match self
                .enrollments
                .enroll(workflow.id, entity_type, *entity_id, seed)
                .await
            {
                Ok(Some(execution_id)) => enrolled.push(execution_id),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Scheduled enrollment into workflow {} failed: {}",
                        workflow.id, e
                    );
                }
            }
        }

        Ok(enrolled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::conditions::{Condition, ConditionGroup};
    use crate::workflows::model::{EnrollmentType, WorkflowStatus};
    use chrono::TimeZone;

    fn workflow_with_trigger(trigger: Trigger) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: "Test".to_string(),
            description: None,
            trigger,
            steps: vec![],
            enrollment_type: EnrollmentType::Automatic,
            re_enrollment: false,
            status: WorkflowStatus::Active,
            total_enrolled: 0,
            total_completed: 0,
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    fn event(event_type: &str, payload: serde_json::Value) -> TriggerEvent {
        TriggerEvent::new(Uuid::new_v4(), event_type, "camper", Uuid::new_v4(), payload)
    }

    #[test]
    fn test_event_trigger_matches_on_type() {
        let workflow = workflow_with_trigger(Trigger::Event {
            event_type: "registration.created".to_string(),
            conditions: None,
        });

        let matching = event("registration.created", serde_json::json!({}));
        let other = event("camper.created", serde_json::json!({}));

        assert!(workflow_matches(&workflow, &matching).unwrap());
        assert!(!workflow_matches(&workflow, &other).unwrap());
    }

    #[test]
    fn test_event_trigger_applies_conditions() {
        let workflow = workflow_with_trigger(Trigger::Event {
            event_type: "registration.created".to_string(),
            conditions: Some(ConditionGroup::and(vec![Condition::equals(
                "session.name",
                serde_json::json!("Summer 2026"),
            )])),
        });

        let matching = event(
            "registration.created",
            serde_json::json!({"session": {"name": "Summer 2026"}}),
        );
        let wrong_session = event(
            "registration.created",
            serde_json::json!({"session": {"name": "Winter 2026"}}),
        );

        assert!(workflow_matches(&workflow, &matching).unwrap());
        assert!(!workflow_matches(&workflow, &wrong_session).unwrap());
    }

    #[test]
    fn test_bad_condition_is_an_error_not_a_silent_false() {
        let workflow = workflow_with_trigger(Trigger::Event {
            event_type: "registration.created".to_string(),
            conditions: Some(ConditionGroup::and(vec![Condition::new(
                "age",
                "between",
                serde_json::json!([5, 10]),
            )])),
        });

        let result = workflow_matches(&workflow, &event("registration.created", serde_json::json!({"age": 7})));
        assert!(matches!(result, Err(EngineError::ConditionEvaluation(_))));
    }

    #[test]
    fn test_form_trigger_matches_specific_form() {
        let workflow = workflow_with_trigger(Trigger::FormSubmitted {
            form_id: Some("medical-intake".to_string()),
            conditions: None,
        });

        let right_form = event(
            "form.submitted",
            serde_json::json!({"form_id": "medical-intake"}),
        );
        let wrong_form = event(
            "form.submitted",
            serde_json::json!({"form_id": "photo-consent"}),
        );

        assert!(workflow_matches(&workflow, &right_form).unwrap());
        assert!(!workflow_matches(&workflow, &wrong_form).unwrap());
    }

    #[test]
    fn test_manual_and_schedule_triggers_ignore_events() {
        let manual = workflow_with_trigger(Trigger::Manual);
        let scheduled = workflow_with_trigger(Trigger::Schedule {
            cron: "0 0 9 * * *".to_string(),
            entity_type: "camp".to_string(),
            entity_id: Uuid::new_v4(),
            conditions: None,
        });

        let any = event("registration.created", serde_json::json!({}));
        assert!(!workflow_matches(&manual, &any).unwrap());
        assert!(!workflow_matches(&scheduled, &any).unwrap());
    }

    #[test]
    fn test_schedule_due_within_window() {
        // Fires daily at 09:00:00.
        let cron = "0 0 9 * * *";
        let last = Utc.with_ymd_and_hms(2026, 6, 1, 8, 59, 30).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 15).unwrap();
        assert!(schedule_due(cron, last, now).unwrap());

        let last = Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 15).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 9, 1, 0).unwrap();
        assert!(!schedule_due(cron, last, now).unwrap());
    }

    #[test]
    fn test_schedule_due_rejects_bad_expression() {
        let now = Utc::now();
        assert!(schedule_due("not a cron", now, now).is_err());
    }

    #[test]
    fn test_seed_context_carries_entity_identity() {
        let entity_id = Uuid::new_v4();
        let event = TriggerEvent::new(
            Uuid::new_v4(),
            "camper.created",
            "camper",
            entity_id,
            serde_json::json!({"camper_name": "Riley"}),
        );

        let seed = event.seed_context();
        assert_eq!(seed["camper_name"], "Riley");
        assert_eq!(seed["event_type"], "camper.created");
        assert_eq!(seed["entity_id"], serde_json::json!(entity_id));
    }

    #[test]
    fn test_schedule_seed_names_the_target_entity() {
        let entity_id = Uuid::new_v4();
        let seed = schedule_seed("registration", entity_id);

        assert_eq!(seed.len(), 2);
        assert_eq!(seed["entity_type"], "registration");
        assert_eq!(seed["entity_id"], serde_json::json!(entity_id));
    }
}
