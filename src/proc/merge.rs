//! Schema-checked merging of loosely-typed payloads into jobs.
//!
//! Backend workers publish job state as JSON documents. Instead of pushing
//! arbitrary keys into a job, every job type lists the fields it
//! understands. A payload is first validated against the job's JSON schema,
//! then decoded field by field into a patch, and only then applied, so a bad
//! payload never leaves a job half-updated.

use crate::core::errors::{ProcError, Result};
use crate::proc::state::{ProcStatus, TaskChainState};
use jsonschema::Validator;
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

/// What to do with payload fields a job does not recognise
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Keep them aside in the [`MergeReport`] and log them
    #[default]
    Quarantine,
    /// Fail the whole merge
    Reject,
}

/// A payload field that was not applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantinedField {
    pub field: String,
    pub reason: String,
    pub value: Value,
}

/// Outcome of a merge
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeReport {
    pub applied: Vec<String>,
    pub quarantined: Vec<QuarantinedField>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.quarantined.is_empty()
    }

    pub(crate) fn applied(&mut self, field: &str) {
        self.applied.push(field.to_string());
    }

    pub(crate) fn quarantine(&mut self, field: &str, reason: impl Into<String>, value: Value) {
        let reason = reason.into();
        warn!(field = %field, reason = %reason, "Quarantined payload field");
        self.quarantined.push(QuarantinedField {
            field: field.to_string(),
            reason,
            value,
        });
    }
}

fn chain_properties() -> Map<String, Value> {
    let strings = json!({"type": "array", "items": {"type": "string"}});
    let mut props = Map::new();
    props.insert("task_names".into(), strings.clone());
    props.insert(
        "current_task_name".into(),
        json!({"type": ["string", "null"]}),
    );
    props.insert(
        "status".into(),
        json!({"enum": ["PENDING", "PROGRESS", "SUCCESS", "FAILURE"]}),
    );
    props.insert("errors".into(), strings.clone());
    props.insert("warnings".into(), strings);
    props
}

fn calc_job_schema() -> Value {
    let mut props = chain_properties();
    props.insert("mainfile".into(), json!({"type": "string"}));
    props.insert("parser_name".into(), json!({"type": "string"}));
    props.insert("tmp_mainfile".into(), json!({"type": ["string", "null"]}));
    props.insert("calc_hash".into(), json!({"type": "string"}));
    props.insert("task_handle".into(), json!({"type": ["string", "null"]}));
    json!({"type": "object", "properties": props})
}

fn upload_job_schema() -> Value {
    let mut props = chain_properties();
    props.insert("upload_id".into(), json!({"type": "string", "minLength": 1}));
    props.insert("upload_hash".into(), json!({"type": ["string", "null"]}));
    props.insert(
        "calc_jobs".into(),
        json!({"type": "array", "items": {"type": "object"}}),
    );
    props.insert(
        "handle_chain".into(),
        json!({
            "type": ["array", "null"],
            "items": {
                "type": "object",
                "properties": {
                    "handle": {"type": "string"},
                    "parent": {"type": ["integer", "null"], "minimum": 0}
                },
                "required": ["handle"]
            }
        }),
    );
    json!({"type": "object", "properties": props})
}

lazy_static! {
    static ref CALC_JOB_VALIDATOR: std::result::Result<Validator, String> =
        jsonschema::validator_for(&calc_job_schema()).map_err(|e| e.to_string());
    static ref UPLOAD_JOB_VALIDATOR: std::result::Result<Validator, String> =
        jsonschema::validator_for(&upload_job_schema()).map_err(|e| e.to_string());
}

/// Document kinds with a known schema
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DocumentKind {
    CalcJob,
    UploadJob,
}

/// Check `payload` against the schema of `kind` and return its fields
pub(crate) fn validate_payload<'a>(
    kind: DocumentKind,
    payload: &'a Value,
) -> Result<&'a Map<String, Value>> {
    let validator = match kind {
        DocumentKind::CalcJob => CALC_JOB_VALIDATOR.as_ref(),
        DocumentKind::UploadJob => UPLOAD_JOB_VALIDATOR.as_ref(),
    }
    .map_err(|e| ProcError::internal(format!("Failed to compile payload schema: {}", e)))?;

    if let Err(error) = validator.validate(payload) {
        let field = error.instance_path.to_string();
        return Err(ProcError::merge(
            if field.is_empty() { "<payload>".to_string() } else { field },
            error.to_string(),
        ));
    }

    payload
        .as_object()
        .ok_or_else(|| ProcError::merge("<payload>", "payload must be an object"))
}

pub(crate) fn decode<T: DeserializeOwned>(field: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone()).map_err(|e| ProcError::merge(field, e.to_string()))
}

/// Handle a field nobody recognised according to `policy`
pub(crate) fn unrecognised(
    policy: MergePolicy,
    report: &mut MergeReport,
    field: &str,
    value: &Value,
) -> Result<()> {
    match policy {
        MergePolicy::Quarantine => {
            report.quarantine(field, "unrecognised field", value.clone());
            Ok(())
        }
        MergePolicy::Reject => Err(ProcError::merge(field, "unrecognised field")),
    }
}

/// Merge an incoming log into an append-only one.
///
/// An incoming log that extends the current one replaces it; otherwise the
/// incoming entries not already present are appended.
pub(crate) fn merge_log(current: &mut Vec<String>, incoming: Vec<String>) {
    if incoming.len() >= current.len() && incoming[..current.len()] == current[..] {
        *current = incoming;
        return;
    }
    for entry in incoming {
        if !current.contains(&entry) {
            current.push(entry);
        }
    }
}

/// Decoded chain fields of a payload, not yet applied
#[derive(Debug, Default)]
pub(crate) struct ChainPatch {
    task_names: Option<Vec<String>>,
    current_task_name: Option<Option<String>>,
    status: Option<ProcStatus>,
    errors: Option<Vec<String>>,
    warnings: Option<Vec<String>>,
}

impl ChainPatch {
    /// Decode `field` if it belongs to the chain; `Ok(false)` if it doesn't
    pub(crate) fn take(&mut self, field: &str, value: &Value) -> Result<bool> {
        match field {
            "task_names" => self.task_names = Some(decode(field, value)?),
            "current_task_name" => self.current_task_name = Some(decode(field, value)?),
            "status" => self.status = Some(decode(field, value)?),
            "errors" => self.errors = Some(decode(field, value)?),
            "warnings" => self.warnings = Some(decode(field, value)?),
            _ => return Ok(false),
        }
        Ok(true)
    }

    pub(crate) fn apply(self, state: &mut TaskChainState, report: &mut MergeReport) {
        if let Some(task_names) = self.task_names {
            if task_names.as_slice() == state.task_names() {
                report.applied("task_names");
            } else {
                report.quarantine(
                    "task_names",
                    "stage names are fixed at construction",
                    json!(task_names),
                );
            }
        }

        let status_accepted = self
            .status
            .map(|status| state.status().can_advance_to(status));

        if let Some(current_task_name) = self.current_task_name {
            if !state.is_terminal() || status_accepted == Some(true) {
                state.set_current_task_name_opt(current_task_name);
                report.applied("current_task_name");
            } else {
                report.quarantine(
                    "current_task_name",
                    format!("chain already finished with {}", state.status()),
                    json!(current_task_name),
                );
            }
        }

        if let Some(errors) = self.errors {
            merge_log(state.errors_mut(), errors);
            report.applied("errors");
        }

        if let Some(warnings) = self.warnings {
            merge_log(state.warnings_mut(), warnings);
            report.applied("warnings");
        }

        if let Some(status) = self.status {
            if status_accepted == Some(true) {
                state.set_status(status);
                report.applied("status");
            } else {
                report.quarantine(
                    "status",
                    format!("cannot move from {} to {}", state.status(), status),
                    json!(status),
                );
            }
        }
    }
}
