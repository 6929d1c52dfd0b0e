//! Shared processing state of a chain of pseudo tasks.
//!
//! A processing is a fixed sequence of named stages (not necessarily
//! backend tasks) plus an aggregated status that follows the backend
//! convention `PENDING`, `PROGRESS`, `SUCCESS`, `FAILURE`. Once a chain has
//! failed, later stages are refused.

use crate::core::errors::{ProcError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Aggregated status of a task chain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcStatus {
    #[default]
    Pending,
    Progress,
    Success,
    Failure,
}

impl ProcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcStatus::Pending => "PENDING",
            ProcStatus::Progress => "PROGRESS",
            ProcStatus::Success => "SUCCESS",
            ProcStatus::Failure => "FAILURE",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcStatus::Success | ProcStatus::Failure)
    }

    fn rank(&self) -> u8 {
        match self {
            ProcStatus::Pending => 0,
            ProcStatus::Progress => 1,
            ProcStatus::Success | ProcStatus::Failure => 2,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    ///
    /// `FAILURE` is always reachable; nothing else leaves a terminal state.
    pub fn can_advance_to(&self, next: ProcStatus) -> bool {
        if *self == next || next == ProcStatus::Failure {
            return true;
        }
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ProcStatus::Pending),
            "PROGRESS" => Ok(ProcStatus::Progress),
            "SUCCESS" => Ok(ProcStatus::Success),
            "FAILURE" => Ok(ProcStatus::Failure),
            _ => Err(format!("Unknown processing status: {}", s)),
        }
    }
}

/// A reason a stage failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageError {
    /// Plain message
    Message(String),
    /// A fault raised while running a stage, with its captured trace
    Fault { message: String, trace: String },
}

impl StageError {
    pub fn message(&self) -> &str {
        match self {
            StageError::Message(message) => message,
            StageError::Fault { message, .. } => message,
        }
    }

    /// Capture a fault from any error, rendering its source chain as trace
    pub fn fault<E: std::error::Error + ?Sized>(err: &E) -> Self {
        let mut trace = format!("Error: {}", err);
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str(&format!("\nCaused by: {}", cause));
            source = cause.source();
        }
        StageError::Fault {
            message: err.to_string(),
            trace,
        }
    }

    /// Entries appended to a chain's `errors`: the message, plus the trace
    /// for faults
    fn into_entries(self) -> Vec<String> {
        match self {
            StageError::Message(message) => vec![message],
            StageError::Fault { message, trace } => vec![message, trace],
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<&str> for StageError {
    fn from(s: &str) -> Self {
        StageError::Message(s.to_string())
    }
}

impl From<String> for StageError {
    fn from(s: String) -> Self {
        StageError::Message(s)
    }
}

impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        StageError::from(&err)
    }
}

impl From<&anyhow::Error> for StageError {
    fn from(err: &anyhow::Error) -> Self {
        // anyhow's Debug output carries the cause chain and, when captured,
        // the backtrace
        StageError::Fault {
            message: err.to_string(),
            trace: format!("{:?}", err),
        }
    }
}

impl From<&ProcError> for StageError {
    fn from(err: &ProcError) -> Self {
        StageError::fault(err)
    }
}

/// One error or a sequence of errors, as accepted by [`TaskChainState::fail`]
pub trait IntoStageErrors {
    fn into_stage_errors(self) -> Vec<StageError>;
}

impl IntoStageErrors for StageError {
    fn into_stage_errors(self) -> Vec<StageError> {
        vec![self]
    }
}

impl IntoStageErrors for &str {
    fn into_stage_errors(self) -> Vec<StageError> {
        vec![self.into()]
    }
}

impl IntoStageErrors for String {
    fn into_stage_errors(self) -> Vec<StageError> {
        vec![self.into()]
    }
}

impl IntoStageErrors for anyhow::Error {
    fn into_stage_errors(self) -> Vec<StageError> {
        vec![self.into()]
    }
}

impl IntoStageErrors for &anyhow::Error {
    fn into_stage_errors(self) -> Vec<StageError> {
        vec![self.into()]
    }
}

impl<T: Into<StageError>> IntoStageErrors for Vec<T> {
    fn into_stage_errors(self) -> Vec<StageError> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<T: Into<StageError>, const N: usize> IntoStageErrors for [T; N] {
    fn into_stage_errors(self) -> Vec<StageError> {
        self.into_iter().map(Into::into).collect()
    }
}

/// Stage sequence, cursor, status and error buffers of one processing.
///
/// Embedded (flattened) into every job type; it never exists as a job of
/// its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskChainState {
    task_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    current_task_name: Option<String>,
    #[serde(default)]
    status: ProcStatus,
    #[serde(default)]
    errors: Vec<String>,
    #[serde(default)]
    warnings: Vec<String>,
}

impl TaskChainState {
    pub fn new(task_names: Vec<String>) -> Self {
        Self {
            task_names,
            current_task_name: None,
            status: ProcStatus::Pending,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn task_names(&self) -> &[String] {
        &self.task_names
    }

    pub fn current_task_name(&self) -> Option<&str> {
        self.current_task_name.as_deref()
    }

    pub fn status(&self) -> ProcStatus {
        self.status
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_started(&self) -> bool {
        self.status != ProcStatus::Pending
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move on to the stage `task_name`.
    ///
    /// Returns `Ok(false)` without touching anything once the chain has
    /// failed. Continuing a completed chain is a caller bug.
    pub fn continue_with(&mut self, task_name: &str) -> Result<bool> {
        if self.status == ProcStatus::Success {
            return Err(ProcError::precondition(
                "continue_with",
                "Cannot continue on completed workflow",
            )
            .with_context("task_name", task_name));
        }

        if self.status == ProcStatus::Failure {
            return Ok(false);
        }

        self.status = ProcStatus::Progress;
        self.current_task_name = Some(task_name.to_string());
        Ok(true)
    }

    /// Mark the whole chain successful. Callers decide when the last stage
    /// is done.
    pub fn success(&mut self) {
        self.status = ProcStatus::Success;
    }

    /// Record one or more errors and mark the chain failed
    pub fn fail(&mut self, errors: impl IntoStageErrors) {
        for error in errors.into_stage_errors() {
            self.errors.extend(error.into_entries());
        }
        self.status = ProcStatus::Failure;
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub(crate) fn set_current_task_name(&mut self, task_name: &str) {
        self.current_task_name = Some(task_name.to_string());
    }

    pub(crate) fn set_status(&mut self, status: ProcStatus) {
        self.status = status;
    }

    pub(crate) fn set_current_task_name_opt(&mut self, task_name: Option<String>) {
        self.current_task_name = task_name;
    }

    pub(crate) fn errors_mut(&mut self) -> &mut Vec<String> {
        &mut self.errors
    }

    pub(crate) fn warnings_mut(&mut self) -> &mut Vec<String> {
        &mut self.warnings
    }
}
