//! Backend adapter contract
//!
//! Processing stages run on an external task-execution backend. The tracker
//! never talks to workers directly; it only inspects the backend's per-task
//! handles through [`ResultBackend`]. Handles are opaque strings and form
//! parent chains when a task is composed of sub-tasks, which is captured in
//! serializable form by [`HandleChain`].

pub mod memory;

pub use memory::MemoryBackend;

use crate::core::errors::{ProcError, Result};
use crate::proc::state::StageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque reference to one task in the backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random handle
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// State of a single backend task as the backend reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendState {
    Pending,
    Progress,
    Success,
    Failure,
}

impl BackendState {
    pub fn is_ready(&self) -> bool {
        matches!(self, BackendState::Success | BackendState::Failure)
    }
}

/// Outcome of a ready backend task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendResult {
    /// The task returned a state document to merge
    Payload(Value),
    /// The task raised a fault
    Fault(StageError),
}

impl BackendResult {
    pub fn is_fault(&self) -> bool {
        matches!(self, BackendResult::Fault(_))
    }
}

/// Operations the tracker needs from the execution backend.
///
/// Implementations report connectivity problems as
/// [`ProcError::BackendUnavailable`]; reconciliation treats those as
/// "nothing changed" and leaves state untouched.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Whether the task finished (successfully or not)
    async fn ready(&self, handle: &TaskHandle) -> Result<bool>;

    /// Current backend state of the task
    async fn state(&self, handle: &TaskHandle) -> Result<BackendState>;

    /// Result of a ready task; a precondition violation if not ready
    async fn result(&self, handle: &TaskHandle) -> Result<BackendResult>;

    /// Best-effort progress snapshot published by a running task
    async fn progress_info(&self, handle: &TaskHandle) -> Result<Option<Value>>;

    /// Handle of the task this one was chained after
    async fn parent(&self, handle: &TaskHandle) -> Result<Option<TaskHandle>>;

    /// Free the task's stored state in the backend
    async fn release(&self, handle: &TaskHandle) -> Result<()>;
}

/// One entry of a [`HandleChain`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleNode {
    pub handle: TaskHandle,
    /// Index of the parent entry in the chain
    #[serde(default)]
    pub parent: Option<usize>,
}

/// Serializable chain of backend handles.
///
/// Entry `0` is the outermost (most recently chained) task. Every parent
/// index points to a later entry, so walking parents always terminates, and
/// every entry must be reached by that walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<HandleNode>", into = "Vec<HandleNode>")]
pub struct HandleChain {
    nodes: Vec<HandleNode>,
}

impl HandleChain {
    pub fn new(nodes: Vec<HandleNode>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(ProcError::precondition(
                "handle_chain",
                "a handle chain needs at least one handle",
            ));
        }
        for (idx, node) in nodes.iter().enumerate() {
            if let Some(parent) = node.parent {
                if parent <= idx || parent >= nodes.len() {
                    return Err(ProcError::precondition(
                        "handle_chain",
                        format!(
                            "entry {} ({}) has invalid parent index {}",
                            idx, node.handle, parent
                        ),
                    ));
                }
            }
        }
        let chain = Self { nodes };
        let reachable = chain.walk().count();
        if reachable != chain.nodes.len() {
            return Err(ProcError::precondition(
                "handle_chain",
                format!(
                    "only {} of {} entries are reachable from the outermost handle",
                    reachable,
                    chain.nodes.len()
                ),
            ));
        }
        Ok(chain)
    }

    /// Chain where each handle's parent is the next one, outermost first
    pub fn linear<I, H>(handles: I) -> Result<Self>
    where
        I: IntoIterator<Item = H>,
        H: Into<TaskHandle>,
    {
        let handles: Vec<TaskHandle> = handles.into_iter().map(Into::into).collect();
        let len = handles.len();
        let nodes = handles
            .into_iter()
            .enumerate()
            .map(|(idx, handle)| HandleNode {
                handle,
                parent: if idx + 1 < len { Some(idx + 1) } else { None },
            })
            .collect();
        Self::new(nodes)
    }

    /// Capture the chain rooted at `outermost` by following backend parents
    pub async fn resolve(backend: &dyn ResultBackend, outermost: TaskHandle) -> Result<Self> {
        let mut handles = vec![outermost];
        while let Some(parent) = backend.parent(&handles[handles.len() - 1]).await? {
            if handles.contains(&parent) {
                return Err(ProcError::precondition(
                    "handle_chain",
                    format!("backend reports a parent cycle through {}", parent),
                ));
            }
            handles.push(parent);
        }
        Self::linear(handles)
    }

    pub fn outermost(&self) -> &TaskHandle {
        &self.nodes[0].handle
    }

    pub fn nodes(&self) -> &[HandleNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Handles from the outermost entry back through its parents
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            chain: self,
            next: Some(0),
        }
    }
}

impl TryFrom<Vec<HandleNode>> for HandleChain {
    type Error = ProcError;

    fn try_from(nodes: Vec<HandleNode>) -> Result<Self> {
        Self::new(nodes)
    }
}

impl From<HandleChain> for Vec<HandleNode> {
    fn from(chain: HandleChain) -> Self {
        chain.nodes
    }
}

/// Iterator returned by [`HandleChain::walk`]
pub struct Walk<'a> {
    chain: &'a HandleChain,
    next: Option<usize>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a TaskHandle;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next?;
        let node = &self.chain.nodes[idx];
        self.next = node.parent;
        Some(&node.handle)
    }
}
