use super::{BackendResult, BackendState, HandleChain, ResultBackend, TaskHandle};
use crate::core::errors::{ProcError, Result};
use crate::proc::state::StageError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct TaskRecord {
    state: BackendState,
    result: Option<BackendResult>,
    info: Option<Value>,
    parent: Option<TaskHandle>,
}

/// In-process result backend.
///
/// Workers (or tests) publish task states through the `set_*` methods; the
/// tracker reads them through [`ResultBackend`]. Availability can be toggled
/// off to simulate an unreachable backend.
#[derive(Debug)]
pub struct MemoryBackend {
    tasks: DashMap<TaskHandle, TaskRecord>,
    available: AtomicBool,
    released: Mutex<Vec<TaskHandle>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tasks: DashMap::new(),
            available: AtomicBool::new(true),
            released: Mutex::new(Vec::new()),
        }
    }

    /// Register a pending task with a generated handle
    pub fn submit(&self, parent: Option<&TaskHandle>) -> TaskHandle {
        let handle = TaskHandle::generate();
        self.submit_with_handle(handle.clone(), parent);
        handle
    }

    pub fn submit_with_handle(&self, handle: TaskHandle, parent: Option<&TaskHandle>) {
        debug!(handle = %handle, parent = ?parent, "Registering backend task");
        self.tasks.insert(
            handle,
            TaskRecord {
                state: BackendState::Pending,
                result: None,
                info: None,
                parent: parent.cloned(),
            },
        );
    }

    /// Register `count` tasks each chained after the previous one.
    ///
    /// The returned chain lists them outermost first, i.e. the last task
    /// submitted is entry 0.
    pub fn submit_chain(&self, count: usize) -> Result<HandleChain> {
        let mut handles: Vec<TaskHandle> = Vec::with_capacity(count);
        for _ in 0..count {
            let handle = self.submit(handles.last());
            handles.push(handle);
        }
        handles.reverse();
        HandleChain::linear(handles)
    }

    pub fn set_progress(&self, handle: &TaskHandle, info: Option<Value>) -> Result<()> {
        self.with_record(handle, |record| {
            record.state = BackendState::Progress;
            record.info = info;
        })
    }

    pub fn set_success(&self, handle: &TaskHandle, payload: Value) -> Result<()> {
        self.with_record(handle, |record| {
            record.state = BackendState::Success;
            record.result = Some(BackendResult::Payload(payload));
        })
    }

    pub fn set_failure(&self, handle: &TaskHandle, error: impl Into<StageError>) -> Result<()> {
        let error = error.into();
        self.with_record(handle, |record| {
            record.state = BackendState::Failure;
            record.result = Some(BackendResult::Fault(error));
        })
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn contains(&self, handle: &TaskHandle) -> bool {
        self.tasks.contains_key(handle)
    }

    /// Handles released so far, in release order
    pub fn released(&self) -> Vec<TaskHandle> {
        self.released
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn with_record<F>(&self, handle: &TaskHandle, f: F) -> Result<()>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut record = self
            .tasks
            .get_mut(handle)
            .ok_or_else(|| ProcError::unknown_handle(handle.as_str()))?;
        f(record.value_mut());
        trace!(handle = %handle, state = ?record.state, "Backend task updated");
        Ok(())
    }

    fn record(&self, operation: &str, handle: &TaskHandle) -> Result<TaskRecord> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(ProcError::backend_unavailable(
                operation,
                "memory backend is switched off",
            ));
        }
        self.tasks
            .get(handle)
            .map(|record| record.value().clone())
            .ok_or_else(|| ProcError::unknown_handle(handle.as_str()))
    }
}

#[async_trait]
impl ResultBackend for MemoryBackend {
    async fn ready(&self, handle: &TaskHandle) -> Result<bool> {
        Ok(self.record("ready", handle)?.state.is_ready())
    }

    async fn state(&self, handle: &TaskHandle) -> Result<BackendState> {
        Ok(self.record("state", handle)?.state)
    }

    async fn result(&self, handle: &TaskHandle) -> Result<BackendResult> {
        let record = self.record("result", handle)?;
        match record.result {
            Some(result) if record.state.is_ready() => Ok(result),
            _ => Err(ProcError::precondition(
                "result",
                format!("task {} is not ready", handle),
            )),
        }
    }

    async fn progress_info(&self, handle: &TaskHandle) -> Result<Option<Value>> {
        let record = self.record("progress_info", handle)?;
        Ok(if record.state.is_ready() { None } else { record.info })
    }

    async fn parent(&self, handle: &TaskHandle) -> Result<Option<TaskHandle>> {
        Ok(self.record("parent", handle)?.parent)
    }

    async fn release(&self, handle: &TaskHandle) -> Result<()> {
        self.record("release", handle)?;
        self.tasks.remove(handle);
        self.released
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle.clone());
        debug!(handle = %handle, "Released backend task");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_task_lifecycle() {
        let backend = MemoryBackend::new();
        let handle = backend.submit(None);

        assert!(!backend.ready(&handle).await.unwrap());
        assert_eq!(backend.state(&handle).await.unwrap(), BackendState::Pending);
        assert!(backend.result(&handle).await.is_err());

        backend
            .set_progress(&handle, Some(json!({"current_task_name": "parse"})))
            .unwrap();
        assert_eq!(
            backend.progress_info(&handle).await.unwrap(),
            Some(json!({"current_task_name": "parse"}))
        );

        backend.set_success(&handle, json!({"status": "SUCCESS"})).unwrap();
        assert!(backend.ready(&handle).await.unwrap());
        assert_eq!(
            backend.result(&handle).await.unwrap(),
            BackendResult::Payload(json!({"status": "SUCCESS"}))
        );
        assert_eq!(backend.progress_info(&handle).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_submit_chain_and_resolve() {
        let backend = MemoryBackend::new();
        let chain = backend.submit_chain(3).unwrap();
        assert_eq!(chain.len(), 3);

        let resolved = HandleChain::resolve(&backend, chain.outermost().clone())
            .await
            .unwrap();
        assert_eq!(resolved, chain);
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let backend = MemoryBackend::new();
        let handle = backend.submit(None);
        backend.set_available(false);

        let err = backend.ready(&handle).await.unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, ProcError::BackendUnavailable { .. }));

        backend.set_available(true);
        assert!(backend.ready(&handle).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_forgets_task() {
        let backend = MemoryBackend::new();
        let handle = backend.submit(None);
        backend.release(&handle).await.unwrap();

        assert!(!backend.contains(&handle));
        assert_eq!(backend.released(), vec![handle.clone()]);
        assert!(matches!(
            backend.ready(&handle).await,
            Err(ProcError::UnknownHandle { .. })
        ));
    }
}
