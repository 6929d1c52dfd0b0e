use crate::backend::{BackendResult, BackendState, HandleChain, ResultBackend};
use crate::core::config::TrackerConfig;
use crate::core::errors::{ProcError, Result};
use crate::proc::calc::CalcJob;
use crate::proc::merge::{self, ChainPatch, DocumentKind, MergePolicy, MergeReport};
use crate::proc::state::{IntoStageErrors, ProcStatus, TaskChainState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Counts of calc jobs per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSummary {
    pub total: usize,
    pub pending: usize,
    pub progress: usize,
    pub success: usize,
    pub failure: usize,
}

/// Processing state of an upload.
///
/// The upload pipeline is itself a chain of backend tasks whose handles are
/// kept in `handle_chain`. Every calculation found while parsing gets its own
/// [`CalcJob`], kept in discovery order.
///
/// The upload's own status only reflects its own stages. Failed calcs show
/// up in `calc_jobs` (and [`UploadJob::summary`]) but do not fail the upload.
///
/// Call [`UploadJob::forget`] once the upload is ready to free the backend's
/// stored results.
#[derive(Debug, Clone, Serialize)]
pub struct UploadJob {
    #[serde(flatten)]
    chain: TaskChainState,
    upload_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_hash: Option<String>,
    calc_jobs: Vec<CalcJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    handle_chain: Option<HandleChain>,
    #[serde(skip)]
    config: Arc<TrackerConfig>,
}

impl UploadJob {
    /// Create an upload job with the default stage layout; its first stage
    /// is started right away
    pub fn new(upload_id: impl Into<String>) -> Result<Self> {
        Self::with_config(upload_id, TrackerConfig::default())
    }

    pub fn with_config(upload_id: impl Into<String>, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let task_names = config.upload_task_names.clone();
        let mut job = Self::from_parts(upload_id.into(), task_names, Arc::new(config))?;
        job.start()?;
        Ok(job)
    }

    fn from_parts(
        upload_id: String,
        task_names: Vec<String>,
        config: Arc<TrackerConfig>,
    ) -> Result<Self> {
        if upload_id.is_empty() {
            return Err(ProcError::precondition(
                "upload_job",
                "upload_id must not be empty",
            ));
        }
        if task_names.is_empty() {
            return Err(ProcError::precondition(
                "upload_job",
                "an upload needs at least one stage",
            ));
        }
        Ok(Self {
            chain: TaskChainState::new(task_names),
            upload_id,
            upload_hash: None,
            calc_jobs: Vec::new(),
            handle_chain: None,
            config,
        })
    }

    fn start(&mut self) -> Result<()> {
        if !self.chain.is_started() {
            let first = self.chain.task_names()[0].clone();
            self.chain.continue_with(&first)?;
            info!(upload_id = %self.upload_id, task = %first, "Upload processing started");
        }
        Ok(())
    }

    /// Rebuild an upload job from its persisted document.
    ///
    /// Calc jobs in the document are upgraded to [`CalcJob`]s.
    pub fn from_document_with(document: &Value, config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        let fields = merge::validate_payload(DocumentKind::UploadJob, document)?;
        let upload_id: String = match fields.get("upload_id") {
            Some(value) => merge::decode("upload_id", value)?,
            None => return Err(ProcError::merge("upload_id", "missing required field")),
        };
        let task_names = match fields.get("task_names") {
            Some(value) => merge::decode("task_names", value)?,
            None => config.upload_task_names.clone(),
        };

        let mut job = Self::from_parts(upload_id, task_names, Arc::new(config))?;
        job.update(document)?;
        job.start()?;
        Ok(job)
    }

    pub fn from_document(document: &Value) -> Result<Self> {
        Self::from_document_with(document, TrackerConfig::default())
    }

    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn state(&self) -> &TaskChainState {
        &self.chain
    }

    pub fn status(&self) -> ProcStatus {
        self.chain.status()
    }

    pub fn task_names(&self) -> &[String] {
        self.chain.task_names()
    }

    pub fn current_task_name(&self) -> Option<&str> {
        self.chain.current_task_name()
    }

    pub fn errors(&self) -> &[String] {
        self.chain.errors()
    }

    pub fn warnings(&self) -> &[String] {
        self.chain.warnings()
    }

    pub fn is_started(&self) -> bool {
        self.chain.is_started()
    }

    pub fn upload_id(&self) -> &str {
        &self.upload_id
    }

    pub fn upload_hash(&self) -> Option<&str> {
        self.upload_hash.as_deref()
    }

    pub fn set_upload_hash(&mut self, upload_hash: impl Into<String>) {
        self.upload_hash = Some(upload_hash.into());
    }

    pub fn handle_chain(&self) -> Option<&HandleChain> {
        self.handle_chain.as_ref()
    }

    pub fn set_handle_chain(&mut self, handle_chain: HandleChain) {
        self.handle_chain = Some(handle_chain);
    }

    pub fn calc_jobs(&self) -> &[CalcJob] {
        &self.calc_jobs
    }

    pub fn calc_jobs_mut(&mut self) -> &mut [CalcJob] {
        &mut self.calc_jobs
    }

    /// Look a calc job up by its identity hash
    pub fn calc_job(&self, calc_hash: &str) -> Option<&CalcJob> {
        self.calc_jobs.iter().find(|c| c.calc_hash() == calc_hash)
    }

    pub fn calc_job_mut(&mut self, calc_hash: &str) -> Option<&mut CalcJob> {
        self.calc_jobs.iter_mut().find(|c| c.calc_hash() == calc_hash)
    }

    /// Register a calculation discovered while parsing; insertion order is
    /// kept
    pub fn add_calc_job(
        &mut self,
        mainfile: impl Into<String>,
        parser_name: impl Into<String>,
        tmp_mainfile: Option<String>,
    ) -> &mut CalcJob {
        let job = CalcJob::with_config(mainfile, parser_name, tmp_mainfile, &self.config);
        debug!(
            upload_id = %self.upload_id,
            calc_hash = %job.calc_hash(),
            mainfile = %job.mainfile(),
            "Calc job added"
        );
        self.calc_jobs.push(job);
        let last = self.calc_jobs.len() - 1;
        &mut self.calc_jobs[last]
    }

    /// Replace the calc jobs with already typed ones
    pub fn set_calc_jobs(&mut self, calc_jobs: Vec<CalcJob>) {
        self.calc_jobs = calc_jobs;
    }

    pub fn failed_calc_jobs(&self) -> impl Iterator<Item = &CalcJob> {
        self.calc_jobs
            .iter()
            .filter(|c| c.status() == ProcStatus::Failure)
    }

    pub fn summary(&self) -> UploadSummary {
        let mut summary = UploadSummary {
            total: self.calc_jobs.len(),
            ..Default::default()
        };
        for calc in &self.calc_jobs {
            match calc.status() {
                ProcStatus::Pending => summary.pending += 1,
                ProcStatus::Progress => summary.progress += 1,
                ProcStatus::Success => summary.success += 1,
                ProcStatus::Failure => summary.failure += 1,
            }
        }
        summary
    }

    pub fn continue_with(&mut self, task_name: &str) -> Result<bool> {
        self.chain.continue_with(task_name)
    }

    pub fn success(&mut self) {
        self.chain.success()
    }

    pub fn fail(&mut self, errors: impl IntoStageErrors) {
        self.chain.fail(errors)
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.chain.warn(warning)
    }

    fn merge_policy(&self) -> MergePolicy {
        if self.config.strict_merge {
            MergePolicy::Reject
        } else {
            MergePolicy::Quarantine
        }
    }

    /// Merge a loosely-typed document into this upload.
    ///
    /// `calc_jobs` entries are matched to existing calc jobs by `calc_hash`
    /// and merged into them; unmatched entries become new [`CalcJob`]s. The
    /// list takes the payload's order, so applying the same payload twice
    /// changes nothing the second time. Nothing is applied unless every
    /// recognised field decodes.
    pub fn update(&mut self, payload: &Value) -> Result<MergeReport> {
        let fields = merge::validate_payload(DocumentKind::UploadJob, payload)?;
        let policy = self.merge_policy();
        let mut report = MergeReport::default();
        let mut chain = ChainPatch::default();
        let mut upload_id: Option<String> = None;
        let mut upload_hash: Option<Option<String>> = None;
        let mut calc_jobs: Option<Vec<CalcJob>> = None;
        let mut handle_chain: Option<Option<HandleChain>> = None;

        for (field, value) in fields {
            if chain.take(field, value)? {
                continue;
            }
            match field.as_str() {
                "upload_id" => upload_id = Some(merge::decode(field, value)?),
                "upload_hash" => upload_hash = Some(merge::decode(field, value)?),
                "handle_chain" => handle_chain = Some(merge::decode(field, value)?),
                "calc_jobs" => calc_jobs = Some(self.merge_calc_jobs(value)?),
                _ => merge::unrecognised(policy, &mut report, field, value)?,
            }
        }

        chain.apply(&mut self.chain, &mut report);
        if let Some(upload_id) = upload_id {
            if upload_id == self.upload_id {
                report.applied("upload_id");
            } else {
                report.quarantine(
                    "upload_id",
                    "upload identity cannot change",
                    Value::String(upload_id),
                );
            }
        }
        if let Some(upload_hash) = upload_hash {
            self.upload_hash = upload_hash;
            report.applied("upload_hash");
        }
        if let Some(handle_chain) = handle_chain {
            self.handle_chain = handle_chain;
            report.applied("handle_chain");
        }
        if let Some(calc_jobs) = calc_jobs {
            self.calc_jobs = calc_jobs;
            report.applied("calc_jobs");
        }

        Ok(report)
    }

    /// Build the next calc job list from a `calc_jobs` payload without
    /// touching the current one
    fn merge_calc_jobs(&self, value: &Value) -> Result<Vec<CalcJob>> {
        let items = value.as_array().map(Vec::as_slice).unwrap_or_default();
        let mut merged = Vec::with_capacity(items.len());
        for item in items {
            let incoming = CalcJob::from_document_with(item, &self.config)?;
            match self.calc_job(incoming.calc_hash()) {
                Some(existing) => {
                    let mut existing = existing.clone();
                    existing.update(item)?;
                    merged.push(existing);
                }
                None => merged.push(incoming),
            }
        }
        Ok(merged)
    }

    /// Pull the latest backend state into this upload and all its calcs.
    ///
    /// Walks the handle chain from the outermost task back through its
    /// parents and consults only the first task that is ready or reports
    /// progress. Returns whether anything might have changed.
    pub async fn update_from_backend(&mut self, backend: &dyn ResultBackend) -> Result<bool> {
        if !self.chain.is_started() {
            return Err(ProcError::precondition(
                "update_from_backend",
                "Run is not yet started",
            )
            .with_context("upload_id", self.upload_id.clone()));
        }

        if self.chain.is_terminal() {
            return Ok(false);
        }

        let handle_chain = match &self.handle_chain {
            Some(handle_chain) => handle_chain.clone(),
            None => return Ok(false),
        };

        let mut might_have_changed = match self.reconcile_stages(backend, &handle_chain).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(
                    upload_id = %self.upload_id,
                    category = e.category(),
                    "Could not reconcile upload stages: {}",
                    e
                );
                false
            }
        };

        let results = futures::future::join_all(
            self.calc_jobs
                .iter_mut()
                .map(|calc| calc.update_from_backend(backend)),
        )
        .await;
        might_have_changed |= results.into_iter().any(|changed| changed);

        trace!(
            upload_id = %self.upload_id,
            status = %self.status(),
            changed = might_have_changed,
            "Upload reconciled"
        );
        Ok(might_have_changed)
    }

    async fn reconcile_stages(
        &mut self,
        backend: &dyn ResultBackend,
        handle_chain: &HandleChain,
    ) -> Result<bool> {
        let mut task_index = self.chain.task_names().len();

        for handle in handle_chain.walk() {
            if task_index == 0 {
                warn!(
                    upload_id = %self.upload_id,
                    handle = %handle,
                    "Handle chain is longer than the upload's stage list"
                );
                break;
            }
            task_index -= 1;

            if backend.ready(handle).await? {
                match backend.result(handle).await? {
                    BackendResult::Fault(fault) => {
                        let message = fault.message().to_string();
                        self.chain.fail(fault);
                        let task_name = self.chain.task_names()[task_index].clone();
                        self.chain.set_current_task_name(&task_name);
                        error!(
                            upload_id = %self.upload_id,
                            current_task_name = %task_name,
                            handle = %handle,
                            error = %message,
                            "Backend task raised exception"
                        );
                    }
                    BackendResult::Payload(payload) => {
                        self.update(&payload)?;
                    }
                }
                return Ok(true);
            }

            if backend.state(handle).await? == BackendState::Progress {
                if let Some(info) = backend.progress_info(handle).await? {
                    self.update(&info)?;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }

    /// Reconcile, then report whether the upload reached a terminal status
    pub async fn ready(&mut self, backend: &dyn ResultBackend) -> Result<bool> {
        self.update_from_backend(backend).await?;
        Ok(self.chain.is_terminal())
    }

    /// Free the backend results of the upload's own stages.
    ///
    /// Only allowed once the upload is ready. Calc task handles are not
    /// touched; see [`UploadJob::forget_calc_jobs`].
    pub async fn forget(&mut self, backend: &dyn ResultBackend) -> Result<()> {
        if !self.ready(backend).await? {
            return Err(ProcError::precondition("forget", "Run is not completed.")
                .with_context("upload_id", self.upload_id.clone()));
        }

        if let Some(handle_chain) = &self.handle_chain {
            for handle in handle_chain.walk() {
                backend.release(handle).await?;
            }
            info!(
                upload_id = %self.upload_id,
                handles = handle_chain.len(),
                "Released upload results"
            );
        }
        Ok(())
    }

    /// Free the backend results of every calc job. Returns how many handles
    /// were released.
    pub async fn forget_calc_jobs(&mut self, backend: &dyn ResultBackend) -> Result<usize> {
        if !self.ready(backend).await? {
            return Err(ProcError::precondition("forget_calc_jobs", "Run is not completed.")
                .with_context("upload_id", self.upload_id.clone()));
        }

        let mut released = 0;
        for calc in &self.calc_jobs {
            if let Some(handle) = calc.task_handle() {
                backend.release(handle).await?;
                released += 1;
            }
        }
        debug!(upload_id = %self.upload_id, released, "Released calc results");
        Ok(released)
    }

    /// Block until the upload is ready or `timeout` has been slept away.
    ///
    /// Polls every `interval`. One final reconciliation runs after the
    /// wait, however it ended. Backend tasks keep running on timeout.
    pub async fn get(
        &mut self,
        backend: &dyn ResultBackend,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<&mut Self> {
        if !self.chain.is_started() {
            return Err(ProcError::precondition("get", "Run is not yet started")
                .with_context("upload_id", self.upload_id.clone()));
        }

        if interval.is_zero() {
            return Err(ProcError::precondition("get", "interval must be greater than zero")
                .with_context("upload_id", self.upload_id.clone()));
        }

        let mut slept = Duration::ZERO;
        while !self.ready(backend).await? && timeout.map_or(true, |t| slept < t) {
            tokio::time::sleep(interval).await;
            slept += interval;
            debug!(
                upload_id = %self.upload_id,
                slept_ms = slept.as_millis() as u64,
                "Waiting for upload processing"
            );
        }

        self.update_from_backend(backend).await?;

        if !self.chain.is_terminal() {
            info!(
                upload_id = %self.upload_id,
                current_task_name = ?self.current_task_name(),
                "Stopped waiting before upload completed"
            );
        }
        Ok(self)
    }

    /// [`UploadJob::get`] with the configured interval and timeout
    pub async fn wait(&mut self, backend: &dyn ResultBackend) -> Result<&mut Self> {
        let interval = self.config.poll_interval();
        let timeout = self.config.wait_timeout();
        self.get(backend, interval, timeout).await
    }
}

impl PartialEq for UploadJob {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain
            && self.upload_id == other.upload_id
            && self.upload_hash == other.upload_hash
            && self.calc_jobs == other.calc_jobs
            && self.handle_chain == other.handle_chain
    }
}

impl TryFrom<Value> for UploadJob {
    type Error = ProcError;

    fn try_from(document: Value) -> Result<Self> {
        Self::from_document(&document)
    }
}

impl<'de> Deserialize<'de> for UploadJob {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let document = Value::deserialize(deserializer)?;
        Self::from_document(&document).map_err(serde::de::Error::custom)
    }
}
