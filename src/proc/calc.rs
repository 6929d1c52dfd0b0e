use crate::backend::{BackendResult, ResultBackend, TaskHandle};
use crate::core::config::TrackerConfig;
use crate::core::errors::{ProcError, Result};
use crate::core::hash;
use crate::proc::merge::{self, ChainPatch, DocumentKind, MergePolicy, MergeReport};
use crate::proc::state::{IntoStageErrors, ProcStatus, TaskChainState};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

/// Processing state of one calculation (one mainfile of an upload).
///
/// The stages are the selected parser, the configured normalizers and the
/// archiving step. The whole pipeline runs as a single backend task
/// referenced by `task_handle`.
#[derive(Debug, Clone, Serialize)]
pub struct CalcJob {
    #[serde(flatten)]
    chain: TaskChainState,
    mainfile: String,
    parser_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tmp_mainfile: Option<String>,
    calc_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    task_handle: Option<TaskHandle>,
    #[serde(skip)]
    merge_policy: MergePolicy,
}

impl CalcJob {
    /// Create a calc job with the default stage layout
    pub fn new(
        mainfile: impl Into<String>,
        parser_name: impl Into<String>,
        tmp_mainfile: Option<String>,
    ) -> Self {
        Self::with_config(mainfile, parser_name, tmp_mainfile, &TrackerConfig::default())
    }

    pub fn with_config(
        mainfile: impl Into<String>,
        parser_name: impl Into<String>,
        tmp_mainfile: Option<String>,
        config: &TrackerConfig,
    ) -> Self {
        let parser_name = parser_name.into();
        let task_names = config.calc_task_names(&parser_name);
        let mut job = Self::from_parts(mainfile.into(), parser_name, tmp_mainfile, task_names);
        if config.strict_merge {
            job.merge_policy = MergePolicy::Reject;
        }
        job
    }

    fn from_parts(
        mainfile: String,
        parser_name: String,
        tmp_mainfile: Option<String>,
        task_names: Vec<String>,
    ) -> Self {
        let calc_hash = hash::hash(&mainfile);
        Self {
            chain: TaskChainState::new(task_names),
            mainfile,
            parser_name,
            tmp_mainfile,
            calc_hash,
            task_handle: None,
            merge_policy: MergePolicy::default(),
        }
    }

    /// Rebuild a calc job from its persisted (or loosely-typed) document.
    ///
    /// `mainfile` and `parser_name` are required; stage names are taken from
    /// the document when present, otherwise derived from `config`. All other
    /// fields are merged on top of the freshly constructed job.
    pub fn from_document_with(document: &Value, config: &TrackerConfig) -> Result<Self> {
        let fields = merge::validate_payload(DocumentKind::CalcJob, document)?;
        let mainfile: String = match fields.get("mainfile") {
            Some(value) => merge::decode("mainfile", value)?,
            None => return Err(ProcError::merge("mainfile", "missing required field")),
        };
        let parser_name: String = match fields.get("parser_name") {
            Some(value) => merge::decode("parser_name", value)?,
            None => return Err(ProcError::merge("parser_name", "missing required field")),
        };
        let tmp_mainfile: Option<String> = match fields.get("tmp_mainfile") {
            Some(value) => merge::decode("tmp_mainfile", value)?,
            None => None,
        };
        let task_names = match fields.get("task_names") {
            Some(value) => merge::decode("task_names", value)?,
            None => config.calc_task_names(&parser_name),
        };

        let mut job = Self::from_parts(mainfile, parser_name, tmp_mainfile, task_names);
        if config.strict_merge {
            job.merge_policy = MergePolicy::Reject;
        }
        job.update(document)?;
        Ok(job)
    }

    pub fn from_document(document: &Value) -> Result<Self> {
        Self::from_document_with(document, &TrackerConfig::default())
    }

    pub fn to_document(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
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

    pub fn mainfile(&self) -> &str {
        &self.mainfile
    }

    pub fn parser_name(&self) -> &str {
        &self.parser_name
    }

    pub fn tmp_mainfile(&self) -> Option<&str> {
        self.tmp_mainfile.as_deref()
    }

    pub fn calc_hash(&self) -> &str {
        &self.calc_hash
    }

    pub fn task_handle(&self) -> Option<&TaskHandle> {
        self.task_handle.as_ref()
    }

    pub fn set_task_handle(&mut self, handle: TaskHandle) {
        self.task_handle = Some(handle);
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

    /// Merge a loosely-typed document into this job.
    ///
    /// Nothing is applied unless every recognised field decodes.
    pub fn update(&mut self, payload: &Value) -> Result<MergeReport> {
        let fields = merge::validate_payload(DocumentKind::CalcJob, payload)?;
        let mut report = MergeReport::default();
        let mut chain = ChainPatch::default();
        let mut mainfile: Option<String> = None;
        let mut parser_name: Option<String> = None;
        let mut tmp_mainfile: Option<Option<String>> = None;
        let mut calc_hash: Option<String> = None;
        let mut task_handle: Option<Option<TaskHandle>> = None;

        for (field, value) in fields {
            if chain.take(field, value)? {
                continue;
            }
            match field.as_str() {
                "mainfile" => mainfile = Some(merge::decode(field, value)?),
                "parser_name" => parser_name = Some(merge::decode(field, value)?),
                "tmp_mainfile" => tmp_mainfile = Some(merge::decode(field, value)?),
                "calc_hash" => calc_hash = Some(merge::decode(field, value)?),
                "task_handle" => task_handle = Some(merge::decode(field, value)?),
                _ => merge::unrecognised(self.merge_policy, &mut report, field, value)?,
            }
        }

        chain.apply(&mut self.chain, &mut report);
        if let Some(mainfile) = mainfile {
            self.mainfile = mainfile;
            report.applied("mainfile");
        }
        if let Some(parser_name) = parser_name {
            self.parser_name = parser_name;
            report.applied("parser_name");
        }
        if let Some(tmp_mainfile) = tmp_mainfile {
            self.tmp_mainfile = tmp_mainfile;
            report.applied("tmp_mainfile");
        }
        if let Some(calc_hash) = calc_hash {
            self.calc_hash = calc_hash;
            report.applied("calc_hash");
        }
        if let Some(task_handle) = task_handle {
            self.task_handle = task_handle;
            report.applied("task_handle");
        }

        Ok(report)
    }

    /// Pull the latest state of this job's backend task.
    ///
    /// Returns whether the job might have changed. Backend trouble is
    /// logged and reported as "no change".
    pub async fn update_from_backend(&mut self, backend: &dyn ResultBackend) -> bool {
        match self.try_update_from_backend(backend).await {
            Ok(changed) => changed,
            Err(e) => {
                warn!(
                    calc_hash = %self.calc_hash,
                    mainfile = %self.mainfile,
                    category = e.category(),
                    "Could not reconcile calc job: {}",
                    e
                );
                false
            }
        }
    }

    async fn try_update_from_backend(&mut self, backend: &dyn ResultBackend) -> Result<bool> {
        if self.chain.is_terminal() {
            return Ok(false);
        }
        let handle = match &self.task_handle {
            Some(handle) => handle.clone(),
            None => return Ok(false),
        };

        if backend.ready(&handle).await? {
            match backend.result(&handle).await? {
                BackendResult::Payload(payload) => {
                    self.update(&payload)?;
                }
                BackendResult::Fault(error) => {
                    warn!(
                        calc_hash = %self.calc_hash,
                        handle = %handle,
                        "Calc task raised an exception: {}",
                        error
                    );
                    self.chain.fail(error);
                }
            }
            debug!(calc_hash = %self.calc_hash, status = %self.status(), "Calc task ready");
            return Ok(true);
        }

        if let Some(info) = backend.progress_info(&handle).await? {
            self.update(&info)?;
            return Ok(true);
        }

        Ok(false)
    }
}

impl PartialEq for CalcJob {
    fn eq(&self, other: &Self) -> bool {
        self.chain == other.chain
            && self.mainfile == other.mainfile
            && self.parser_name == other.parser_name
            && self.tmp_mainfile == other.tmp_mainfile
            && self.calc_hash == other.calc_hash
            && self.task_handle == other.task_handle
    }
}

impl TryFrom<Value> for CalcJob {
    type Error = ProcError;

    fn try_from(document: Value) -> Result<Self> {
        Self::from_document(&document)
    }
}

impl<'de> serde::Deserialize<'de> for CalcJob {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let document = <Value as serde::Deserialize>::deserialize(deserializer)?;
        Self::from_document(&document).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_construction() {
        let job = CalcJob::new("1/template.json", "parserA", None);
        assert_eq!(job.calc_hash(), hash::hash("1/template.json"));
        assert_eq!(job.task_names(), ["parserA", "SystemNormalizer", "archiving"]);
        assert_eq!(job.status(), ProcStatus::Pending);
        assert!(job.task_handle().is_none());
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let mut job = CalcJob::new("a/main.out", "parserA", None);
        let err = job
            .update(&json!({"current_task_name": "parserA", "parser_name": 3}))
            .unwrap_err();
        assert!(matches!(err, ProcError::Merge { .. }));
        assert_eq!(job.current_task_name(), None);
    }

    #[test]
    fn test_update_quarantines_unknown_fields() {
        let mut job = CalcJob::new("a/main.out", "parserA", None);
        let report = job
            .update(&json!({"status": "PROGRESS", "current_task_name": "parserA", "bogus": true}))
            .unwrap();
        assert_eq!(job.status(), ProcStatus::Progress);
        assert_eq!(report.quarantined.len(), 1);
        assert_eq!(report.quarantined[0].field, "bogus");
    }

    #[test]
    fn test_strict_policy_rejects_unknown_fields() {
        let config = TrackerConfig {
            strict_merge: true,
            ..Default::default()
        };
        let mut job = CalcJob::with_config("a/main.out", "parserA", None, &config);
        assert!(job.update(&json!({"bogus": true})).is_err());
    }

    #[test]
    fn test_document_round_trip() {
        let mut job = CalcJob::new(
            "1/template.json",
            "parserA",
            Some("/tmp/x/1/template.json".into()),
        );
        job.set_task_handle(TaskHandle::new("t-1"));
        job.continue_with("parserA").unwrap();
        job.warn("odd unit");

        let doc = job.to_document().unwrap();
        assert_eq!(doc["status"], json!("PROGRESS"));
        assert_eq!(doc["task_handle"], json!("t-1"));

        let restored: CalcJob = serde_json::from_value(doc).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_from_document_requires_identity() {
        assert!(CalcJob::from_document(&json!({"parser_name": "p"})).is_err());
        assert!(CalcJob::from_document(&json!({"mainfile": "m"})).is_err());
    }

    #[tokio::test]
    async fn test_update_from_backend_without_handle() {
        let backend = MemoryBackend::new();
        let mut job = CalcJob::new("a/main.out", "parserA", None);
        assert!(!job.update_from_backend(&backend).await);
    }

    #[tokio::test]
    async fn test_update_from_backend_progress_then_success() {
        let backend = MemoryBackend::new();
        let handle = backend.submit(None);
        let mut job = CalcJob::new("a/main.out", "parserA", None);
        job.set_task_handle(handle.clone());

        assert!(!job.update_from_backend(&backend).await);

        backend
            .set_progress(
                &handle,
                Some(json!({"status": "PROGRESS", "current_task_name": "SystemNormalizer"})),
            )
            .unwrap();
        assert!(job.update_from_backend(&backend).await);
        assert_eq!(job.current_task_name(), Some("SystemNormalizer"));

        backend
            .set_success(
                &handle,
                json!({"status": "SUCCESS", "current_task_name": "archiving"}),
            )
            .unwrap();
        assert!(job.update_from_backend(&backend).await);
        assert_eq!(job.status(), ProcStatus::Success);

        // terminal jobs are left alone
        assert!(!job.update_from_backend(&backend).await);
    }

    #[tokio::test]
    async fn test_update_from_backend_fault() {
        let backend = MemoryBackend::new();
        let handle = backend.submit(None);
        let mut job = CalcJob::new("a/main.out", "parserA", None);
        job.set_task_handle(handle.clone());
        job.continue_with("parserA").unwrap();

        backend
            .set_failure(&handle, anyhow::anyhow!("parser crashed"))
            .unwrap();
        assert!(job.update_from_backend(&backend).await);
        assert_eq!(job.status(), ProcStatus::Failure);
        assert_eq!(job.errors()[0], "parser crashed");
    }

    #[tokio::test]
    async fn test_unavailable_backend_reports_no_change() {
        let backend = MemoryBackend::new();
        let handle = backend.submit(None);
        backend.set_success(&handle, json!({"status": "SUCCESS"})).unwrap();
        backend.set_available(false);

        let mut job = CalcJob::new("a/main.out", "parserA", None);
        job.set_task_handle(handle);
        let before = job.clone();

        assert!(!job.update_from_backend(&backend).await);
        assert_eq!(job, before);
    }
}
