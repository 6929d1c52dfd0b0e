//! Reconciliation of upload jobs against the in-memory backend

use pretty_assertions::assert_eq;
use proctrack::{
    HandleChain, MemoryBackend, ProcError, ProcStatus, TaskHandle, UploadJob,
};
use serde_json::{json, Value};

/// Upload with a four-stage handle chain; entry 0 is the `cleanup` task
fn upload_with_chain(backend: &MemoryBackend) -> (UploadJob, Vec<TaskHandle>) {
    let mut upload = UploadJob::new("upload-1").unwrap();
    let chain = backend.submit_chain(4).unwrap();
    let handles: Vec<TaskHandle> = chain.walk().cloned().collect();
    upload.set_handle_chain(chain);
    (upload, handles)
}

fn stage_payload(task: &str) -> Value {
    json!({"status": "PROGRESS", "current_task_name": task})
}

#[tokio::test]
async fn test_fault_on_outermost_handle_fails_upload() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);

    backend
        .set_failure(&handles[0], anyhow::anyhow!("cleanup exploded"))
        .unwrap();

    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.status(), ProcStatus::Failure);
    assert!(!upload.errors().is_empty());
    assert_eq!(upload.errors()[0], "cleanup exploded");
    assert_eq!(upload.current_task_name(), Some("cleanup"));
}

#[tokio::test]
async fn test_fault_on_inner_handle_names_its_stage() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);

    backend
        .set_success(&handles[3], stage_payload("uploading"))
        .unwrap();
    backend.set_failure(&handles[2], "archive is corrupt").unwrap();

    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.status(), ProcStatus::Failure);
    assert_eq!(upload.current_task_name(), Some("extracting"));
    assert_eq!(upload.errors(), ["archive is corrupt"]);
}

#[tokio::test]
async fn test_only_first_reporting_handle_is_consulted() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);

    backend
        .set_success(&handles[3], json!({"current_task_name": "uploading", "upload_hash": "old"}))
        .unwrap();
    backend
        .set_progress(
            &handles[1],
            Some(json!({"current_task_name": "parse_all", "upload_hash": "h-1"})),
        )
        .unwrap();

    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.current_task_name(), Some("parse_all"));
    assert_eq!(upload.upload_hash(), Some("h-1"));
    assert_eq!(upload.status(), ProcStatus::Progress);
}

#[tokio::test]
async fn test_progress_without_info_keeps_walking() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);

    backend.set_progress(&handles[1], None).unwrap();
    backend
        .set_success(&handles[2], stage_payload("extracting"))
        .unwrap();

    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.current_task_name(), Some("extracting"));
}

#[tokio::test]
async fn test_nothing_reported_means_no_change() {
    let backend = MemoryBackend::new();
    let (mut upload, _handles) = upload_with_chain(&backend);
    let before = upload.clone();

    assert!(!upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload, before);
}

#[tokio::test]
async fn test_calc_jobs_are_reconciled_after_the_walk() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);

    let calc_a = backend.submit(None);
    let calc_b = backend.submit(None);
    backend
        .set_progress(
            &handles[1],
            Some(json!({
                "current_task_name": "parse_all",
                "calc_jobs": [
                    {
                        "mainfile": "a/main.out",
                        "parser_name": "parserA",
                        "task_handle": calc_a.as_str()
                    },
                    {
                        "mainfile": "b/main.out",
                        "parser_name": "parserA",
                        "task_handle": calc_b.as_str()
                    }
                ]
            })),
        )
        .unwrap();

    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.calc_jobs().len(), 2);
    assert_eq!(upload.calc_jobs()[0].mainfile(), "a/main.out");
    assert_eq!(upload.calc_jobs()[1].mainfile(), "b/main.out");

    backend
        .set_success(&calc_a, json!({"status": "SUCCESS", "current_task_name": "archiving"}))
        .unwrap();
    backend.set_failure(&calc_b, "parser crashed").unwrap();

    // the upload itself reports the same progress again; the calcs moved on
    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.calc_jobs()[0].status(), ProcStatus::Success);
    assert_eq!(upload.calc_jobs()[1].status(), ProcStatus::Failure);
    assert_eq!(upload.calc_jobs()[1].errors(), ["parser crashed"]);

    // calc failures are reported, not propagated
    assert_eq!(upload.status(), ProcStatus::Progress);
    assert_eq!(upload.summary().failure, 1);
    assert_eq!(upload.summary().success, 1);
}

#[tokio::test]
async fn test_unavailable_backend_leaves_state_untouched() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);
    upload.add_calc_job("a/main.out", "parserA", None);
    let calc = backend.submit(None);
    upload.calc_jobs_mut()[0].set_task_handle(calc.clone());

    backend.set_failure(&handles[0], "boom").unwrap();
    backend
        .set_success(&calc, json!({"status": "SUCCESS"}))
        .unwrap();
    backend.set_available(false);

    let before = upload.clone();
    assert!(!upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload, before);

    backend.set_available(true);
    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.status(), ProcStatus::Failure);
}

#[tokio::test]
async fn test_ready_matches_terminal_status() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);

    assert!(!upload.ready(&backend).await.unwrap());
    assert!(!upload.status().is_terminal());

    backend
        .set_success(&handles[0], json!({"status": "SUCCESS", "current_task_name": "cleanup"}))
        .unwrap();
    assert!(upload.ready(&backend).await.unwrap());
    assert_eq!(upload.status(), ProcStatus::Success);
    assert_eq!(upload.current_task_name(), Some("cleanup"));
}

#[tokio::test]
async fn test_terminal_upload_is_not_reconciled() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);
    upload.fail("cancelled by operator");

    backend
        .set_success(&handles[0], json!({"status": "SUCCESS"}))
        .unwrap();
    assert!(!upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.status(), ProcStatus::Failure);
    assert!(!upload.continue_with("cleanup").unwrap());
}

#[tokio::test]
async fn test_forget_releases_upload_chain_only() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);
    let calc = backend.submit(None);
    upload
        .add_calc_job("a/main.out", "parserA", None)
        .set_task_handle(calc.clone());

    let err = upload.forget(&backend).await.unwrap_err();
    assert!(matches!(err, ProcError::PreconditionViolation { .. }));
    assert!(backend.released().is_empty());

    backend
        .set_success(&handles[0], json!({"status": "SUCCESS"}))
        .unwrap();
    upload.forget(&backend).await.unwrap();

    assert_eq!(backend.released(), handles);
    assert!(backend.contains(&calc));

    assert_eq!(upload.forget_calc_jobs(&backend).await.unwrap(), 1);
    assert!(!backend.contains(&calc));
}

#[tokio::test]
async fn test_resolved_chain_drives_reconciliation() {
    let backend = MemoryBackend::new();
    let uploading = TaskHandle::new("uploading-task");
    let extracting = TaskHandle::new("extracting-task");
    backend.submit_with_handle(uploading.clone(), None);
    backend.submit_with_handle(extracting.clone(), Some(&uploading));

    let chain = HandleChain::resolve(&backend, extracting.clone())
        .await
        .unwrap();
    assert_eq!(
        chain.walk().cloned().collect::<Vec<_>>(),
        vec![extracting.clone(), uploading.clone()]
    );

    let mut upload = UploadJob::new("upload-2").unwrap();
    upload.set_handle_chain(chain);

    // two handles against four stages: the outermost maps to `cleanup`
    backend.set_failure(&extracting, "bad archive").unwrap();
    assert!(upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload.current_task_name(), Some("cleanup"));
}

#[tokio::test]
async fn test_chain_longer_than_stages_stops_without_change() {
    let backend = MemoryBackend::new();
    let mut upload = UploadJob::new("upload-3").unwrap();
    let chain = backend.submit_chain(5).unwrap();
    let handles: Vec<TaskHandle> = chain.walk().cloned().collect();
    upload.set_handle_chain(chain);

    // only the fifth handle, which has no stage of its own, has finished
    backend.set_failure(&handles[4], "stray task").unwrap();
    let before = upload.clone();

    assert!(!upload.update_from_backend(&backend).await.unwrap());
    assert_eq!(upload, before);
    assert_eq!(upload.status(), ProcStatus::Progress);
}

#[tokio::test]
async fn test_resolve_rejects_parent_cycle() {
    let backend = MemoryBackend::new();
    let first = TaskHandle::new("first");
    let second = TaskHandle::new("second");
    backend.submit_with_handle(first.clone(), Some(&second));
    backend.submit_with_handle(second.clone(), Some(&first));

    let err = HandleChain::resolve(&backend, first).await.unwrap_err();
    assert!(matches!(err, ProcError::PreconditionViolation { .. }));
}

#[tokio::test]
async fn test_forget_releases_every_chain_entry() {
    let backend = MemoryBackend::new();
    let (mut upload, handles) = upload_with_chain(&backend);
    backend
        .set_success(&handles[0], json!({"status": "SUCCESS"}))
        .unwrap();

    upload.forget(&backend).await.unwrap();
    for handle in &handles {
        assert!(!backend.contains(handle));
    }
    assert_eq!(backend.released().len(), upload.handle_chain().unwrap().len());
}
