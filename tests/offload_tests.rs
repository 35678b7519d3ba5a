//! Integration tests for job directories and the offload cycle.


use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use tempfile::TempDir;
use tokio::sync::mpsc;

use drone_dispatch::config::OffloaderConfig;
use drone_dispatch::offload::{
    CompletionService, InMemoryCompletionService, JobDirectory, JobKind, OffloadOutcome,
    OffloadRequest, Offloader, StatusFileCompletionService,
};
use test_harness::{make_job_dir, make_test_dir, RecordingNotifier};

fn channel() -> (
    mpsc::UnboundedSender<OffloadRequest>,
    mpsc::UnboundedReceiver<OffloadRequest>,
) {
    mpsc::unbounded_channel()
}

// =============================================================================
// JobDirectory
// =============================================================================

#[tokio::test]
async fn test_unfinished_job_is_not_enqueued() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = InMemoryCompletionService::new();
    let mut job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    let (tx, mut rx) = channel();

    let outcome = job.enqueue_offload(&tx, 0, &service).await.unwrap();

    assert_eq!(outcome, OffloadOutcome::NotFinished);
    assert_eq!(job.get_failure_count(), 0);
    assert!(job.get_failure_time().is_none());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_zero_age_enqueues_as_soon_as_finished() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = InMemoryCompletionService::new();
    service.finish_job(118, Utc::now(), vec![Utc::now()]).await;
    let mut job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    let (tx, mut rx) = channel();

    let outcome = job.enqueue_offload(&tx, 0, &service).await.unwrap();

    assert_eq!(outcome, OffloadOutcome::Enqueued);
    assert_eq!(job.get_failure_count(), 1);
    let request = rx.try_recv().unwrap();
    assert_eq!(request.dir, root.path().join("118-fubar"));
    assert_eq!(request.dest, "");
}

#[tokio::test]
async fn test_age_limit_holds_young_jobs() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    make_job_dir(root.path(), "117-fubar");
    let service = InMemoryCompletionService::new();
    let created = Utc::now() - Duration::days(30);
    service
        .finish_job(118, created, vec![Utc::now() - Duration::days(7) + Duration::minutes(1)])
        .await;
    service
        .finish_job(117, created, vec![Utc::now() - Duration::days(7) - Duration::minutes(1)])
        .await;
    let (tx, _rx) = channel();

    let mut young = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    let mut old = JobDirectory::regular(root.path(), "117-fubar").unwrap();

    assert_eq!(
        young.enqueue_offload(&tx, 7, &service).await.unwrap(),
        OffloadOutcome::NotExpired
    );
    assert_eq!(young.get_failure_count(), 0);
    assert_eq!(
        old.enqueue_offload(&tx, 7, &service).await.unwrap(),
        OffloadOutcome::Enqueued
    );
}

#[tokio::test]
async fn test_age_limit_past_the_calendar_never_expires() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = InMemoryCompletionService::new();
    service.finish_job(118, Utc::now(), Vec::new()).await;
    let mut job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    let (tx, _rx) = channel();

    let outcome = job.enqueue_offload(&tx, u32::MAX, &service).await.unwrap();

    assert_eq!(outcome, OffloadOutcome::NotExpired);
    assert_eq!(job.get_failure_count(), 0);
}

#[tokio::test]
async fn test_reportable_after_second_attempt() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "hosts/host1/118-reset");
    let service = InMemoryCompletionService::new();
    service.finish_special_task(118, Utc::now()).await;
    let mut job = JobDirectory::special(root.path(), "hosts/host1/118-reset").unwrap();
    let (tx, mut rx) = channel();

    job.enqueue_offload(&tx, 0, &service).await.unwrap();
    let first_failure = job.get_failure_time().unwrap();
    assert!(!job.is_reportable());

    job.enqueue_offload(&tx, 0, &service).await.unwrap();
    assert!(job.is_reportable());
    assert_eq!(job.get_failure_count(), 2);
    assert_eq!(job.get_failure_time(), Some(first_failure));
    assert_eq!(rx.try_recv().unwrap().dest, "hosts/host1");
}

#[tokio::test]
async fn test_is_offloaded_tracks_directory_existence() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let job = JobDirectory::regular(root.path(), "118-fubar").unwrap();

    // Never attempted, but present: not offloaded.
    assert!(!job.is_offloaded());
    std::fs::remove_dir_all(job.path()).unwrap();
    assert!(job.is_offloaded());
}

#[tokio::test]
async fn test_no_offload_everywhere_deletes_job() {
    let root = TempDir::new().unwrap();
    make_test_dir(root.path(), "118-fubar", "test1", Some(true));
    make_test_dir(root.path(), "118-fubar", "test2", Some(true));
    let service = InMemoryCompletionService::new();
    service.finish_job(118, Utc::now(), Vec::new()).await;
    let mut job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    let (tx, mut rx) = channel();

    let outcome = job.enqueue_offload(&tx, 0, &service).await.unwrap();

    assert_eq!(outcome, OffloadOutcome::NothingToOffload);
    assert!(job.is_offloaded());
    assert_eq!(job.get_failure_count(), 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_no_offload_only_drops_marked_tests() {
    let root = TempDir::new().unwrap();
    make_test_dir(root.path(), "118-fubar", "skip_me", Some(true));
    make_test_dir(root.path(), "118-fubar", "keep_me", Some(false));
    make_test_dir(root.path(), "118-fubar", "plain", None);
    let service = InMemoryCompletionService::new();
    service.finish_job(118, Utc::now(), Vec::new()).await;
    let mut job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    let (tx, _rx) = channel();

    let outcome = job.enqueue_offload(&tx, 0, &service).await.unwrap();

    assert_eq!(outcome, OffloadOutcome::Enqueued);
    assert!(!job.path().join("skip_me").exists());
    assert!(job.path().join("keep_me").exists());
    assert!(job.path().join("plain").exists());
}

#[tokio::test]
async fn test_regular_timestamp_is_last_host_queue_entry() {
    let root = TempDir::new().unwrap();
    let service = InMemoryCompletionService::new();
    let created = Utc.with_ymd_and_hms(2024, 3, 14, 15, 0, 0).unwrap();
    let early = Utc.with_ymd_and_hms(2024, 3, 14, 16, 0, 0).unwrap();
    let late = Utc.with_ymd_and_hms(2024, 3, 14, 17, 0, 0).unwrap();
    service.finish_job(118, created, vec![late, early]).await;
    service.finish_job(117, created, Vec::new()).await;

    let job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    assert_eq!(job.get_timestamp_if_finished(&service).await.unwrap(), Some(late));

    // All entries aborted: fall back to creation time.
    let job = JobDirectory::regular(root.path(), "117-fubar").unwrap();
    assert_eq!(job.get_timestamp_if_finished(&service).await.unwrap(), Some(created));

    let job = JobDirectory::regular(root.path(), "116-fubar").unwrap();
    assert_eq!(job.get_timestamp_if_finished(&service).await.unwrap(), None);
}

#[tokio::test]
async fn test_special_timestamp_is_task_completion() {
    let root = TempDir::new().unwrap();
    let service = InMemoryCompletionService::new();
    let finished = Utc.with_ymd_and_hms(2024, 3, 14, 16, 0, 0).unwrap();
    service.finish_special_task(118, finished).await;

    let job = JobDirectory::special(root.path(), "hosts/host1/118-reset").unwrap();
    assert_eq!(job.get_timestamp_if_finished(&service).await.unwrap(), Some(finished));

    // A regular job with the same id is a different record.
    let job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    assert_eq!(job.get_timestamp_if_finished(&service).await.unwrap(), None);
}

#[tokio::test]
async fn test_service_errors_leave_job_untouched() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = InMemoryCompletionService::new();
    service.finish_job(118, Utc::now(), Vec::new()).await;
    service.set_unavailable(true).await;
    let mut job = JobDirectory::regular(root.path(), "118-fubar").unwrap();
    let (tx, _rx) = channel();

    assert!(job.enqueue_offload(&tx, 0, &service).await.is_err());
    assert_eq!(job.get_failure_count(), 0);
}

#[test]
fn test_get_job_directories_filters_entries() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    make_job_dir(root.path(), "117-fubar");
    make_job_dir(root.path(), "not-a-job");
    std::fs::write(root.path().join("119-file"), "not a directory").unwrap();
    make_job_dir(root.path(), "hosts/host1/333-reset");
    make_job_dir(root.path(), "hosts/host2/334-repair");
    make_job_dir(root.path(), "hosts/host2/lost+found");

    let mut regular = JobKind::Regular.get_job_directories(root.path()).unwrap();
    regular.sort();
    assert_eq!(regular, vec!["117-fubar", "118-fubar"]);

    let mut special = JobKind::Special.get_job_directories(root.path()).unwrap();
    special.sort();
    assert_eq!(special, vec!["hosts/host1/333-reset", "hosts/host2/334-repair"]);
}

// =============================================================================
// Offloader
// =============================================================================

fn delete_only_offloader(
    root: &TempDir,
    service: Arc<dyn CompletionService>,
    notifier: Arc<RecordingNotifier>,
) -> Offloader {
    let mut config = OffloaderConfig::new(root.path()).all().with_parallelism(2);
    config.delete_only = true;
    Offloader::new(config, service, notifier)
}

#[tokio::test]
async fn test_offload_once_removes_finished_jobs() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    make_job_dir(root.path(), "117-fubar");
    make_job_dir(root.path(), "hosts/host1/333-reset");
    let service = Arc::new(InMemoryCompletionService::new());
    service.finish_job(118, Utc::now(), Vec::new()).await;
    service.finish_special_task(333, Utc::now()).await;
    let notifier = RecordingNotifier::new();
    let mut offloader = delete_only_offloader(&root, service, notifier.clone());

    let summary = offloader.offload_once().await.unwrap();

    assert_eq!(summary.new_jobs, 3);
    assert_eq!(summary.enqueued, 2);
    assert_eq!(summary.removed, 2);
    assert_eq!(summary.open, 1);
    assert!(!summary.reported);
    assert!(!root.path().join("118-fubar").exists());
    assert!(!root.path().join("hosts/host1/333-reset").exists());
    assert!(root.path().join("117-fubar").exists());
    assert!(offloader.open_jobs().contains_key("117-fubar"));
    assert!(notifier.messages().is_empty());
}

#[tokio::test]
async fn test_add_new_jobs_keeps_existing_state() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = Arc::new(InMemoryCompletionService::new());
    let mut offloader = delete_only_offloader(&root, service.clone(), RecordingNotifier::new());

    assert_eq!(offloader.add_new_jobs().unwrap(), 1);
    assert_eq!(offloader.add_new_jobs().unwrap(), 0);

    make_job_dir(root.path(), "119-fubar");
    let summary = offloader.offload_once().await.unwrap();
    assert_eq!(summary.new_jobs, 1);
    assert_eq!(summary.open, 2);

    service.finish_job(119, Utc::now(), Vec::new()).await;
    let summary = offloader.offload_once().await.unwrap();
    assert_eq!(summary.new_jobs, 0);
    assert_eq!(summary.removed, 1);
    assert_eq!(
        offloader.open_jobs().keys().collect::<Vec<_>>(),
        vec!["118-fubar"]
    );
}

#[tokio::test]
async fn test_unavailable_service_skips_jobs() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    make_job_dir(root.path(), "117-fubar");
    let service = Arc::new(InMemoryCompletionService::new());
    service.finish_job(118, Utc::now(), Vec::new()).await;
    service.set_unavailable(true).await;
    let mut offloader = delete_only_offloader(&root, service.clone(), RecordingNotifier::new());

    let summary = offloader.offload_once().await.unwrap();
    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.open, 2);

    // Picked up again once the service recovers.
    service.set_unavailable(false).await;
    let summary = offloader.offload_once().await.unwrap();
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.open, 1);
}

#[tokio::test]
async fn test_offload_once_with_status_file() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    make_job_dir(root.path(), "hosts/host1/333-reset");
    let status = root.path().join("status.json");
    std::fs::write(
        &status,
        r#"{"jobs": {"118": {"created_on": "2024-03-14T15:09:26Z",
                             "host_queue_entries": ["2024-03-14T16:00:00Z"]}}}"#,
    )
    .unwrap();
    let service = Arc::new(StatusFileCompletionService::new(&status));
    let mut offloader = delete_only_offloader(&root, service, RecordingNotifier::new());

    let summary = offloader.offload_once().await.unwrap();

    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.open, 1);
    assert!(offloader.open_jobs().contains_key("hosts/host1/333-reset"));
}

#[tokio::test]
async fn test_missing_status_file_is_not_fatal() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = Arc::new(StatusFileCompletionService::new(root.path().join("missing.json")));
    let mut offloader = delete_only_offloader(&root, service, RecordingNotifier::new());

    let summary = offloader.offload_once().await.unwrap();
    assert_eq!(summary.enqueued, 0);
    assert_eq!(summary.open, 1);
}

fn upload_offloader(
    root: &TempDir,
    gsutil_script: &str,
    service: Arc<dyn CompletionService>,
    notifier: Arc<RecordingNotifier>,
) -> Offloader {
    let mut config = OffloaderConfig::new(root.path());
    // `sh -c <script> gsutil <args...>` sees the gsutil arguments as $1...
    config.gsutil = vec![
        "sh".to_string(),
        "-c".to_string(),
        gsutil_script.to_string(),
        "gsutil".to_string(),
    ];
    config.gs_uri = "gs://a-test-bucket/".to_string();
    Offloader::new(config, service, notifier)
}

#[tokio::test]
async fn test_successful_upload_removes_directory() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = Arc::new(InMemoryCompletionService::new());
    service.finish_job(118, Utc::now(), Vec::new()).await;
    let notifier = RecordingNotifier::new();
    let mut offloader = upload_offloader(
        &root,
        r#"[ "$1" = rsync ] && [ "$2" = -eR ] && [ -d "$3" ] && [ "$4" = gs://a-test-bucket/118-fubar ]"#,
        service,
        notifier.clone(),
    );

    let summary = offloader.offload_once().await.unwrap();

    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.removed, 1);
    assert_eq!(summary.open, 0);
    assert!(!root.path().join("118-fubar").exists());
    assert!(notifier.messages().is_empty());
}

#[tokio::test]
async fn test_failed_upload_keeps_directory_until_reported() {
    let root = TempDir::new().unwrap();
    make_job_dir(root.path(), "118-fubar");
    let service = Arc::new(InMemoryCompletionService::new());
    service.finish_job(118, Utc::now(), Vec::new()).await;
    let notifier = RecordingNotifier::new();
    let mut offloader = upload_offloader(
        &root,
        "echo 'AccessDeniedException: 403' >&2; exit 1",
        service,
        notifier.clone(),
    );

    let summary = offloader.offload_once().await.unwrap();
    assert_eq!(summary.enqueued, 1);
    assert_eq!(summary.removed, 0);
    assert!(!summary.reported);
    let job = &offloader.open_jobs()["118-fubar"];
    assert!(!job.is_offloaded());
    assert_eq!(job.get_failure_count(), 1);
    assert!(!job.is_reportable());

    let summary = offloader.offload_once().await.unwrap();
    assert!(summary.reported);
    let job = &offloader.open_jobs()["118-fubar"];
    assert!(root.path().join("118-fubar/status.log").exists());
    assert_eq!(job.get_failure_count(), 2);
    assert!(job.is_reportable());

    let messages = notifier.messages();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.contains("118-fubar"));
}
