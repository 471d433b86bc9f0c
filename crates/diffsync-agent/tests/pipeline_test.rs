//! End-to-end behaviour of the fetcher and applier against in-memory
//! capabilities.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use diffsync_agent::{
    AgentError, ApplyOutcome, ApplyStep, Applier, Fetcher, NoMigration, Role, ShutdownHandle,
    ShutdownSignal, StartMode, StepOutcome,
};
use diffsync_core::Batch;
use diffsync_storage::ArtifactFile;

fn applier(config: &diffsync_agent::SyncConfig, tool: &Arc<RecordingTool>) -> Applier {
    Applier::new(
        config,
        tool.clone(),
        Arc::new(NoMigration),
        ShutdownHandle::new(),
    )
}

#[tokio::test]
async fn test_end_to_end_single_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = FakeProducer::with_diffs(5);

    let mut fetcher = Fetcher::new(&config, producer.clone(), ShutdownHandle::new());
    assert_eq!(fetcher.start().await.unwrap(), id(0));
    let outcome = fetcher.step().await.unwrap();

    assert_eq!(
        outcome,
        StepOutcome::Advanced(Batch::new(id(0), id(5)).unwrap())
    );
    assert_eq!(producer.downloads(), 10);
    assert_eq!(Role::Fetcher.cursor(&config).read().await.unwrap(), id(5));

    let tool = RecordingTool::new();
    let mut applier = applier(&config, &tool);
    applier.start().await.unwrap();
    let step = applier.step().await.unwrap();

    assert_eq!(step, ApplyStep::Applied(Batch::new(id(0), id(5)).unwrap()));
    assert_eq!(Role::Applier.cursor(&config).read().await.unwrap(), id(5));

    let calls = tool.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].files,
        vec![
            "000000001.osc",
            "000000002.osc",
            "000000003.osc",
            "000000004.osc",
            "000000005.osc",
        ]
    );
    assert_eq!(calls[0].version, timestamp(5));
    assert_eq!(calls[0].first_body, change_body(1));

    // Nothing new on either side.
    assert!(matches!(
        fetcher.step().await.unwrap(),
        StepOutcome::Idle { .. }
    ));
    assert_eq!(applier.step().await.unwrap(), ApplyStep::Idle);
    // Scratch directories do not outlive their batch.
    assert_eq!(
        std::fs::read_dir(config.scratch_root()).unwrap().count(),
        0
    );
}

#[tokio::test]
async fn test_batches_are_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.max_batch_size = 2;
    let producer = FakeProducer::with_diffs(5);

    let mut fetcher = Fetcher::new(&config, producer.clone(), ShutdownHandle::new());
    fetcher.start().await.unwrap();
    let mut batches = Vec::new();
    while let StepOutcome::Advanced(batch) = fetcher.step().await.unwrap() {
        batches.push((batch.start().get(), batch.end().get()));
    }
    assert_eq!(batches, vec![(0, 2), (2, 4), (4, 5)]);

    let tool = RecordingTool::new();
    let mut applier = applier(&config, &tool);
    applier.start().await.unwrap();
    while let ApplyStep::Applied(_) = applier.step().await.unwrap() {}
    let applied: Vec<usize> = tool.calls().iter().map(|c| c.files.len()).collect();
    assert_eq!(applied, vec![2, 2, 1]);
}

#[tokio::test]
async fn test_refetching_published_batch_makes_no_requests() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = FakeProducer::with_diffs(5);

    let mut fetcher = Fetcher::new(&config, producer.clone(), ShutdownHandle::new());
    fetcher.start().await.unwrap();
    fetcher.step().await.unwrap();
    let downloads = producer.downloads();

    let batch = Batch::new(id(0), id(5)).unwrap();
    fetcher.fetch_batch(batch).await.unwrap();

    assert_eq!(producer.downloads(), downloads);
    assert_eq!(fetcher.current(), id(5));
    assert_eq!(Role::Fetcher.cursor(&config).read().await.unwrap(), id(5));
}

#[tokio::test]
async fn test_auto_resume_from_both_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = config.artifact_store();
    for seq in 3..=5 {
        seed_artifact(&store, seq);
    }
    Role::Fetcher.cursor(&config).write(id(5)).await.unwrap();
    Role::Applier.cursor(&config).write(id(2)).await.unwrap();

    let mut fetcher = Fetcher::new(&config, FakeProducer::with_diffs(5), ShutdownHandle::new());
    assert_eq!(fetcher.start().await.unwrap(), id(5));

    let tool = RecordingTool::new();
    let mut applier = applier(&config, &tool);
    assert_eq!(applier.start().await.unwrap(), id(2));
    assert_eq!(
        applier.collect_batch(id(2)).await.unwrap(),
        Batch::new(id(2), id(5))
    );
}

#[tokio::test]
async fn test_fetcher_never_resumes_behind_applier() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    Role::Fetcher.cursor(&config).write(id(3)).await.unwrap();
    Role::Applier.cursor(&config).write(id(9)).await.unwrap();

    let mut fetcher = Fetcher::new(&config, FakeProducer::new(), ShutdownHandle::new());
    assert_eq!(fetcher.start().await.unwrap(), id(9));

    let mut explicit = config.clone();
    explicit.start = StartMode::Explicit(id(1));
    let mut fetcher = Fetcher::new(&explicit, FakeProducer::new(), ShutdownHandle::new());
    assert_eq!(fetcher.start().await.unwrap(), id(1));
}

#[tokio::test]
async fn test_applier_stops_at_first_gap() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = config.artifact_store();
    for seq in [3, 4, 5, 7, 8] {
        seed_artifact(&store, seq);
    }

    let tool = RecordingTool::new();
    let applier = applier(&config, &tool);
    assert_eq!(
        applier.collect_batch(id(2)).await.unwrap(),
        Batch::new(id(2), id(5))
    );
    assert_eq!(applier.collect_batch(id(5)).await.unwrap(), None);
}

#[tokio::test]
async fn test_corrupt_download_blocks_cursor_and_is_refetched() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = FakeProducer::with_diffs(5);
    let store = config.artifact_store();
    let broken = store.relative_name(id(3), ArtifactFile::Change);
    producer.put(&broken, b"\x1f\x8b\x08 truncated".to_vec());

    let mut fetcher = Fetcher::new(&config, producer.clone(), ShutdownHandle::new());
    fetcher.start().await.unwrap();
    let err = fetcher.step().await.unwrap_err();

    assert!(matches!(
        err,
        AgentError::PartialBatch {
            requested: 5,
            failed: 1,
            ..
        }
    ));
    assert_eq!(fetcher.current(), id(0));
    assert_eq!(Role::Fetcher.cursor(&config).load().await.unwrap(), None);
    assert!(!store.is_available(id(3)));
    assert!(!store.path_of(id(3), ArtifactFile::Change).exists());
    assert!(store.is_available(id(4)));

    // The applier only sees what verified.
    let tool = RecordingTool::new();
    let applier = applier(&config, &tool);
    assert_eq!(
        applier.collect_batch(id(0)).await.unwrap(),
        Batch::new(id(0), id(2))
    );

    // Once the producer serves a good file, only it is transferred.
    producer.add_diff(3);
    let before = producer.downloads();
    assert!(matches!(
        fetcher.step().await.unwrap(),
        StepOutcome::Advanced(_)
    ));
    assert_eq!(producer.downloads() - before, 1);
    assert!(store.is_available(id(3)));
}

#[tokio::test]
async fn test_missing_remote_file_is_partial_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = FakeProducer::with_diffs(2);
    producer.set_latest(3);

    let mut fetcher = Fetcher::new(&config, producer.clone(), ShutdownHandle::new());
    fetcher.start().await.unwrap();
    let err = fetcher.step().await.unwrap_err();
    assert!(matches!(err, AgentError::PartialBatch { failed: 1, .. }));
    assert_eq!(fetcher.current(), id(0));
}

#[tokio::test]
async fn test_unreachable_producer_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = FakeProducer::with_diffs(5);
    producer.set_reachable(false);

    let mut fetcher = Fetcher::new(&config, producer.clone(), ShutdownHandle::new());
    fetcher.start().await.unwrap();
    assert!(matches!(
        fetcher.step().await,
        Err(AgentError::Configuration(_))
    ));
    assert_eq!(producer.state_requests(), 1);

    // The run loop gives up too.
    let fetcher = Fetcher::new(&config, producer, ShutdownHandle::new());
    assert!(matches!(
        fetcher.run().await,
        Err(AgentError::Configuration(_))
    ));
}

#[tokio::test]
async fn test_outage_after_first_contact_is_waited_out() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = FakeProducer::with_diffs(2);

    let mut fetcher = Fetcher::new(&config, producer.clone(), ShutdownHandle::new());
    fetcher.start().await.unwrap();
    fetcher.step().await.unwrap();

    producer.add_diff(3);
    producer.set_latest(3);
    producer.fail_state_polls(4);
    let polls = producer.state_requests();

    assert_eq!(
        fetcher.step().await.unwrap(),
        StepOutcome::Advanced(Batch::new(id(2), id(3)).unwrap())
    );
    assert_eq!(producer.state_requests() - polls, 5);
}

#[tokio::test]
async fn test_apply_retries_then_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = config.artifact_store();
    for seq in 1..=3 {
        seed_artifact(&store, seq);
    }

    let tool = RecordingTool::new();
    let failure = ApplyOutcome::Failed {
        code: Some(1),
        detail: "deadlock detected".into(),
    };
    tool.script(vec![failure.clone(), failure]);

    let mut applier = applier(&config, &tool);
    applier.start().await.unwrap();
    assert!(matches!(
        applier.step().await.unwrap(),
        ApplyStep::Applied(_)
    ));
    assert_eq!(tool.calls().len(), 3);
    assert_eq!(Role::Applier.cursor(&config).read().await.unwrap(), id(3));
}

#[tokio::test]
async fn test_exhausted_apply_retries_leave_batch_pending() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = config.artifact_store();
    for seq in 1..=3 {
        seed_artifact(&store, seq);
    }

    let tool = RecordingTool::new();
    let failure = ApplyOutcome::Failed {
        code: Some(2),
        detail: "out of disk".into(),
    };
    tool.script(vec![failure.clone(), failure.clone(), failure]);

    let mut applier = applier(&config, &tool);
    applier.start().await.unwrap();
    assert!(matches!(
        applier.step().await,
        Err(AgentError::ApplyTool(_))
    ));
    assert_eq!(Role::Applier.cursor(&config).load().await.unwrap(), None);
    assert_eq!(applier.current(), id(0));

    // The same range is offered again, never a later one.
    assert_eq!(
        applier.step().await.unwrap(),
        ApplyStep::Applied(Batch::new(id(0), id(3)).unwrap())
    );
}

#[tokio::test]
async fn test_tool_shutdown_request_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    seed_artifact(&config.artifact_store(), 1);

    let tool = RecordingTool::new();
    tool.script(vec![ApplyOutcome::ShutdownRequested]);
    let shutdown = ShutdownHandle::new();
    let mut applier = Applier::new(&config, tool.clone(), Arc::new(NoMigration), shutdown.clone());
    applier.start().await.unwrap();

    assert!(applier.step().await.unwrap_err().is_shutdown());
    assert_eq!(tool.calls().len(), 1);
    assert_eq!(shutdown.signal(), Some(ShutdownSignal::ToolRequested));
    assert_eq!(Role::Applier.cursor(&config).load().await.unwrap(), None);
}

#[tokio::test]
async fn test_run_loops_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = FakeProducer::with_diffs(4);
    let tool = RecordingTool::new();
    let shutdown = ShutdownHandle::new();

    let fetcher = tokio::spawn(Fetcher::new(&config, producer.clone(), shutdown.clone()).run());
    let applier = tokio::spawn(
        Applier::new(&config, tool.clone(), tool.migration(), shutdown.clone()).run(),
    );

    let apply_cursor = Role::Applier.cursor(&config);
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while apply_cursor.read().await.unwrap() < id(4) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "applier never caught up");

    shutdown.shutdown();
    fetcher.await.unwrap().unwrap();
    applier.await.unwrap().unwrap();

    assert!(!tool.applied_before_migration());
    assert_eq!(Role::Fetcher.cursor(&config).read().await.unwrap(), id(4));
}

#[tokio::test]
async fn test_stale_partial_downloads_swept_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = config.artifact_store();
    let stale = store.prepare_temp(id(7), ArtifactFile::Change).unwrap();
    std::fs::write(&stale, b"half a download").unwrap();

    let mut fetcher = Fetcher::new(&config, FakeProducer::new(), ShutdownHandle::new());
    fetcher.start().await.unwrap();
    assert!(!stale.exists());
}

#[tokio::test]
async fn test_shutdown_mid_download_discards_partial_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let producer = StallingProducer::with_diffs(5);
    let shutdown = ShutdownHandle::new();

    let mut fetcher = Fetcher::new(&config, producer.clone(), shutdown.clone());
    fetcher.start().await.unwrap();

    let trigger = shutdown.clone();
    let watched = producer.clone();
    tokio::spawn(async move {
        while watched.started() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        trigger.trigger(ShutdownSignal::SigTerm);
    });

    let result = tokio::time::timeout(Duration::from_secs(10), fetcher.step())
        .await
        .expect("fetch did not stop on shutdown");

    assert!(matches!(result, Err(AgentError::Shutdown)));
    assert!(producer.started() > 0);
    assert_eq!(temp_files(&config.diff_dir), Vec::<std::path::PathBuf>::new());
    assert!(!Role::Fetcher.cursor_path(&config).exists());
    assert_eq!(fetcher.current(), id(0));
}

#[tokio::test]
async fn test_version_read_retries_until_state_file_is_complete() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path());
    config.timing.metadata_attempts = 50;
    config.timing.metadata_wait_ms = 10;
    let store = config.artifact_store();
    seed_artifact(&store, 1);
    seed_artifact(&store, 2);

    let state_path = store.path_of(id(2), ArtifactFile::State);
    std::fs::write(&state_path, "sequenceNumber=2\n").unwrap();

    let tool = RecordingTool::new();
    let mut applier = applier(&config, &tool);
    applier.start().await.unwrap();

    let writer = tokio::spawn({
        let state_path = state_path.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            std::fs::write(&state_path, state_text(2)).unwrap();
        }
    });
    assert_eq!(applier.extract_version(id(2)).await.unwrap(), timestamp(2));
    writer.await.unwrap();

    assert_eq!(
        applier.step().await.unwrap(),
        ApplyStep::Applied(Batch::new(id(0), id(2)).unwrap())
    );
    assert_eq!(tool.calls()[0].version, timestamp(2));
}

#[tokio::test]
async fn test_version_read_gives_up_after_bounded_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = config.artifact_store();
    seed_artifact(&store, 1);
    std::fs::write(
        store.path_of(id(1), ArtifactFile::State),
        "sequenceNumber=1\n",
    )
    .unwrap();

    let tool = RecordingTool::new();
    let applier = applier(&config, &tool);
    assert!(matches!(
        applier.extract_version(id(1)).await,
        Err(AgentError::Core(_))
    ));
}

#[tokio::test]
async fn test_shutdown_during_apply_removes_scratch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path());
    let store = config.artifact_store();
    for seq in 1..=3 {
        seed_artifact(&store, seq);
    }

    let tool = BlockingTool::new();
    let shutdown = ShutdownHandle::new();
    let mut applier = Applier::new(&config, tool.clone(), Arc::new(NoMigration), shutdown.clone());
    applier.start().await.unwrap();

    let trigger = shutdown.clone();
    let watched = tool.clone();
    tokio::spawn(async move {
        while watched.input_dirs().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        trigger.trigger(ShutdownSignal::SigTerm);
    });

    let result = tokio::time::timeout(Duration::from_secs(10), applier.step())
        .await
        .expect("apply did not stop on shutdown");

    assert!(result.unwrap_err().is_shutdown());
    assert_eq!(shutdown.signal(), Some(ShutdownSignal::SigTerm));
    let dirs = tool.input_dirs();
    assert_eq!(dirs.len(), 1);
    assert!(!dirs[0].exists());
    assert_eq!(
        std::fs::read_dir(config.scratch_root()).unwrap().count(),
        0
    );
    assert_eq!(Role::Applier.cursor(&config).load().await.unwrap(), None);
}
