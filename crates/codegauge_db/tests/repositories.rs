//! Integration tests for the repository layer: CAS discipline, uniqueness,
//! registry ownership and cascade deletes.

use codegauge_db::{
    create_pool, init_schema, CkMetricUpsert, CommitMetricUpsert, DatasetConfig, DbConfig, DbError,
    DbPool, DatasetRepository, JobRepository, MetricRepository, ModelRepository, NewJob, NewModel,
    RegistryKind, RegistryRepository, RepoRepository, TerminalResults, XaiRepository,
};
use codegauge_protocol::{CapabilityDescriptor, JobKind, JobStatus, TaskId, XaiType};

async fn pool() -> DbPool {
    let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
    init_schema(&pool).await.unwrap();
    pool
}

async fn seed_repo(pool: &DbPool) -> i64 {
    RepoRepository::new(pool.clone())
        .create("https://example.com/acme/widget.git")
        .await
        .unwrap()
        .id
}

async fn seed_dataset(pool: &DbPool, repo_id: i64) -> i64 {
    DatasetRepository::new(pool.clone())
        .create(
            repo_id,
            "d",
            &DatasetConfig {
                feature_columns: vec!["la".into()],
                target_column: "is_buggy".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .id
}

#[tokio::test]
async fn test_job_lifecycle_cas() {
    let pool = pool().await;
    let jobs = JobRepository::new(pool.clone());

    let job = jobs.create(&NewJob::new(JobKind::Training)).await.unwrap();
    assert_eq!(job.status(), JobStatus::Pending);
    assert!(job.started_at.is_none());
    assert!(job.completed_at.is_none());

    let task = TaskId::from("task-1");
    assert!(jobs.mark_running(job.id, &task).await.unwrap());
    let row = jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Running);
    assert!(row.started_at.is_some());
    assert!(row.completed_at.is_none());

    // second claim loses the race
    assert!(!jobs.mark_running(job.id, &task).await.unwrap());

    assert!(jobs
        .complete(job.id, JobStatus::Success, "done", &TerminalResults::default())
        .await
        .unwrap());
    let row = jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Success);
    assert!(row.completed_at.is_some());
    assert!(row.completed_at.unwrap() >= row.started_at.unwrap());
    assert!(row.updated_at >= row.created_at);
}

#[tokio::test]
async fn test_terminal_rows_refuse_further_transitions() {
    let pool = pool().await;
    let jobs = JobRepository::new(pool.clone());
    let job = jobs.create(&NewJob::new(JobKind::Inference)).await.unwrap();

    jobs.mark_running(job.id, &TaskId::from("t")).await.unwrap();
    jobs.complete(job.id, JobStatus::Failed, "boom", &TerminalResults::default())
        .await
        .unwrap();

    // Revoking an already-terminal job is a no-op on the row.
    let moved = jobs
        .try_transition(job.id, JobStatus::Running, JobStatus::Revoked, None)
        .await
        .unwrap();
    assert!(!moved);
    assert_eq!(jobs.get_required(job.id).await.unwrap().status(), JobStatus::Failed);

    // Illegal edges are rejected before touching the database.
    let err = jobs
        .try_transition(job.id, JobStatus::Failed, JobStatus::Running, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::IllegalTransition(_)));
}

#[tokio::test]
async fn test_dispatch_claim_is_exclusive_and_ordered() {
    let pool = pool().await;
    let jobs = JobRepository::new(pool.clone());

    let first = jobs.create(&NewJob::new(JobKind::Training)).await.unwrap();
    let second = jobs.create(&NewJob::new(JobKind::Training)).await.unwrap();
    let other_kind = jobs.create(&NewJob::new(JobKind::Inference)).await.unwrap();

    let claimed = jobs
        .claim_next_for_dispatch(&[JobKind::Training])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, first.id);

    let claimed = jobs
        .claim_next_for_dispatch(&[JobKind::Training])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, second.id);

    // nothing left for this kind
    assert!(jobs
        .claim_next_for_dispatch(&[JobKind::Training])
        .await
        .unwrap()
        .is_none());

    // the inference job is still claimable by its own kind
    let claimed = jobs
        .claim_next_for_dispatch(&[JobKind::Inference])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, other_kind.id);

    // requeue makes a job claimable again
    jobs.requeue_dispatch(first.id).await.unwrap();
    let claimed = jobs
        .claim_next_for_dispatch(&[JobKind::Training])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, first.id);
}

#[tokio::test]
async fn test_model_versioning_and_uniqueness() {
    let pool = pool().await;
    let models = ModelRepository::new(pool.clone());

    let first = models
        .create(&NewModel {
            name: "M".into(),
            model_type: "random_forest".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(first.version, 1);
    assert!(first.artifact_uri.is_none());

    let second = models
        .create(&NewModel {
            name: "M".into(),
            model_type: "random_forest".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(second.version, 2);

    models
        .set_artifact_uri(first.id, "file://analytics/models/M/v1/model.json")
        .await
        .unwrap();
    let row = models.get_required(first.id).await.unwrap();
    assert_eq!(
        row.artifact_uri.as_deref(),
        Some("file://analytics/models/M/v1/model.json")
    );
}

#[tokio::test]
async fn test_xai_results_idempotent_on_pair() {
    let pool = pool().await;
    let jobs = JobRepository::new(pool.clone());
    let xai = XaiRepository::new(pool.clone());

    let inference = jobs.create(&NewJob::new(JobKind::Inference)).await.unwrap();

    let (id_a, created_a) = xai.create_pending(inference.id, XaiType::Shap).await.unwrap();
    let (id_b, created_b) = xai.create_pending(inference.id, XaiType::Shap).await.unwrap();
    assert!(created_a);
    assert!(!created_b);
    assert_eq!(id_a, id_b);

    let (lime_id, created) = xai.create_pending(inference.id, XaiType::Lime).await.unwrap();
    assert!(created);
    assert_ne!(lime_id, id_a);

    let rows = xai.list_for_inference(inference.id).await.unwrap();
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_xai_bulk_fail_only_touches_open_rows() {
    let pool = pool().await;
    let jobs = JobRepository::new(pool.clone());
    let xai = XaiRepository::new(pool.clone());
    let inference = jobs.create(&NewJob::new(JobKind::Inference)).await.unwrap();

    let (a, _) = xai.create_pending(inference.id, XaiType::Shap).await.unwrap();
    let (b, _) = xai.create_pending(inference.id, XaiType::Lime).await.unwrap();

    // finish one first
    xai.try_transition(a, JobStatus::Pending, JobStatus::Running, None)
        .await
        .unwrap();
    xai.complete_success(a, &serde_json::json!({"ok": true}), "done")
        .await
        .unwrap();

    let affected = xai.mark_failed_bulk(&[a, b], "dispatch failed").await.unwrap();
    assert_eq!(affected, 1);
    assert_eq!(
        xai.get_required(a).await.unwrap().status(),
        JobStatus::Success
    );
    assert_eq!(
        xai.get_required(b).await.unwrap().status(),
        JobStatus::Failed
    );
}

#[tokio::test]
async fn test_registry_sync_handover() {
    let pool = pool().await;
    let registries = RegistryRepository::new(pool.clone());

    fn descriptor(name: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            description: format!("rule {}", name),
            parameter_schema: serde_json::json!([]),
        }
    }

    // W1 syncs {A, B, C}; W2 syncs {B, D}.
    registries
        .sync(
            RegistryKind::CleaningRules,
            "w1",
            &[descriptor("a"), descriptor("b"), descriptor("c")],
        )
        .await
        .unwrap();
    registries
        .sync(
            RegistryKind::CleaningRules,
            "w2",
            &[descriptor("b"), descriptor("d")],
        )
        .await
        .unwrap();

    let by_name = |rows: &[codegauge_db::CapabilityRow], name: &str| {
        rows.iter().find(|r| r.name == name).cloned().unwrap()
    };

    let rows = registries
        .list_implemented(RegistryKind::CleaningRules)
        .await
        .unwrap();
    assert_eq!(rows.len(), 4);
    assert_eq!(by_name(&rows, "a").last_updated_by, "w1");
    assert_eq!(by_name(&rows, "b").last_updated_by, "w2"); // last writer owns it
    assert_eq!(by_name(&rows, "c").last_updated_by, "w1"); // w2 never touched it
    assert_eq!(by_name(&rows, "d").last_updated_by, "w2");

    // W1 restarts advertising only {A}: C is down-flagged, A stays, B and D
    // belong to W2 and are untouched.
    registries
        .sync(RegistryKind::CleaningRules, "w1", &[descriptor("a")])
        .await
        .unwrap();

    let implemented = registries
        .list_implemented(RegistryKind::CleaningRules)
        .await
        .unwrap();
    let names: Vec<&str> = implemented.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "d"]);

    let c = registries
        .get(RegistryKind::CleaningRules, "c")
        .await
        .unwrap()
        .unwrap();
    assert!(!c.is_implemented);
    assert_eq!(c.last_updated_by, "w1");
}

#[tokio::test]
async fn test_cascade_delete_from_repository() {
    let pool = pool().await;
    let repos = RepoRepository::new(pool.clone());
    let jobs = JobRepository::new(pool.clone());
    let metrics = MetricRepository::new(pool.clone());

    let repo_id = seed_repo(&pool).await;
    let dataset_id = seed_dataset(&pool, repo_id).await;
    jobs.create(
        &NewJob::new(JobKind::DatasetGeneration)
            .with_dataset(dataset_id)
            .with_repository(repo_id),
    )
    .await
    .unwrap();
    metrics
        .upsert_commit_metrics(
            repo_id,
            &[CommitMetricUpsert {
                commit_hash: "abc".into(),
                is_buggy: Some(true),
                ..Default::default()
            }],
        )
        .await
        .unwrap();
    metrics
        .upsert_ck_metrics(
            repo_id,
            &[CkMetricUpsert {
                commit_hash: "abc".into(),
                file_path: "src/a.rs".into(),
                class_name: "A".into(),
                ..Default::default()
            }],
        )
        .await
        .unwrap();

    assert!(repos.delete(repo_id).await.unwrap());

    let job_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cg_jobs")
        .fetch_one(&pool)
        .await
        .unwrap();
    let dataset_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cg_datasets")
        .fetch_one(&pool)
        .await
        .unwrap();
    let metric_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cg_commit_metrics")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(job_count, 0);
    assert_eq!(dataset_count, 0);
    assert_eq!(metric_count, 0);
}

#[tokio::test]
async fn test_study_jobs_accumulate() {
    let pool = pool().await;
    let jobs = JobRepository::new(pool.clone());

    for _ in 0..2 {
        let new_job = NewJob {
            kind: Some(JobKind::HpSearch),
            study_name: Some("study-x".into()),
            ..Default::default()
        };
        jobs.create(&new_job).await.unwrap();
    }

    let attached = jobs.find_by_study("study-x").await.unwrap();
    assert_eq!(attached.len(), 2);
    assert!(attached[0].id < attached[1].id);
}
