//! End-to-end handler tests driven through the dispatch template, against an
//! in-memory store and a local artifact directory. No broker involved: the
//! tests call the same entry point the worker's event loop does.

use std::sync::Arc;

use codegauge_db::{DatasetConfig, JobRepository, NewJob, XaiRepository};
use codegauge_pipeline::{CancellationToken, Dependencies, NullProgress, ProgressSink};
use codegauge_protocol::{
    DatasetStatus, DispatchCommand, JobId, JobKind, JobStatus, TaskId, TaskState,
};
use codegauge_store::{ArtifactStore, LocalArtifactStore};
use codegauge_test_utils::{
    commit_hash, seed_commit_metrics, seed_ready_dataset, seed_repository, test_env, FailingStore,
};
use codegauge_worker::handlers::run_dispatched_job;

fn training_config() -> serde_json::Value {
    serde_json::json!({
        "model_name": "M",
        "model_type": "random_forest",
        "hyperparameters": {"n_estimators": 10, "max_depth": 6},
        "feature_columns": ["la", "ld"],
        "target_column": "is_buggy",
        "random_seed": 42,
        "eval_test_split_size": 0.25,
    })
}

async fn dispatch(
    deps: &Dependencies,
    job_id: i64,
    task: &str,
) -> codegauge_protocol::JobReceipt {
    let job = deps.jobs.get_required(job_id).await.unwrap();
    let task_id = TaskId::from(task);
    deps.jobs.set_task_id(job_id, &task_id).await.unwrap();
    let cmd = DispatchCommand {
        job_id: JobId::new(job.id as u64),
        kind: job.kind().unwrap(),
        task_id,
    };
    run_dispatched_job(&cmd, deps, Arc::new(NullProgress), CancellationToken::new()).await
}

// ---------------------------------------------------------------------
// S1: training happy path
// ---------------------------------------------------------------------

#[tokio::test]
async fn training_happy_path_registers_model() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 200).await;

    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::Training)
                .with_dataset(dataset_id)
                .with_config(training_config()),
        )
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, job.id, "train-1").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let row = env.deps.jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Success);
    let model_id = row.model_id.expect("model linked on job row");

    let model = env.deps.models.get_required(model_id).await.unwrap();
    assert_eq!(model.name, "M");
    assert_eq!(model.version, 1);
    let uri = model.artifact_uri.clone().expect("artifact uri recorded");
    assert!(uri.contains("models/M/v1/"));
    assert!(env.store.exists(&uri).unwrap());

    let metrics = model.performance_metrics().unwrap();
    assert!(metrics.contains_key("accuracy"));
    assert!(metrics.contains_key("f1_weighted"));
    assert!(metrics.contains_key("training_time_seconds"));
}

#[tokio::test]
async fn training_rejects_unready_dataset() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset = env
        .deps
        .datasets
        .create(
            repo_id,
            "pending",
            &codegauge_test_utils::seed_dataset_config(),
        )
        .await
        .unwrap();

    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::Training)
                .with_dataset(dataset.id)
                .with_config(training_config()),
        )
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, job.id, "train-bad").await;
    assert_eq!(receipt.status, TaskState::Failure);
    let row = env.deps.jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Failed);
    assert!(row.status_message.unwrap().contains("not ready"));
}

// ---------------------------------------------------------------------
// S3: inference + explanation fan-out
// ---------------------------------------------------------------------

async fn train_model(env: &codegauge_test_utils::TestEnv, dataset_id: i64) -> i64 {
    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::Training)
                .with_dataset(dataset_id)
                .with_config(training_config()),
        )
        .await
        .unwrap();
    let receipt = dispatch(&env.deps, job.id, "train-setup").await;
    assert_eq!(receipt.status, TaskState::Success);
    env.deps
        .jobs
        .get_required(job.id)
        .await
        .unwrap()
        .model_id
        .unwrap()
}

#[tokio::test]
async fn inference_fans_out_explanations() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    seed_commit_metrics(&env.pool, repo_id, 10).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 200).await;
    let model_id = train_model(&env, dataset_id).await;

    let target_commit = commit_hash(3);
    let inference = env
        .deps
        .jobs
        .create(&NewJob {
            kind: Some(JobKind::Inference),
            model_id: Some(model_id),
            input_reference: Some(serde_json::json!({
                "repo_id": repo_id,
                "commit_hash": target_commit,
            })),
            ..Default::default()
        })
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, inference.id, "infer-1").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let row = env.deps.jobs.get_required(inference.id).await.unwrap();
    let package = row.prediction().expect("prediction package stored");
    // every seeded commit carries two class rows
    assert_eq!(package.num_files_analyzed, 2);
    assert!(package.error.is_none());
    assert!(package.commit_prediction == 0 || package.commit_prediction == 1);

    // fan-out: an orchestration job was enqueued after the terminal CAS
    let orchestrations = env
        .deps
        .jobs
        .list_recent(Some(JobKind::XaiOrchestration), 10)
        .await
        .unwrap();
    assert_eq!(orchestrations.len(), 1);
    let orchestration = &orchestrations[0];
    assert_eq!(orchestration.status(), JobStatus::Pending);

    // run the orchestration; random_forest is tree-based, so all five
    // explanation families apply
    let receipt = dispatch(&env.deps, orchestration.id, "orch-1").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let xai = XaiRepository::new(env.pool.clone());
    let results = xai.list_for_inference(inference.id).await.unwrap();
    assert_eq!(results.len(), 5);
    let mut types: Vec<&str> = results.iter().map(|r| r.xai_type.as_str()).collect();
    types.sort_unstable();
    assert_eq!(
        types,
        vec!["counterfactuals", "decision_path", "feature_importance", "lime", "shap"]
    );

    // one explanation job per created row
    let explanation_jobs = env
        .deps
        .jobs
        .list_recent(Some(JobKind::XaiResult), 10)
        .await
        .unwrap();
    assert_eq!(explanation_jobs.len(), 5);

    // run one explanation end to end
    let shap_row = results.iter().find(|r| r.xai_type == "shap").unwrap();
    let shap_job = explanation_jobs
        .iter()
        .find(|j| {
            j.config_map()
                .ok()
                .and_then(|c| c.get("xai_result_id").and_then(|v| v.as_i64()))
                == Some(shap_row.id)
        })
        .expect("shap job");
    let receipt = dispatch(&env.deps, shap_job.id, "xai-1").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let shap_row = xai.get_required(shap_row.id).await.unwrap();
    assert_eq!(shap_row.status(), JobStatus::Success);
    let result = shap_row.result_json().expect("typed result stored");
    assert!(result.get("feature_names").is_some());
}

#[tokio::test]
async fn inference_with_no_features_fails_with_empty_package() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 200).await;
    let model_id = train_model(&env, dataset_id).await;

    let inference = env
        .deps
        .jobs
        .create(&NewJob {
            kind: Some(JobKind::Inference),
            model_id: Some(model_id),
            input_reference: Some(serde_json::json!({
                "repo_id": repo_id,
                "commit_hash": "feedfacefeedfacefeedfacefeedfacefeedface",
            })),
            ..Default::default()
        })
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, inference.id, "infer-empty").await;
    assert_eq!(receipt.status, TaskState::Failure);

    let row = env.deps.jobs.get_required(inference.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Failed);
    let package = row.prediction().expect("empty package still stored");
    assert_eq!(package.num_files_analyzed, 0);
    assert_eq!(package.commit_prediction, -1);
    assert_eq!(package.error.as_deref(), Some("no features"));

    // no fan-out for failed inference
    let orchestrations = env
        .deps
        .jobs
        .list_recent(Some(JobKind::XaiOrchestration), 10)
        .await
        .unwrap();
    assert!(orchestrations.is_empty());
}

// ---------------------------------------------------------------------
// S4: revoke mid-pipeline
// ---------------------------------------------------------------------

/// Progress sink that fires the cancellation token as soon as the batch
/// phase reports its first batch.
struct CancelOnBatch {
    token: CancellationToken,
}

impl ProgressSink for CancelOnBatch {
    fn report(&self, _progress: u8, _step: &str, message: Option<&str>) {
        if message.is_some_and(|m| m.starts_with("Processing batch")) {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn revoke_mid_batch_leaves_no_artifacts() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    seed_commit_metrics(&env.pool, repo_id, 120).await;

    let config = DatasetConfig {
        feature_columns: vec!["la".into(), "ld".into(), "entropy".into()],
        target_column: "is_buggy".into(),
        batch_size: Some(25),
        ..Default::default()
    };
    let dataset = env
        .deps
        .datasets
        .create(repo_id, "to-revoke", &config)
        .await
        .unwrap();

    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::DatasetGeneration)
                .with_dataset(dataset.id)
                .with_repository(repo_id),
        )
        .await
        .unwrap();

    let task_id = TaskId::from("dsgen-revoke");
    env.deps.jobs.set_task_id(job.id, &task_id).await.unwrap();
    let cancel = CancellationToken::new();
    let progress = Arc::new(CancelOnBatch {
        token: cancel.clone(),
    });
    let cmd = DispatchCommand {
        job_id: JobId::new(job.id as u64),
        kind: JobKind::DatasetGeneration,
        task_id,
    };
    let receipt = run_dispatched_job(&cmd, &env.deps, progress, cancel).await;
    assert_eq!(receipt.status, TaskState::Revoked);

    let row = env.deps.jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Revoked);

    let dataset = env.deps.datasets.get_required(dataset.id).await.unwrap();
    assert_ne!(dataset.status(), DatasetStatus::Ready);
    assert!(dataset.storage_uri.is_none());

    // both URIs absent or cleaned
    let main = codegauge_store::dataset_uri("file", "analytics", dataset.id);
    let sample = codegauge_store::background_sample_uri("file", "analytics", dataset.id);
    assert!(!env.store.exists(&main).unwrap());
    assert!(!env.store.exists(&sample).unwrap());
}

// ---------------------------------------------------------------------
// Dataset generation happy path + background sampling boundary
// ---------------------------------------------------------------------

#[tokio::test]
async fn dataset_generation_end_to_end() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    seed_commit_metrics(&env.pool, repo_id, 120).await;

    let config = DatasetConfig {
        feature_columns: vec!["la".into(), "ld".into(), "entropy".into()],
        target_column: "is_buggy".into(),
        cleaning_rules: vec![codegauge_db::CleaningRuleConfig {
            name: "drop_duplicates".into(),
            enabled: true,
            params: Default::default(),
        }],
        feature_selection: None,
        batch_size: Some(50),
    };
    let dataset = env
        .deps
        .datasets
        .create(repo_id, "full-run", &config)
        .await
        .unwrap();

    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::DatasetGeneration)
                .with_dataset(dataset.id)
                .with_repository(repo_id),
        )
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, job.id, "dsgen-1").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let dataset = env.deps.datasets.get_required(dataset.id).await.unwrap();
    assert_eq!(dataset.status(), DatasetStatus::Ready);
    let main_uri = dataset.storage_uri.expect("main artifact recorded");
    assert!(env.store.exists(&main_uri).unwrap());
    // plenty of rows: the background sample exists too
    let background = dataset.background_sample_uri.expect("background sample");
    assert!(env.store.exists(&background).unwrap());
    assert!(dataset.num_rows.unwrap() >= 50);
}

#[tokio::test]
async fn small_dataset_skips_background_sample() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    // 20 commits, two rows each, minus parent-less commit 0 and bot-author
    // commits: well under the 50-row sampling minimum.
    seed_commit_metrics(&env.pool, repo_id, 20).await;

    let config = DatasetConfig {
        feature_columns: vec!["la".into(), "ld".into()],
        target_column: "is_buggy".into(),
        batch_size: Some(10),
        ..Default::default()
    };
    let dataset = env
        .deps
        .datasets
        .create(repo_id, "small", &config)
        .await
        .unwrap();
    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::DatasetGeneration)
                .with_dataset(dataset.id)
                .with_repository(repo_id),
        )
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, job.id, "dsgen-small").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let dataset = env.deps.datasets.get_required(dataset.id).await.unwrap();
    assert_eq!(dataset.status(), DatasetStatus::Ready);
    assert!(dataset.storage_uri.is_some());
    assert!(dataset.background_sample_uri.is_none());
    assert!(dataset.num_rows.unwrap() < 50);
}

// ---------------------------------------------------------------------
// S6: artifact write failure after Model row creation
// ---------------------------------------------------------------------

#[tokio::test]
async fn artifact_write_failure_leaves_model_without_uri() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 200).await;

    // Same artifact root, but writes fail once armed.
    let failing = Arc::new(FailingStore::new(LocalArtifactStore::new(env.dir.path())));
    let deps = Dependencies::new(env.pool.clone(), failing.clone(), "file", "analytics");

    let job = deps
        .jobs
        .create(
            &NewJob::new(JobKind::Training)
                .with_dataset(dataset_id)
                .with_config(training_config()),
        )
        .await
        .unwrap();

    failing.fail_next_writes();
    let receipt = dispatch(&deps, job.id, "train-fail").await;
    assert_eq!(receipt.status, TaskState::Failure);

    let row = deps.jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Failed);
    assert!(row.status_message.unwrap().contains("ArtifactError"));

    // The Model row remains, URI-less, and is therefore never selectable
    // for inference submission.
    let model = deps.models.list_recent(1).await.unwrap().pop().unwrap();
    assert_eq!(model.name, "M");
    assert!(model.artifact_uri.is_none());
}

// ---------------------------------------------------------------------
// Re-delivery adoption
// ---------------------------------------------------------------------

#[tokio::test]
async fn redelivered_running_job_adopts_new_task_id() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 200).await;

    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::Training)
                .with_dataset(dataset_id)
                .with_config(training_config()),
        )
        .await
        .unwrap();

    // simulate a stale claim by a vanished worker
    let jobs = JobRepository::new(env.pool.clone());
    jobs.mark_running(job.id, &TaskId::from("stale-task"))
        .await
        .unwrap();

    // re-delivery arrives under a fresh task id without touching the row
    let cmd = DispatchCommand {
        job_id: JobId::new(job.id as u64),
        kind: JobKind::Training,
        task_id: TaskId::from("fresh-task"),
    };
    let receipt =
        run_dispatched_job(&cmd, &env.deps, Arc::new(NullProgress), CancellationToken::new())
            .await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let row = env.deps.jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Success);
    assert_eq!(row.broker_task_id.as_deref(), Some("fresh-task"));

    // re-dispatching a terminal job is ignored without a second model row
    let receipt = dispatch(&env.deps, job.id, "third-task").await;
    assert_eq!(receipt.status, TaskState::Success);
    assert_eq!(env.deps.models.count().await.unwrap(), 1);
}

// ---------------------------------------------------------------------
// HP search
// ---------------------------------------------------------------------

#[tokio::test]
async fn hp_search_records_best_trial_and_registers_model() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 120).await;

    let config = serde_json::json!({
        "model_type": "decision_tree",
        "feature_columns": ["la", "ld"],
        "target_column": "is_buggy",
        "hp_space": [
            {"param_name": "max_depth", "suggest_type": "int", "low": 2, "high": 8, "step": 1}
        ],
        "n_trials": 4,
        "objective_metric": "f1_weighted",
        "cv_folds": 3,
        "pruner": "nop",
        "random_seed": 42,
        "retrain_best": true,
        "model_name": "tuned",
    });
    let job = env
        .deps
        .jobs
        .create(&NewJob {
            kind: Some(JobKind::HpSearch),
            config,
            dataset_id: Some(dataset_id),
            study_name: Some("study-tuned".into()),
            ..Default::default()
        })
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, job.id, "hp-1").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let row = env.deps.jobs.get_required(job.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Success);
    assert!(row.best_trial_id.is_some());
    assert!(row.best_value.unwrap() > 0.5);
    let best_params: serde_json::Value =
        serde_json::from_str(row.best_params.as_deref().unwrap()).unwrap();
    let depth = best_params["max_depth"].as_i64().unwrap();
    assert!((2..=8).contains(&depth));

    // retrain_best registered a model with the best configuration
    let model_id = row.model_id.expect("retrained model linked");
    let model = env.deps.models.get_required(model_id).await.unwrap();
    assert_eq!(model.name, "tuned");
    assert_eq!(model.hp_search_job_id, Some(job.id));
    assert!(model.artifact_uri.is_some());
}

// ---------------------------------------------------------------------
// Commit ingestion
// ---------------------------------------------------------------------

#[tokio::test]
async fn ingestion_upserts_payload_and_completes_substate() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;

    let config = serde_json::json!({
        "commit_hash": "abc123",
        "commit": {
            "message": "fix: guard against empty frames",
            "author_name": "dev-1",
            "author_email": "dev1@example.com"
        },
        "diffs": [
            {"file_path": "src/a.rs", "change_type": "modified", "lines_added": 12, "lines_deleted": 3}
        ],
        "commit_metrics": {
            "parent_hashes": "parent0",
            "author_date_ts": 1700000000,
            "is_merge": false,
            "files_churned": 1,
            "values": {"la": 12.0, "ld": 3.0, "entropy": 0.4},
            "is_buggy": null
        },
        "ck_metrics": [
            {"file_path": "src/a.rs", "class_name": "A", "cbo": 4.0, "wmc": 11.0,
             "dit": 1.0, "rfc": 8.0, "lcom": 0.2, "loc": 140.0}
        ]
    });
    let job = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::CommitIngestion)
                .with_repository(repo_id)
                .with_config(config),
        )
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, job.id, "ingest-1").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    let detail = env
        .deps
        .commits
        .get_required(repo_id, "abc123")
        .await
        .unwrap();
    assert_eq!(detail.ingestion_status, "complete");
    let diffs = env.deps.commits.diffs_for(detail.id).await.unwrap();
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].lines_added, 12);

    let metric = env
        .deps
        .metrics
        .commit_metric(repo_id, "abc123")
        .await
        .unwrap()
        .expect("commit metric upserted");
    assert_eq!(metric.la, Some(12.0));
    assert_eq!(metric.first_parent(), Some("parent0"));

    // re-running the same ingestion is idempotent on the unique keys
    let job2 = env
        .deps
        .jobs
        .create(
            &NewJob::new(JobKind::CommitIngestion)
                .with_repository(repo_id)
                .with_config(serde_json::from_str(&job.config).unwrap()),
        )
        .await
        .unwrap();
    let receipt = dispatch(&env.deps, job2.id, "ingest-2").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);
    let diffs = env.deps.commits.diffs_for(detail.id).await.unwrap();
    assert_eq!(diffs.len(), 1);
}

// ---------------------------------------------------------------------
// Ingestion-triggered inference chaining
// ---------------------------------------------------------------------

fn chained_ingestion_config(commit: &str) -> serde_json::Value {
    serde_json::json!({
        "commit_hash": commit,
        "commit": {"author_name": "dev-1"},
        "commit_metrics": {
            "parent_hashes": null,
            "author_date_ts": 1700000000,
            "files_churned": 1,
            "values": {"la": 8.0, "ld": 1.0}
        },
        "ck_metrics": [
            {"file_path": "src/a.rs", "class_name": "A", "cbo": 4.0, "wmc": 11.0,
             "dit": 1.0, "rfc": 8.0, "lcom": 0.2, "loc": 140.0}
        ]
    })
}

#[tokio::test]
async fn ingestion_hands_off_chained_inference_job() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 200).await;
    let model_id = train_model(&env, dataset_id).await;

    let commit = "cafebabecafebabecafebabecafebabecafebabe";
    let inference = env
        .deps
        .jobs
        .create(&NewJob {
            kind: Some(JobKind::Inference),
            model_id: Some(model_id),
            input_reference: Some(serde_json::json!({
                "repo_id": repo_id,
                "commit_hash": commit,
            })),
            ..Default::default()
        })
        .await
        .unwrap();

    // parked: the dispatcher must not claim it before the hand-off
    assert!(env.deps.jobs.park_dispatch(inference.id).await.unwrap());
    assert!(env
        .deps
        .jobs
        .claim_next_for_dispatch(&[JobKind::Inference])
        .await
        .unwrap()
        .is_none());

    let ingestion = env
        .deps
        .jobs
        .create(&NewJob {
            kind: Some(JobKind::CommitIngestion),
            config: chained_ingestion_config(commit),
            repository_id: Some(repo_id),
            inference_job_id: Some(inference.id),
            ..Default::default()
        })
        .await
        .unwrap();

    let receipt = dispatch(&env.deps, ingestion.id, "chain-ingest").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);

    // the hand-off released the inference job with a task id attached
    let released = env
        .deps
        .jobs
        .claim_next_for_dispatch(&[JobKind::Inference])
        .await
        .unwrap()
        .expect("inference job released for dispatch");
    assert_eq!(released.id, inference.id);
    assert!(released.broker_task_id.is_some());

    // and it now succeeds against the freshly ingested features
    let receipt = dispatch(&env.deps, inference.id, "chain-infer").await;
    assert_eq!(receipt.status, TaskState::Success, "{:?}", receipt.error_message);
    let row = env.deps.jobs.get_required(inference.id).await.unwrap();
    assert_eq!(row.prediction().unwrap().num_files_analyzed, 1);
}

#[tokio::test]
async fn revoked_ingestion_fails_chained_inference_job() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;

    let commit = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
    let inference = env
        .deps
        .jobs
        .create(&NewJob {
            kind: Some(JobKind::Inference),
            model_id: None,
            input_reference: Some(serde_json::json!({
                "repo_id": repo_id,
                "commit_hash": commit,
            })),
            ..Default::default()
        })
        .await
        .unwrap();
    env.deps.jobs.park_dispatch(inference.id).await.unwrap();

    let ingestion = env
        .deps
        .jobs
        .create(&NewJob {
            kind: Some(JobKind::CommitIngestion),
            config: chained_ingestion_config(commit),
            repository_id: Some(repo_id),
            inference_job_id: Some(inference.id),
            ..Default::default()
        })
        .await
        .unwrap();

    // revoke before the handler reaches its first boundary check
    let task_id = TaskId::from("chain-revoked");
    env.deps.jobs.set_task_id(ingestion.id, &task_id).await.unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let cmd = DispatchCommand {
        job_id: JobId::new(ingestion.id as u64),
        kind: JobKind::CommitIngestion,
        task_id,
    };
    let receipt =
        run_dispatched_job(&cmd, &env.deps, Arc::new(NullProgress), cancel).await;
    assert_eq!(receipt.status, TaskState::Revoked);

    // the chained job is failed, not left parked forever
    let row = env.deps.jobs.get_required(inference.id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Failed);
    assert!(row
        .status_message
        .unwrap()
        .contains("Upstream ingestion failed"));
}
