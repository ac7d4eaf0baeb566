//! Submission-service tests: cross-entity checks, the HP-search study
//! re-use rule, publish-failure compensation and task-status merging.

use codegauge_control::api::{HpSearchSubmission, TrainingSubmission};
use codegauge_control::{BrokerHandle, SubmissionService, SubmitError, TaskStatusStore};
use codegauge_db::{RegistryKind, RegistryRepository};
use codegauge_protocol::{
    CapabilityDescriptor, ConfigMap, DatasetStatus, JobKind, JobStatus, SearchSpaceParam,
    SuggestType,
};
use codegauge_test_utils::{seed_ready_dataset, seed_repository, test_env, TestEnv};
use tokio::sync::mpsc;

/// Service with a live dispatcher channel; the receiver is returned so the
/// test can keep it alive (or drop it to simulate a dead broker).
fn service_for(
    env: &TestEnv,
) -> (
    SubmissionService,
    tokio::sync::mpsc::UnboundedReceiver<codegauge_control::DispatcherSignal>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let broker = BrokerHandle::new(tx);
    let service = SubmissionService::new(env.pool.clone(), broker, TaskStatusStore::new());
    (service, rx)
}

/// Register model types in the registry the way a worker's sync would.
async fn register_model_types(env: &TestEnv, names: &[&str]) {
    let registries = RegistryRepository::new(env.pool.clone());
    let descriptors: Vec<CapabilityDescriptor> = names
        .iter()
        .map(|name| CapabilityDescriptor {
            name: name.to_string(),
            display_name: name.replace('_', " "),
            description: "test".to_string(),
            parameter_schema: serde_json::json!([
                {
                    "name": "n_estimators",
                    "type": "integer",
                    "default": 100,
                    "range": {"min": 1.0, "max": 1000.0, "step": 1.0},
                    "required": false
                },
                {
                    "name": "max_depth",
                    "type": "integer",
                    "default": 8,
                    "range": {"min": 1.0, "max": 64.0, "step": 1.0},
                    "required": false
                }
            ]),
        })
        .collect();
    registries
        .sync(RegistryKind::ModelTypes, "test-worker", &descriptors)
        .await
        .unwrap();
}

fn training_submission() -> TrainingSubmission {
    let mut hp = ConfigMap::new();
    hp.insert("n_estimators".into(), serde_json::json!(50));
    TrainingSubmission {
        model_name: "M".into(),
        model_type: "random_forest".into(),
        hyperparameters: hp,
        feature_columns: vec!["la".into(), "ld".into()],
        target_column: "is_buggy".into(),
        random_seed: Some(42),
        eval_test_split_size: None,
    }
}

fn hp_submission() -> HpSearchSubmission {
    HpSearchSubmission {
        model_type: "random_forest".into(),
        feature_columns: vec!["la".into()],
        target_column: "is_buggy".into(),
        hp_space: vec![SearchSpaceParam {
            param_name: "max_depth".into(),
            suggest_type: SuggestType::Int,
            low: Some(2.0),
            high: Some(8.0),
            step: Some(1.0),
            log: false,
            choices: None,
        }],
        n_trials: Some(5),
        objective_metric: None,
        cv_folds: None,
        pruner: None,
        random_seed: None,
        retrain_best: false,
        model_name: None,
    }
}

#[tokio::test]
async fn training_submission_creates_pending_job_with_task_id() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 100).await;
    register_model_types(&env, &["random_forest"]).await;
    let (service, _rx) = service_for(&env);

    let (job_id, task_id) = service
        .submit_training(dataset_id, &training_submission())
        .await
        .unwrap();

    let row = service.jobs.get_required(job_id).await.unwrap();
    assert_eq!(row.status(), JobStatus::Pending);
    assert_eq!(row.broker_task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(row.dataset_id, Some(dataset_id));
}

#[tokio::test]
async fn training_submission_validates_hyperparameters() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 100).await;
    register_model_types(&env, &["random_forest"]).await;
    let (service, _rx) = service_for(&env);

    // unknown model type -> validation error (HTTP 400)
    let mut submission = training_submission();
    submission.model_type = "quantum_forest".into();
    assert!(matches!(
        service.submit_training(dataset_id, &submission).await,
        Err(SubmitError::Validation(_))
    ));

    // out-of-range HP -> validation error
    let mut submission = training_submission();
    submission
        .hyperparameters
        .insert("n_estimators".into(), serde_json::json!(100_000));
    assert!(matches!(
        service.submit_training(dataset_id, &submission).await,
        Err(SubmitError::Validation(_))
    ));

    // non-ready dataset -> conflict (HTTP 409)
    let pending = service
        .datasets
        .create(
            repo_id,
            "pending",
            &codegauge_test_utils::seed_dataset_config(),
        )
        .await
        .unwrap();
    assert!(matches!(
        service.submit_training(pending.id, &training_submission()).await,
        Err(SubmitError::Conflict(_))
    ));
}

// ---------------------------------------------------------------------
// S2: HP-search study re-use rule
// ---------------------------------------------------------------------

#[tokio::test]
async fn hp_search_study_reuse_rule() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_7 = seed_ready_dataset(&env, repo_id, 100).await;
    let dataset_8 = seed_ready_dataset(&env, repo_id, 100).await;
    register_model_types(&env, &["random_forest", "decision_tree"]).await;
    let (service, _rx) = service_for(&env);

    // create the study
    let (first_job, _) = service
        .submit_hp_search(dataset_7, "study-x", false, &hp_submission())
        .await
        .unwrap();

    // same name without continue_if_exists -> conflict
    let err = service
        .submit_hp_search(dataset_7, "study-x", false, &hp_submission())
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(_)));
    assert!(err.to_string().contains("already exists"));

    // continue on a different dataset -> conflict naming the dataset
    let err = service
        .submit_hp_search(dataset_8, "study-x", true, &hp_submission())
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(_)));
    assert!(err.to_string().contains("different dataset"));

    // continue with a different model type -> conflict
    let mut other_model = hp_submission();
    other_model.model_type = "decision_tree".into();
    let err = service
        .submit_hp_search(dataset_7, "study-x", true, &other_model)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(_)));
    assert!(err.to_string().contains("model type"));

    // matching continue -> one study, two jobs attached
    let (second_job, _) = service
        .submit_hp_search(dataset_7, "study-x", true, &hp_submission())
        .await
        .unwrap();
    assert_ne!(first_job, second_job);
    let attached = service.jobs.find_by_study("study-x").await.unwrap();
    assert_eq!(attached.len(), 2);
}

// ---------------------------------------------------------------------
// Inference submission checks
// ---------------------------------------------------------------------

#[tokio::test]
async fn inference_submission_requires_artifact() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let (service, _rx) = service_for(&env);

    let model = service
        .models
        .create(&codegauge_db::NewModel {
            name: "bare".into(),
            model_type: "random_forest".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    let input = serde_json::json!({"repo_id": repo_id, "commit_hash": "abc"});

    // model without artifact -> conflict (HTTP 409)
    let err = service.submit_inference(model.id, &input).await.unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(_)));

    // unknown model -> not found (HTTP 404)
    let err = service.submit_inference(9999, &input).await.unwrap_err();
    assert!(matches!(err, SubmitError::NotFound(_)));

    // missing commit_hash -> validation (HTTP 400)
    service
        .models
        .set_artifact_uri(model.id, "file://analytics/models/bare/v1/model.json")
        .await
        .unwrap();
    let err = service
        .submit_inference(model.id, &serde_json::json!({"repo_id": repo_id}))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));

    // all checks pass
    let (job_id, _) = service.submit_inference(model.id, &input).await.unwrap();
    assert!(job_id > 0);
}

// ---------------------------------------------------------------------
// Publish-failure compensation
// ---------------------------------------------------------------------

#[tokio::test]
async fn publish_failure_flips_row_to_failed() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 100).await;
    register_model_types(&env, &["random_forest"]).await;

    let (service, rx) = service_for(&env);
    drop(rx); // broker gone: every publish now fails

    let err = service
        .submit_training(dataset_id, &training_submission())
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Internal(_)));

    // the compensation flipped the freshly created row to failed
    let jobs = service.jobs.list_recent(None, 1).await.unwrap();
    let row = &jobs[0];
    assert_eq!(row.status(), JobStatus::Failed);
    assert!(row
        .status_message
        .as_deref()
        .unwrap()
        .contains("Failed to publish"));
}

// ---------------------------------------------------------------------
// Dataset creation validates plug-ins against the registries
// ---------------------------------------------------------------------

#[tokio::test]
async fn dataset_creation_rejects_unknown_cleaning_rule() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let (service, _rx) = service_for(&env);

    let mut config = codegauge_test_utils::seed_dataset_config();
    config.cleaning_rules.push(codegauge_db::CleaningRuleConfig {
        name: "polish_everything".into(),
        enabled: true,
        params: Default::default(),
    });

    let err = service
        .create_dataset(repo_id, "bad", &config)
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));
    assert!(err.to_string().contains("polish_everything"));
}

#[tokio::test]
async fn dataset_generation_submission_requires_pending_dataset() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let ready = seed_ready_dataset(&env, repo_id, 100).await;
    let (service, _rx) = service_for(&env);

    let err = service.submit_dataset_generation(ready).await.unwrap_err();
    assert!(matches!(err, SubmitError::Conflict(_)));

    let pending = service
        .datasets
        .create(
            repo_id,
            "fresh",
            &codegauge_test_utils::seed_dataset_config(),
        )
        .await
        .unwrap();
    let (job_id, task_id) = service.submit_dataset_generation(pending.id).await.unwrap();
    let row = service.jobs.get_required(job_id).await.unwrap();
    assert_eq!(row.broker_task_id.as_deref(), Some(task_id.as_str()));
    assert_eq!(
        service.datasets.get_required(pending.id).await.unwrap().status(),
        DatasetStatus::Pending
    );
}

// ---------------------------------------------------------------------
// Ingestion triggered on behalf of an inference job
// ---------------------------------------------------------------------

#[tokio::test]
async fn chained_ingestion_parks_the_inference_job() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    let (service, _rx) = service_for(&env);

    let model = service
        .models
        .create(&codegauge_db::NewModel {
            name: "chained".into(),
            model_type: "random_forest".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    service
        .models
        .set_artifact_uri(model.id, "file://analytics/models/chained/v1/model.json")
        .await
        .unwrap();

    let input = serde_json::json!({"repo_id": repo_id, "commit_hash": "abc"});
    let (inference_id, _) = service.submit_inference(model.id, &input).await.unwrap();

    let payload = serde_json::json!({"commit": {"author_name": "dev-1"}});
    let (ingestion_id, _) = service
        .ingest_commit(repo_id, "abc", &payload, Some(inference_id))
        .await
        .unwrap();

    // the ingestion job carries the chain reference
    let ingestion = service.jobs.get_required(ingestion_id).await.unwrap();
    assert_eq!(ingestion.inference_job_id, Some(inference_id));

    // the inference job is parked: only the ingestion is claimable
    let claimed = service
        .jobs
        .claim_next_for_dispatch(&[JobKind::Inference, JobKind::CommitIngestion])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, ingestion_id);
    assert!(service
        .jobs
        .claim_next_for_dispatch(&[JobKind::Inference])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn chained_ingestion_validates_the_inference_reference() {
    let env = test_env().await;
    let repo_id = seed_repository(&env.pool).await;
    register_model_types(&env, &["random_forest"]).await;
    let dataset_id = seed_ready_dataset(&env, repo_id, 100).await;
    let (service, _rx) = service_for(&env);

    let payload = serde_json::json!({"commit": {"author_name": "dev-1"}});

    // unknown inference job -> not found
    let err = service
        .ingest_commit(repo_id, "abc", &payload, Some(9999))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::NotFound(_)));

    // a non-inference job cannot anchor the chain
    let (training_id, _) = service
        .submit_training(dataset_id, &training_submission())
        .await
        .unwrap();
    let err = service
        .ingest_commit(repo_id, "abc", &payload, Some(training_id))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));

    // a mismatched target commit is rejected
    let model = service
        .models
        .create(&codegauge_db::NewModel {
            name: "mismatch".into(),
            model_type: "random_forest".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    service
        .models
        .set_artifact_uri(model.id, "file://analytics/models/mismatch/v1/model.json")
        .await
        .unwrap();
    let input = serde_json::json!({"repo_id": repo_id, "commit_hash": "other"});
    let (inference_id, _) = service.submit_inference(model.id, &input).await.unwrap();
    let err = service
        .ingest_commit(repo_id, "abc", &payload, Some(inference_id))
        .await
        .unwrap_err();
    assert!(matches!(err, SubmitError::Validation(_)));
}
