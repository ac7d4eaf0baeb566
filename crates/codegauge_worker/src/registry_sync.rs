//! Capability-registry synchronisation.
//!
//! At startup the worker enumerates its compiled-in plug-ins (cleaning
//! rules, feature-selection algorithms, model types with their HP schemas)
//! and reflects each set into its registry table: upsert the discovered
//! rows, down-flag rows this worker owns but no longer advertises. Rows
//! owned by other workers are never touched.

use codegauge_db::{RegistryKind, RegistryRepository};
use codegauge_ml::supported_model_types;
use codegauge_protocol::CapabilityDescriptor;
use tracing::{error, info};

use crate::cleaning::cleaning_rule_descriptors;
use crate::features::feature_selection_descriptors;

/// Model-type descriptors derived from the strategy declarations.
pub fn model_type_descriptors() -> Vec<CapabilityDescriptor> {
    supported_model_types()
        .iter()
        .map(|info| CapabilityDescriptor {
            name: info.name.to_string(),
            display_name: info.display_name.to_string(),
            description: info.description.to_string(),
            parameter_schema: serde_json::to_value(&info.schema)
                .unwrap_or_else(|_| serde_json::json!([])),
        })
        .collect()
}

/// Run all three registry syncs. Failures are logged per registry; a failed
/// sync does not prevent the worker from serving jobs with the plug-ins it
/// has.
pub async fn sync_all(registries: &RegistryRepository, worker_id: &str) {
    let sets: [(RegistryKind, Vec<CapabilityDescriptor>); 3] = [
        (RegistryKind::CleaningRules, cleaning_rule_descriptors()),
        (
            RegistryKind::FeatureSelection,
            feature_selection_descriptors(),
        ),
        (RegistryKind::ModelTypes, model_type_descriptors()),
    ];

    for (kind, descriptors) in sets {
        match registries.sync(kind, worker_id, &descriptors).await {
            Ok(()) => info!(
                "Registry sync: {:?} updated with {} descriptors",
                kind,
                descriptors.len()
            ),
            Err(e) => error!("Registry sync for {:?} failed: {}", kind, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codegauge_db::{create_pool, init_schema, DbConfig};

    #[tokio::test]
    async fn test_sync_all_populates_registries() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        init_schema(&pool).await.unwrap();
        let registries = RegistryRepository::new(pool);

        sync_all(&registries, "worker-1").await;

        let rules = registries
            .list_implemented(RegistryKind::CleaningRules)
            .await
            .unwrap();
        assert!(rules.iter().any(|r| r.name == "drop_duplicates"));

        let algos = registries
            .list_implemented(RegistryKind::FeatureSelection)
            .await
            .unwrap();
        assert_eq!(algos.len(), 2);

        let models = registries
            .list_implemented(RegistryKind::ModelTypes)
            .await
            .unwrap();
        assert!(models.iter().any(|m| m.name == "random_forest"));
        for model in &models {
            assert_eq!(model.last_updated_by, "worker-1");
            // schemas are surfaced verbatim as JSON arrays
            let schema: serde_json::Value =
                serde_json::from_str(&model.parameter_schema).unwrap();
            assert!(schema.is_array());
        }
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let pool = create_pool(DbConfig::sqlite_memory()).await.unwrap();
        init_schema(&pool).await.unwrap();
        let registries = RegistryRepository::new(pool);

        sync_all(&registries, "worker-1").await;
        let first = registries
            .list_implemented(RegistryKind::ModelTypes)
            .await
            .unwrap();
        sync_all(&registries, "worker-1").await;
        let second = registries
            .list_implemented(RegistryKind::ModelTypes)
            .await
            .unwrap();

        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.parameter_schema, b.parameter_schema);
            assert_eq!(a.last_updated_by, b.last_updated_by);
        }
    }
}
