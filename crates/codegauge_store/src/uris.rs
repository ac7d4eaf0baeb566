//! Artifact URI contract.
//!
//! `<scheme>://<bucket>/datasets/dataset_<id>.parquet`,
//! `<scheme>://<bucket>/datasets/dataset_<id>_background.parquet` and
//! `<scheme>://<bucket>/models/<name>/v<version>/model.<ext>`.

use url::Url;

use crate::{Result, StoreError};

/// Parsed form of an artifact URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

pub fn parse_uri(uri: &str) -> Result<ParsedUri> {
    let url = Url::parse(uri).map_err(|e| StoreError::InvalidUri {
        uri: uri.to_string(),
        reason: e.to_string(),
    })?;

    let bucket = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| StoreError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing bucket".to_string(),
        })?
        .to_string();

    let key = url.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(StoreError::InvalidUri {
            uri: uri.to_string(),
            reason: "missing object key".to_string(),
        });
    }
    if key.split('/').any(|seg| seg == "..") {
        return Err(StoreError::InvalidUri {
            uri: uri.to_string(),
            reason: "path traversal in object key".to_string(),
        });
    }

    Ok(ParsedUri {
        scheme: url.scheme().to_string(),
        bucket,
        key,
    })
}

/// Main dataset artifact URI for a dataset id.
pub fn dataset_uri(scheme: &str, bucket: &str, dataset_id: i64) -> String {
    format!("{}://{}/datasets/dataset_{}.parquet", scheme, bucket, dataset_id)
}

/// Background-sample URI for a dataset id.
pub fn background_sample_uri(scheme: &str, bucket: &str, dataset_id: i64) -> String {
    format!(
        "{}://{}/datasets/dataset_{}_background.parquet",
        scheme, bucket, dataset_id
    )
}

/// Model artifact URI for `(name, version)`.
pub fn model_uri(scheme: &str, bucket: &str, name: &str, version: i64, ext: &str) -> String {
    format!("{}://{}/models/{}/v{}/model.{}", scheme, bucket, name, version, ext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uri() {
        let parsed = parse_uri("s3://analytics/datasets/dataset_7.parquet").unwrap();
        assert_eq!(parsed.scheme, "s3");
        assert_eq!(parsed.bucket, "analytics");
        assert_eq!(parsed.key, "datasets/dataset_7.parquet");
    }

    #[test]
    fn test_parse_rejects_traversal() {
        assert!(parse_uri("file://bucket/../etc/passwd").is_err());
    }

    #[test]
    fn test_parse_rejects_missing_key() {
        assert!(parse_uri("s3://bucket").is_err());
        assert!(parse_uri("s3://bucket/").is_err());
    }

    #[test]
    fn test_uri_builders() {
        assert_eq!(
            dataset_uri("s3", "analytics", 7),
            "s3://analytics/datasets/dataset_7.parquet"
        );
        assert_eq!(
            background_sample_uri("s3", "analytics", 7),
            "s3://analytics/datasets/dataset_7_background.parquet"
        );
        assert_eq!(
            model_uri("s3", "analytics", "M", 1, "json"),
            "s3://analytics/models/M/v1/model.json"
        );
    }
}
