//! Hyper-parameter schema contract and the typed HP-search space.
//!
//! Worker strategies declare one `HyperparameterSpec` per tunable knob; the
//! control plane surfaces these verbatim to the UI and validates submitted
//! hyper-parameters against them before accepting a training or search job.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Integer,
    Float,
    String,
    Boolean,
    TextChoice,
    Enum,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::String => "string",
            ParamType::Boolean => "boolean",
            ParamType::TextChoice => "text_choice",
            ParamType::Enum => "enum",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Numeric range constraint for integer/float parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ParamRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<bool>,
}

/// One tunable parameter as advertised by a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperparameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<ParamRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParamValidationError {
    #[error("missing required parameter '{0}'")]
    MissingRequired(String),
    #[error("unknown parameter '{0}'")]
    Unknown(String),
    #[error("parameter '{name}' has wrong type, expected {expected}")]
    WrongType { name: String, expected: ParamType },
    #[error("parameter '{name}' value {value} outside range [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("parameter '{name}' value not among declared options")]
    NotAnOption { name: String },
}

/// Validate a submitted hyper-parameter map against a declared schema.
///
/// Unknown keys are rejected so a typo cannot silently fall back to a
/// strategy default.
pub fn validate_params(
    schema: &[HyperparameterSpec],
    params: &BTreeMap<String, serde_json::Value>,
) -> Result<(), ParamValidationError> {
    for spec in schema {
        let value = match params.get(&spec.name) {
            Some(v) => v,
            None if spec.required => {
                return Err(ParamValidationError::MissingRequired(spec.name.clone()))
            }
            None => continue,
        };
        check_value(spec, value)?;
    }

    for key in params.keys() {
        if !schema.iter().any(|s| &s.name == key) {
            return Err(ParamValidationError::Unknown(key.clone()));
        }
    }
    Ok(())
}

fn check_value(
    spec: &HyperparameterSpec,
    value: &serde_json::Value,
) -> Result<(), ParamValidationError> {
    let wrong_type = || ParamValidationError::WrongType {
        name: spec.name.clone(),
        expected: spec.param_type,
    };

    match spec.param_type {
        ParamType::Integer => {
            let n = value.as_i64().ok_or_else(wrong_type)?;
            check_range(spec, n as f64)?;
        }
        ParamType::Float => {
            let n = value.as_f64().ok_or_else(wrong_type)?;
            check_range(spec, n)?;
        }
        ParamType::String => {
            value.as_str().ok_or_else(wrong_type)?;
        }
        ParamType::Boolean => {
            value.as_bool().ok_or_else(wrong_type)?;
        }
        ParamType::TextChoice | ParamType::Enum => {
            value.as_str().ok_or_else(wrong_type)?;
            if let Some(options) = &spec.options {
                if !options.contains(value) {
                    return Err(ParamValidationError::NotAnOption {
                        name: spec.name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_range(spec: &HyperparameterSpec, value: f64) -> Result<(), ParamValidationError> {
    if let Some(range) = &spec.range {
        let min = range.min.unwrap_or(f64::NEG_INFINITY);
        let max = range.max.unwrap_or(f64::INFINITY);
        if value < min || value > max {
            return Err(ParamValidationError::OutOfRange {
                name: spec.name.clone(),
                value,
                min,
                max,
            });
        }
    }
    Ok(())
}

// ============================================================================
// HP search space
// ============================================================================

/// Suggestion type for one search-space dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestType {
    Float,
    Int,
    Categorical,
}

/// One dimension of a typed HP search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpaceParam {
    pub param_name: String,
    pub suggest_type: SuggestType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(default)]
    pub log: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<serde_json::Value>>,
}

impl SearchSpaceParam {
    /// Structural check performed at submission time: numeric dimensions
    /// need bounds, categorical ones need choices.
    pub fn validate(&self) -> Result<(), String> {
        match self.suggest_type {
            SuggestType::Float | SuggestType::Int => {
                let (low, high) = match (self.low, self.high) {
                    (Some(l), Some(h)) => (l, h),
                    _ => {
                        return Err(format!(
                            "'low'/'high' required for '{}'",
                            self.param_name
                        ))
                    }
                };
                if low > high {
                    return Err(format!(
                        "'low' exceeds 'high' for '{}'",
                        self.param_name
                    ));
                }
                if self.log && low <= 0.0 {
                    return Err(format!(
                        "log-scale range must be positive for '{}'",
                        self.param_name
                    ));
                }
            }
            SuggestType::Categorical => {
                if self.choices.as_ref().map_or(true, |c| c.is_empty()) {
                    return Err(format!("'choices' required for '{}'", self.param_name));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Vec<HyperparameterSpec> {
        vec![
            HyperparameterSpec {
                name: "n_estimators".into(),
                param_type: ParamType::Integer,
                default: Some(json!(100)),
                range: Some(ParamRange {
                    min: Some(1.0),
                    max: Some(1000.0),
                    step: Some(1.0),
                    log: None,
                }),
                options: None,
                required: false,
            },
            HyperparameterSpec {
                name: "criterion".into(),
                param_type: ParamType::Enum,
                default: Some(json!("gini")),
                range: None,
                options: Some(vec![json!("gini"), json!("entropy")]),
                required: false,
            },
            HyperparameterSpec {
                name: "target_metric".into(),
                param_type: ParamType::String,
                default: None,
                range: None,
                options: None,
                required: true,
            },
        ]
    }

    #[test]
    fn test_valid_params_pass() {
        let mut params = BTreeMap::new();
        params.insert("n_estimators".to_string(), json!(50));
        params.insert("criterion".to_string(), json!("entropy"));
        params.insert("target_metric".to_string(), json!("f1_weighted"));
        assert!(validate_params(&schema(), &params).is_ok());
    }

    #[test]
    fn test_missing_required_rejected() {
        let params = BTreeMap::new();
        assert_eq!(
            validate_params(&schema(), &params),
            Err(ParamValidationError::MissingRequired(
                "target_metric".into()
            ))
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let mut params = BTreeMap::new();
        params.insert("target_metric".to_string(), json!("auc"));
        params.insert("n_esimators".to_string(), json!(50)); // typo
        assert!(matches!(
            validate_params(&schema(), &params),
            Err(ParamValidationError::Unknown(_))
        ));
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut params = BTreeMap::new();
        params.insert("target_metric".to_string(), json!("auc"));
        params.insert("n_estimators".to_string(), json!(5000));
        assert!(matches!(
            validate_params(&schema(), &params),
            Err(ParamValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_bad_option_rejected() {
        let mut params = BTreeMap::new();
        params.insert("target_metric".to_string(), json!("auc"));
        params.insert("criterion".to_string(), json!("entropy2"));
        assert!(matches!(
            validate_params(&schema(), &params),
            Err(ParamValidationError::NotAnOption { .. })
        ));
    }

    #[test]
    fn test_search_space_validation() {
        let ok = SearchSpaceParam {
            param_name: "lr".into(),
            suggest_type: SuggestType::Float,
            low: Some(1e-4),
            high: Some(1.0),
            step: None,
            log: true,
            choices: None,
        };
        assert!(ok.validate().is_ok());

        let missing_bounds = SearchSpaceParam {
            param_name: "depth".into(),
            suggest_type: SuggestType::Int,
            low: None,
            high: None,
            step: None,
            log: false,
            choices: None,
        };
        assert!(missing_bounds.validate().is_err());

        let empty_choices = SearchSpaceParam {
            param_name: "criterion".into(),
            suggest_type: SuggestType::Categorical,
            low: None,
            high: None,
            step: None,
            log: false,
            choices: Some(vec![]),
        };
        assert!(empty_choices.validate().is_err());
    }
}
