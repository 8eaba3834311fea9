use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::error::{AppError, Result};

/// One value the agent needs before it can continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRequest {
    pub key: String,
    pub label: String,
}

/// Pause record persisted on the run row while it waits for input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPayload {
    pub what_i_tried: String,
    pub what_i_need: String,
    #[serde(default)]
    pub inputs: Vec<InputRequest>,
}

impl EscalationPayload {
    pub fn validate(&self) -> Result<()> {
        if self.what_i_need.trim().is_empty() {
            return Err(AppError::Validation(
                "escalation must say what the agent needs".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for input in &self.inputs {
            if input.key.trim().is_empty() {
                return Err(AppError::Validation(
                    "escalation input keys must not be empty".to_string(),
                ));
            }
            if !seen.insert(input.key.as_str()) {
                return Err(AppError::Validation(format!(
                    "duplicate escalation input key '{}'",
                    input.key
                )));
            }
        }
        Ok(())
    }

    pub fn input_keys(&self) -> BTreeSet<String> {
        self.inputs.iter().map(|i| i.key.clone()).collect()
    }

    /// Provided values must cover exactly the declared keys.
    pub fn check_inputs(&self, provided: &Map<String, Value>) -> Result<()> {
        let expected = self.input_keys();
        let given: BTreeSet<String> = provided.keys().cloned().collect();
        if expected != given {
            return Err(AppError::InputMismatch {
                expected: expected.into_iter().collect(),
                provided: given.into_iter().collect(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload() -> EscalationPayload {
        serde_json::from_value(json!({
            "what_i_tried": "ran the migration",
            "what_i_need": "the staging database url",
            "inputs": [{"key": "db_url", "label": "Staging DB URL"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_check_inputs_requires_exact_keys() {
        let payload = payload();
        let ok = json!({"db_url": "postgres://..."});
        assert!(payload.check_inputs(ok.as_object().unwrap()).is_ok());

        let extra = json!({"db_url": "x", "token": "y"});
        let err = payload.check_inputs(extra.as_object().unwrap()).unwrap_err();
        assert_eq!(err.kind(), "input_mismatch");

        let missing = json!({});
        assert!(payload.check_inputs(missing.as_object().unwrap()).is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_keys() {
        let mut payload = payload();
        payload.inputs.push(InputRequest {
            key: "db_url".to_string(),
            label: "again".to_string(),
        });
        assert!(payload.validate().is_err());
    }
}
