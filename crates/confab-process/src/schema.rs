//! JSON-Schema validation of process arguments.

use serde_json::Value;

/// Validate `arguments` against a JSON schema, returning the first violation
/// as a human-readable message.
pub fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema).map_err(|err| err.to_string())?;
    let result = match validator.iter_errors(arguments).next() {
        None => Ok(()),
        Some(error) => Err(error.to_string()),
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_matching_arguments() {
        let schema = json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        });
        assert!(validate_arguments(&schema, &json!({"text": "hi"})).is_ok());
    }

    #[test]
    fn rejects_missing_required_field() {
        let schema = json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"],
        });
        let err = validate_arguments(&schema, &json!({})).unwrap_err();
        assert!(err.contains("text"));
    }
}
