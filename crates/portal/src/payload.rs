//! Portal payload helpers and the entity schema.

use serde_json::{Map, Value};

use portalsync_graph::Schema;
use portalsync_net::Session;
use portalsync_protocol::{ErrorCode, NetError};

pub const LIBRARY: &str = "Library";
pub const CONSENT_VIDEO: &str = "ConsentVideo";
pub const PATIENT: &str = "Patient";
pub const SKETCH: &str = "Sketch";
pub const CONSENT_FORM: &str = "ConsentForm";

/// Required fields of every entity the portal workloads create.
pub fn schema() -> Schema {
    Schema::new()
        .entity(LIBRARY, &[])
        .entity(CONSENT_VIDEO, &["id", "title", "path"])
        .entity(PATIENT, &["id"])
        .entity(SKETCH, &["id"])
        .entity(CONSENT_FORM, &["title"])
}

/// Requires every element of a listing to be a JSON object.
pub(crate) fn objects(values: Vec<Value>, what: &str) -> Result<Vec<Map<String, Value>>, NetError> {
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => Ok(map),
            other => Err(NetError::new(
                ErrorCode::Json,
                format!("{what}: expected an object, got {other}"),
            )),
        })
        .collect()
}

/// Required identifier field; strings and numbers are accepted.
pub(crate) fn identifier(fields: &Map<String, Value>, key: &str) -> Result<String, NetError> {
    match Session::value_for_key(fields, key)? {
        Value::String(s) if !s.is_empty() => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(NetError::new(
            ErrorCode::Json,
            format!("field `{key}` is not an identifier: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identifiers_accept_strings_and_numbers() {
        let fields = json!({"a": "v1", "b": 42, "c": true, "d": ""});
        let fields = fields.as_object().unwrap();
        assert_eq!(identifier(fields, "a").unwrap(), "v1");
        assert_eq!(identifier(fields, "b").unwrap(), "42");
        assert_eq!(identifier(fields, "c").unwrap_err().code(), ErrorCode::Json);
        assert_eq!(identifier(fields, "d").unwrap_err().code(), ErrorCode::Json);
        assert_eq!(identifier(fields, "e").unwrap_err().code(), ErrorCode::Json);
    }

    #[test]
    fn listings_must_hold_objects() {
        let ok = objects(vec![json!({"id": 1})], "videos").unwrap();
        assert_eq!(ok.len(), 1);
        let err = objects(vec![json!({"id": 1}), json!(3)], "videos").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Json);
        assert!(err.description().starts_with("videos:"));
    }

    #[test]
    fn schema_knows_portal_entities() {
        let schema = schema();
        for entity in [LIBRARY, CONSENT_VIDEO, PATIENT, SKETCH, CONSENT_FORM] {
            assert!(schema.knows(entity), "{entity}");
        }
        let missing_path = json!({"id": "v1", "title": "Intro"});
        assert!(
            schema
                .check(CONSENT_VIDEO, missing_path.as_object().unwrap())
                .is_err()
        );
    }
}
