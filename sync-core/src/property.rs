use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// A dynamically-typed property value, per the entity property bag design
/// note: a tagged union rather than a fixed schema, so `EventType` authors
/// can define arbitrary property shapes that `PropertyDefinition` rows
/// describe and `Event` rows carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Text(String),
    Number(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Select(String),
    Duration(i64),
    Url(String),
    Email(String),
}

impl PropertyValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PropertyValue::Text(_) => "text",
            PropertyValue::Number(_) => "number",
            PropertyValue::Boolean(_) => "boolean",
            PropertyValue::Date(_) => "date",
            PropertyValue::Select(_) => "select",
            PropertyValue::Duration(_) => "duration",
            PropertyValue::Url(_) => "url",
            PropertyValue::Email(_) => "email",
        }
    }

    /// Validates an entity body's `properties` bag: every entry must decode
    /// as a well-formed `PropertyValue`. A missing or `null` `properties`
    /// field is treated as an empty bag, since only `Event` and
    /// `PropertyDefinition` rows carry one. Called on both sides of the
    /// wire — the client before queuing a mutation, the server before
    /// committing a create/update — so a malformed bag never reaches the
    /// change log either device has to reconcile against.
    pub fn validate_bag(body: &Value) -> Result<()> {
        let Some(properties) = body.get("properties") else {
            return Ok(());
        };
        if properties.is_null() {
            return Ok(());
        }
        let map = properties.as_object().ok_or_else(|| Error::Api {
            status: 422,
            message: "properties must be a JSON object".into(),
        })?;
        for (field, value) in map {
            serde_json::from_value::<PropertyValue>(value.clone()).map_err(|_| Error::Api {
                status: 422,
                message: format!("invalid property \"{field}\": not a well-formed PropertyValue"),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_wire_shape_is_tagged() {
        let v = PropertyValue::Number(3.5);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["type"], "number");
        assert_eq!(json["value"], 3.5);
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let values = vec![
            PropertyValue::Text("hi".into()),
            PropertyValue::Number(1.0),
            PropertyValue::Boolean(true),
            PropertyValue::Date(Utc::now()),
            PropertyValue::Select("red".into()),
            PropertyValue::Duration(60),
            PropertyValue::Url("https://example.com".into()),
            PropertyValue::Email("a@example.com".into()),
        ];
        for v in values {
            let json = serde_json::to_string(&v).unwrap();
            let back: PropertyValue = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn test_validate_bag_accepts_missing_and_null_properties() {
        assert!(PropertyValue::validate_bag(&serde_json::json!({"id": "e1"})).is_ok());
        assert!(PropertyValue::validate_bag(&serde_json::json!({"properties": null})).is_ok());
    }

    #[test]
    fn test_validate_bag_accepts_well_formed_entries() {
        let body = serde_json::json!({
            "properties": {
                "distance_km": {"type": "number", "value": 5.2},
                "label": {"type": "text", "value": "morning run"},
            }
        });
        assert!(PropertyValue::validate_bag(&body).is_ok());
    }

    #[test]
    fn test_validate_bag_rejects_malformed_entry() {
        let body = serde_json::json!({
            "properties": { "distance_km": {"type": "number", "value": "not a number"} }
        });
        let err = PropertyValue::validate_bag(&body).unwrap_err();
        assert!(matches!(err, Error::Api { status: 422, .. }));
    }

    #[test]
    fn test_validate_bag_rejects_non_object_properties() {
        let err = PropertyValue::validate_bag(&serde_json::json!({"properties": "oops"})).unwrap_err();
        assert!(matches!(err, Error::Api { status: 422, .. }));
    }
}
