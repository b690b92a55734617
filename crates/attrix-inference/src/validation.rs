//! Eager validation of vision replies into strict [`AttributeDetail`]s.
//!
//! Nothing loosely typed crosses this boundary: a reply either becomes an
//! [`AttributeMap`] keyed by exactly the schema keys, or fails with
//! `MalformedResponse` (not JSON), `SchemaValidationFailed` (wrong shape),
//! or `ImageQualityRejected` (the model refused the image).

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use tracing::trace;

use attrix_core::defaults::IMAGE_QUALITY_CODE;
use attrix_core::{
    AttributeDetail, AttributeMap, AttributeType, Error, Result, SchemaItem, SchemaValue,
};

fn fence_regex() -> &'static Regex {
    static FENCE: OnceLock<Regex> = OnceLock::new();
    FENCE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").unwrap()
    })
}

/// Strip a surrounding markdown code fence, if any.
fn unwrap_fence(content: &str) -> &str {
    match fence_regex().captures(content).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => content.trim(),
    }
}

/// Parse and validate a raw model reply against `schema`.
pub fn parse_reply(content: &str, schema: &[SchemaItem]) -> Result<AttributeMap> {
    let body = unwrap_fence(content);
    let value: JsonValue = serde_json::from_str(body)
        .map_err(|e| Error::MalformedResponse(format!("Reply is not valid JSON: {}", e)))?;

    let object = value.as_object().ok_or_else(|| {
        Error::SchemaValidationFailed("Reply must be a JSON object keyed by attribute".into())
    })?;

    if let Some(reason) = image_quality_rejection(object, schema) {
        return Err(Error::ImageQualityRejected(reason));
    }

    validate_attributes(object, schema)
}

/// Detect the `{"error": "IMAGE_QUALITY", "reason": ...}` refusal.
fn image_quality_rejection(object: &Map<String, JsonValue>, schema: &[SchemaItem]) -> Option<String> {
    if schema.iter().any(|item| item.key == "error") {
        return None;
    }
    let code = object.get("error")?.as_str()?;
    if !code.eq_ignore_ascii_case(IMAGE_QUALITY_CODE) {
        return None;
    }
    Some(
        object
            .get("reason")
            .and_then(JsonValue::as_str)
            .unwrap_or("Image is not usable for attribute extraction")
            .to_string(),
    )
}

/// Validate the attribute object. Extra keys are dropped.
pub fn validate_attributes(
    object: &Map<String, JsonValue>,
    schema: &[SchemaItem],
) -> Result<AttributeMap> {
    let missing: Vec<&str> = schema
        .iter()
        .filter(|item| !object.contains_key(&item.key))
        .map(|item| item.key.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(Error::SchemaValidationFailed(format!(
            "Missing attribute keys: {}",
            missing.join(", ")
        )));
    }

    let mut attributes = AttributeMap::new();
    for item in schema {
        let detail = match &object[&item.key] {
            JsonValue::Null => None,
            JsonValue::Object(fields) => Some(validate_detail(item, fields)?),
            other => {
                return Err(Error::SchemaValidationFailed(format!(
                    "Attribute {} must be null or an object, got {}",
                    item.key,
                    json_type(other)
                )))
            }
        };
        trace!(schema_key = %item.key, ?detail, "Validated attribute");
        attributes.insert(item.key.clone(), detail);
    }
    Ok(attributes)
}

fn validate_detail(item: &SchemaItem, fields: &Map<String, JsonValue>) -> Result<AttributeDetail> {
    let (Some(schema_raw), Some(raw_raw)) = (fields.get("schemaValue"), fields.get("rawValue"))
    else {
        return Err(Error::SchemaValidationFailed(format!(
            "Attribute {} must carry schemaValue and rawValue",
            item.key
        )));
    };

    let schema_value = match schema_raw {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(SchemaValue::Text(s.trim().to_string())),
        JsonValue::Number(n) => n.as_f64().map(SchemaValue::Number),
        other => {
            return Err(Error::SchemaValidationFailed(format!(
                "Attribute {} schemaValue must be a string, number or null, got {}",
                item.key,
                json_type(other)
            )))
        }
    };

    let raw_value = match raw_raw {
        JsonValue::Null => None,
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        other => {
            return Err(Error::SchemaValidationFailed(format!(
                "Attribute {} rawValue must be a string or null, got {}",
                item.key,
                json_type(other)
            )))
        }
    };

    let flagged = fields
        .get("isNewDiscovery")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);

    let mut detail = AttributeDetail {
        schema_value,
        raw_value,
        is_new_discovery: false,
        visual_confidence: confidence(fields.get("visualConfidence")),
        mapping_confidence: confidence(fields.get("mappingConfidence")),
        reasoning: fields
            .get("reasoning")
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .filter(|s| !s.is_empty()),
    };
    normalize(item, &mut detail, flagged);
    Ok(detail)
}

/// Apply per-type normalisation and the raw-implies-schema invariant.
fn normalize(item: &SchemaItem, detail: &mut AttributeDetail, flagged: bool) {
    let mut unmapped = false;
    if detail.schema_value.is_none() {
        if let Some(raw) = &detail.raw_value {
            detail.schema_value = Some(SchemaValue::Text(raw.clone()));
            unmapped = true;
        }
    }

    match item.attribute_type {
        AttributeType::Number => {
            if let Some(SchemaValue::Text(s)) = &detail.schema_value {
                if let Ok(n) = s.trim().parse::<f64>() {
                    detail.schema_value = Some(SchemaValue::Number(n));
                }
            }
        }
        AttributeType::Select => {
            let canonical = detail
                .schema_value
                .as_ref()
                .and_then(|v| item.canonical_value(&v.to_string()))
                .map(str::to_string);
            let matched = canonical.is_some();
            if let Some(c) = canonical {
                detail.schema_value = Some(SchemaValue::Text(c));
            }
            detail.is_new_discovery =
                detail.schema_value.is_some() && (flagged || unmapped || !matched);
        }
        AttributeType::Text => {}
    }
}

fn confidence(value: Option<&JsonValue>) -> u8 {
    let n = match value {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(JsonValue::String(s)) => s.trim().trim_end_matches('%').parse().unwrap_or(0.0),
        _ => 0.0,
    };
    n.round().clamp(0.0, 100.0) as u8
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attrix_core::{keys_match, ErrorKind};
    use serde_json::json;

    fn schema() -> Vec<SchemaItem> {
        vec![
            SchemaItem::select("color", "Color", ["RED", "BLUE"]),
            SchemaItem::text("material", "Material"),
            SchemaItem::number("weight", "Weight"),
        ]
    }

    fn detail(schema_value: JsonValue, raw_value: JsonValue) -> JsonValue {
        json!({
            "schemaValue": schema_value,
            "rawValue": raw_value,
            "visualConfidence": 90,
            "mappingConfidence": 80,
            "reasoning": "visible"
        })
    }

    #[test]
    fn test_valid_reply() {
        let reply = json!({
            "color": detail(json!("RED"), json!("red")),
            "material": null,
            "weight": detail(json!(250), json!("250 g")),
        });
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();

        assert!(keys_match(&attrs, &schema()));
        let color = attrs["color"].as_ref().unwrap();
        assert_eq!(color.schema_value, Some("RED".into()));
        assert_eq!(color.visual_confidence, 90);
        assert!(!color.is_new_discovery);
        assert!(attrs["material"].is_none());
        assert_eq!(
            attrs["weight"].as_ref().unwrap().schema_value,
            Some(SchemaValue::Number(250.0))
        );
    }

    #[test]
    fn test_fenced_reply() {
        let reply = format!(
            "Here you go:\n```json\n{}\n```",
            json!({"color": null, "material": null, "weight": null})
        );
        let attrs = parse_reply(&reply, &schema()).unwrap();
        assert!(attrs.values().all(Option::is_none));
    }

    #[test]
    fn test_not_json_is_malformed() {
        let err = parse_reply("I cannot help with that", &schema()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    }

    #[test]
    fn test_array_is_validation_failure() {
        let err = parse_reply("[1, 2]", &schema()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
    }

    #[test]
    fn test_missing_key_is_validation_failure() {
        let reply = json!({"color": null, "material": null});
        let err = parse_reply(&reply.to_string(), &schema()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
        assert!(err.to_string().contains("weight"));
    }

    #[test]
    fn test_scalar_value_is_validation_failure() {
        let reply = json!({"color": "RED", "material": null, "weight": null});
        let err = parse_reply(&reply.to_string(), &schema()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
    }

    #[test]
    fn test_object_without_required_fields_is_validation_failure() {
        let reply = json!({"color": {"value": "RED"}, "material": null, "weight": null});
        let err = parse_reply(&reply.to_string(), &schema()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaValidationFailed);
    }

    #[test]
    fn test_extra_keys_are_dropped() {
        let reply = json!({"color": null, "material": null, "weight": null, "size": null});
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();
        assert!(!attrs.contains_key("size"));
        assert!(keys_match(&attrs, &schema()));
    }

    #[test]
    fn test_image_quality_refusal() {
        let reply = json!({"error": "IMAGE_QUALITY", "reason": "too dark"});
        let err = parse_reply(&reply.to_string(), &schema()).unwrap_err();
        assert!(matches!(err, Error::ImageQualityRejected(r) if r == "too dark"));
    }

    #[test]
    fn test_raw_without_schema_value_is_mapped_best_effort() {
        let reply = json!({
            "color": detail(json!(null), json!("teal")),
            "material": detail(json!(null), json!("linen")),
            "weight": null,
        });
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();

        let color = attrs["color"].as_ref().unwrap();
        assert_eq!(color.schema_value, Some("teal".into()));
        assert!(color.is_new_discovery);

        let material = attrs["material"].as_ref().unwrap();
        assert_eq!(material.schema_value, Some("linen".into()));
        assert!(!material.is_new_discovery);
    }

    #[test]
    fn test_select_canonicalised_case_insensitive() {
        let reply = json!({
            "color": detail(json!("blue"), json!("navy")),
            "material": null,
            "weight": null,
        });
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();
        let color = attrs["color"].as_ref().unwrap();
        assert_eq!(color.schema_value, Some("BLUE".into()));
        assert!(!color.is_new_discovery);
    }

    #[test]
    fn test_select_unknown_value_is_discovery() {
        let reply = json!({
            "color": detail(json!("OLIVE"), json!("olive")),
            "material": null,
            "weight": null,
        });
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();
        assert!(attrs["color"].as_ref().unwrap().is_new_discovery);
    }

    #[test]
    fn test_model_discovery_flag_kept_with_best_effort_mapping() {
        let mut d = detail(json!("BLUE"), json!("teal"));
        d["isNewDiscovery"] = json!(true);
        let reply = json!({"color": d, "material": null, "weight": null});
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();
        let color = attrs["color"].as_ref().unwrap();
        assert_eq!(color.schema_value, Some("BLUE".into()));
        assert!(color.is_new_discovery);
    }

    #[test]
    fn test_confidence_clamped_and_defaulted() {
        let reply = json!({
            "color": {"schemaValue": "RED", "rawValue": "red", "visualConfidence": 140.6, "mappingConfidence": "55%"},
            "material": {"schemaValue": "cotton", "rawValue": "cotton"},
            "weight": null,
        });
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();
        let color = attrs["color"].as_ref().unwrap();
        assert_eq!(color.visual_confidence, 100);
        assert_eq!(color.mapping_confidence, 55);
        let material = attrs["material"].as_ref().unwrap();
        assert_eq!(material.visual_confidence, 0);
        assert!(material.reasoning.is_none());
    }

    #[test]
    fn test_numeric_string_becomes_number() {
        let reply = json!({
            "color": null,
            "material": null,
            "weight": detail(json!("12.5"), json!("12.5kg")),
        });
        let attrs = parse_reply(&reply.to_string(), &schema()).unwrap();
        assert_eq!(
            attrs["weight"].as_ref().unwrap().schema_value,
            Some(SchemaValue::Number(12.5))
        );
    }
}
