//! Caller-supplied parameter overrides for workflow node inputs.
//!
//! Callers describe overrides as loose [`OverrideRecord`]s (typically read
//! from JSON configuration). Each record is converted into exactly one
//! typed [`ParameterOverride`]; a record that satisfies neither the single
//! nor the bulk shape is a validation error.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const VALUE_TYPE_TEXT: &str = "text";
pub const VALUE_TYPE_NUMBER: &str = "number";
pub const VALUE_TYPE_BOOLEAN: &str = "boolean";
pub const VALUE_TYPE_IMAGE: &str = "image";

/// All accepted values of [`OverrideRecord::value_type`].
pub const VALID_VALUE_TYPES: &[&str] = &[
    VALUE_TYPE_TEXT,
    VALUE_TYPE_NUMBER,
    VALUE_TYPE_BOOLEAN,
    VALUE_TYPE_IMAGE,
];

pub const MODE_SINGLE: &str = "single";
pub const MODE_BULK: &str = "bulk";

pub const IMAGE_SOURCE_URL: &str = "url";
pub const IMAGE_SOURCE_BINARY: &str = "binary";

/// Binary property used when an image override names none.
pub const DEFAULT_BINARY_PROPERTY: &str = "data";

// ---------------------------------------------------------------------------
// Typed overrides
// ---------------------------------------------------------------------------

/// Where an image parameter gets its bytes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageReference {
    /// Base64 bytes supplied by the caller.
    InlineBinary {
        name: Option<String>,
        mime_type: Option<String>,
        data: String,
    },
    /// An http(s) URL, possibly pointing back at the generation server.
    RemoteUrl(String),
}

/// A coerced override value.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    Text(String),
    Number(Number),
    Boolean(bool),
    Image(ImageReference),
}

impl TypedValue {
    /// JSON literal for non-image values. Images need resolving first.
    pub fn as_literal(&self) -> Option<Value> {
        match self {
            TypedValue::Text(s) => Some(Value::String(s.clone())),
            TypedValue::Number(n) => Some(Value::Number(n.clone())),
            TypedValue::Boolean(b) => Some(Value::Bool(*b)),
            TypedValue::Image(_) => None,
        }
    }
}

/// One validated override.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterOverride {
    /// Set one input of one node.
    Single {
        node_id: String,
        param_name: String,
        value: TypedValue,
    },
    /// Merge a flat object into a node's inputs, overwriting existing keys.
    Bulk {
        node_id: String,
        parameters: Map<String, Value>,
    },
}

impl ParameterOverride {
    pub fn node_id(&self) -> &str {
        match self {
            ParameterOverride::Single { node_id, .. } | ParameterOverride::Bulk { node_id, .. } => {
                node_id
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loose records
// ---------------------------------------------------------------------------

/// A binary payload referenced by image overrides, keyed by property name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryPayload {
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Caller-side binary attachments available to image overrides.
pub type BinaryStore = HashMap<String, BinaryPayload>;

/// Override as written in caller configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRecord {
    #[serde(default)]
    pub node_id: String,
    /// `single` or `bulk`; inferred when absent.
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub param_name: Option<String>,
    #[serde(default, rename = "type")]
    pub value_type: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    /// Bulk parameters as JSON text.
    #[serde(default)]
    pub parameters_json: Option<String>,
    /// Bulk parameters as an inline object.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// `url` or `binary` for image overrides.
    #[serde(default)]
    pub image_source: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub binary_property: Option<String>,
}

impl OverrideRecord {
    /// Convert into a typed override, resolving binary references.
    pub fn into_override(self, binaries: &BinaryStore) -> Result<ParameterOverride, CoreError> {
        let node_id = self.node_id.trim().to_string();
        if node_id.is_empty() {
            return Err(CoreError::Validation("node ID must not be empty".into()));
        }

        match self.resolved_mode()? {
            Mode::Bulk => {
                let parameters = self.bulk_parameters()?;
                Ok(ParameterOverride::Bulk {
                    node_id,
                    parameters,
                })
            }
            Mode::Single => {
                let param_name = self
                    .param_name
                    .as_deref()
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        CoreError::Validation(format!(
                            "node '{node_id}': parameter name is required"
                        ))
                    })?
                    .to_string();
                let value = self.typed_value(binaries)?;
                Ok(ParameterOverride::Single {
                    node_id,
                    param_name,
                    value,
                })
            }
        }
    }

    fn resolved_mode(&self) -> Result<Mode, CoreError> {
        match self.mode.as_deref() {
            Some(MODE_BULK) => Ok(Mode::Bulk),
            Some(MODE_SINGLE) => Ok(Mode::Single),
            Some(other) => Err(CoreError::Validation(format!(
                "unknown override mode '{other}', expected '{MODE_SINGLE}' or '{MODE_BULK}'"
            ))),
            None => {
                let has_bulk = self.parameters_json.is_some() || self.parameters.is_some();
                let has_single = self.param_name.is_some() || self.value_type.is_some();
                match (has_single, has_bulk) {
                    (true, true) => Err(CoreError::Validation(
                        "override sets both single ('paramName'/'type') and bulk ('parameters') fields; set 'mode'"
                            .into(),
                    )),
                    (true, false) => Ok(Mode::Single),
                    (false, true) => Ok(Mode::Bulk),
                    (false, false) => Err(CoreError::Validation(
                        "override must set either 'paramName' and 'type', or bulk 'parameters'"
                            .into(),
                    )),
                }
            }
        }
    }

    fn bulk_parameters(&self) -> Result<Map<String, Value>, CoreError> {
        let value = match (&self.parameters_json, &self.parameters) {
            (Some(text), _) => serde_json::from_str::<Value>(text).map_err(|e| {
                CoreError::Validation(format!("bulk parameters are not valid JSON: {e}"))
            })?,
            (None, Some(value)) => value.clone(),
            (None, None) => {
                return Err(CoreError::Validation(
                    "bulk override requires 'parameters' or 'parametersJson'".into(),
                ))
            }
        };

        match value {
            Value::Object(map) => Ok(map),
            _ => Err(CoreError::Validation(
                "bulk parameters must be a JSON object".into(),
            )),
        }
    }

    fn typed_value(&self, binaries: &BinaryStore) -> Result<TypedValue, CoreError> {
        let value_type = self.value_type.as_deref().ok_or_else(|| {
            CoreError::Validation(format!(
                "value type is required, expected one of: {}",
                VALID_VALUE_TYPES.join(", ")
            ))
        })?;

        match value_type {
            VALUE_TYPE_TEXT => Ok(TypedValue::Text(coerce_text(self.value.as_ref()))),
            VALUE_TYPE_NUMBER => Ok(TypedValue::Number(coerce_number(self.value.as_ref()))),
            VALUE_TYPE_BOOLEAN => Ok(TypedValue::Boolean(coerce_boolean(self.value.as_ref()))),
            VALUE_TYPE_IMAGE => self.image_reference(binaries).map(TypedValue::Image),
            other => Err(CoreError::Validation(format!(
                "unsupported value type '{other}', expected one of: {}",
                VALID_VALUE_TYPES.join(", ")
            ))),
        }
    }

    fn image_reference(&self, binaries: &BinaryStore) -> Result<ImageReference, CoreError> {
        let url = self
            .image_url
            .clone()
            .or_else(|| self.value.as_ref().and_then(Value::as_str).map(String::from));
        let source = self
            .image_source
            .as_deref()
            .unwrap_or(if url.is_some() { IMAGE_SOURCE_URL } else { IMAGE_SOURCE_BINARY });

        match source {
            IMAGE_SOURCE_URL => {
                let url = url
                    .map(|u| u.trim().to_string())
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| CoreError::Validation("image URL is required".into()))?;
                Ok(ImageReference::RemoteUrl(url))
            }
            IMAGE_SOURCE_BINARY => {
                let property = self
                    .binary_property
                    .as_deref()
                    .unwrap_or(DEFAULT_BINARY_PROPERTY);
                let payload = binaries.get(property).ok_or_else(|| {
                    CoreError::Validation(format!("binary property '{property}' not found"))
                })?;
                Ok(ImageReference::InlineBinary {
                    name: payload.file_name.clone(),
                    mime_type: payload.mime_type.clone(),
                    data: payload.data.clone(),
                })
            }
            other => Err(CoreError::Validation(format!(
                "unknown image source '{other}', expected '{IMAGE_SOURCE_URL}' or '{IMAGE_SOURCE_BINARY}'"
            ))),
        }
    }
}

enum Mode {
    Single,
    Bulk,
}

/// Convert a list of records, qualifying any error with its position.
pub fn parse_override_records(
    records: Vec<OverrideRecord>,
    binaries: &BinaryStore,
) -> Result<Vec<ParameterOverride>, CoreError> {
    records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            record
                .into_override(binaries)
                .map_err(|e| qualify(index, e))
        })
        .collect()
}

/// Prefix an error with the 1-based override position, e.g. `override #3: ...`.
pub fn qualify(index: usize, error: CoreError) -> CoreError {
    let prefix = override_label(index);
    match error {
        CoreError::Validation(m) => CoreError::Validation(format!("{prefix}: {m}")),
        CoreError::Data(m) => CoreError::Data(format!("{prefix}: {m}")),
    }
}

pub fn override_label(index: usize) -> String {
    format!("override #{}", index + 1)
}

// ---------------------------------------------------------------------------
// Coercion
// ---------------------------------------------------------------------------

/// Text coercion: strings as-is, other scalars stringified, missing/null as "".
pub fn coerce_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Number coercion: numbers and numeric strings, otherwise 0.
pub fn coerce_number(value: Option<&Value>) -> Number {
    match value {
        Some(Value::Number(n)) => n.clone(),
        Some(Value::String(s)) => parse_number(s.trim()).unwrap_or_else(|| Number::from(0)),
        _ => Number::from(0),
    }
}

/// Boolean coercion: only literal `true` or the string `"true"` are true.
pub fn coerce_boolean(value: Option<&Value>) -> bool {
    matches!(value, Some(Value::Bool(true))) || matches!(value, Some(Value::String(s)) if s == "true")
}

fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn single(value_type: &str, value: Value) -> OverrideRecord {
        OverrideRecord {
            node_id: "6".into(),
            param_name: Some("text".into()),
            value_type: Some(value_type.into()),
            value: Some(value),
            ..Default::default()
        }
    }

    #[test]
    fn deserializes_camel_case_record() {
        let record: OverrideRecord = serde_json::from_value(json!({
            "nodeId": "3",
            "paramName": "seed",
            "type": "number",
            "value": 7
        }))
        .unwrap();
        let parsed = record.into_override(&BinaryStore::new()).unwrap();
        assert_eq!(
            parsed,
            ParameterOverride::Single {
                node_id: "3".into(),
                param_name: "seed".into(),
                value: TypedValue::Number(Number::from(7)),
            }
        );
    }

    #[test]
    fn text_defaults_to_empty_string() {
        let mut record = single("text", json!(null));
        record.value = None;
        assert_matches!(
            record.into_override(&BinaryStore::new()),
            Ok(ParameterOverride::Single { value: TypedValue::Text(t), .. }) if t.is_empty()
        );
    }

    #[test]
    fn number_coercion() {
        assert_eq!(coerce_number(None), Number::from(0));
        assert_eq!(coerce_number(Some(&json!("12"))), Number::from(12));
        assert_eq!(coerce_number(Some(&json!("1.5"))), Number::from_f64(1.5).unwrap());
        assert_eq!(coerce_number(Some(&json!("abc"))), Number::from(0));
        assert_eq!(coerce_number(Some(&json!(3.25))), Number::from_f64(3.25).unwrap());
    }

    #[test]
    fn boolean_is_true_only_for_true_literals() {
        assert!(coerce_boolean(Some(&json!(true))));
        assert!(coerce_boolean(Some(&json!("true"))));
        assert!(!coerce_boolean(Some(&json!("TRUE"))));
        assert!(!coerce_boolean(Some(&json!(1))));
        assert!(!coerce_boolean(Some(&json!("yes"))));
        assert!(!coerce_boolean(None));
    }

    #[test]
    fn bulk_from_json_text() {
        let record = OverrideRecord {
            node_id: "3".into(),
            mode: Some("bulk".into()),
            parameters_json: Some(r#"{"seed": 1, "steps": 30}"#.into()),
            ..Default::default()
        };
        assert_matches!(
            record.into_override(&BinaryStore::new()),
            Ok(ParameterOverride::Bulk { parameters, .. }) if parameters.len() == 2
        );
    }

    #[test]
    fn bulk_mode_is_inferred_from_parameters() {
        let record = OverrideRecord {
            node_id: "3".into(),
            parameters: Some(json!({"cfg": 6.5})),
            ..Default::default()
        };
        assert_matches!(
            record.into_override(&BinaryStore::new()),
            Ok(ParameterOverride::Bulk { .. })
        );
    }

    #[test]
    fn record_with_both_shapes_needs_explicit_mode() {
        let record: OverrideRecord = serde_json::from_value(json!({
            "nodeId": "3",
            "paramName": "seed",
            "type": "number",
            "value": 7,
            "parameters": {"cfg": 9, "steps": 40}
        }))
        .unwrap();
        assert_matches!(
            record.clone().into_override(&BinaryStore::new()),
            Err(CoreError::Validation(m)) if m.contains("both single") && m.contains("set 'mode'")
        );

        let explicit = OverrideRecord {
            mode: Some("bulk".into()),
            ..record
        };
        assert_matches!(
            explicit.into_override(&BinaryStore::new()),
            Ok(ParameterOverride::Bulk { parameters, .. }) if parameters.len() == 2
        );
    }

    #[test]
    fn bulk_rejects_non_object() {
        let record = OverrideRecord {
            node_id: "3".into(),
            mode: Some("bulk".into()),
            parameters_json: Some("[1, 2]".into()),
            ..Default::default()
        };
        assert_matches!(
            record.into_override(&BinaryStore::new()),
            Err(CoreError::Validation(m)) if m.contains("must be a JSON object")
        );
    }

    #[test]
    fn record_with_neither_shape_is_rejected() {
        let record = OverrideRecord {
            node_id: "3".into(),
            ..Default::default()
        };
        assert_matches!(
            record.into_override(&BinaryStore::new()),
            Err(CoreError::Validation(m)) if m.contains("either")
        );
    }

    #[test]
    fn unsupported_type_is_rejected() {
        assert_matches!(
            single("color", json!("red")).into_override(&BinaryStore::new()),
            Err(CoreError::Validation(m)) if m.contains("unsupported value type 'color'")
        );
    }

    #[test]
    fn image_url_reference() {
        let record = OverrideRecord {
            node_id: "10".into(),
            param_name: Some("image".into()),
            value_type: Some("image".into()),
            image_url: Some("https://example.com/cat.png".into()),
            ..Default::default()
        };
        assert_matches!(
            record.into_override(&BinaryStore::new()),
            Ok(ParameterOverride::Single {
                value: TypedValue::Image(ImageReference::RemoteUrl(u)),
                ..
            }) if u == "https://example.com/cat.png"
        );
    }

    #[test]
    fn image_binary_reference_is_looked_up() {
        let mut binaries = BinaryStore::new();
        binaries.insert(
            "photo".into(),
            BinaryPayload {
                file_name: Some("me.jpg".into()),
                mime_type: Some("image/jpeg".into()),
                data: "aGVsbG8=".into(),
            },
        );
        let record = OverrideRecord {
            node_id: "10".into(),
            param_name: Some("image".into()),
            value_type: Some("image".into()),
            image_source: Some("binary".into()),
            binary_property: Some("photo".into()),
            ..Default::default()
        };
        assert_matches!(
            record.clone().into_override(&binaries),
            Ok(ParameterOverride::Single {
                value: TypedValue::Image(ImageReference::InlineBinary { name: Some(n), .. }),
                ..
            }) if n == "me.jpg"
        );

        assert_matches!(
            record.into_override(&BinaryStore::new()),
            Err(CoreError::Validation(m)) if m.contains("binary property 'photo' not found")
        );
    }

    #[test]
    fn parse_records_qualifies_errors_by_position() {
        let records = vec![
            single("text", json!("ok")),
            single("text", json!("ok")),
            OverrideRecord::default(),
        ];
        assert_matches!(
            parse_override_records(records, &BinaryStore::new()),
            Err(CoreError::Validation(m)) if m.starts_with("override #3: ")
        );
    }
}
