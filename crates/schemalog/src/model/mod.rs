//! Schema model
//!
//! A closed set of per-format schema trees behind [`ParsedSchema`]. Every
//! variant offers the same capabilities: a canonical text form, a
//! fingerprint over that form, and structural comparison (see
//! [`crate::compatibility::compare`]).
//!
//! Parsing takes the already-linked [`Dependency`] list, so a parsed schema
//! carries everything needed to resolve cross-schema type names.

pub mod avro;
pub mod json;
pub mod protobuf;

use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::types::{SchemaReference, SchemaType};
use serde_json::Value as JsonValue;
use std::sync::Arc;

pub use avro::AvroSchema;
pub use json::JsonSchema;
pub use protobuf::ProtobufSchema;

/// A resolved reference: the name used inside the schema and the linked target
#[derive(Debug, Clone)]
pub struct Dependency {
    pub name: String,
    pub schema: Arc<ParsedSchema>,
}

impl Dependency {
    pub fn new(name: impl Into<String>, schema: Arc<ParsedSchema>) -> Self {
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// A parsed and linked schema
#[derive(Debug, Clone)]
pub enum ParsedSchema {
    Avro(AvroSchema),
    Json(JsonSchema),
    Protobuf(ProtobufSchema),
}

impl ParsedSchema {
    /// Parse schema text and link it against its dependencies
    pub fn parse(
        schema_type: SchemaType,
        text: &str,
        dependencies: &[Dependency],
    ) -> SchemaResult<Self> {
        match schema_type {
            SchemaType::Avro => AvroSchema::parse(text, dependencies).map(ParsedSchema::Avro),
            SchemaType::Json => JsonSchema::parse(text, dependencies).map(ParsedSchema::Json),
            SchemaType::Protobuf => {
                ProtobufSchema::parse(text, dependencies).map(ParsedSchema::Protobuf)
            }
        }
    }

    pub fn schema_type(&self) -> SchemaType {
        match self {
            ParsedSchema::Avro(_) => SchemaType::Avro,
            ParsedSchema::Json(_) => SchemaType::Json,
            ParsedSchema::Protobuf(_) => SchemaType::Protobuf,
        }
    }

    /// Stable normalized text; parsing it yields the same canonical form
    pub fn canonical_form(&self) -> &str {
        match self {
            ParsedSchema::Avro(s) => s.canonical_form(),
            ParsedSchema::Json(s) => s.canonical_form(),
            ParsedSchema::Protobuf(s) => s.canonical_form(),
        }
    }

    pub fn fingerprint(&self, references: &[SchemaReference]) -> SchemaFingerprint {
        SchemaFingerprint::compute(self.schema_type(), self.canonical_form(), references)
    }
}

/// Render a JSON value with object keys in sorted order and no whitespace.
///
/// Independent of serde_json's map ordering feature.
pub(crate) fn canonical_json(value: &JsonValue) -> String {
    let mut out = String::new();
    write_canonical_json(value, &mut out);
    out
}

fn write_canonical_json(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical_json(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Extend a dotted location path
pub(crate) fn join_path(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{}.{}", path, segment)
    }
}

pub(crate) fn parse_json(text: &str, what: &str) -> SchemaResult<JsonValue> {
    serde_json::from_str(text)
        .map_err(|e| SchemaError::ParseError(format!("Invalid {} schema JSON: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let value: JsonValue =
            serde_json::from_str(r#"{ "b": [3, {"z": 1, "a": null}], "a": "x\"y" }"#).unwrap();
        assert_eq!(
            canonical_json(&value),
            r#"{"a":"x\"y","b":[3,{"a":null,"z":1}]}"#
        );
    }

    #[test]
    fn test_canonicalization_is_idempotent_for_every_format() {
        let inputs = [
            (
                SchemaType::Avro,
                r#"{ "name": "User", "type": "record",
                    "fields": [ {"type": "long", "name": "id"} ] }"#,
            ),
            (
                SchemaType::Json,
                r#"{"type": "object", "properties": {"id": {"type": "integer"}}}"#,
            ),
            (
                SchemaType::Protobuf,
                "// header\nsyntax = \"proto3\";\npackage a.b;\n\
                 message M { /* id */ int64 id = 1; extensions 100 to max; }\n",
            ),
        ];
        for (schema_type, text) in inputs {
            let once = ParsedSchema::parse(schema_type, text, &[]).unwrap();
            let twice = ParsedSchema::parse(schema_type, once.canonical_form(), &[]).unwrap();
            assert_eq!(once.canonical_form(), twice.canonical_form(), "{}", schema_type);
            assert_eq!(once.fingerprint(&[]), twice.fingerprint(&[]));
        }
    }

    #[test]
    fn test_formatting_does_not_change_fingerprint() {
        let a = ParsedSchema::parse(SchemaType::Json, r#"{"type":"string"}"#, &[]).unwrap();
        let b = ParsedSchema::parse(SchemaType::Json, "{\n  \"type\" : \"string\"\n}", &[]).unwrap();
        assert_eq!(a.fingerprint(&[]), b.fingerprint(&[]));
    }
}
