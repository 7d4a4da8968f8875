//! JSON Schema model
//!
//! Comparison walks both documents in step. A reader/writer pair is
//! compatible when every instance valid under the writer is acceptable to
//! the reader for the keywords checked here: `type`, `enum`, `required`,
//! `properties`, `additionalProperties` and `items`. `$ref` is followed both
//! inside a document and into referenced schemas.

use super::{canonical_json, join_path, parse_json, Dependency, ParsedSchema};
use crate::compatibility::{ChangeKind, CompareResult};
use crate::error::{SchemaError, SchemaResult};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

const MAX_REF_DEPTH: usize = 32;

/// A parsed JSON Schema document
#[derive(Debug, Clone)]
pub struct JsonSchema {
    value: JsonValue,
    canonical: String,
    dependencies: BTreeMap<String, Arc<JsonSchema>>,
}

impl JsonSchema {
    pub fn parse(text: &str, dependencies: &[Dependency]) -> SchemaResult<Self> {
        let value = parse_json(text, "JSON")?;
        if !value.is_object() && !value.is_boolean() {
            return Err(SchemaError::InvalidSchema(
                "JSON schema must be an object or a boolean".to_string(),
            ));
        }

        let mut deps = BTreeMap::new();
        for dependency in dependencies {
            let ParsedSchema::Json(dep) = dependency.schema.as_ref() else {
                return Err(SchemaError::InvalidSchema(format!(
                    "Reference '{}' is not a JSON schema",
                    dependency.name
                )));
            };
            deps.insert(dependency.name.clone(), Arc::new(dep.clone()));
        }

        let mut refs = Vec::new();
        collect_refs(&value, &mut refs);
        let mut external = false;
        for reference in refs {
            let base = reference.split('#').next().unwrap_or_default();
            if base.is_empty() {
                continue;
            }
            external = true;
            if !deps.contains_key(base) {
                return Err(SchemaError::InvalidSchema(format!(
                    "Unresolved $ref '{}': no reference named '{}'",
                    reference, base
                )));
            }
        }

        #[cfg(feature = "json-schema")]
        if !external {
            jsonschema::validator_for(&value)
                .map_err(|e| SchemaError::InvalidSchema(format!("Invalid JSON schema: {}", e)))?;
        }
        #[cfg(not(feature = "json-schema"))]
        let _ = external;

        Ok(Self {
            canonical: canonical_json(&value),
            value,
            dependencies: deps,
        })
    }

    pub fn canonical_form(&self) -> &str {
        &self.canonical
    }

    pub fn value(&self) -> &JsonValue {
        &self.value
    }
}

fn collect_refs<'v>(value: &'v JsonValue, out: &mut Vec<&'v str>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                match (key.as_str(), child) {
                    ("$ref", JsonValue::String(r)) => out.push(r),
                    // enum/const hold data, not schemas
                    ("enum" | "const", _) => {}
                    _ => collect_refs(child, out),
                }
            }
        }
        JsonValue::Array(items) => items.iter().for_each(|i| collect_refs(i, out)),
        _ => {}
    }
}

#[derive(Clone, Copy)]
struct Doc<'v> {
    root: &'v JsonValue,
    deps: &'v BTreeMap<String, Arc<JsonSchema>>,
}

impl<'v> Doc<'v> {
    fn of(schema: &'v JsonSchema) -> Self {
        Self {
            root: &schema.value,
            deps: &schema.dependencies,
        }
    }

    /// Follow `$ref` chains; None when a pointer does not resolve
    fn resolve(self, mut value: &'v JsonValue) -> Option<(&'v JsonValue, Doc<'v>)> {
        let mut doc = self;
        for _ in 0..MAX_REF_DEPTH {
            let Some(reference) = value.get("$ref").and_then(JsonValue::as_str) else {
                return Some((value, doc));
            };
            let (base, fragment) = reference.split_once('#').unwrap_or((reference, ""));
            if !base.is_empty() {
                let dep = doc.deps.get(base)?;
                doc = Doc::of(dep);
            }
            value = if fragment.is_empty() {
                doc.root
            } else {
                doc.root.pointer(fragment)?
            };
        }
        None
    }
}

/// Compare two JSON schemas: does `reader` accept everything `writer` allows?
pub fn compare(reader: &JsonSchema, writer: &JsonSchema, result: &mut CompareResult) {
    let mut walk = Walk {
        visited: HashSet::new(),
        result,
    };
    walk.check(
        Doc::of(reader),
        &reader.value,
        Doc::of(writer),
        &writer.value,
        "",
    );
}

struct Walk<'r> {
    visited: HashSet<(usize, usize)>,
    result: &'r mut CompareResult,
}

impl Walk<'_> {
    fn check<'v>(
        &mut self,
        r_doc: Doc<'v>,
        reader: &'v JsonValue,
        w_doc: Doc<'v>,
        writer: &'v JsonValue,
        path: &str,
    ) {
        let (Some((reader, r_doc)), Some((writer, w_doc))) =
            (r_doc.resolve(reader), w_doc.resolve(writer))
        else {
            self.result
                .add(ChangeKind::TypeChanged, path, "unresolved $ref");
            return;
        };

        let key = (
            reader as *const JsonValue as usize,
            writer as *const JsonValue as usize,
        );
        if !self.visited.insert(key) {
            return;
        }

        match (reader, writer) {
            (JsonValue::Bool(true), _) | (_, JsonValue::Bool(false)) => return,
            (JsonValue::Bool(false), _) => {
                self.result
                    .add(ChangeKind::TypeChanged, path, "reader rejects every value");
                return;
            }
            (JsonValue::Object(r), JsonValue::Bool(true)) if !r.is_empty() => {
                self.result.add(
                    ChangeKind::TypeChanged,
                    path,
                    "writer accepts any value but reader is constrained",
                );
                return;
            }
            _ => {}
        }

        self.check_types(reader, writer, path);
        self.check_enum(reader, writer, path);
        self.check_properties(r_doc, reader, w_doc, writer, path);

        if let (Some(r_items), Some(w_items)) = (reader.get("items"), writer.get("items")) {
            if r_items.is_object() || r_items.is_boolean() {
                self.check(r_doc, r_items, w_doc, w_items, path);
            }
        }
    }

    fn check_types(&mut self, reader: &JsonValue, writer: &JsonValue, path: &str) {
        let Some(r_types) = types(reader) else {
            return;
        };
        let Some(w_types) = types(writer) else {
            self.result.add(
                ChangeKind::TypeChanged,
                path,
                format!(
                    "writer has no type constraint, reader expects {}",
                    join(&r_types)
                ),
            );
            return;
        };
        for w_type in &w_types {
            let accepted = r_types.contains(w_type)
                || (w_type == "integer" && r_types.contains("number"));
            if !accepted {
                self.result.add(
                    ChangeKind::TypeChanged,
                    path,
                    format!("writer type {} not accepted by reader {}", w_type, join(&r_types)),
                );
            }
        }
    }

    fn check_enum(&mut self, reader: &JsonValue, writer: &JsonValue, path: &str) {
        let Some(r_values) = reader.get("enum").and_then(JsonValue::as_array) else {
            return;
        };
        match writer.get("enum").and_then(JsonValue::as_array) {
            Some(w_values) => {
                for value in w_values {
                    if !r_values.contains(value) {
                        self.result.add(
                            ChangeKind::EnumValueMissing,
                            path,
                            format!("writer enum value {} unknown to reader", value),
                        );
                    }
                }
            }
            None => self.result.add(
                ChangeKind::EnumValueMissing,
                path,
                "writer is not restricted to the reader's enum values",
            ),
        }
    }

    fn check_properties<'v>(
        &mut self,
        r_doc: Doc<'v>,
        reader: &'v JsonValue,
        w_doc: Doc<'v>,
        writer: &'v JsonValue,
        path: &str,
    ) {
        let r_props = reader.get("properties").and_then(JsonValue::as_object);
        let w_props = writer.get("properties").and_then(JsonValue::as_object);
        let r_required = required(reader);
        let w_required = required(writer);

        for field in &r_required {
            if !w_required.contains(field) {
                self.result.add(
                    ChangeKind::RequiredFieldMissing,
                    join_path(path, field),
                    format!("reader requires '{}' which the writer does not guarantee", field),
                );
            }
        }

        for (name, r_prop) in r_props.into_iter().flatten() {
            let prop_path = join_path(path, name);
            match w_props.and_then(|w| w.get(name)) {
                Some(w_prop) => self.check(r_doc, r_prop, w_doc, w_prop, &prop_path),
                None if writer.get("additionalProperties") != Some(&JsonValue::Bool(false)) => {
                    self.result.add(
                        ChangeKind::PropertyAdded,
                        prop_path,
                        format!("reader declares '{}' which the writer leaves open", name),
                    );
                }
                None => {}
            }
        }

        let r_additional = reader.get("additionalProperties");
        for (name, w_prop) in w_props.into_iter().flatten() {
            if r_props.is_some_and(|r| r.contains_key(name)) {
                continue;
            }
            match r_additional {
                Some(JsonValue::Bool(false)) => self.result.add(
                    ChangeKind::PropertyNotAllowed,
                    join_path(path, name),
                    format!("writer property '{}' rejected by closed reader", name),
                ),
                Some(schema @ JsonValue::Object(_)) => {
                    self.check(r_doc, schema, w_doc, w_prop, &join_path(path, name));
                }
                _ => {}
            }
        }
    }
}

fn types(schema: &JsonValue) -> Option<BTreeSet<String>> {
    match schema.get("type")? {
        JsonValue::String(t) => Some(BTreeSet::from([t.clone()])),
        JsonValue::Array(ts) => Some(
            ts.iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect(),
        ),
        _ => None,
    }
}

fn required(schema: &JsonValue) -> Vec<String> {
    schema
        .get("required")
        .and_then(JsonValue::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn join(types: &BTreeSet<String>) -> String {
    types.iter().cloned().collect::<Vec<_>>().join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SchemaType;

    fn parse(text: &str) -> JsonSchema {
        JsonSchema::parse(text, &[]).unwrap()
    }

    fn compare_texts(reader: &str, writer: &str) -> CompareResult {
        let mut result = CompareResult::new();
        compare(&parse(reader), &parse(writer), &mut result);
        result
    }

    const PERSON: &str = r#"{"type":"object","properties":{"name":{"type":"string"}},"required":["name"]}"#;
    const PERSON_AGE: &str = r#"{"type":"object","properties":{"name":{"type":"string"},"age":{"type":"integer"}},"required":["name","age"]}"#;

    #[test]
    fn test_rejects_non_schema_documents() {
        assert!(matches!(
            JsonSchema::parse("42", &[]).unwrap_err(),
            SchemaError::InvalidSchema(_)
        ));
        assert!(JsonSchema::parse(r#"{"$ref":"missing.json"}"#, &[]).is_err());
    }

    #[test]
    fn test_required_field_missing() {
        // Writer drops a field the reader requires
        let result = compare_texts(PERSON_AGE, PERSON);
        let bad: Vec<_> = result.incompatibilities().collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].kind, ChangeKind::RequiredFieldMissing);
        assert_eq!(bad[0].path, "age");

        assert!(compare_texts(PERSON, PERSON_AGE).is_compatible());
    }

    #[test]
    fn test_integer_widens_to_number() {
        let int = r#"{"type":"integer"}"#;
        let num = r#"{"type":"number"}"#;
        assert!(compare_texts(num, int).is_compatible());
        assert!(!compare_texts(int, num).is_compatible());
    }

    #[test]
    fn test_closed_content_model() {
        let closed = r#"{"type":"object","properties":{"a":{"type":"string"}},"additionalProperties":false}"#;
        let wider = r#"{"type":"object","properties":{"a":{"type":"string"},"b":{"type":"string"}}}"#;
        let result = compare_texts(closed, wider);
        assert_eq!(
            result.incompatibilities().next().map(|r| r.kind),
            Some(ChangeKind::PropertyNotAllowed)
        );
    }

    #[test]
    fn test_ref_into_dependency() {
        let address_v1 = ParsedSchema::parse(
            SchemaType::Json,
            r#"{"type":"object","properties":{"zip":{"type":"string"}}}"#,
            &[],
        )
        .unwrap();
        let address_v2 = ParsedSchema::parse(
            SchemaType::Json,
            r#"{"type":"object","properties":{"zip":{"type":"integer"}}}"#,
            &[],
        )
        .unwrap();
        let customer = r#"{"type":"object","properties":{"home":{"$ref":"address.json"}}}"#;
        let reader =
            JsonSchema::parse(customer, &[Dependency::new("address.json", Arc::new(address_v1))])
                .unwrap();
        let writer =
            JsonSchema::parse(customer, &[Dependency::new("address.json", Arc::new(address_v2))])
                .unwrap();

        let mut result = CompareResult::new();
        compare(&reader, &writer, &mut result);
        let bad: Vec<_> = result.incompatibilities().collect();
        assert_eq!(bad.len(), 1);
        assert_eq!(bad[0].path, "home.zip");
    }

    #[test]
    fn test_local_definitions() {
        let schema = r##"{"definitions":{"id":{"type":"string"}},"type":"object",
            "properties":{"id":{"$ref":"#/definitions/id"}}}"##;
        assert!(compare_texts(schema, schema).is_compatible());
    }
}
