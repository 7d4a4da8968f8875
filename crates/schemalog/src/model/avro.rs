//! Avro schema model
//!
//! Parsing and validation go through `apache_avro`. Referenced schemas are
//! parsed together with the main schema so named types resolve across
//! schema boundaries.

use super::{canonical_json, join_path, parse_json, Dependency, ParsedSchema};
use crate::compatibility::{ChangeKind, CompareResult, ModificationRecord};
use crate::error::{SchemaError, SchemaResult};
use apache_avro::schema::SchemaKind;
use apache_avro::Schema;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A parsed Avro schema
#[derive(Debug, Clone)]
pub struct AvroSchema {
    schema: Schema,
    /// Named types by full name, including those of dependencies
    names: Arc<HashMap<String, Schema>>,
    canonical: String,
    /// Canonical texts of all transitive dependencies, in link order
    sources: Vec<String>,
}

impl AvroSchema {
    pub fn parse(text: &str, dependencies: &[Dependency]) -> SchemaResult<Self> {
        let value = parse_json(text, "Avro")?;
        let canonical = canonical_json(&value);

        let mut sources: Vec<String> = Vec::new();
        for dependency in dependencies {
            let ParsedSchema::Avro(dep) = dependency.schema.as_ref() else {
                return Err(SchemaError::InvalidSchema(format!(
                    "Reference '{}' is not an Avro schema",
                    dependency.name
                )));
            };
            for source in dep.sources.iter().chain(std::iter::once(&dep.canonical)) {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }

        let invalid = |e: apache_avro::Error| SchemaError::InvalidSchema(format!("Invalid Avro schema: {}", e));
        let (schema, all) = if sources.is_empty() {
            let schema = Schema::parse_str(&canonical).map_err(invalid)?;
            (schema.clone(), vec![schema])
        } else {
            let mut inputs: Vec<&str> = sources.iter().map(String::as_str).collect();
            inputs.push(&canonical);
            let all = Schema::parse_list(&inputs).map_err(invalid)?;
            let schema = all
                .last()
                .cloned()
                .ok_or_else(|| SchemaError::Internal("Avro parser returned no schema".into()))?;
            (schema, all)
        };

        let mut names = HashMap::new();
        for parsed in &all {
            collect_names(parsed, &mut names);
        }

        Ok(Self {
            schema,
            names: Arc::new(names),
            canonical,
            sources,
        })
    }

    pub fn canonical_form(&self) -> &str {
        &self.canonical
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }
}

fn collect_names(schema: &Schema, names: &mut HashMap<String, Schema>) {
    match schema {
        Schema::Record(record) => {
            if names
                .insert(record.name.fullname(None), schema.clone())
                .is_none()
            {
                for field in &record.fields {
                    collect_names(&field.schema, names);
                }
            }
        }
        Schema::Enum(e) => {
            names.insert(e.name.fullname(None), schema.clone());
        }
        Schema::Fixed(f) => {
            names.insert(f.name.fullname(None), schema.clone());
        }
        Schema::Array(array) => collect_names(&array.items, names),
        Schema::Map(map) => collect_names(&map.types, names),
        Schema::Union(union) => {
            for variant in union.variants() {
                collect_names(variant, names);
            }
        }
        _ => {}
    }
}

/// Compare using Avro schema resolution: can `reader` decode data written with `writer`?
pub fn compare(reader: &AvroSchema, writer: &AvroSchema, result: &mut CompareResult) {
    let root = match &reader.schema {
        Schema::Record(r) => r.name.name.clone(),
        _ => String::new(),
    };
    let mut resolution = Resolution {
        reader_names: &reader.names,
        writer_names: &writer.names,
        visited: HashSet::new(),
        records: Vec::new(),
    };
    resolution.check(&reader.schema, &writer.schema, &root);
    result.records.extend(resolution.records);
}

struct Resolution<'a> {
    reader_names: &'a HashMap<String, Schema>,
    writer_names: &'a HashMap<String, Schema>,
    visited: HashSet<(String, String)>,
    records: Vec<ModificationRecord>,
}

impl<'a> Resolution<'a> {
    fn add(&mut self, kind: ChangeKind, path: &str, message: String) {
        self.records.push(ModificationRecord::new(kind, path, message));
    }

    /// Run a check on the side; report only whether it passed
    fn trial(&self, reader: &Schema, writer: &Schema, path: &str) -> bool {
        let mut scratch = Resolution {
            reader_names: self.reader_names,
            writer_names: self.writer_names,
            visited: self.visited.clone(),
            records: Vec::new(),
        };
        scratch.check(reader, writer, path);
        scratch.records.iter().all(ModificationRecord::is_compatible)
    }

    fn check(&mut self, reader: &Schema, writer: &Schema, path: &str) {
        let (Some(reader), Some(writer)) = (
            deref(reader, self.reader_names),
            deref(writer, self.writer_names),
        ) else {
            self.add(
                ChangeKind::TypeChanged,
                path,
                "unresolved named type".to_string(),
            );
            return;
        };

        match (writer, reader) {
            (Schema::Null, Schema::Null)
            | (Schema::Boolean, Schema::Boolean)
            | (Schema::String, Schema::String)
            | (Schema::Bytes, Schema::Bytes)
            | (Schema::Int, Schema::Int)
            | (Schema::Long, Schema::Long)
            | (Schema::Float, Schema::Float)
            | (Schema::Double, Schema::Double) => {}

            // Numeric promotions: int -> long -> float -> double
            (Schema::Int, Schema::Long | Schema::Float | Schema::Double)
            | (Schema::Long, Schema::Float | Schema::Double)
            | (Schema::Float, Schema::Double) => {}

            // String <-> Bytes promotion
            (Schema::String, Schema::Bytes) | (Schema::Bytes, Schema::String) => {}

            (Schema::Array(w), Schema::Array(r)) => self.check(&r.items, &w.items, path),
            (Schema::Map(w), Schema::Map(r)) => self.check(&r.types, &w.types, path),

            (Schema::Enum(w), Schema::Enum(r)) => {
                if w.name.name != r.name.name {
                    self.name_mismatch(path, &r.name.name, &w.name.name);
                    return;
                }
                if r.default.is_some() {
                    return;
                }
                for symbol in &w.symbols {
                    if !r.symbols.contains(symbol) {
                        self.add(
                            ChangeKind::EnumSymbolMissing,
                            path,
                            format!(
                                "writer symbol '{}' unknown to reader enum {} without default",
                                symbol, r.name.name
                            ),
                        );
                    }
                }
            }

            (Schema::Fixed(w), Schema::Fixed(r)) => {
                if w.name.name != r.name.name {
                    self.name_mismatch(path, &r.name.name, &w.name.name);
                } else if w.size != r.size {
                    self.add(
                        ChangeKind::FixedSizeMismatch,
                        path,
                        format!("fixed size changed from {} to {}", r.size, w.size),
                    );
                }
            }

            (Schema::Record(w), Schema::Record(r)) => {
                if w.name.name != r.name.name {
                    self.name_mismatch(path, &r.name.name, &w.name.name);
                    return;
                }
                let key = (r.name.fullname(None), w.name.fullname(None));
                if !self.visited.insert(key) {
                    return;
                }
                for r_field in &r.fields {
                    let field_path = join_path(path, &r_field.name);
                    let w_field = w.fields.iter().find(|wf| {
                        wf.name == r_field.name
                            || r_field
                                .aliases
                                .as_ref()
                                .is_some_and(|a| a.contains(&wf.name))
                    });
                    match w_field {
                        Some(wf) => self.check(&r_field.schema, &wf.schema, &field_path),
                        None if r_field.default.is_none() => self.add(
                            ChangeKind::ReaderFieldMissingDefault,
                            &field_path,
                            format!(
                                "reader field '{}' has no matching writer field and no default",
                                r_field.name
                            ),
                        ),
                        // Reader falls back to the default
                        None => {}
                    }
                }
            }

            (Schema::Union(w), Schema::Union(r)) => {
                for w_variant in w.variants() {
                    if !r.variants().iter().any(|rv| self.trial(rv, w_variant, path)) {
                        self.add(
                            ChangeKind::MissingUnionBranch,
                            path,
                            format!(
                                "writer union branch {} has no matching reader branch",
                                kind_name(w_variant)
                            ),
                        );
                    }
                }
            }

            (w, Schema::Union(r)) => {
                if !r.variants().iter().any(|rv| self.trial(rv, w, path)) {
                    self.add(
                        ChangeKind::MissingUnionBranch,
                        path,
                        format!("writer type {} is not a branch of the reader union", kind_name(w)),
                    );
                }
            }

            (Schema::Union(w), r) => {
                for w_variant in w.variants() {
                    self.check(r, w_variant, path);
                }
            }

            // Logical types and anything else structurally identical
            (w, r) if w == r => {}

            (w, r) => self.add(
                ChangeKind::TypeChanged,
                path,
                format!(
                    "writer type {} cannot be read as {}",
                    kind_name(w),
                    kind_name(r)
                ),
            ),
        }
    }

    fn name_mismatch(&mut self, path: &str, reader: &str, writer: &str) {
        self.add(
            ChangeKind::NameMismatch,
            path,
            format!("reader type {} does not match writer type {}", reader, writer),
        );
    }
}

fn deref<'s>(schema: &'s Schema, names: &'s HashMap<String, Schema>) -> Option<&'s Schema> {
    match schema {
        Schema::Ref { name } => names.get(&name.fullname(None)),
        other => Some(other),
    }
}

fn kind_name(schema: &Schema) -> String {
    match schema {
        Schema::Record(r) => r.name.fullname(None),
        Schema::Enum(e) => e.name.fullname(None),
        Schema::Fixed(f) => f.name.fullname(None),
        other => format!("{:?}", SchemaKind::from(other)).to_lowercase(),
    }
}
