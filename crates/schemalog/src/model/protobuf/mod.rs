//! Protobuf schema model
//!
//! A parsed `.proto` file plus the protobuf schemas it imports. Linking
//! checks that every import is satisfied, that tags are unique and not
//! reserved, and that every field type resolves to a scalar, a message or
//! enum in the file or its dependencies, or a well-known `google.` type.

mod compare;
pub mod elements;
mod parser;

pub use compare::compare;

use super::{Dependency, ParsedSchema};
use crate::error::{SchemaError, SchemaResult};
use elements::{EnumElement, FieldElement, MessageElement, ProtoFile, TypeElement};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

const SCALAR_TYPES: &[&str] = &[
    "double", "float", "int32", "int64", "uint32", "uint64", "sint32", "sint64", "fixed32",
    "fixed64", "sfixed32", "sfixed64", "bool", "string", "bytes",
];

/// Import prefixes that never need an explicit reference
const WELL_KNOWN_IMPORTS: &[&str] = &["google/protobuf/", "google/type/"];

const WELL_KNOWN_PACKAGE: &str = "google.";

#[derive(Debug, Clone)]
pub struct ProtobufSchema {
    file: ProtoFile,
    canonical: String,
    dependencies: BTreeMap<String, Arc<ProtobufSchema>>,
}

impl ProtobufSchema {
    pub fn parse(text: &str, dependencies: &[Dependency]) -> SchemaResult<Self> {
        let file = parser::parse(text)?;

        let mut deps = BTreeMap::new();
        for dependency in dependencies {
            let ParsedSchema::Protobuf(dep) = dependency.schema.as_ref() else {
                return Err(SchemaError::InvalidSchema(format!(
                    "Reference '{}' is not a protobuf schema",
                    dependency.name
                )));
            };
            deps.insert(dependency.name.clone(), Arc::new(dep.clone()));
        }

        for import in &file.imports {
            let well_known = WELL_KNOWN_IMPORTS.iter().any(|p| import.path.starts_with(p));
            if !well_known && !deps.contains_key(&import.path) {
                return Err(SchemaError::InvalidSchema(format!(
                    "Import '{}' has no matching reference",
                    import.path
                )));
            }
        }

        let schema = Self {
            canonical: file.to_schema(),
            file,
            dependencies: deps,
        };
        schema.validate()?;
        Ok(schema)
    }

    pub fn canonical_form(&self) -> &str {
        &self.canonical
    }

    pub fn file(&self) -> &ProtoFile {
        &self.file
    }

    pub fn package(&self) -> Option<&str> {
        self.file.package.as_deref()
    }

    pub fn dependencies(&self) -> &BTreeMap<String, Arc<ProtobufSchema>> {
        &self.dependencies
    }

    /// `.package` or empty for files without one
    fn scope(&self) -> String {
        self.package()
            .map(|p| format!(".{}", p))
            .unwrap_or_default()
    }

    fn validate(&self) -> SchemaResult<()> {
        let index = TypeIndex::new(self);
        if let Some(duplicate) = index.duplicates.first() {
            return Err(SchemaError::InvalidSchema(format!(
                "Type '{}' is defined more than once",
                duplicate
            )));
        }

        let scope = self.scope();
        for element in &self.file.types {
            validate_type(&index, &scope, element)?;
        }
        for extend in &self.file.extends {
            for field in &extend.fields {
                resolve_field(&index, &scope, field)?;
            }
        }
        for service in &self.file.services {
            for rpc in &service.rpcs {
                for type_name in [&rpc.request_type, &rpc.response_type] {
                    match index.resolve(&scope, type_name) {
                        Some(ResolvedType::Message(_)) | Some(ResolvedType::External(_)) => {}
                        _ => {
                            return Err(SchemaError::InvalidSchema(format!(
                                "rpc {}.{} uses unknown message type '{}'",
                                service.name, rpc.name, type_name
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn validate_type(index: &TypeIndex<'_>, scope: &str, element: &TypeElement) -> SchemaResult<()> {
    let TypeElement::Message(message) = element else {
        return Ok(());
    };
    let fqn = format!("{}.{}", scope, message.name);

    let mut tags = HashSet::new();
    for (field, _) in message.all_fields() {
        if !tags.insert(field.tag) {
            return Err(SchemaError::InvalidSchema(format!(
                "{}: field number {} is used more than once",
                &fqn[1..],
                field.tag
            )));
        }
        if message.reserves_tag(field.tag) || message.reserves_name(&field.name) {
            return Err(SchemaError::InvalidSchema(format!(
                "{}: field '{}' = {} uses a reserved name or number",
                &fqn[1..],
                field.name,
                field.tag
            )));
        }
        resolve_field(index, &fqn, field)?;
    }
    for extend in &message.extends {
        for field in &extend.fields {
            resolve_field(index, &fqn, field)?;
        }
    }
    for nested in &message.nested {
        validate_type(index, &fqn, nested)?;
    }
    Ok(())
}

fn resolve_field(index: &TypeIndex<'_>, scope: &str, field: &FieldElement) -> SchemaResult<ResolvedType> {
    index.resolve(scope, &field.type_name).ok_or_else(|| {
        SchemaError::InvalidSchema(format!(
            "Field '{}' has unknown type '{}'",
            field.name, field.type_name
        ))
    })
}

// ============================================================================
// Type resolution
// ============================================================================

/// A field type after name resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedType {
    Scalar(String),
    Message(String),
    Enum(String),
    /// Well-known type outside the linked schemas
    External(String),
    Map(Box<ResolvedType>, Box<ResolvedType>),
}

impl ResolvedType {
    pub fn describe(&self) -> String {
        match self {
            ResolvedType::Scalar(name) => name.clone(),
            ResolvedType::Message(fqn) | ResolvedType::Enum(fqn) | ResolvedType::External(fqn) => {
                fqn.clone()
            }
            ResolvedType::Map(key, value) => {
                format!("map<{}, {}>", key.describe(), value.describe())
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Indexed<'a> {
    Message(&'a MessageElement),
    Enum(&'a EnumElement),
}

/// Fully-qualified names (`.pkg.Outer.Inner`) of every type in a schema
/// and its transitive dependencies
pub(crate) struct TypeIndex<'a> {
    types: HashMap<String, Indexed<'a>>,
    duplicates: Vec<String>,
}

impl<'a> TypeIndex<'a> {
    pub(crate) fn new(schema: &'a ProtobufSchema) -> Self {
        let mut files: Vec<&'a ProtobufSchema> = Vec::new();
        let mut seen = HashSet::new();
        collect_files(schema, &mut files, &mut seen);

        let mut index = Self {
            types: HashMap::new(),
            duplicates: Vec::new(),
        };
        for file in files {
            let scope = file.scope();
            for element in &file.file.types {
                index.insert(&scope, element);
            }
        }
        index
    }

    fn insert(&mut self, scope: &str, element: &'a TypeElement) {
        let fqn = format!("{}.{}", scope, element.name());
        if let TypeElement::Message(message) = element {
            for nested in &message.nested {
                self.insert(&fqn, nested);
            }
        }
        let entry = match element {
            TypeElement::Message(m) => Indexed::Message(m),
            TypeElement::Enum(e) => Indexed::Enum(e),
        };
        if self.types.insert(fqn.clone(), entry).is_some() {
            self.duplicates.push(fqn);
        }
    }

    pub(crate) fn get(&self, fqn: &str) -> Option<Indexed<'a>> {
        self.types.get(fqn).copied()
    }

    pub(crate) fn message(&self, fqn: &str) -> Option<&'a MessageElement> {
        match self.get(fqn) {
            Some(Indexed::Message(m)) => Some(m),
            _ => None,
        }
    }

    pub(crate) fn enumeration(&self, fqn: &str) -> Option<&'a EnumElement> {
        match self.get(fqn) {
            Some(Indexed::Enum(e)) => Some(e),
            _ => None,
        }
    }

    /// Resolve a type name the way protoc does: innermost scope first,
    /// walking outward to the root. A leading `.` makes the name absolute.
    pub(crate) fn resolve(&self, scope: &str, type_name: &str) -> Option<ResolvedType> {
        if let Some(inner) = type_name
            .strip_prefix("map<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            let (key, value) = inner.split_once(',')?;
            let key = self.resolve(scope, key.trim())?;
            let value = self.resolve(scope, value.trim())?;
            return Some(ResolvedType::Map(Box::new(key), Box::new(value)));
        }

        if SCALAR_TYPES.contains(&type_name) {
            return Some(ResolvedType::Scalar(type_name.to_string()));
        }

        if let Some(absolute) = type_name.strip_prefix('.') {
            return self.lookup(type_name).or_else(|| external(absolute));
        }

        let mut scope = scope;
        loop {
            let candidate = format!("{}.{}", scope, type_name);
            if let Some(found) = self.lookup(&candidate) {
                return Some(found);
            }
            match scope.rfind('.') {
                Some(pos) => scope = &scope[..pos],
                None => break,
            }
        }
        external(type_name)
    }

    fn lookup(&self, fqn: &str) -> Option<ResolvedType> {
        self.get(fqn).map(|indexed| match indexed {
            Indexed::Message(_) => ResolvedType::Message(fqn.to_string()),
            Indexed::Enum(_) => ResolvedType::Enum(fqn.to_string()),
        })
    }
}

fn external(relative: &str) -> Option<ResolvedType> {
    relative
        .starts_with(WELL_KNOWN_PACKAGE)
        .then(|| ResolvedType::External(format!(".{}", relative)))
}

fn collect_files<'a>(
    schema: &'a ProtobufSchema,
    files: &mut Vec<&'a ProtobufSchema>,
    seen: &mut HashSet<*const ProtobufSchema>,
) {
    if !seen.insert(schema as *const ProtobufSchema) {
        return;
    }
    files.push(schema);
    for dependency in schema.dependencies.values() {
        collect_files(dependency, files, seen);
    }
}
