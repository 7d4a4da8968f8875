//! Schema compatibility checking
//!
//! [`compare`] is the pure primitive: one reader, one writer, a list of
//! structured [`ModificationRecord`]s. [`CompatibilityChecker`] applies a
//! [`CompatibilityLevel`] on top of it, choosing directions and which prior
//! versions take part.

use crate::error::SchemaResult;
use crate::model::ParsedSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use crate::types::CompatibilityLevel;

/// Kind of structural change between a reader and a writer schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    // Any format
    SchemaTypeChanged,
    TypeChanged,

    // Avro
    NameMismatch,
    ReaderFieldMissingDefault,
    EnumSymbolMissing,
    FixedSizeMismatch,
    MissingUnionBranch,

    // JSON Schema
    RequiredFieldMissing,
    PropertyNotAllowed,
    EnumValueMissing,
    PropertyAdded,

    // Protobuf
    PackageChanged,
    SyntaxChanged,
    MessageAdded,
    MessageRemoved,
    EnumAdded,
    EnumRemoved,
    FieldAdded,
    FieldRemoved,
    ReservedFieldRemoved,
    FieldRenamed,
    FieldTypeChanged,
    FieldLabelChanged,
    FieldMovedIntoOneof,
    FieldMovedOutOfOneof,
    ReservedTagReused,
    EnumConstantAdded,
    EnumConstantRemoved,
    EnumConstantRenamed,
    EnumConstantNumberChanged,
    ReservedEnumConstantRemoved,
}

impl ChangeKind {
    /// Whether a change of this kind keeps the pair compatible
    pub fn is_compatible(&self) -> bool {
        matches!(
            self,
            ChangeKind::PropertyAdded
                | ChangeKind::SyntaxChanged
                | ChangeKind::MessageAdded
                | ChangeKind::EnumAdded
                | ChangeKind::FieldAdded
                | ChangeKind::ReservedFieldRemoved
                | ChangeKind::FieldRenamed
                | ChangeKind::EnumConstantAdded
                | ChangeKind::EnumConstantRenamed
                | ChangeKind::ReservedEnumConstantRemoved
        )
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Serialized form is the display form
        let text = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&text)
    }
}

/// One structural difference found by [`compare`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
    pub kind: ChangeKind,
    /// Dotted location inside the schema, e.g. `Msg.name`
    pub path: String,
    pub message: String,
}

impl ModificationRecord {
    pub fn new(kind: ChangeKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.kind.is_compatible()
    }
}

impl std::fmt::Display for ModificationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}: {}", self.kind, self.message)
        } else {
            write!(f, "{} at {}: {}", self.kind, self.path, self.message)
        }
    }
}

/// Which side the candidate plays in a check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckDirection {
    /// Prior version reads, candidate writes
    Backward,
    /// Candidate reads, prior version writes
    Forward,
}

/// Result of comparing one reader/writer pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareResult {
    /// Prior version the candidate was compared against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<CheckDirection>,
    #[serde(default)]
    pub records: Vec<ModificationRecord>,
}

impl CompareResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: ChangeKind, path: impl Into<String>, message: impl Into<String>) {
        self.records.push(ModificationRecord::new(kind, path, message));
    }

    pub fn is_compatible(&self) -> bool {
        self.records.iter().all(ModificationRecord::is_compatible)
    }

    /// Records that make the pair incompatible
    pub fn incompatibilities(&self) -> impl Iterator<Item = &ModificationRecord> {
        self.records.iter().filter(|r| !r.is_compatible())
    }

    fn against(mut self, version: u32, direction: CheckDirection) -> Self {
        self.version = Some(version);
        self.direction = Some(direction);
        self
    }
}

/// Compare a reader schema with a writer schema.
///
/// Pure: reads both linked schemas and reports every difference it finds.
pub fn compare(reader: &ParsedSchema, writer: &ParsedSchema) -> SchemaResult<CompareResult> {
    let mut result = CompareResult::new();
    match (reader, writer) {
        (ParsedSchema::Avro(r), ParsedSchema::Avro(w)) => crate::model::avro::compare(r, w, &mut result),
        (ParsedSchema::Json(r), ParsedSchema::Json(w)) => crate::model::json::compare(r, w, &mut result),
        (ParsedSchema::Protobuf(r), ParsedSchema::Protobuf(w)) => {
            crate::model::protobuf::compare(r, w, &mut result)
        }
        (r, w) => result.add(
            ChangeKind::SchemaTypeChanged,
            "",
            format!(
                "schema type changed from {} to {}",
                r.schema_type(),
                w.schema_type()
            ),
        ),
    }
    Ok(result)
}

/// Schema compatibility checker
pub struct CompatibilityChecker {
    level: CompatibilityLevel,
}

impl CompatibilityChecker {
    pub fn new(level: CompatibilityLevel) -> Self {
        Self { level }
    }

    pub fn level(&self) -> CompatibilityLevel {
        self.level
    }

    /// Pick the prior versions this level checks against.
    ///
    /// `history` holds live versions in ascending order.
    pub fn select_history<'a, T>(&self, history: &'a [T]) -> &'a [T] {
        if self.level == CompatibilityLevel::None {
            &[]
        } else if self.level.is_transitive() {
            history
        } else {
            match history.len() {
                0 => history,
                n => &history[n - 1..],
            }
        }
    }

    /// Check a candidate against prior versions.
    ///
    /// Returns one [`CompareResult`] per (version, direction) pair checked.
    pub fn check(
        &self,
        candidate: &ParsedSchema,
        history: &[(u32, Arc<ParsedSchema>)],
    ) -> SchemaResult<Vec<CompareResult>> {
        let mut results = Vec::new();
        for (version, prior) in self.select_history(history) {
            if self.level.is_backward() {
                results.push(compare(prior, candidate)?.against(*version, CheckDirection::Backward));
            }
            if self.level.is_forward() {
                results.push(compare(candidate, prior)?.against(*version, CheckDirection::Forward));
            }
        }
        Ok(results)
    }
}

/// Collect incompatibilities from a set of results
pub fn incompatibilities(results: &[CompareResult]) -> Vec<ModificationRecord> {
    results
        .iter()
        .flat_map(|r| r.incompatibilities().cloned())
        .collect()
}
