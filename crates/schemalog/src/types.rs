//! Schema types and data structures
//!
//! This module provides core types for the schema registry:
//! - [`SchemaId`], [`Subject`], [`SchemaVersion`] - Core identifiers
//! - [`Schema`], [`SubjectVersion`], [`SchemaReference`] - Registered content
//! - [`SchemaType`] - Supported schema formats
//! - [`Mode`], [`CompatibilityLevel`] - Registry configuration

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Unique identifier for a schema (global across all subjects)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SchemaId(pub u32);

impl SchemaId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SchemaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SchemaId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Subject (typically topic-name + "-key" or "-value")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Subject(pub String);

impl Subject {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Subject {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Subject {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for Subject {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Schema Type
// ============================================================================

/// Schema format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SchemaType {
    #[default]
    Avro,
    #[serde(alias = "JSONSCHEMA", alias = "JSON_SCHEMA")]
    Json,
    #[serde(alias = "PROTO")]
    Protobuf,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Avro => "AVRO",
            SchemaType::Json => "JSON",
            SchemaType::Protobuf => "PROTOBUF",
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SchemaType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "AVRO" => Ok(SchemaType::Avro),
            "JSON" | "JSONSCHEMA" | "JSON_SCHEMA" => Ok(SchemaType::Json),
            "PROTOBUF" | "PROTO" => Ok(SchemaType::Protobuf),
            _ => Err(format!("Unknown schema type: {}", s)),
        }
    }
}

// ============================================================================
// Versions
// ============================================================================

/// Version number within a subject
///
/// Serialized as a number. The "latest" marker is written as `-1` and
/// accepted as `-1` or the string `"latest"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaVersion(pub u32);

impl SchemaVersion {
    /// The special "latest" version marker
    pub const LATEST: u32 = u32::MAX;

    pub fn new(version: u32) -> Self {
        Self(version)
    }

    /// Create a version that represents "latest"
    pub fn latest() -> Self {
        Self(Self::LATEST)
    }

    /// Check if this represents the "latest" version
    pub fn is_latest(&self) -> bool {
        self.0 == Self::LATEST
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_latest() {
            write!(f, "latest")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for SchemaVersion {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl std::str::FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "latest" | "-1" => Ok(Self::latest()),
            other => match other.parse::<u32>() {
                Ok(0) | Err(_) => Err(format!(
                    "The specified version '{}' is not a valid version id",
                    s
                )),
                Ok(v) => Ok(Self(v)),
            },
        }
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.is_latest() {
            serializer.serialize_i64(-1)
        } else {
            serializer.serialize_u32(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(i64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(-1) => Ok(Self::latest()),
            Raw::Num(n) if n > 0 && n < i64::from(Self::LATEST) => Ok(Self(n as u32)),
            Raw::Num(n) => Err(serde::de::Error::custom(format!(
                "invalid schema version {}",
                n
            ))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}

// ============================================================================
// Registered Content
// ============================================================================

/// Reference to another schema (for composition)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaReference {
    /// Reference name (used in the schema, e.g. an import path)
    pub name: String,
    /// Subject containing the referenced schema
    pub subject: String,
    /// Version of the referenced schema, or latest
    pub version: SchemaVersion,
}

impl SchemaReference {
    pub fn new(
        name: impl Into<String>,
        subject: impl Into<String>,
        version: impl Into<SchemaVersion>,
    ) -> Self {
        Self {
            name: name.into(),
            subject: subject.into(),
            version: version.into(),
        }
    }

    /// Reference that follows the highest live version of its subject
    pub fn latest(name: impl Into<String>, subject: impl Into<String>) -> Self {
        Self::new(name, subject, SchemaVersion::latest())
    }
}

/// Deserialize a reference list where `null` means empty
pub fn nullable_references<'de, D>(deserializer: D) -> Result<Vec<SchemaReference>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<SchemaReference>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A registered schema with its metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Unique schema ID (global)
    pub id: SchemaId,
    /// Schema type/format
    #[serde(default)]
    pub schema_type: SchemaType,
    /// Canonical schema text
    pub schema: String,
    /// SHA-256 fingerprint of the canonical form and references
    pub fingerprint: String,
    /// Schema references (for nested schemas)
    #[serde(default, deserialize_with = "nullable_references")]
    pub references: Vec<SchemaReference>,
}

/// A subject version combines subject, version, and schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectVersion {
    /// Subject name
    pub subject: Subject,
    /// Version number
    pub version: u32,
    /// Schema ID
    pub id: SchemaId,
    /// Schema type
    #[serde(default)]
    pub schema_type: SchemaType,
    /// The schema definition
    pub schema: String,
    /// Schema references
    #[serde(default, deserialize_with = "nullable_references")]
    pub references: Vec<SchemaReference>,
    /// Soft-deleted flag
    #[serde(default)]
    pub deleted: bool,
}

// ============================================================================
// Registry Configuration Types
// ============================================================================

/// Mode for schema registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    /// Read-write mode (default)
    #[default]
    Readwrite,
    /// Read-only mode
    Readonly,
    /// Import mode (for migrations)
    Import,
}

impl Mode {
    /// Check if registrations and deletions are accepted
    pub fn allows_writes(&self) -> bool {
        !matches!(self, Mode::Readonly)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Readwrite => write!(f, "READWRITE"),
            Mode::Readonly => write!(f, "READONLY"),
            Mode::Import => write!(f, "IMPORT"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "READWRITE" => Ok(Mode::Readwrite),
            "READONLY" => Ok(Mode::Readonly),
            "IMPORT" => Ok(Mode::Import),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// Compatibility level for schema evolution
///
/// | Level | Reader | Writer | History |
/// |-------|--------|--------|---------|
/// | BACKWARD | prior | candidate | latest |
/// | FORWARD | candidate | prior | latest |
/// | FULL | both ways | both ways | latest |
/// | *_TRANSITIVE | as above | as above | all live versions |
/// | NONE | - | - | - |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompatibilityLevel {
    /// Existing readers can consume data written with the candidate (default)
    #[default]
    Backward,

    /// Backward against every live prior version
    BackwardTransitive,

    /// The candidate can consume data written with existing schemas
    Forward,

    /// Forward against every live prior version
    ForwardTransitive,

    /// Both backward and forward compatible
    Full,

    /// Both backward and forward compatible (transitive)
    FullTransitive,

    /// No compatibility checking
    None,
}

impl CompatibilityLevel {
    /// Check if this level requires backward compatibility
    pub fn is_backward(&self) -> bool {
        matches!(
            self,
            Self::Backward | Self::BackwardTransitive | Self::Full | Self::FullTransitive
        )
    }

    /// Check if this level requires forward compatibility
    pub fn is_forward(&self) -> bool {
        matches!(
            self,
            Self::Forward | Self::ForwardTransitive | Self::Full | Self::FullTransitive
        )
    }

    /// Check if this level is transitive (checks all versions)
    pub fn is_transitive(&self) -> bool {
        matches!(
            self,
            Self::BackwardTransitive | Self::ForwardTransitive | Self::FullTransitive
        )
    }
}

impl std::fmt::Display for CompatibilityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Backward => "BACKWARD",
            Self::BackwardTransitive => "BACKWARD_TRANSITIVE",
            Self::Forward => "FORWARD",
            Self::ForwardTransitive => "FORWARD_TRANSITIVE",
            Self::Full => "FULL",
            Self::FullTransitive => "FULL_TRANSITIVE",
            Self::None => "NONE",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CompatibilityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BACKWARD" => Ok(Self::Backward),
            "BACKWARD_TRANSITIVE" => Ok(Self::BackwardTransitive),
            "FORWARD" => Ok(Self::Forward),
            "FORWARD_TRANSITIVE" => Ok(Self::ForwardTransitive),
            "FULL" => Ok(Self::Full),
            "FULL_TRANSITIVE" => Ok(Self::FullTransitive),
            "NONE" => Ok(Self::None),
            _ => Err(format!("Unknown compatibility level: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_type_parse() {
        assert_eq!("avro".parse::<SchemaType>().unwrap(), SchemaType::Avro);
        assert_eq!("AVRO".parse::<SchemaType>().unwrap(), SchemaType::Avro);
        assert_eq!("json".parse::<SchemaType>().unwrap(), SchemaType::Json);
        assert_eq!(
            "protobuf".parse::<SchemaType>().unwrap(),
            SchemaType::Protobuf
        );
        assert!("thrift".parse::<SchemaType>().is_err());
    }

    #[test]
    fn test_schema_id() {
        let id = SchemaId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert_eq!(format!("{}", id), "42");
    }

    #[test]
    fn test_compatibility_level_parse() {
        assert_eq!(
            "backward".parse::<CompatibilityLevel>().unwrap(),
            CompatibilityLevel::Backward
        );
        assert_eq!(
            "FULL_TRANSITIVE".parse::<CompatibilityLevel>().unwrap(),
            CompatibilityLevel::FullTransitive
        );
        assert_eq!(
            "none".parse::<CompatibilityLevel>().unwrap(),
            CompatibilityLevel::None
        );
        assert!("SIDEWAYS".parse::<CompatibilityLevel>().is_err());
    }

    #[test]
    fn test_compatibility_level_methods() {
        assert!(CompatibilityLevel::Backward.is_backward());
        assert!(!CompatibilityLevel::Backward.is_forward());
        assert!(!CompatibilityLevel::Backward.is_transitive());

        assert!(CompatibilityLevel::Full.is_backward());
        assert!(CompatibilityLevel::Full.is_forward());
        assert!(!CompatibilityLevel::Full.is_transitive());

        assert!(CompatibilityLevel::FullTransitive.is_transitive());
    }

    #[test]
    fn test_compatibility_level_serde() {
        let json = serde_json::to_string(&CompatibilityLevel::BackwardTransitive).unwrap();
        assert_eq!(json, "\"BACKWARD_TRANSITIVE\"");
        let level: CompatibilityLevel = serde_json::from_str("\"FULL\"").unwrap();
        assert_eq!(level, CompatibilityLevel::Full);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("readonly".parse::<Mode>().unwrap(), Mode::Readonly);
        assert!(Mode::Import.allows_writes());
        assert!(!Mode::Readonly.allows_writes());
    }

    // ========================================================================
    // Version Tests
    // ========================================================================

    #[test]
    fn test_version_latest_wire_form() {
        let latest = SchemaVersion::latest();
        assert_eq!(serde_json::to_string(&latest).unwrap(), "-1");
        assert_eq!(
            serde_json::from_str::<SchemaVersion>("-1").unwrap(),
            latest
        );
        assert_eq!(
            serde_json::from_str::<SchemaVersion>("\"latest\"").unwrap(),
            latest
        );
        assert_eq!(
            serde_json::from_str::<SchemaVersion>("3").unwrap(),
            SchemaVersion::new(3)
        );
        assert!(serde_json::from_str::<SchemaVersion>("0").is_err());
    }

    #[test]
    fn test_version_display() {
        assert_eq!(SchemaVersion::latest().to_string(), "latest");
        assert_eq!(SchemaVersion::new(2).to_string(), "2");
        assert_eq!("latest".parse::<SchemaVersion>().unwrap(), SchemaVersion::latest());
    }

    #[test]
    fn test_null_references_are_empty() {
        let json = r#"{"id":1,"schema_type":"PROTOBUF","schema":"x","fingerprint":"ab","references":null}"#;
        let schema: Schema = serde_json::from_str(json).unwrap();
        assert!(schema.references.is_empty());
    }
}
