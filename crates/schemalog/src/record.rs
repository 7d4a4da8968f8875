//! Mutation records
//!
//! The unit appended to the `_schemas` log. Records are JSON objects tagged
//! with a major format version. Unknown fields are ignored and unknown
//! operations decode to [`OperationKind::Unknown`], so a node can replay a
//! log written by a newer producer of the same major format.

use crate::error::{SchemaError, SchemaResult};
use crate::fingerprint::SchemaFingerprint;
use crate::types::{
    nullable_references, CompatibilityLevel, Mode, Schema, SchemaId, SchemaReference, SchemaType,
    Subject,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Major record format understood by this build
pub const RECORD_FORMAT: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    RegisterSchema,
    UpdateConfig,
    UpdateMode,
    DeleteSubject,
    DeleteVersion,
    #[serde(other)]
    Unknown,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::RegisterSchema => "register_schema",
            OperationKind::UpdateConfig => "update_config",
            OperationKind::UpdateMode => "update_mode",
            OperationKind::DeleteSubject => "delete_subject",
            OperationKind::DeleteVersion => "delete_version",
            OperationKind::Unknown => "unknown",
        }
    }
}

/// Wire form of a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRecord {
    pub format: u32,
    pub op: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_id: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_type: Option<SchemaType>,
    /// Canonical schema text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(
        default,
        deserialize_with = "nullable_references",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub references: Vec<SchemaReference>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub permanent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compatibility: Option<CompatibilityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    /// Node that appended the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer: Option<String>,
}

/// A decoded, validated mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    RegisterSchema {
        subject: Subject,
        version: u32,
        schema: Schema,
        deleted: bool,
    },
    /// `subject: None` targets the global scope; `compatibility: None` clears it
    UpdateConfig {
        subject: Option<Subject>,
        compatibility: Option<CompatibilityLevel>,
    },
    UpdateMode {
        subject: Option<Subject>,
        mode: Option<Mode>,
    },
    DeleteSubject {
        subject: Subject,
        permanent: bool,
    },
    DeleteVersion {
        subject: Subject,
        version: u32,
        permanent: bool,
    },
}

impl MutationRecord {
    fn empty(op: OperationKind) -> Self {
        Self {
            format: RECORD_FORMAT,
            op,
            subject: None,
            version: None,
            schema_id: None,
            schema_type: None,
            schema: None,
            references: Vec::new(),
            deleted: false,
            permanent: false,
            compatibility: None,
            mode: None,
            producer: None,
        }
    }

    pub fn register(subject: &Subject, version: u32, schema: &Schema) -> Self {
        Self {
            subject: Some(subject.0.clone()),
            version: Some(version),
            schema_id: Some(schema.id.0),
            schema_type: Some(schema.schema_type),
            schema: Some(schema.schema.clone()),
            references: schema.references.clone(),
            ..Self::empty(OperationKind::RegisterSchema)
        }
    }

    pub fn update_config(subject: Option<&Subject>, level: Option<CompatibilityLevel>) -> Self {
        Self {
            subject: subject.map(|s| s.0.clone()),
            compatibility: level,
            ..Self::empty(OperationKind::UpdateConfig)
        }
    }

    pub fn update_mode(subject: Option<&Subject>, mode: Option<Mode>) -> Self {
        Self {
            subject: subject.map(|s| s.0.clone()),
            mode,
            ..Self::empty(OperationKind::UpdateMode)
        }
    }

    pub fn delete_subject(subject: &Subject, permanent: bool) -> Self {
        Self {
            subject: Some(subject.0.clone()),
            permanent,
            ..Self::empty(OperationKind::DeleteSubject)
        }
    }

    pub fn delete_version(subject: &Subject, version: u32, permanent: bool) -> Self {
        Self {
            subject: Some(subject.0.clone()),
            version: Some(version),
            permanent,
            ..Self::empty(OperationKind::DeleteVersion)
        }
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = Some(producer.into());
        self
    }

    /// Log key: operation plus the entity it touches
    pub fn key(&self) -> Bytes {
        let mut key = format!("{:?}", self.op).to_lowercase();
        match &self.subject {
            Some(subject) => {
                key.push('/');
                key.push_str(subject);
            }
            None => key.push_str("/_global"),
        }
        if let Some(version) = self.version {
            key.push('/');
            key.push_str(&version.to_string());
        }
        Bytes::from(key)
    }

    pub fn encode(&self) -> SchemaResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Decode a record read at `offset`. Undecodable payloads and foreign
    /// major formats are corruption.
    pub fn decode(offset: u64, value: &[u8]) -> SchemaResult<Self> {
        let record: MutationRecord =
            serde_json::from_slice(value).map_err(|e| SchemaError::LogCorruption {
                offset,
                reason: format!("undecodable mutation record: {}", e),
            })?;
        if record.format != RECORD_FORMAT {
            return Err(SchemaError::LogCorruption {
                offset,
                reason: format!(
                    "unsupported record format {} (expected {})",
                    record.format, RECORD_FORMAT
                ),
            });
        }
        Ok(record)
    }

    /// Convert to a typed mutation; `None` for operations this build does not know
    pub fn into_mutation(self, offset: u64) -> SchemaResult<Option<Mutation>> {
        let missing = |field: &str| SchemaError::LogCorruption {
            offset,
            reason: format!("{:?} record without '{}'", self.op, field),
        };

        let mutation = match self.op {
            OperationKind::Unknown => return Ok(None),
            OperationKind::RegisterSchema => {
                let subject = self.subject.clone().ok_or_else(|| missing("subject"))?;
                let version = self.version.ok_or_else(|| missing("version"))?;
                let id = self.schema_id.ok_or_else(|| missing("schema_id"))?;
                let text = self.schema.clone().ok_or_else(|| missing("schema"))?;
                let schema_type = self.schema_type.unwrap_or_default();
                let fingerprint =
                    SchemaFingerprint::compute(schema_type, &text, &self.references).sha256_hex();
                Mutation::RegisterSchema {
                    subject: Subject::new(subject),
                    version,
                    schema: Schema {
                        id: SchemaId::new(id),
                        schema_type,
                        schema: text,
                        fingerprint,
                        references: self.references,
                    },
                    deleted: self.deleted,
                }
            }
            OperationKind::UpdateConfig => Mutation::UpdateConfig {
                subject: self.subject.map(Subject::new),
                compatibility: self.compatibility,
            },
            OperationKind::UpdateMode => Mutation::UpdateMode {
                subject: self.subject.map(Subject::new),
                mode: self.mode,
            },
            OperationKind::DeleteSubject => Mutation::DeleteSubject {
                subject: Subject::new(self.subject.clone().ok_or_else(|| missing("subject"))?),
                permanent: self.permanent,
            },
            OperationKind::DeleteVersion => Mutation::DeleteVersion {
                subject: Subject::new(self.subject.clone().ok_or_else(|| missing("subject"))?),
                version: self.version.ok_or_else(|| missing("version"))?,
                permanent: self.permanent,
            },
        };
        Ok(Some(mutation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        let text = r#""string""#;
        Schema {
            id: SchemaId::new(3),
            schema_type: SchemaType::Avro,
            schema: text.to_string(),
            fingerprint: SchemaFingerprint::compute(SchemaType::Avro, text, &[]).sha256_hex(),
            references: vec![],
        }
    }

    #[test]
    fn test_register_record_decodes_to_mutation() {
        let subject = Subject::new("orders-value");
        let record = MutationRecord::register(&subject, 2, &schema()).with_producer("node-a");
        let bytes = record.encode().unwrap();

        let decoded = MutationRecord::decode(0, &bytes).unwrap();
        assert_eq!(decoded, record);
        match decoded.into_mutation(0).unwrap() {
            Some(Mutation::RegisterSchema {
                subject: s,
                version,
                schema: registered,
                deleted,
            }) => {
                assert_eq!(s, subject);
                assert_eq!(version, 2);
                assert_eq!(registered, schema());
                assert!(!deleted);
            }
            other => panic!("unexpected mutation: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_fields_and_operations_are_tolerated() {
        let newer = br#"{"format":1,"op":"update_config","subject":"s","compatibility":"FULL","tenant":"x"}"#;
        let mutation = MutationRecord::decode(4, newer)
            .unwrap()
            .into_mutation(4)
            .unwrap();
        assert_eq!(
            mutation,
            Some(Mutation::UpdateConfig {
                subject: Some(Subject::new("s")),
                compatibility: Some(CompatibilityLevel::Full),
            })
        );

        let future_op = br#"{"format":1,"op":"set_tags","subject":"s"}"#;
        let record = MutationRecord::decode(5, future_op).unwrap();
        assert_eq!(record.op, OperationKind::Unknown);
        assert_eq!(record.into_mutation(5).unwrap(), None);
    }

    #[test]
    fn test_null_references_accepted() {
        let raw = br#"{"format":1,"op":"register_schema","subject":"s","version":1,"schema_id":1,"schema_type":"JSON","schema":"{}","references":null}"#;
        let record = MutationRecord::decode(0, raw).unwrap();
        assert!(record.references.is_empty());
    }

    #[test]
    fn test_corrupt_records_rejected() {
        let err = MutationRecord::decode(9, b"{not json").unwrap_err();
        assert!(matches!(err, SchemaError::LogCorruption { offset: 9, .. }));

        let err = MutationRecord::decode(1, br#"{"format":2,"op":"update_mode"}"#).unwrap_err();
        assert!(err.is_fatal());

        let err = MutationRecord::decode(2, br#"{"format":1,"op":"delete_version","subject":"s"}"#)
            .unwrap()
            .into_mutation(2)
            .unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_keys() {
        let subject = Subject::new("s");
        assert_eq!(
            MutationRecord::delete_version(&subject, 3, false).key(),
            Bytes::from("deleteversion/s/3")
        );
        assert_eq!(
            MutationRecord::update_mode(None, Some(Mode::Readonly)).key(),
            Bytes::from("updatemode/_global")
        );
    }
}
