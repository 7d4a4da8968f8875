//! Schema registry errors

use crate::compatibility::ModificationRecord;
use thiserror::Error;

/// Confluent-compatible error codes
pub mod error_codes {
    // Subject/schema not found
    pub const SUBJECT_NOT_FOUND: u32 = 40401;
    pub const VERSION_NOT_FOUND: u32 = 40402;
    pub const SCHEMA_NOT_FOUND: u32 = 40403;
    pub const SUBJECT_SOFT_DELETED: u32 = 40404;
    pub const SUBJECT_NOT_SOFT_DELETED: u32 = 40405;
    pub const VERSION_NOT_SOFT_DELETED: u32 = 40407;

    // Invalid schema/compatibility
    pub const INVALID_SCHEMA: u32 = 42201;
    pub const INVALID_VERSION: u32 = 42202;
    pub const INVALID_COMPATIBILITY_LEVEL: u32 = 42203;
    pub const INCOMPATIBLE_SCHEMA: u32 = 409;

    // Mode / references
    pub const OPERATION_NOT_PERMITTED: u32 = 42205;
    pub const REFERENCE_NOT_FOUND: u32 = 42206;
    pub const REFERENCE_CYCLE: u32 = 42207;
    pub const REFERENCE_EXISTS: u32 = 42208;

    // Authorization
    pub const FORBIDDEN: u32 = 40301;

    // Internal errors
    pub const INTERNAL_ERROR: u32 = 50001;
    pub const STORAGE_ERROR: u32 = 50002;
    pub const OPERATION_TIMEOUT: u32 = 50004;
    pub const NOT_READY: u32 = 50003;
    pub const NO_PRIMARY: u32 = 50301;
    pub const NOT_PRIMARY: u32 = 50302;
    pub const PRIMARY_UNREACHABLE: u32 = 50303;
    pub const LOG_CORRUPTION: u32 = 50009;
}

/// Schema registry error types
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("Schema not found: {0}")]
    NotFound(String),

    #[error("Subject not found: {0}")]
    SubjectNotFound(String),

    #[error("Version not found: {subject} version {version}")]
    VersionNotFound { subject: String, version: String },

    #[error("Subject '{0}' was not deleted first before being permanently deleted")]
    SubjectNotSoftDeleted(String),

    #[error("Subject '{subject}' version {version} was not deleted first before being permanently deleted")]
    VersionNotSoftDeleted { subject: String, version: u32 },

    #[error("Schema reference not found: {name} references {subject} version {version}")]
    ReferenceNotFound {
        name: String,
        subject: String,
        version: String,
    },

    #[error("Schema reference cycle: {}", chain.join(" -> "))]
    ReferenceCycle { chain: Vec<String> },

    #[error("One or more references exist to subject '{subject}' version {version}")]
    ReferenceExists { subject: String, version: u32 },

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Schema parse error: {0}")]
    ParseError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Incompatible schema: {}", describe(.0))]
    Incompatible(Vec<ModificationRecord>),

    #[error("Operation not permitted: {0}")]
    OperationNotPermitted(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not primary (primary: {})", primary.as_deref().unwrap_or("unknown"))]
    NotPrimary { primary: Option<String> },

    #[error("Primary unknown")]
    PrimaryUnknown,

    #[error("Primary {primary} unreachable: {reason}")]
    PrimaryUnreachable { primary: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Registry not ready: {0}")]
    NotReady(String),

    #[error("Log corruption at offset {offset}: {reason}")]
    LogCorruption { offset: u64, reason: String },

    #[error("Log error: {0}")]
    Log(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn describe(records: &[ModificationRecord]) -> String {
    records
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl SchemaError {
    /// Get the Confluent-compatible error code
    pub fn error_code(&self) -> u32 {
        match self {
            SchemaError::NotFound(_) => error_codes::SCHEMA_NOT_FOUND,
            SchemaError::SubjectNotFound(_) => error_codes::SUBJECT_NOT_FOUND,
            SchemaError::VersionNotFound { .. } => error_codes::VERSION_NOT_FOUND,
            SchemaError::SubjectNotSoftDeleted(_) => error_codes::SUBJECT_NOT_SOFT_DELETED,
            SchemaError::VersionNotSoftDeleted { .. } => error_codes::VERSION_NOT_SOFT_DELETED,
            SchemaError::ReferenceNotFound { .. } => error_codes::REFERENCE_NOT_FOUND,
            SchemaError::ReferenceCycle { .. } => error_codes::REFERENCE_CYCLE,
            SchemaError::ReferenceExists { .. } => error_codes::REFERENCE_EXISTS,
            SchemaError::InvalidSchema(_) => error_codes::INVALID_SCHEMA,
            SchemaError::ParseError(_) => error_codes::INVALID_SCHEMA,
            SchemaError::InvalidInput(_) => error_codes::INVALID_SCHEMA,
            SchemaError::Incompatible(_) => error_codes::INCOMPATIBLE_SCHEMA,
            SchemaError::OperationNotPermitted(_) => error_codes::OPERATION_NOT_PERMITTED,
            SchemaError::Forbidden(_) => error_codes::FORBIDDEN,
            SchemaError::NotPrimary { .. } => error_codes::NOT_PRIMARY,
            SchemaError::PrimaryUnknown => error_codes::NO_PRIMARY,
            SchemaError::PrimaryUnreachable { .. } => error_codes::PRIMARY_UNREACHABLE,
            SchemaError::Timeout(_) => error_codes::OPERATION_TIMEOUT,
            SchemaError::NotReady(_) => error_codes::NOT_READY,
            SchemaError::LogCorruption { .. } => error_codes::LOG_CORRUPTION,
            SchemaError::Log(_) => error_codes::STORAGE_ERROR,
            SchemaError::Config(_) => error_codes::INVALID_COMPATIBILITY_LEVEL,
            SchemaError::Serialization(_) => error_codes::INTERNAL_ERROR,
            SchemaError::Io(_) => error_codes::INTERNAL_ERROR,
            SchemaError::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// Get the HTTP status code
    pub fn http_status(&self) -> u16 {
        match self {
            SchemaError::NotFound(_)
            | SchemaError::SubjectNotFound(_)
            | SchemaError::VersionNotFound { .. }
            | SchemaError::SubjectNotSoftDeleted(_)
            | SchemaError::VersionNotSoftDeleted { .. } => 404,
            SchemaError::InvalidSchema(_)
            | SchemaError::ParseError(_)
            | SchemaError::InvalidInput(_)
            | SchemaError::ReferenceNotFound { .. }
            | SchemaError::ReferenceCycle { .. }
            | SchemaError::ReferenceExists { .. }
            | SchemaError::OperationNotPermitted(_)
            | SchemaError::Config(_) => 422,
            SchemaError::Incompatible(_) => 409,
            SchemaError::Forbidden(_) => 403,
            SchemaError::NotPrimary { .. }
            | SchemaError::PrimaryUnknown
            | SchemaError::PrimaryUnreachable { .. }
            | SchemaError::NotReady(_) => 503,
            SchemaError::Timeout(_) => 504,
            _ => 500,
        }
    }

    /// Check if the operation may succeed when retried
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SchemaError::NotPrimary { .. }
                | SchemaError::PrimaryUnknown
                | SchemaError::PrimaryUnreachable { .. }
                | SchemaError::Timeout(_)
                | SchemaError::NotReady(_)
                | SchemaError::Log(_)
        )
    }

    /// Check if the error means this node must stop serving
    pub fn is_fatal(&self) -> bool {
        matches!(self, SchemaError::LogCorruption { .. })
    }

    /// Primary hint carried by leadership errors
    pub fn primary(&self) -> Option<&str> {
        match self {
            SchemaError::NotPrimary { primary } => primary.as_deref(),
            SchemaError::PrimaryUnreachable { primary, .. } => Some(primary),
            _ => None,
        }
    }

    /// Rebuild an error from its wire code and message.
    ///
    /// Used when a forwarded request fails on the primary; structured
    /// payloads that do not survive the trip collapse into the closest
    /// variant carrying the remote message.
    pub fn from_code(code: u32, message: String) -> Self {
        match code {
            error_codes::SCHEMA_NOT_FOUND => SchemaError::NotFound(message),
            error_codes::SUBJECT_NOT_FOUND => SchemaError::SubjectNotFound(message),
            error_codes::INVALID_SCHEMA => SchemaError::InvalidSchema(message),
            error_codes::OPERATION_NOT_PERMITTED => SchemaError::OperationNotPermitted(message),
            error_codes::FORBIDDEN => SchemaError::Forbidden(message),
            error_codes::NO_PRIMARY => SchemaError::PrimaryUnknown,
            error_codes::NOT_PRIMARY => SchemaError::NotPrimary { primary: None },
            error_codes::OPERATION_TIMEOUT => SchemaError::Timeout(message),
            error_codes::NOT_READY => SchemaError::NotReady(message),
            error_codes::PRIMARY_UNREACHABLE => SchemaError::PrimaryUnreachable {
                primary: String::new(),
                reason: message,
            },
            error_codes::STORAGE_ERROR => SchemaError::Log(message),
            error_codes::INCOMPATIBLE_SCHEMA => SchemaError::Incompatible(Vec::new()),
            error_codes::INVALID_COMPATIBILITY_LEVEL => SchemaError::Config(message),
            _ => SchemaError::Internal(message),
        }
    }
}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

impl From<serde_json::Error> for SchemaError {
    fn from(e: serde_json::Error) -> Self {
        SchemaError::Serialization(e.to_string())
    }
}

impl From<apache_avro::Error> for SchemaError {
    fn from(e: apache_avro::Error) -> Self {
        SchemaError::ParseError(e.to_string())
    }
}
