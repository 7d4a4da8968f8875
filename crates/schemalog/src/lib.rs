//! # schemalog
//!
//! A schema registry whose entire state is a replicated, append-only log.
//!
//! ## Features
//!
//! - **Multiple Schema Formats**: Avro, JSON Schema, Protobuf (with imports)
//! - **Schema Evolution**: Forward, backward, full, and transitive compatibility checking
//! - **Schema Fingerprinting**: SHA-256 over the canonical form for deduplication
//! - **Log-Replayed State**: every node rebuilds the same state from the same log
//! - **Single Writer**: one primary appends; followers forward writes to it
//! - **Read-Your-Writes**: a write returns only after this node has applied it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SchemaRegistry                         │
//! │  register / check / delete / config / mode / reads          │
//! ├───────────────────┬─────────────────────┬───────────────────┤
//! │ ReferenceResolver │ CompatibilityChecker│ PrimaryForwarder  │
//! │ (link references) │ (compare by level)  │ (HTTP, in-process)│
//! ├───────────────────┴─────────────────────┼───────────────────┤
//! │ LogReader -> RegistryState (apply)      │ Leadership        │
//! │ readiness, offsets, fail-fast           │ (static, lease)   │
//! ├─────────────────────────────────────────┴───────────────────┤
//! │ CommitLog: MemoryLog, FileLog                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use schemalog::{RegistryConfig, SchemaRegistry, SchemaType};
//!
//! let registry = SchemaRegistry::new(RegistryConfig::memory()).await?;
//!
//! let avro = r#"{"type": "record", "name": "User", "fields": [{"name": "id", "type": "long"}]}"#;
//! let registration = registry.register("user-value", SchemaType::Avro, avro, vec![]).await?;
//!
//! let schema = registry.get_schema_by_id(registration.id).await?;
//! println!("Schema: {}", schema.schema);
//! ```
//!
//! Several nodes can share one log in a process:
//!
//! ```rust,ignore
//! let log: Arc<dyn CommitLog> = Arc::new(MemoryLog::default());
//! let forwarder = Arc::new(LocalForwarder::new());
//!
//! let primary = SchemaRegistry::builder(RegistryConfig::memory())
//!     .log(log.clone())
//!     .leadership(Arc::new(StaticCoordinator::primary(Some("node-a".into()))))
//!     .start()
//!     .await?;
//! let follower = SchemaRegistry::builder(RegistryConfig::memory())
//!     .log(log)
//!     .leadership(Arc::new(StaticCoordinator::follower("node-a")))
//!     .forwarder(forwarder.clone())
//!     .start()
//!     .await?;
//! forwarder.add("node-a", &primary);
//! ```
//!
//! ## Compatibility Modes
//!
//! | Mode | Description |
//! |------|-------------|
//! | `BACKWARD` | Readers of the latest version can read data written with the new schema (default) |
//! | `BACKWARD_TRANSITIVE` | As `BACKWARD`, against every live version |
//! | `FORWARD` | The new schema can read data written with the latest version |
//! | `FORWARD_TRANSITIVE` | As `FORWARD`, against every live version |
//! | `FULL` | Both backward and forward compatible |
//! | `FULL_TRANSITIVE` | Full compatibility with all versions |
//! | `NONE` | No compatibility checking |

pub mod auth;
pub mod compatibility;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod forward;
pub mod leadership;
pub mod log;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod model;
pub mod reader;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod types;

// Re-exports for convenience
pub use auth::{AclAuthorizer, AclEntry, AllowAll, AuthorizedRegistry, Authorizer, Permission};
pub use compatibility::{
    compare, ChangeKind, CompareResult, CompatibilityChecker, CompatibilityLevel,
    ModificationRecord,
};
pub use config::{LeadershipConfig, LogBackend, LogConfig, RegistryConfig, TimeoutConfig};
pub use error::{error_codes, SchemaError, SchemaResult};
pub use fingerprint::SchemaFingerprint;
#[cfg(feature = "http-forward")]
pub use forward::HttpForwarder;
pub use forward::{ForwardRequest, ForwardResponse, LocalForwarder, PrimaryForwarder};
pub use leadership::{
    LeadershipCoordinator, LeaseCoordinator, LeaseStore, MemoryLeaseStore, PrimaryInfo,
    StaticCoordinator,
};
pub use log::{CommitLog, FileLog, LogRecord, MemoryLog};
#[cfg(feature = "metrics")]
pub use metrics::{MetricsConfig, RegistryMetrics};
pub use model::ParsedSchema;
pub use reader::{LogReader, ReaderState};
pub use record::{Mutation, MutationRecord, OperationKind};
pub use registry::{Registration, RegistryBuilder, SchemaRegistry};
pub use resolver::ReferenceResolver;
pub use state::RegistryState;
pub use types::{
    Mode, Schema, SchemaId, SchemaReference, SchemaType, SchemaVersion, Subject, SubjectVersion,
};
