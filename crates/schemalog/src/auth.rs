//! Capability checks
//!
//! Permissions are checked at the subject level:
//! - `Read` - get schemas, list subjects and versions, check compatibility
//! - `Write` - register, delete, change config and mode (implies `Read`)
//!
//! Global config and mode belong to the [`Resource::Global`] scope, which
//! only unrestricted grants cover.
//!
//! ```rust,ignore
//! use schemalog::auth::{AclAuthorizer, AclEntry, Permission};
//!
//! let acl = AclAuthorizer::new(vec![
//!     AclEntry::all("admin", Permission::Write),
//!     AclEntry::subjects("billing", Permission::Write, "^billing-.*")?,
//!     AclEntry::subjects("*", Permission::Read, ".*")?,
//! ]);
//! let registry = SchemaRegistry::builder(config).authorizer(Arc::new(acl)).start().await?;
//! registry.as_principal("billing").register("billing-value", SchemaType::Avro, text, vec![]).await?;
//! ```

use crate::compatibility::CompareResult;
use crate::error::{SchemaError, SchemaResult};
use crate::registry::{Registration, SchemaRegistry};
use crate::types::{
    CompatibilityLevel, Mode, Schema, SchemaId, SchemaReference, SchemaType, SchemaVersion,
    Subject, SubjectVersion,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Capability required by an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

impl Permission {
    /// Whether holding `self` grants `required`
    pub fn grants(self, required: Permission) -> bool {
        self == Permission::Write || required == Permission::Read
    }
}

/// What an operation acts on
#[derive(Debug, Clone, Copy)]
pub enum Resource<'a> {
    Subject(&'a Subject),
    /// Registry-wide config and mode
    Global,
}

impl std::fmt::Display for Resource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Subject(subject) => write!(f, "subject '{}'", subject),
            Resource::Global => write!(f, "global scope"),
        }
    }
}

/// Decides whether a principal may perform an operation
pub trait Authorizer: Send + Sync {
    fn authorize(&self, principal: &str, permission: Permission, resource: Resource<'_>) -> bool;
}

/// Grants everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _principal: &str, _permission: Permission, _resource: Resource<'_>) -> bool {
        true
    }
}

/// Subjects an ACL entry covers
#[derive(Debug, Clone)]
pub enum AclScope {
    /// Every subject and the global scope
    All,
    /// Subjects whose name matches
    Subjects(Regex),
}

/// One grant: `principal` holds `permission` on `scope`
#[derive(Debug, Clone)]
pub struct AclEntry {
    /// Principal name, `*` for anyone
    pub principal: String,
    pub permission: Permission,
    pub scope: AclScope,
}

impl AclEntry {
    /// Grant on every subject and the global scope
    pub fn all(principal: impl Into<String>, permission: Permission) -> Self {
        Self {
            principal: principal.into(),
            permission,
            scope: AclScope::All,
        }
    }

    /// Grant on subjects matching `pattern`
    pub fn subjects(
        principal: impl Into<String>,
        permission: Permission,
        pattern: &str,
    ) -> SchemaResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| SchemaError::Config(format!("invalid subject pattern '{}': {}", pattern, e)))?;
        Ok(Self {
            principal: principal.into(),
            permission,
            scope: AclScope::Subjects(regex),
        })
    }

    fn matches(&self, principal: &str, permission: Permission, resource: Resource<'_>) -> bool {
        if self.principal != "*" && self.principal != principal {
            return false;
        }
        if !self.permission.grants(permission) {
            return false;
        }
        match (&self.scope, resource) {
            (AclScope::All, _) => true,
            (AclScope::Subjects(regex), Resource::Subject(subject)) => regex.is_match(subject.as_str()),
            (AclScope::Subjects(_), Resource::Global) => false,
        }
    }
}

/// Allow-list of grants; anything not granted is denied
#[derive(Debug, Default, Clone)]
pub struct AclAuthorizer {
    entries: Vec<AclEntry>,
}

impl AclAuthorizer {
    pub fn new(entries: Vec<AclEntry>) -> Self {
        Self { entries }
    }

    pub fn add(&mut self, entry: AclEntry) {
        self.entries.push(entry);
    }
}

impl Authorizer for AclAuthorizer {
    fn authorize(&self, principal: &str, permission: Permission, resource: Resource<'_>) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.matches(principal, permission, resource))
    }
}

/// Registry operations on behalf of a principal
///
/// Obtained from [`SchemaRegistry::as_principal`].
pub struct AuthorizedRegistry<'a> {
    registry: &'a SchemaRegistry,
    authorizer: &'a dyn Authorizer,
    principal: String,
}

impl<'a> AuthorizedRegistry<'a> {
    pub(crate) fn new(
        registry: &'a SchemaRegistry,
        authorizer: &'a dyn Authorizer,
        principal: String,
    ) -> Self {
        Self {
            registry,
            authorizer,
            principal,
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    fn allowed(&self, permission: Permission, resource: Resource<'_>) -> bool {
        self.authorizer
            .authorize(&self.principal, permission, resource)
    }

    fn require(&self, permission: Permission, resource: Resource<'_>) -> SchemaResult<()> {
        if self.allowed(permission, resource) {
            Ok(())
        } else {
            debug!(principal = %self.principal, ?permission, %resource, "Access denied");
            Err(SchemaError::Forbidden(format!(
                "{} lacks {:?} permission on {}",
                self.principal, permission, resource
            )))
        }
    }

    fn scope(subject: Option<&Subject>) -> Resource<'_> {
        subject.map_or(Resource::Global, Resource::Subject)
    }

    pub async fn register(
        &self,
        subject: impl Into<Subject>,
        schema_type: SchemaType,
        schema: &str,
        references: Vec<SchemaReference>,
    ) -> SchemaResult<Registration> {
        let subject = subject.into();
        self.require(Permission::Write, Resource::Subject(&subject))?;
        self.registry
            .register(subject, schema_type, schema, references)
            .await
    }

    pub async fn check_compatibility(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
        schema_type: SchemaType,
        schema: &str,
        references: Vec<SchemaReference>,
    ) -> SchemaResult<Vec<CompareResult>> {
        let subject = subject.into();
        self.require(Permission::Read, Resource::Subject(&subject))?;
        self.registry
            .check_compatibility(subject, version, schema_type, schema, references)
            .await
    }

    pub async fn delete_version(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
        permanent: bool,
    ) -> SchemaResult<u32> {
        let subject = subject.into();
        self.require(Permission::Write, Resource::Subject(&subject))?;
        self.registry.delete_version(subject, version, permanent).await
    }

    pub async fn delete_subject(
        &self,
        subject: impl Into<Subject>,
        permanent: bool,
    ) -> SchemaResult<Vec<u32>> {
        let subject = subject.into();
        self.require(Permission::Write, Resource::Subject(&subject))?;
        self.registry.delete_subject(subject, permanent).await
    }

    pub async fn get_config(&self, subject: Option<&Subject>) -> SchemaResult<CompatibilityLevel> {
        self.require(Permission::Read, Self::scope(subject))?;
        self.registry.get_config(subject).await
    }

    pub async fn set_config(
        &self,
        subject: Option<Subject>,
        level: CompatibilityLevel,
    ) -> SchemaResult<CompatibilityLevel> {
        self.require(Permission::Write, Self::scope(subject.as_ref()))?;
        self.registry.set_config(subject, level).await
    }

    pub async fn delete_config(
        &self,
        subject: impl Into<Subject>,
    ) -> SchemaResult<Option<CompatibilityLevel>> {
        let subject = subject.into();
        self.require(Permission::Write, Resource::Subject(&subject))?;
        self.registry.delete_config(subject).await
    }

    pub async fn get_mode(&self, subject: Option<&Subject>) -> SchemaResult<Mode> {
        self.require(Permission::Read, Self::scope(subject))?;
        self.registry.get_mode(subject).await
    }

    pub async fn set_mode(&self, subject: Option<Subject>, mode: Mode) -> SchemaResult<Mode> {
        self.require(Permission::Write, Self::scope(subject.as_ref()))?;
        self.registry.set_mode(subject, mode).await
    }

    /// Subjects the principal can read
    pub async fn list_subjects(&self, include_deleted: bool) -> SchemaResult<Vec<Subject>> {
        let subjects = self.registry.list_subjects(include_deleted).await?;
        Ok(subjects
            .into_iter()
            .filter(|s| self.allowed(Permission::Read, Resource::Subject(s)))
            .collect())
    }

    pub async fn list_versions(
        &self,
        subject: impl Into<Subject>,
        include_deleted: bool,
    ) -> SchemaResult<Vec<u32>> {
        let subject = subject.into();
        self.require(Permission::Read, Resource::Subject(&subject))?;
        self.registry.list_versions(subject, include_deleted).await
    }

    /// Schema by id, hidden unless a readable subject uses it
    pub async fn get_schema_by_id(&self, id: SchemaId) -> SchemaResult<Schema> {
        if !self.allowed(Permission::Read, Resource::Global) {
            let readable = self
                .registry
                .subjects_for_schema(id)
                .await?
                .iter()
                .any(|(subject, _)| self.allowed(Permission::Read, Resource::Subject(subject)));
            if !readable {
                return Err(SchemaError::NotFound(format!("schema id {}", id)));
            }
        }
        self.registry.get_schema_by_id(id).await
    }

    pub async fn get_version(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
    ) -> SchemaResult<SubjectVersion> {
        let subject = subject.into();
        self.require(Permission::Read, Resource::Subject(&subject))?;
        self.registry.get_version(subject, version).await
    }

    pub async fn lookup(
        &self,
        subject: impl Into<Subject>,
        schema_type: SchemaType,
        schema: &str,
        references: Vec<SchemaReference>,
    ) -> SchemaResult<SubjectVersion> {
        let subject = subject.into();
        self.require(Permission::Read, Resource::Subject(&subject))?;
        self.registry
            .lookup(subject, schema_type, schema, references)
            .await
    }

    /// Readable subject/version pairs bound to `id`
    pub async fn subjects_for_schema(&self, id: SchemaId) -> SchemaResult<Vec<(Subject, u32)>> {
        let bindings = self.registry.subjects_for_schema(id).await?;
        Ok(bindings
            .into_iter()
            .filter(|(subject, _)| self.allowed(Permission::Read, Resource::Subject(subject)))
            .collect())
    }

    pub async fn referenced_by(
        &self,
        subject: impl Into<Subject>,
        version: SchemaVersion,
    ) -> SchemaResult<Vec<SchemaId>> {
        let subject = subject.into();
        self.require(Permission::Read, Resource::Subject(&subject))?;
        self.registry.referenced_by(subject, version).await
    }
}
