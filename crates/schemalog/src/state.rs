//! Registry state
//!
//! The aggregate rebuilt from the `_schemas` log: schemas by ID, subjects
//! with their versions, and per-subject and global config and mode.
//!
//! Only [`RegistryState::apply`] mutates it, and only the log reader calls
//! `apply`. A record that breaks an invariant is reported as
//! [`SchemaError::LogCorruption`]; nothing is repaired.
//!
//! Ordered maps keep iteration (and therefore every listing) deterministic,
//! so two replays of the same log compare equal.

use crate::error::{SchemaError, SchemaResult};
use crate::record::Mutation;
use crate::types::{
    CompatibilityLevel, Mode, Schema, SchemaId, SchemaVersion, Subject, SubjectVersion,
};
use std::collections::BTreeMap;
use tracing::debug;

/// One version slot of a subject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionEntry {
    pub id: SchemaId,
    pub deleted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectState {
    versions: BTreeMap<u32, VersionEntry>,
    /// Highest version ever assigned, kept across permanent deletes
    max_version: u32,
    compatibility: Option<CompatibilityLevel>,
    mode: Option<Mode>,
}

impl SubjectState {
    pub fn live_versions(&self) -> impl Iterator<Item = (u32, &VersionEntry)> {
        self.versions
            .iter()
            .filter(|(_, e)| !e.deleted)
            .map(|(v, e)| (*v, e))
    }

    pub fn latest_live(&self) -> Option<u32> {
        self.live_versions().map(|(v, _)| v).last()
    }

    fn has_versions(&self, include_deleted: bool) -> bool {
        if include_deleted {
            !self.versions.is_empty()
        } else {
            self.live_versions().next().is_some()
        }
    }
}

/// Registry state derived from the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryState {
    schemas: BTreeMap<SchemaId, Schema>,
    fingerprints: BTreeMap<String, SchemaId>,
    subjects: BTreeMap<Subject, SubjectState>,
    global_compatibility: Option<CompatibilityLevel>,
    global_mode: Option<Mode>,
    max_schema_id: u32,
    /// Offset of the last record applied
    applied_offset: Option<u64>,
}

fn violation(offset: u64, reason: impl Into<String>) -> SchemaError {
    SchemaError::LogCorruption {
        offset,
        reason: reason.into(),
    }
}

impl RegistryState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one mutation read at `offset`
    pub fn apply(&mut self, offset: u64, mutation: Mutation) -> SchemaResult<()> {
        if let Some(last) = self.applied_offset {
            if offset <= last {
                return Err(violation(
                    offset,
                    format!("record offset {} not after applied offset {}", offset, last),
                ));
            }
        }

        match mutation {
            Mutation::RegisterSchema {
                subject,
                version,
                schema,
                deleted,
            } => self.apply_register(offset, subject, version, schema, deleted)?,
            Mutation::UpdateConfig {
                subject,
                compatibility,
            } => match subject {
                Some(subject) => self.subjects.entry(subject).or_default().compatibility = compatibility,
                None => self.global_compatibility = compatibility,
            },
            Mutation::UpdateMode { subject, mode } => match subject {
                Some(subject) => self.subjects.entry(subject).or_default().mode = mode,
                None => self.global_mode = mode,
            },
            Mutation::DeleteSubject { subject, permanent } => {
                self.apply_delete_subject(offset, &subject, permanent)?
            }
            Mutation::DeleteVersion {
                subject,
                version,
                permanent,
            } => self.apply_delete_version(offset, &subject, version, permanent)?,
        }

        self.applied_offset = Some(offset);
        Ok(())
    }

    fn apply_register(
        &mut self,
        offset: u64,
        subject: Subject,
        version: u32,
        schema: Schema,
        deleted: bool,
    ) -> SchemaResult<()> {
        match self.schemas.get(&schema.id) {
            Some(existing) if existing.fingerprint != schema.fingerprint => {
                return Err(violation(
                    offset,
                    format!("schema id {} re-registered with different content", schema.id),
                ));
            }
            Some(_) => {}
            None => {
                if schema.id.0 <= self.max_schema_id {
                    return Err(violation(
                        offset,
                        format!(
                            "schema id {} not above highest assigned id {}",
                            schema.id, self.max_schema_id
                        ),
                    ));
                }
                if let Some(other) = self.fingerprints.get(&schema.fingerprint) {
                    return Err(violation(
                        offset,
                        format!("schema id {} duplicates content of id {}", schema.id, other),
                    ));
                }
            }
        }

        let current = self.subjects.get(&subject);
        let next_version = current.map_or(0, |s| s.max_version) + 1;
        match current.and_then(|s| s.versions.get(&version)) {
            Some(entry) if entry.id != schema.id => {
                return Err(violation(
                    offset,
                    format!(
                        "{} version {} already bound to schema id {}",
                        subject, version, entry.id
                    ),
                ));
            }
            // Replayed or rewritten record for the same binding
            Some(_) => {}
            None if version != next_version => {
                return Err(violation(
                    offset,
                    format!(
                        "{} version {} out of order (expected {})",
                        subject, version, next_version
                    ),
                ));
            }
            None => {}
        }

        let state = self.subjects.entry(subject.clone()).or_default();
        let entry = state.versions.entry(version).or_insert(VersionEntry {
            id: schema.id,
            deleted,
        });
        entry.deleted = deleted;
        state.max_version = state.max_version.max(version);

        debug!(subject = %subject, version, id = %schema.id, offset, "Applied schema registration");
        self.max_schema_id = self.max_schema_id.max(schema.id.0);
        self.fingerprints
            .entry(schema.fingerprint.clone())
            .or_insert(schema.id);
        self.schemas.entry(schema.id).or_insert(schema);
        Ok(())
    }

    fn apply_delete_subject(&mut self, offset: u64, subject: &Subject, permanent: bool) -> SchemaResult<()> {
        let state = self
            .subjects
            .get_mut(subject)
            .filter(|s| !s.versions.is_empty())
            .ok_or_else(|| violation(offset, format!("delete of unknown subject {}", subject)))?;

        if permanent {
            if state.live_versions().next().is_some() {
                return Err(violation(
                    offset,
                    format!("permanent delete of {} before soft delete", subject),
                ));
            }
            state.versions.clear();
        } else {
            for entry in state.versions.values_mut() {
                entry.deleted = true;
            }
        }
        debug!(subject = %subject, permanent, offset, "Applied subject delete");
        Ok(())
    }

    fn apply_delete_version(
        &mut self,
        offset: u64,
        subject: &Subject,
        version: u32,
        permanent: bool,
    ) -> SchemaResult<()> {
        let state = self
            .subjects
            .get_mut(subject)
            .ok_or_else(|| violation(offset, format!("delete of unknown subject {}", subject)))?;
        let entry = state.versions.get_mut(&version).ok_or_else(|| {
            violation(offset, format!("delete of unknown version {} of {}", version, subject))
        })?;

        if permanent {
            if !entry.deleted {
                return Err(violation(
                    offset,
                    format!("permanent delete of {} version {} before soft delete", subject, version),
                ));
            }
            state.versions.remove(&version);
        } else {
            entry.deleted = true;
        }
        debug!(subject = %subject, version, permanent, offset, "Applied version delete");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub fn applied_offset(&self) -> Option<u64> {
        self.applied_offset
    }

    pub fn max_schema_id(&self) -> u32 {
        self.max_schema_id
    }

    pub fn schema(&self, id: SchemaId) -> Option<&Schema> {
        self.schemas.get(&id)
    }

    pub fn schema_count(&self) -> usize {
        self.schemas.len()
    }

    pub fn schema_by_fingerprint(&self, fingerprint: &str) -> Option<&Schema> {
        self.fingerprints
            .get(fingerprint)
            .and_then(|id| self.schemas.get(id))
    }

    pub fn subject(&self, subject: &Subject) -> Option<&SubjectState> {
        self.subjects.get(subject)
    }

    pub fn subjects(&self, include_deleted: bool) -> Vec<Subject> {
        self.subjects
            .iter()
            .filter(|(_, s)| s.has_versions(include_deleted))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn versions(&self, subject: &Subject, include_deleted: bool) -> SchemaResult<Vec<u32>> {
        let state = self
            .subjects
            .get(subject)
            .filter(|s| s.has_versions(include_deleted))
            .ok_or_else(|| SchemaError::SubjectNotFound(subject.to_string()))?;
        Ok(state
            .versions
            .iter()
            .filter(|(_, e)| include_deleted || !e.deleted)
            .map(|(v, _)| *v)
            .collect())
    }

    /// Next version number for `subject`
    pub fn next_version(&self, subject: &Subject) -> u32 {
        self.subjects
            .get(subject)
            .map(|s| s.max_version + 1)
            .unwrap_or(1)
    }

    /// Resolve a version number, `latest` meaning the highest live version
    pub fn resolve_version(
        &self,
        subject: &Subject,
        version: SchemaVersion,
        include_deleted: bool,
    ) -> SchemaResult<(u32, VersionEntry)> {
        let state = self
            .subjects
            .get(subject)
            .filter(|s| s.has_versions(include_deleted))
            .ok_or_else(|| SchemaError::SubjectNotFound(subject.to_string()))?;
        let not_found = || SchemaError::VersionNotFound {
            subject: subject.to_string(),
            version: version.to_string(),
        };

        if version.is_latest() {
            let latest = state.latest_live().ok_or_else(not_found)?;
            let entry = state.versions.get(&latest).copied().ok_or_else(not_found)?;
            return Ok((latest, entry));
        }
        match state.versions.get(&version.0) {
            Some(entry) if include_deleted || !entry.deleted => Ok((version.0, *entry)),
            _ => Err(not_found()),
        }
    }

    pub fn subject_version(
        &self,
        subject: &Subject,
        version: SchemaVersion,
        include_deleted: bool,
    ) -> SchemaResult<SubjectVersion> {
        let (number, entry) = self.resolve_version(subject, version, include_deleted)?;
        let schema = self
            .schemas
            .get(&entry.id)
            .ok_or_else(|| SchemaError::Internal(format!("schema id {} missing", entry.id)))?;
        Ok(SubjectVersion {
            subject: subject.clone(),
            version: number,
            id: entry.id,
            schema_type: schema.schema_type,
            schema: schema.schema.clone(),
            references: schema.references.clone(),
            deleted: entry.deleted,
        })
    }

    /// Live versions of `subject` with their schemas, ascending
    pub fn live_history(&self, subject: &Subject) -> Vec<(u32, &Schema)> {
        self.subjects
            .get(subject)
            .map(|state| {
                state
                    .live_versions()
                    .filter_map(|(v, e)| self.schemas.get(&e.id).map(|s| (v, s)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Live version of `subject` bound to schema `id`
    pub fn version_with_id(&self, subject: &Subject, id: SchemaId) -> Option<u32> {
        self.subjects
            .get(subject)?
            .live_versions()
            .find(|(_, e)| e.id == id)
            .map(|(v, _)| v)
    }

    pub fn subjects_for_schema(&self, id: SchemaId) -> Vec<(Subject, u32)> {
        self.subjects
            .iter()
            .flat_map(|(name, state)| {
                state
                    .live_versions()
                    .filter(move |(_, e)| e.id == id)
                    .map(move |(v, _)| (name.clone(), v))
            })
            .collect()
    }

    /// Schema IDs of live versions whose references point at `subject`
    /// `version`. With `include_latest`, `latest` references count when
    /// `version` is currently the highest live version.
    pub fn referrers(&self, subject: &Subject, version: u32, include_latest: bool) -> Vec<SchemaId> {
        let is_latest = self
            .subjects
            .get(subject)
            .and_then(SubjectState::latest_live)
            == Some(version);

        let mut ids: Vec<SchemaId> = self
            .subjects
            .values()
            .flat_map(|state| state.live_versions().map(|(_, e)| e.id))
            .filter(|id| {
                self.schemas.get(id).is_some_and(|schema| {
                    schema.references.iter().any(|r| {
                        r.subject == subject.as_str()
                            && (r.version.0 == version
                                || (include_latest && is_latest && r.version.is_latest()))
                    })
                })
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn compatibility(&self, subject: Option<&Subject>) -> Option<CompatibilityLevel> {
        match subject {
            Some(subject) => self.subjects.get(subject).and_then(|s| s.compatibility),
            None => self.global_compatibility,
        }
    }

    /// Subject override, then global, then `default`
    pub fn effective_compatibility(
        &self,
        subject: &Subject,
        default: CompatibilityLevel,
    ) -> CompatibilityLevel {
        self.compatibility(Some(subject))
            .or(self.global_compatibility)
            .unwrap_or(default)
    }

    pub fn mode(&self, subject: Option<&Subject>) -> Option<Mode> {
        match subject {
            Some(subject) => self.subjects.get(subject).and_then(|s| s.mode),
            None => self.global_mode,
        }
    }

    pub fn effective_mode(&self, subject: &Subject) -> Mode {
        self.mode(Some(subject))
            .or(self.global_mode)
            .unwrap_or_default()
    }
}
