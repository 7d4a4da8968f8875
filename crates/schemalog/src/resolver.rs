//! Reference resolution
//!
//! Turns a schema's declared references into linked [`Dependency`] values
//! by looking up each target in [`RegistryState`], linking the target's own
//! references first. `latest` references resolve to the highest live
//! version at the time of resolution.

use crate::error::{SchemaError, SchemaResult};
use crate::model::{Dependency, ParsedSchema};
use crate::state::RegistryState;
use crate::types::{SchemaReference, SchemaType, SchemaVersion, Subject};
use std::collections::HashMap;
use std::sync::Arc;

/// A reference after resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedReference {
    pub name: String,
    pub subject: Subject,
    pub version: u32,
}

/// Resolves references against one consistent state snapshot
pub struct ReferenceResolver<'s> {
    state: &'s RegistryState,
    /// Subject the schema being linked will be registered under
    root: Option<Subject>,
    /// (subject, version) pairs currently being linked, outermost first
    stack: Vec<(Subject, u32)>,
    linked: HashMap<(Subject, u32), Arc<ParsedSchema>>,
}

impl<'s> ReferenceResolver<'s> {
    pub fn new(state: &'s RegistryState) -> Self {
        Self {
            state,
            root: None,
            stack: Vec::new(),
            linked: HashMap::new(),
        }
    }

    /// Resolve on behalf of a registration under `subject`.
    ///
    /// A `latest` reference back to `subject` would make the new version
    /// depend on itself, so it is reported as a cycle.
    pub fn for_subject(mut self, subject: &Subject) -> Self {
        self.root = Some(subject.clone());
        self
    }

    /// Parse `text` and link it against its references
    pub fn link(
        &mut self,
        schema_type: SchemaType,
        text: &str,
        references: &[SchemaReference],
    ) -> SchemaResult<ParsedSchema> {
        let dependencies = self.resolve(references)?;
        ParsedSchema::parse(schema_type, text, &dependencies)
    }

    /// Resolve references to linked dependencies, depth first
    pub fn resolve(&mut self, references: &[SchemaReference]) -> SchemaResult<Vec<Dependency>> {
        let mut dependencies = Vec::with_capacity(references.len());
        for reference in references {
            let target = self.target(reference)?;
            let schema = self.link_target(&target)?;
            dependencies.push(Dependency::new(reference.name.clone(), schema));
        }
        Ok(dependencies)
    }

    /// Pin a reference to a concrete live version
    pub fn target(&self, reference: &SchemaReference) -> SchemaResult<ResolvedReference> {
        let subject = Subject::new(reference.subject.clone());
        let not_found = || SchemaError::ReferenceNotFound {
            name: reference.name.clone(),
            subject: reference.subject.clone(),
            version: reference.version.to_string(),
        };

        if reference.version.is_latest() && self.root.as_ref() == Some(&subject) {
            let mut chain = self.chain();
            chain.push(format!("{}:latest", subject));
            return Err(SchemaError::ReferenceCycle { chain });
        }

        let (version, _) = self
            .state
            .resolve_version(&subject, reference.version, false)
            .map_err(|_| not_found())?;
        Ok(ResolvedReference {
            name: reference.name.clone(),
            subject,
            version,
        })
    }

    fn chain(&self) -> Vec<String> {
        self.root
            .iter()
            .map(|s| format!("{}:new", s))
            .chain(self.stack.iter().map(|(s, v)| format!("{}:{}", s, v)))
            .collect()
    }

    fn link_target(&mut self, target: &ResolvedReference) -> SchemaResult<Arc<ParsedSchema>> {
        let key = (target.subject.clone(), target.version);
        if let Some(schema) = self.linked.get(&key) {
            return Ok(schema.clone());
        }
        if self.stack.contains(&key) {
            let mut chain = self.chain();
            chain.push(format!("{}:{}", target.subject, target.version));
            return Err(SchemaError::ReferenceCycle { chain });
        }

        let registered = self.state.subject_version(
            &target.subject,
            SchemaVersion::new(target.version),
            false,
        )?;

        self.stack.push(key.clone());
        let linked = self.link(
            registered.schema_type,
            &registered.schema,
            &registered.references,
        );
        self.stack.pop();

        let schema = Arc::new(linked?);
        self.linked.insert(key, schema.clone());
        Ok(schema)
    }
}
