//! Namespace conflict resolution and reverse routing.
//!
//! Pure algorithm: given the union of named items aggregated across
//! backends, disambiguate colliding names with a `backend:name` prefix and
//! build the name→backend index used for routing. Nothing here touches
//! connections or sessions.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TychoError};

/// Separator between a backend prefix and the original name.
pub const NAMESPACE_SEPARATOR: char = ':';

/// What kind of listed item an entry describes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntryKind {
    Tool,
    Resource,
}

/// One named item from one backend's listing. Recomputed per aggregation,
/// never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub name: String,
    pub kind: EntryKind,
    pub origin: String,
}

impl NamespaceEntry {
    pub fn new(name: impl Into<String>, kind: EntryKind, origin: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            origin: origin.into(),
        }
    }
}

/// Outcome of one conflict-resolution pass over an aggregated listing.
#[derive(Debug, Clone, Default)]
pub struct ResolvedNamespace {
    entries: Vec<NamespaceEntry>,
    index: HashMap<String, String>,
    origins: HashSet<String>,
    conflicts: HashMap<String, usize>,
}

impl ResolvedNamespace {
    /// Disambiguate an aggregated listing.
    ///
    /// Names occurring exactly once pass through unmodified. Names
    /// occurring more than once are rewritten to `origin:name` for every
    /// colliding item. Only raw names are inspected for collisions: if two
    /// entries would publish the same name only *after* prefixing (or the
    /// identical backend lists the identical name twice), that is a
    /// detected conflict, never a silent overwrite.
    pub fn resolve(entries: Vec<NamespaceEntry>) -> Result<Self> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for entry in &entries {
            *counts.entry(entry.name.as_str()).or_default() += 1;
        }

        let mut resolved = Self::default();
        for entry in &entries {
            let occurrences = counts.get(entry.name.as_str()).copied().unwrap_or(0);
            let published = if occurrences > 1 {
                resolved
                    .conflicts
                    .insert(entry.name.clone(), occurrences);
                let prefixed =
                    format!("{}{}{}", entry.origin, NAMESPACE_SEPARATOR, entry.name);
                tracing::debug!(
                    raw = %entry.name,
                    published = %prefixed,
                    "applied namespace prefix"
                );
                prefixed
            } else {
                entry.name.clone()
            };

            if resolved
                .index
                .insert(published.clone(), entry.origin.clone())
                .is_some()
            {
                return Err(TychoError::NamespaceConflict(published));
            }
            resolved.origins.insert(entry.origin.clone());
            resolved.entries.push(NamespaceEntry {
                name: published,
                kind: entry.kind,
                origin: entry.origin.clone(),
            });
        }

        Ok(resolved)
    }

    /// Published entries, in input order.
    pub fn entries(&self) -> &[NamespaceEntry] {
        &self.entries
    }

    /// Raw colliding names and their occurrence counts.
    pub fn conflicts(&self) -> &HashMap<String, usize> {
        &self.conflicts
    }

    /// Number of published name→backend mappings.
    pub fn mapping_count(&self) -> usize {
        self.index.len()
    }

    /// Resolve which backend owns a published name.
    ///
    /// A prefixed name resolves by its prefix in constant time regardless
    /// of backend count; an unprefixed name resolves through the index
    /// built from the most recent successful aggregation. No entry means
    /// a routing error — there is no default-backend guess.
    pub fn resolve_server(&self, name: &str) -> Result<String> {
        if let Some(origin) = self.index.get(name) {
            return Ok(origin.clone());
        }
        if let Some((prefix, _)) = name.split_once(NAMESPACE_SEPARATOR) {
            if self.origins.contains(prefix) {
                return Ok(prefix.to_string());
            }
        }
        Err(TychoError::Routing(name.to_string()))
    }
}
