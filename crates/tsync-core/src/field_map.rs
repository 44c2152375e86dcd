use std::collections::BTreeMap;

use thiserror::Error;

use crate::{ColumnLayout, FieldValue, Record};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldMapError {
    #[error("field map contains an empty source or target name")]
    EmptyName,
    #[error("source fields `{first}` and `{second}` collide after lower-casing")]
    Collision { first: String, second: String },
}

/// Source field name -> canonical field name, validated once at startup.
///
/// Lookups are case-insensitive: every incoming name is lower-cased before
/// the rename is applied, so the map is stored with lower-case keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldMap {
    renames: BTreeMap<String, String>,
}

impl FieldMap {
    pub fn new<I, K, V>(entries: I) -> Result<Self, FieldMapError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut renames = BTreeMap::new();
        let mut originals: BTreeMap<String, String> = BTreeMap::new();
        for (source, target) in entries {
            let source = source.into();
            let target = target.into();
            let key = source.trim().to_lowercase();
            let target = target.trim().to_string();
            if key.is_empty() || target.is_empty() {
                return Err(FieldMapError::EmptyName);
            }
            if let Some(first) = originals.get(&key) {
                return Err(FieldMapError::Collision {
                    first: first.clone(),
                    second: source,
                });
            }
            originals.insert(key.clone(), source);
            renames.insert(key, target);
        }
        Ok(Self { renames })
    }

    pub fn len(&self) -> usize {
        self.renames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.renames.is_empty()
    }

    /// Canonical name for one incoming field name.
    pub fn canonical_name(&self, name: &str) -> String {
        let lower = name.trim().to_lowercase();
        match self.renames.get(&lower) {
            Some(target) => target.clone(),
            None => lower,
        }
    }

    /// Rename every field of `record` to its canonical name.
    ///
    /// A field that lands on the entity column is dropped: the entity key
    /// stamped by the fetcher is authoritative. When two fields land on the
    /// same canonical name the first non-null one in name order wins. The
    /// operation is idempotent.
    pub fn normalize(&self, record: Record, layout: &ColumnLayout) -> Record {
        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        for (name, value) in record.fields {
            let canonical = self.canonical_name(&name);
            if canonical == layout.entity_column {
                continue;
            }
            match fields.get(&canonical) {
                Some(existing) if !existing.is_null() => {}
                _ => {
                    fields.insert(canonical, value);
                }
            }
        }
        Record {
            entity: record.entity,
            fields,
        }
    }
}
