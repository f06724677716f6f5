//! Per-entity map from source record identifiers to target identifiers.
//!
//! Populated by the importer as records are written; read by the
//! deferred-field and many-to-many phases after the entity phase has
//! quiesced. Append-only within a run: the first mapping for a source id
//! wins and later inserts are ignored.

use dashmap::DashMap;
use uuid::Uuid;

/// Concurrent identity map keyed by entity logical name.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entities: DashMap<String, DashMap<Uuid, Uuid>>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `source -> target` for `entity`.
    ///
    /// Returns `true` when the mapping was inserted, `false` when the
    /// source id was already mapped (the existing mapping is kept).
    pub fn insert(&self, entity: &str, source: Uuid, target: Uuid) -> bool {
        let entity_map = self
            .entities
            .entry(entity.to_ascii_lowercase())
            .or_default();
        let inserted = match entity_map.entry(source) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(target);
                true
            }
        };
        inserted
    }

    /// Looks up the target id for `source` in `entity`.
    pub fn resolve(&self, entity: &str, source: Uuid) -> Option<Uuid> {
        let key = entity.to_ascii_lowercase();
        self.entities
            .get(&key)
            .and_then(|entity_map| entity_map.get(&source).map(|target| *target))
    }

    /// Number of mappings recorded for `entity`.
    pub fn len(&self, entity: &str) -> usize {
        self.entities
            .get(&entity.to_ascii_lowercase())
            .map(|entity_map| entity_map.len())
            .unwrap_or(0)
    }

    /// Total mappings across all entities.
    pub fn total_len(&self) -> usize {
        self.entities.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }
}
