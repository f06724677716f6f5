//! The record and value data model.
//!
//! A [`Record`] is an opaque map from field logical name to a typed
//! [`Value`], plus the record's own identifier. Records are immutable
//! once loaded from an archive; derived records (deferred-field updates,
//! stripped copies) are produced by the cloning helpers.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A typed reference to a record of another entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Target entity logical name, lowercased.
    pub entity: String,
    /// Target record identifier.
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(entity: impl Into<String>, id: Uuid) -> Self {
        Self {
            entity: entity.into().to_ascii_lowercase(),
            id,
        }
    }
}

/// An option-set value: the stored integer plus an optional display label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceValue {
    pub value: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    Id(Uuid),
    Reference(EntityRef),
    Choice(ChoiceValue),
    Memo(String),
    /// A blob carried in the archive's `attachments/` directory,
    /// identified by its relative path.
    Blob(String),
}

impl Value {
    /// The referenced entity and id, when this value is a reference.
    pub fn as_reference(&self) -> Option<&EntityRef> {
        match self {
            Value::Reference(entity_ref) => Some(entity_ref),
            _ => None,
        }
    }
}

/// One side of a many-to-many association set: a record of `entity`
/// and the target records it is associated with under `relationship`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub relationship: String,
    pub entity: String,
    pub id: Uuid,
    pub target_entity: String,
    pub target_ids: Vec<Uuid>,
}

/// One record of one entity.
///
/// Field names are stored lowercased; lookups are case-insensitive by
/// construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: Uuid,
    fields: BTreeMap<String, Value>,
}

impl Record {
    /// Creates an empty record with the given identifier.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// The record's identifier within its entity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Sets a field, returning `self` for chained construction.
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a field.
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into().to_ascii_lowercase(), value);
    }

    /// Gets a field by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&Value> {
        if name.chars().any(|c| c.is_ascii_uppercase()) {
            self.fields.get(&name.to_ascii_lowercase())
        } else {
            self.fields.get(name)
        }
    }

    /// Whether the record carries a field of this name.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterates fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// A copy with the named fields removed.
    ///
    /// Used to null out deferred lookups and target-invalid fields before
    /// the initial write.
    pub fn without_fields<'a, I>(&self, names: I) -> Record
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut copy = self.clone();
        for name in names {
            copy.fields.remove(&name.to_ascii_lowercase());
        }
        copy
    }

    /// A copy keeping only the named fields.
    pub fn only_fields<'a, I>(&self, names: I) -> Record
    where
        I: IntoIterator<Item = &'a str>,
    {
        let keep: std::collections::BTreeSet<String> = names
            .into_iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();
        let mut copy = Record::new(self.id);
        for (name, value) in &self.fields {
            if keep.contains(name) {
                copy.fields.insert(name.clone(), value.clone());
            }
        }
        copy
    }
}
