//! The schema data model.
//!
//! Entities, fields and relationships are stored in flat vectors with
//! index maps for case-insensitive lookup; nothing in the model holds a
//! reference into another entity, so cyclic schemas are representable
//! without ownership cycles.

use crate::error::SchemaError;
use std::collections::HashMap;

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    Text,
    Integer,
    Decimal,
    Boolean,
    DateTime,
    Identifier,
    /// A plain lookup to another entity.
    Lookup,
    /// A customer-style polymorphic lookup.
    Customer,
    /// An owner lookup.
    Owner,
    /// A parent lookup.
    Parent,
    /// An option-set value.
    Choice,
    Memo,
    /// A blob carried in the archive's attachments tree.
    Blob,
}

impl FieldType {
    /// Parses a declared type string. Accepts the synonyms the archive
    /// vocabulary uses.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "string" | "text" => Some(FieldType::Text),
            "number" | "int" | "integer" | "bigint" => Some(FieldType::Integer),
            "decimal" | "money" | "float" | "double" => Some(FieldType::Decimal),
            "bool" | "boolean" => Some(FieldType::Boolean),
            "datetime" => Some(FieldType::DateTime),
            "guid" | "uniqueidentifier" | "primarykey" => Some(FieldType::Identifier),
            "entityreference" | "lookup" => Some(FieldType::Lookup),
            "customer" => Some(FieldType::Customer),
            "owner" => Some(FieldType::Owner),
            "parent" | "parentcustomer" => Some(FieldType::Parent),
            "optionsetvalue" | "picklist" | "state" | "status" => Some(FieldType::Choice),
            "memo" | "ntext" => Some(FieldType::Memo),
            "image" | "file" => Some(FieldType::Blob),
            _ => None,
        }
    }

    /// The canonical type string used when writing a schema document.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "string",
            FieldType::Integer => "number",
            FieldType::Decimal => "decimal",
            FieldType::Boolean => "bool",
            FieldType::DateTime => "datetime",
            FieldType::Identifier => "guid",
            FieldType::Lookup => "entityreference",
            FieldType::Customer => "customer",
            FieldType::Owner => "owner",
            FieldType::Parent => "parent",
            FieldType::Choice => "optionsetvalue",
            FieldType::Memo => "memo",
            FieldType::Blob => "file",
        }
    }

    /// Whether values of this type reference records of another entity.
    pub fn is_lookup_like(&self) -> bool {
        matches!(
            self,
            FieldType::Lookup | FieldType::Customer | FieldType::Owner | FieldType::Parent
        )
    }
}

/// One field of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// Logical name, lowercased.
    pub logical_name: String,
    pub display_name: Option<String>,
    pub field_type: FieldType,
    /// The referenced entity for lookup-like fields, lowercased.
    pub target_entity: Option<String>,
    pub is_required: bool,
    pub is_custom: bool,
}

impl FieldSchema {
    pub fn new(logical_name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            logical_name: logical_name.into().to_ascii_lowercase(),
            display_name: None,
            field_type,
            target_entity: None,
            is_required: false,
            is_custom: false,
        }
    }

    /// A text field.
    pub fn text(logical_name: impl Into<String>) -> Self {
        Self::new(logical_name, FieldType::Text)
    }

    /// An identifier field.
    pub fn identifier(logical_name: impl Into<String>) -> Self {
        Self::new(logical_name, FieldType::Identifier)
    }

    /// A lookup to `target_entity`.
    pub fn lookup(logical_name: impl Into<String>, target_entity: impl Into<String>) -> Self {
        let mut field = Self::new(logical_name, FieldType::Lookup);
        field.target_entity = Some(target_entity.into().to_ascii_lowercase());
        field
    }

    /// An owner lookup to `target_entity`.
    pub fn owner(logical_name: impl Into<String>, target_entity: impl Into<String>) -> Self {
        let mut field = Self::new(logical_name, FieldType::Owner);
        field.target_entity = Some(target_entity.into().to_ascii_lowercase());
        field
    }

    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn is_lookup_like(&self) -> bool {
        self.field_type.is_lookup_like()
    }
}

/// One relationship declared on an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipSchema {
    /// Relationship schema name, lowercased. Many-to-many relationships
    /// are not directional; both endpoints may declare the same name.
    pub name: String,
    pub entity_a: String,
    pub entity_b: String,
    pub is_many_to_many: bool,
}

impl RelationshipSchema {
    pub fn many_to_many(
        name: impl Into<String>,
        entity_a: impl Into<String>,
        entity_b: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            entity_a: entity_a.into().to_ascii_lowercase(),
            entity_b: entity_b.into().to_ascii_lowercase(),
            is_many_to_many: true,
        }
    }
}

/// One entity of the schema.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub logical_name: String,
    pub display_name: Option<String>,
    pub primary_id_field: String,
    pub primary_name_field: String,
    pub disable_plugins: bool,
    pub fields: Vec<FieldSchema>,
    pub relationships: Vec<RelationshipSchema>,
    field_index: HashMap<String, usize>,
}

impl EntitySchema {
    pub fn new(
        logical_name: impl Into<String>,
        primary_id_field: impl Into<String>,
        primary_name_field: impl Into<String>,
    ) -> Self {
        Self {
            logical_name: logical_name.into().to_ascii_lowercase(),
            display_name: None,
            primary_id_field: primary_id_field.into().to_ascii_lowercase(),
            primary_name_field: primary_name_field.into().to_ascii_lowercase(),
            disable_plugins: false,
            fields: Vec::new(),
            relationships: Vec::new(),
            field_index: HashMap::new(),
        }
    }

    pub fn with_field(mut self, field: FieldSchema) -> Self {
        self.push_field(field);
        self
    }

    pub fn with_relationship(mut self, relationship: RelationshipSchema) -> Self {
        self.relationships.push(relationship);
        self
    }

    pub fn push_field(&mut self, field: FieldSchema) {
        self.field_index
            .insert(field.logical_name.clone(), self.fields.len());
        self.fields.push(field);
    }

    /// Looks up a field by logical name, case-insensitively.
    pub fn field(&self, logical_name: &str) -> Option<&FieldSchema> {
        self.field_index
            .get(&logical_name.to_ascii_lowercase())
            .map(|index| &self.fields[*index])
    }

    /// Fields that reference records of another entity.
    pub fn lookup_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|field| field.is_lookup_like())
    }
}

/// A parsed, validated schema.
#[derive(Debug, Clone)]
pub struct Schema {
    entities: Vec<EntitySchema>,
    index: HashMap<String, usize>,
}

impl Schema {
    /// Builds and validates a schema: entity names unique, lookup-like
    /// fields carry a target entity, many-to-many relationships name
    /// both endpoints, field names unique per entity.
    pub fn new(entities: Vec<EntitySchema>) -> Result<Self, SchemaError> {
        let mut index = HashMap::new();
        for (position, entity) in entities.iter().enumerate() {
            if index.insert(entity.logical_name.clone(), position).is_some() {
                return Err(SchemaError::Semantic(format!(
                    "duplicate entity '{}'",
                    entity.logical_name
                )));
            }
            let mut seen_fields = HashMap::new();
            for field in &entity.fields {
                if seen_fields
                    .insert(field.logical_name.clone(), ())
                    .is_some()
                {
                    return Err(SchemaError::Semantic(format!(
                        "duplicate field '{}' on entity '{}'",
                        field.logical_name, entity.logical_name
                    )));
                }
                if field.is_lookup_like() && field.target_entity.is_none() {
                    return Err(SchemaError::Semantic(format!(
                        "lookup field '{}.{}' has no target entity",
                        entity.logical_name, field.logical_name
                    )));
                }
            }
            for relationship in &entity.relationships {
                if relationship.is_many_to_many
                    && (relationship.entity_a.is_empty() || relationship.entity_b.is_empty())
                {
                    return Err(SchemaError::Semantic(format!(
                        "many-to-many relationship '{}' is missing an endpoint",
                        relationship.name
                    )));
                }
            }
        }
        Ok(Self { entities, index })
    }

    /// Looks up an entity by logical name, case-insensitively.
    pub fn entity(&self, logical_name: &str) -> Option<&EntitySchema> {
        self.index
            .get(&logical_name.to_ascii_lowercase())
            .map(|position| &self.entities[*position])
    }

    pub fn entities(&self) -> &[EntitySchema] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// All many-to-many relationships, deduplicated by name and sorted.
    pub fn many_to_many(&self) -> Vec<&RelationshipSchema> {
        let mut seen = HashMap::new();
        for entity in &self.entities {
            for relationship in &entity.relationships {
                if relationship.is_many_to_many {
                    seen.entry(relationship.name.clone())
                        .or_insert(relationship);
                }
            }
        }
        let mut relationships: Vec<&RelationshipSchema> = seen.into_values().collect();
        relationships.sort_by(|a, b| a.name.cmp(&b.name));
        relationships
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> EntitySchema {
        EntitySchema::new("Account", "accountid", "name")
            .with_field(FieldSchema::identifier("accountid"))
            .with_field(FieldSchema::text("name").required())
            .with_field(FieldSchema::lookup("primarycontactid", "Contact"))
    }

    #[test]
    fn names_are_lowercased() {
        let entity = account();
        assert_eq!(entity.logical_name, "account");
        assert_eq!(
            entity.field("PrimaryContactId").unwrap().target_entity,
            Some("contact".to_string())
        );
    }

    #[test]
    fn schema_lookup_is_case_insensitive() {
        let schema = Schema::new(vec![account()]).unwrap();
        assert!(schema.entity("ACCOUNT").is_some());
        assert!(schema.entity("missing").is_none());
    }

    #[test]
    fn duplicate_entities_rejected() {
        let result = Schema::new(vec![account(), account()]);
        assert!(matches!(result, Err(SchemaError::Semantic(_))));
    }

    #[test]
    fn lookup_without_target_rejected() {
        let mut entity = EntitySchema::new("broken", "id", "name");
        entity.push_field(FieldSchema::new("parentid", FieldType::Lookup));
        let result = Schema::new(vec![entity]);
        assert!(matches!(result, Err(SchemaError::Semantic(_))));
    }

    #[test]
    fn m2m_deduplicates_by_name() {
        let a = EntitySchema::new("account", "accountid", "name").with_relationship(
            RelationshipSchema::many_to_many("account_contacts", "account", "contact"),
        );
        let b = EntitySchema::new("contact", "contactid", "fullname").with_relationship(
            RelationshipSchema::many_to_many("account_contacts", "account", "contact"),
        );
        let schema = Schema::new(vec![a, b]).unwrap();
        assert_eq!(schema.many_to_many().len(), 1);
    }

    #[test]
    fn lookup_like_types() {
        assert!(FieldType::Lookup.is_lookup_like());
        assert!(FieldType::Owner.is_lookup_like());
        assert!(FieldType::Customer.is_lookup_like());
        assert!(FieldType::Parent.is_lookup_like());
        assert!(!FieldType::Text.is_lookup_like());
        assert!(!FieldType::Identifier.is_lookup_like());
    }

    #[test]
    fn field_type_round_trips_through_strings() {
        for field_type in [
            FieldType::Text,
            FieldType::Integer,
            FieldType::Decimal,
            FieldType::Boolean,
            FieldType::DateTime,
            FieldType::Identifier,
            FieldType::Lookup,
            FieldType::Customer,
            FieldType::Owner,
            FieldType::Parent,
            FieldType::Choice,
            FieldType::Memo,
            FieldType::Blob,
        ] {
            assert_eq!(FieldType::parse(field_type.as_str()), Some(field_type));
        }
        assert_eq!(FieldType::parse("virtual"), None);
    }
}
