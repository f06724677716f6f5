//! Schema document reader and writer.
//!
//! The schema document shape:
//!
//! ```xml
//! <entities>
//!   <entity name="account" displayname="Account" primaryidfield="accountid"
//!           primarynamefield="name" disableplugins="false">
//!     <fields>
//!       <field name="name" displayname="Account Name" type="string" customfield="false"/>
//!       <field name="primarycontactid" type="entityreference" lookupType="contact"/>
//!     </fields>
//!     <relationships>
//!       <relationship name="accountleads" m2m="true" relatedEntityName="lead"/>
//!     </relationships>
//!   </entity>
//! </entities>
//! ```
//!
//! Unknown elements and attributes are ignored.

use crate::error::{Result, SchemaError};
use crate::model::{EntitySchema, FieldSchema, FieldType, RelationshipSchema, Schema};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use roxmltree::{Document, Node};

fn pos_of(node: Node<'_, '_>) -> roxmltree::TextPos {
    node.document().text_pos_at(node.range().start)
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(raw, Some("true") | Some("True") | Some("1"))
}

/// Parses a schema document.
pub fn parse_schema(xml: &str) -> Result<Schema> {
    let doc = Document::parse(xml).map_err(|error| SchemaError::Xml(error.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "entities" {
        return Err(SchemaError::invalid(
            format!("expected root element 'entities', found '{}'", root.tag_name().name()),
            pos_of(root),
        ));
    }

    let mut entities = Vec::new();
    for node in root.children().filter(|n| n.is_element()) {
        if node.tag_name().name() != "entity" {
            continue;
        }
        entities.push(parse_entity(node)?);
    }

    Schema::new(entities)
}

fn parse_entity(node: Node<'_, '_>) -> Result<EntitySchema> {
    let name = node
        .attribute("name")
        .ok_or_else(|| SchemaError::invalid("entity is missing 'name'", pos_of(node)))?;
    let primary_id = node.attribute("primaryidfield").ok_or_else(|| {
        SchemaError::invalid(
            format!("entity '{name}' is missing 'primaryidfield'"),
            pos_of(node),
        )
    })?;
    let primary_name = node.attribute("primarynamefield").unwrap_or_default();

    let mut entity = EntitySchema::new(name, primary_id, primary_name);
    entity.display_name = node.attribute("displayname").map(str::to_string);
    entity.disable_plugins = parse_bool(node.attribute("disableplugins"));

    for child in node.children().filter(|n| n.is_element()) {
        match child.tag_name().name() {
            "fields" => {
                for field_node in child.children().filter(|n| n.is_element()) {
                    if field_node.tag_name().name() != "field" {
                        continue;
                    }
                    entity.push_field(parse_field(field_node, &entity.logical_name)?);
                }
            }
            "relationships" => {
                for rel_node in child.children().filter(|n| n.is_element()) {
                    if rel_node.tag_name().name() != "relationship" {
                        continue;
                    }
                    entity
                        .relationships
                        .push(parse_relationship(rel_node, &entity.logical_name)?);
                }
            }
            _ => {}
        }
    }
    Ok(entity)
}

fn parse_field(node: Node<'_, '_>, entity: &str) -> Result<FieldSchema> {
    let name = node.attribute("name").ok_or_else(|| {
        SchemaError::invalid(format!("field on '{entity}' is missing 'name'"), pos_of(node))
    })?;
    let raw_type = node.attribute("type").ok_or_else(|| {
        SchemaError::invalid(
            format!("field '{entity}.{name}' has no declared type"),
            pos_of(node),
        )
    })?;
    let field_type = FieldType::parse(raw_type).ok_or_else(|| {
        SchemaError::invalid(
            format!("field '{entity}.{name}' has unknown type '{raw_type}'"),
            pos_of(node),
        )
    })?;

    let mut field = FieldSchema::new(name, field_type);
    field.display_name = node.attribute("displayname").map(str::to_string);
    field.is_custom = parse_bool(node.attribute("customfield"));
    field.is_required = parse_bool(node.attribute("required"));
    field.target_entity = node
        .attribute("lookupType")
        .map(|target| target.to_ascii_lowercase());

    if field.is_lookup_like() && field.target_entity.is_none() {
        return Err(SchemaError::invalid(
            format!("lookup field '{entity}.{name}' is missing 'lookupType'"),
            pos_of(node),
        ));
    }
    Ok(field)
}

fn parse_relationship(node: Node<'_, '_>, entity: &str) -> Result<RelationshipSchema> {
    let name = node.attribute("name").ok_or_else(|| {
        SchemaError::invalid(
            format!("relationship on '{entity}' is missing 'name'"),
            pos_of(node),
        )
    })?;
    let is_m2m = parse_bool(node.attribute("m2m"));
    let related = node.attribute("relatedEntityName").unwrap_or_default();
    if is_m2m && related.is_empty() {
        return Err(SchemaError::invalid(
            format!("many-to-many relationship '{name}' is missing 'relatedEntityName'"),
            pos_of(node),
        ));
    }
    Ok(RelationshipSchema {
        name: name.to_ascii_lowercase(),
        entity_a: entity.to_ascii_lowercase(),
        entity_b: related.to_ascii_lowercase(),
        is_many_to_many: is_m2m,
    })
}

/// Serializes a schema to the document shape read by [`parse_schema`].
pub fn schema_to_xml(schema: &Schema) -> String {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .expect("write to vec");
    writer
        .write_event(Event::Start(BytesStart::new("entities")))
        .expect("write to vec");

    for entity in schema.entities() {
        let mut start = BytesStart::new("entity");
        start.push_attribute(("name", entity.logical_name.as_str()));
        if let Some(display) = &entity.display_name {
            start.push_attribute(("displayname", display.as_str()));
        }
        start.push_attribute(("primaryidfield", entity.primary_id_field.as_str()));
        start.push_attribute(("primarynamefield", entity.primary_name_field.as_str()));
        start.push_attribute((
            "disableplugins",
            if entity.disable_plugins { "true" } else { "false" },
        ));
        writer.write_event(Event::Start(start)).expect("write to vec");

        writer
            .write_event(Event::Start(BytesStart::new("fields")))
            .expect("write to vec");
        for field in &entity.fields {
            let mut element = BytesStart::new("field");
            element.push_attribute(("name", field.logical_name.as_str()));
            if let Some(display) = &field.display_name {
                element.push_attribute(("displayname", display.as_str()));
            }
            element.push_attribute(("type", field.field_type.as_str()));
            if let Some(target) = &field.target_entity {
                element.push_attribute(("lookupType", target.as_str()));
            }
            if field.is_custom {
                element.push_attribute(("customfield", "true"));
            }
            if field.is_required {
                element.push_attribute(("required", "true"));
            }
            writer.write_event(Event::Empty(element)).expect("write to vec");
        }
        writer
            .write_event(Event::End(BytesEnd::new("fields")))
            .expect("write to vec");

        if !entity.relationships.is_empty() {
            writer
                .write_event(Event::Start(BytesStart::new("relationships")))
                .expect("write to vec");
            for relationship in &entity.relationships {
                let mut element = BytesStart::new("relationship");
                element.push_attribute(("name", relationship.name.as_str()));
                element.push_attribute((
                    "m2m",
                    if relationship.is_many_to_many {
                        "true"
                    } else {
                        "false"
                    },
                ));
                element.push_attribute(("relatedEntityName", relationship.entity_b.as_str()));
                writer.write_event(Event::Empty(element)).expect("write to vec");
            }
            writer
                .write_event(Event::End(BytesEnd::new("relationships")))
                .expect("write to vec");
        }

        writer
            .write_event(Event::End(BytesEnd::new("entity")))
            .expect("write to vec");
    }

    writer
        .write_event(Event::End(BytesEnd::new("entities")))
        .expect("write to vec");
    String::from_utf8(writer.into_inner()).expect("utf-8 xml")
}
