//! Record data reader and writer.
//!
//! The data document carries per-entity record collections and
//! many-to-many association sets in the schema vocabulary:
//!
//! ```xml
//! <entities>
//!   <entity name="account">
//!     <records>
//!       <record id="c0a8012e-...">
//!         <field name="name" value="Contoso"/>
//!         <field name="primarycontactid" value="5e1f..." lookupentity="contact"/>
//!       </record>
//!     </records>
//!     <m2mrelationships>
//!       <m2mrelationship sourceid="c0a8012e-..." relationshipname="accountleads"
//!                        targetentityname="lead">
//!         <targetid>77aa...</targetid>
//!       </m2mrelationship>
//!     </m2mrelationships>
//!   </entity>
//! </entities>
//! ```
//!
//! Values are typed by the schema on read; fields unknown to the schema
//! are kept as text so newer archives survive older schemas.

use crate::error::{Result, SchemaError};
use crate::model::{EntitySchema, FieldType, Schema};
use chrono::{DateTime, Utc};
use dataport_core::record::{Association, ChoiceValue, EntityRef, Record, Value};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use roxmltree::{Document, Node};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::io::Write;
use std::str::FromStr;
use uuid::Uuid;

/// Records of one entity, in document order.
#[derive(Debug, Clone)]
pub struct EntityData {
    pub name: String,
    pub records: Vec<Record>,
}

/// Parsed contents of a data document.
#[derive(Debug, Clone, Default)]
pub struct DataSet {
    entities: Vec<EntityData>,
    associations: Vec<Association>,
    index: HashMap<String, usize>,
}

impl DataSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entity's records. Replaces any previous collection of
    /// the same name.
    pub fn push_entity(&mut self, name: impl Into<String>, records: Vec<Record>) {
        let name = name.into().to_ascii_lowercase();
        match self.index.get(&name) {
            Some(position) => self.entities[*position].records = records,
            None => {
                self.index.insert(name.clone(), self.entities.len());
                self.entities.push(EntityData { name, records });
            }
        }
    }

    pub fn push_association(&mut self, association: Association) {
        self.associations.push(association);
    }

    pub fn entities(&self) -> &[EntityData] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&EntityData> {
        self.index
            .get(&name.to_ascii_lowercase())
            .map(|position| &self.entities[*position])
    }

    /// Records of `name`, or an empty slice.
    pub fn records(&self, name: &str) -> &[Record] {
        self.entity(name)
            .map(|entity| entity.records.as_slice())
            .unwrap_or(&[])
    }

    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    pub fn total_records(&self) -> usize {
        self.entities.iter().map(|entity| entity.records.len()).sum()
    }
}

fn parse_uuid(raw: &str, context: &str, pos: roxmltree::TextPos) -> Result<Uuid> {
    let trimmed = raw.trim_start_matches('{').trim_end_matches('}');
    Uuid::parse_str(trimmed).map_err(|_| {
        SchemaError::Invalid {
            message: format!("{context}: '{raw}' is not a valid identifier"),
            line: pos.row,
            column: pos.col,
        }
    })
}

fn pos_of(node: Node<'_, '_>) -> roxmltree::TextPos {
    node.document().text_pos_at(node.range().start)
}

/// Parses a data document against `schema`.
pub fn parse_data(xml: &str, schema: &Schema) -> Result<DataSet> {
    let doc = Document::parse(xml).map_err(|error| SchemaError::Xml(error.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "entities" {
        return Err(SchemaError::invalid(
            "expected root element 'entities'",
            pos_of(root),
        ));
    }

    let mut dataset = DataSet::new();
    for entity_node in root.children().filter(|n| n.is_element()) {
        if entity_node.tag_name().name() != "entity" {
            continue;
        }
        let name = entity_node
            .attribute("name")
            .ok_or_else(|| SchemaError::invalid("entity is missing 'name'", pos_of(entity_node)))?;
        let entity_schema = schema.entity(name).ok_or_else(|| {
            SchemaError::invalid(
                format!("data contains entity '{name}' absent from the schema"),
                pos_of(entity_node),
            )
        })?;

        let mut records = Vec::new();
        for section in entity_node.children().filter(|n| n.is_element()) {
            match section.tag_name().name() {
                "records" => {
                    for record_node in section.children().filter(|n| n.is_element()) {
                        if record_node.tag_name().name() != "record" {
                            continue;
                        }
                        records.push(parse_record(record_node, entity_schema)?);
                    }
                }
                "m2mrelationships" => {
                    for assoc_node in section.children().filter(|n| n.is_element()) {
                        if assoc_node.tag_name().name() != "m2mrelationship" {
                            continue;
                        }
                        dataset.push_association(parse_association(assoc_node, name)?);
                    }
                }
                _ => {}
            }
        }
        dataset.push_entity(name, records);
    }
    Ok(dataset)
}

fn parse_record(node: Node<'_, '_>, entity: &EntitySchema) -> Result<Record> {
    let id_raw = node
        .attribute("id")
        .ok_or_else(|| SchemaError::invalid("record is missing 'id'", pos_of(node)))?;
    let id = parse_uuid(id_raw, "record id", pos_of(node))?;
    let mut record = Record::new(id);

    for field_node in node.children().filter(|n| n.is_element()) {
        if field_node.tag_name().name() != "field" {
            continue;
        }
        let name = field_node
            .attribute("name")
            .ok_or_else(|| SchemaError::invalid("field is missing 'name'", pos_of(field_node)))?;
        let raw = field_node
            .attribute("value")
            .ok_or_else(|| {
                SchemaError::invalid(
                    format!("field '{name}' is missing 'value'"),
                    pos_of(field_node),
                )
            })?;
        let value = parse_value(field_node, entity, name, raw)?;
        record.set(name, value);
    }
    Ok(record)
}

fn parse_value(
    node: Node<'_, '_>,
    entity: &EntitySchema,
    name: &str,
    raw: &str,
) -> Result<Value> {
    let pos = pos_of(node);
    let Some(field) = entity.field(name) else {
        // Field unknown to the schema: keep the raw text.
        return Ok(Value::Text(raw.to_string()));
    };

    let value = match field.field_type {
        FieldType::Text => Value::Text(raw.to_string()),
        FieldType::Memo => Value::Memo(raw.to_string()),
        FieldType::Blob => Value::Blob(raw.to_string()),
        FieldType::Integer => Value::Integer(raw.parse::<i64>().map_err(|_| {
            SchemaError::invalid(format!("field '{name}': '{raw}' is not an integer"), pos)
        })?),
        FieldType::Decimal => Value::Decimal(Decimal::from_str(raw).map_err(|_| {
            SchemaError::invalid(format!("field '{name}': '{raw}' is not a decimal"), pos)
        })?),
        FieldType::Boolean => match raw {
            "true" | "True" | "1" => Value::Boolean(true),
            "false" | "False" | "0" => Value::Boolean(false),
            _ => {
                return Err(SchemaError::invalid(
                    format!("field '{name}': '{raw}' is not a boolean"),
                    pos,
                ))
            }
        },
        FieldType::DateTime => {
            let parsed = DateTime::parse_from_rfc3339(raw).map_err(|_| {
                SchemaError::invalid(
                    format!("field '{name}': '{raw}' is not an RFC 3339 timestamp"),
                    pos,
                )
            })?;
            Value::Timestamp(parsed.with_timezone(&Utc))
        }
        FieldType::Identifier => Value::Id(parse_uuid(raw, name, pos)?),
        FieldType::Lookup | FieldType::Customer | FieldType::Owner | FieldType::Parent => {
            let target = node
                .attribute("lookupentity")
                .map(|target| target.to_ascii_lowercase())
                .or_else(|| field.target_entity.clone())
                .ok_or_else(|| {
                    SchemaError::invalid(
                        format!("lookup field '{name}' has no target entity"),
                        pos,
                    )
                })?;
            Value::Reference(EntityRef::new(target, parse_uuid(raw, name, pos)?))
        }
        FieldType::Choice => Value::Choice(ChoiceValue {
            value: raw.parse::<i32>().map_err(|_| {
                SchemaError::invalid(
                    format!("field '{name}': '{raw}' is not an option value"),
                    pos,
                )
            })?,
            label: node.attribute("label").map(str::to_string),
        }),
    };
    Ok(value)
}

fn parse_association(node: Node<'_, '_>, entity: &str) -> Result<Association> {
    let pos = pos_of(node);
    let relationship = node
        .attribute("relationshipname")
        .ok_or_else(|| SchemaError::invalid("m2mrelationship is missing 'relationshipname'", pos))?;
    let source_raw = node
        .attribute("sourceid")
        .ok_or_else(|| SchemaError::invalid("m2mrelationship is missing 'sourceid'", pos))?;
    let target_entity = node
        .attribute("targetentityname")
        .ok_or_else(|| SchemaError::invalid("m2mrelationship is missing 'targetentityname'", pos))?;

    let mut target_ids = Vec::new();
    for target_node in node.children().filter(|n| n.is_element()) {
        if target_node.tag_name().name() != "targetid" {
            continue;
        }
        let text = target_node.text().unwrap_or_default().trim().to_string();
        target_ids.push(parse_uuid(&text, "targetid", pos_of(target_node))?);
    }

    Ok(Association {
        relationship: relationship.to_ascii_lowercase(),
        entity: entity.to_ascii_lowercase(),
        id: parse_uuid(source_raw, "sourceid", pos)?,
        target_entity: target_entity.to_ascii_lowercase(),
        target_ids,
    })
}

fn io_error<E: std::fmt::Display>(error: E) -> SchemaError {
    SchemaError::Xml(error.to_string())
}

/// Streaming writer for the data document.
///
/// Entities are written one at a time; the exporter appends each
/// entity's section as soon as its scan completes.
pub struct DataWriter<W: Write> {
    writer: Writer<W>,
}

impl<W: Write> DataWriter<W> {
    /// Starts the document.
    pub fn new(inner: W) -> Result<Self> {
        let mut writer = Writer::new_with_indent(inner, b' ', 2);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(io_error)?;
        writer
            .write_event(Event::Start(BytesStart::new("entities")))
            .map_err(io_error)?;
        Ok(Self { writer })
    }

    /// Writes one entity section: its records plus the associations
    /// whose source side is this entity.
    pub fn write_entity(
        &mut self,
        name: &str,
        records: &[Record],
        associations: &[Association],
    ) -> Result<()> {
        let mut start = BytesStart::new("entity");
        start.push_attribute(("name", name.to_ascii_lowercase().as_str()));
        self.writer
            .write_event(Event::Start(start))
            .map_err(io_error)?;

        self.writer
            .write_event(Event::Start(BytesStart::new("records")))
            .map_err(io_error)?;
        for record in records {
            self.write_record(record)?;
        }
        self.writer
            .write_event(Event::End(BytesEnd::new("records")))
            .map_err(io_error)?;

        if !associations.is_empty() {
            self.writer
                .write_event(Event::Start(BytesStart::new("m2mrelationships")))
                .map_err(io_error)?;
            for association in associations {
                let mut element = BytesStart::new("m2mrelationship");
                element.push_attribute(("sourceid", association.id.to_string().as_str()));
                element.push_attribute(("relationshipname", association.relationship.as_str()));
                element.push_attribute(("targetentityname", association.target_entity.as_str()));
                self.writer
                    .write_event(Event::Start(element))
                    .map_err(io_error)?;
                for target in &association.target_ids {
                    self.writer
                        .write_event(Event::Start(BytesStart::new("targetid")))
                        .map_err(io_error)?;
                    self.writer
                        .write_event(Event::Text(BytesText::new(&target.to_string())))
                        .map_err(io_error)?;
                    self.writer
                        .write_event(Event::End(BytesEnd::new("targetid")))
                        .map_err(io_error)?;
                }
                self.writer
                    .write_event(Event::End(BytesEnd::new("m2mrelationship")))
                    .map_err(io_error)?;
            }
            self.writer
                .write_event(Event::End(BytesEnd::new("m2mrelationships")))
                .map_err(io_error)?;
        }

        self.writer
            .write_event(Event::End(BytesEnd::new("entity")))
            .map_err(io_error)?;
        Ok(())
    }

    fn write_record(&mut self, record: &Record) -> Result<()> {
        let mut start = BytesStart::new("record");
        start.push_attribute(("id", record.id().to_string().as_str()));
        self.writer
            .write_event(Event::Start(start))
            .map_err(io_error)?;

        for (name, value) in record.fields() {
            let mut element = BytesStart::new("field");
            element.push_attribute(("name", name));
            match value {
                Value::Text(text) | Value::Memo(text) => {
                    element.push_attribute(("value", text.as_str()));
                }
                Value::Blob(path) => element.push_attribute(("value", path.as_str())),
                Value::Integer(number) => {
                    element.push_attribute(("value", number.to_string().as_str()))
                }
                Value::Decimal(decimal) => {
                    element.push_attribute(("value", decimal.to_string().as_str()))
                }
                Value::Boolean(flag) => {
                    element.push_attribute(("value", if *flag { "true" } else { "false" }))
                }
                Value::Timestamp(timestamp) => {
                    element.push_attribute(("value", timestamp.to_rfc3339().as_str()))
                }
                Value::Id(id) => element.push_attribute(("value", id.to_string().as_str())),
                Value::Reference(entity_ref) => {
                    element.push_attribute(("value", entity_ref.id.to_string().as_str()));
                    element.push_attribute(("lookupentity", entity_ref.entity.as_str()));
                }
                Value::Choice(choice) => {
                    element.push_attribute(("value", choice.value.to_string().as_str()));
                    if let Some(label) = &choice.label {
                        element.push_attribute(("label", label.as_str()));
                    }
                }
            }
            self.writer
                .write_event(Event::Empty(element))
                .map_err(io_error)?;
        }

        self.writer
            .write_event(Event::End(BytesEnd::new("record")))
            .map_err(io_error)?;
        Ok(())
    }

    /// Closes the document and returns the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.writer
            .write_event(Event::End(BytesEnd::new("entities")))
            .map_err(io_error)?;
        Ok(self.writer.into_inner())
    }
}

/// Serializes a whole dataset, associations grouped under their source
/// entity.
pub fn dataset_to_xml(dataset: &DataSet) -> Result<String> {
    let mut writer = DataWriter::new(Vec::new())?;
    for entity in dataset.entities() {
        let associations: Vec<Association> = dataset
            .associations()
            .iter()
            .filter(|association| association.entity == entity.name)
            .cloned()
            .collect();
        writer.write_entity(&entity.name, &entity.records, &associations)?;
    }
    let buffer = writer.finish()?;
    String::from_utf8(buffer).map_err(|error| SchemaError::Xml(error.to_string()))
}
