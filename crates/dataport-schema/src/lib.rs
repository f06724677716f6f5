//! Schema model, XML readers/writers and the portable archive layout.
//!
//! The schema document (`data_schema.xml`) describes entities, fields
//! and relationships; the data document (`data.xml`) carries records
//! and many-to-many associations in the same vocabulary. Both are read
//! with a DOM parser that reports line/column context on violations and
//! written with a streaming writer. The portable archive is a directory
//! holding both documents, a record-count manifest and an optional
//! `attachments/` blob tree. Unknown elements and attributes are
//! ignored for forward compatibility.

pub mod archive;
pub mod data;
pub mod error;
pub mod model;
pub mod reader;

pub use archive::{ArchiveReader, ArchiveWriter, Manifest};
pub use data::{DataSet, DataWriter, EntityData};
pub use error::SchemaError;
pub use model::{EntitySchema, FieldSchema, FieldType, RelationshipSchema, Schema};
pub use reader::{parse_schema, schema_to_xml};
