//! The portable archive layout.
//!
//! An archive is a directory:
//!
//! ```text
//! archive/
//!   data_schema.xml    entities, fields, relationships
//!   data.xml           records and m2m associations
//!   manifest.json      per-entity record counts
//!   attachments/       optional blob tree referenced by record fields
//! ```

use crate::data::{parse_data, DataSet, DataWriter};
use crate::error::{Result, SchemaError};
use crate::model::Schema;
use crate::reader::{parse_schema, schema_to_xml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const SCHEMA_FILE: &str = "data_schema.xml";
const DATA_FILE: &str = "data.xml";
const MANIFEST_FILE: &str = "manifest.json";
const ATTACHMENTS_DIR: &str = "attachments";

/// Per-entity record counts, written with the archive and consumed as
/// optional load estimates by the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub record_counts: BTreeMap<String, u64>,
}

impl Manifest {
    pub fn record(&mut self, entity: impl Into<String>, count: u64) {
        self.record_counts
            .insert(entity.into().to_ascii_lowercase(), count);
    }
}

fn guard_relative(relative: &str) -> Result<()> {
    let path = Path::new(relative);
    if path.is_absolute()
        || path
            .components()
            .any(|component| matches!(component, std::path::Component::ParentDir))
    {
        return Err(SchemaError::Semantic(format!(
            "attachment path '{relative}' must be relative and stay inside the archive"
        )));
    }
    Ok(())
}

/// Writes a portable archive.
pub struct ArchiveWriter {
    root: PathBuf,
}

impl ArchiveWriter {
    /// Creates the archive directory (and parents).
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|error| SchemaError::io(root.display().to_string(), error))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes the schema document.
    pub fn write_schema(&self, schema: &Schema) -> Result<()> {
        let path = self.root.join(SCHEMA_FILE);
        fs::write(&path, schema_to_xml(schema))
            .map_err(|error| SchemaError::io(path.display().to_string(), error))
    }

    /// Opens a streaming writer for the data document.
    pub fn data_writer(&self) -> Result<DataWriter<BufWriter<File>>> {
        let path = self.root.join(DATA_FILE);
        let file =
            File::create(&path).map_err(|error| SchemaError::io(path.display().to_string(), error))?;
        DataWriter::new(BufWriter::new(file))
    }

    /// Writes the manifest.
    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.root.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|error| SchemaError::Semantic(error.to_string()))?;
        fs::write(&path, json).map_err(|error| SchemaError::io(path.display().to_string(), error))
    }

    /// Writes one attachment blob under `attachments/`.
    pub fn write_attachment(&self, relative: &str, bytes: &[u8]) -> Result<()> {
        guard_relative(relative)?;
        let path = self.root.join(ATTACHMENTS_DIR).join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|error| SchemaError::io(parent.display().to_string(), error))?;
        }
        let mut file =
            File::create(&path).map_err(|error| SchemaError::io(path.display().to_string(), error))?;
        file.write_all(bytes)
            .map_err(|error| SchemaError::io(path.display().to_string(), error))
    }
}

/// Reads a portable archive.
pub struct ArchiveReader {
    root: PathBuf,
}

impl ArchiveReader {
    /// Opens an archive directory; the schema document must exist.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let schema_path = root.join(SCHEMA_FILE);
        if !schema_path.is_file() {
            return Err(SchemaError::Semantic(format!(
                "'{}' is not an archive: {SCHEMA_FILE} not found",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads and validates the schema document.
    pub fn read_schema(&self) -> Result<Schema> {
        let path = self.root.join(SCHEMA_FILE);
        let xml =
            fs::read_to_string(&path).map_err(|error| SchemaError::io(path.display().to_string(), error))?;
        parse_schema(&xml)
    }

    /// Reads the data document against `schema`. A missing data file
    /// reads as an empty dataset.
    pub fn read_data(&self, schema: &Schema) -> Result<DataSet> {
        let path = self.root.join(DATA_FILE);
        if !path.is_file() {
            return Ok(DataSet::new());
        }
        let xml =
            fs::read_to_string(&path).map_err(|error| SchemaError::io(path.display().to_string(), error))?;
        parse_data(&xml, schema)
    }

    /// Reads the manifest, if present.
    pub fn read_manifest(&self) -> Result<Option<Manifest>> {
        let path = self.root.join(MANIFEST_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let json =
            fs::read_to_string(&path).map_err(|error| SchemaError::io(path.display().to_string(), error))?;
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|error| SchemaError::Semantic(format!("malformed manifest: {error}")))
    }

    /// Reads one attachment blob.
    pub fn read_attachment(&self, relative: &str) -> Result<Vec<u8>> {
        guard_relative(relative)?;
        let path = self.root.join(ATTACHMENTS_DIR).join(relative);
        fs::read(&path).map_err(|error| SchemaError::io(path.display().to_string(), error))
    }

    /// Whether the archive carries an attachments tree.
    pub fn has_attachments(&self) -> bool {
        self.root.join(ATTACHMENTS_DIR).is_dir()
    }
}
