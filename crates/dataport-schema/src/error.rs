//! Schema and archive errors.

use dataport_core::error::MigrationError;

/// Errors from parsing, serializing or archive I/O.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The document is not well-formed XML.
    #[error("malformed xml: {0}")]
    Xml(String),

    /// The document is well-formed but violates the schema shape.
    #[error("{message} (line {line}, column {column})")]
    Invalid {
        message: String,
        line: u32,
        column: u32,
    },

    /// A semantic violation with no single document position.
    #[error("invalid schema: {0}")]
    Semantic(String),

    /// Archive file I/O failed.
    #[error("archive i/o on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl SchemaError {
    pub(crate) fn invalid(message: impl Into<String>, pos: roxmltree::TextPos) -> Self {
        SchemaError::Invalid {
            message: message.into(),
            line: pos.row,
            column: pos.col,
        }
    }

    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        SchemaError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<SchemaError> for MigrationError {
    fn from(error: SchemaError) -> Self {
        MigrationError::Validation(error.to_string())
    }
}

/// Result type for schema operations.
pub type Result<T> = std::result::Result<T, SchemaError>;
