//! Request and response shapes for the service protocol.

use bitflags::bitflags;
use dataport_core::record::Record;
use uuid::Uuid;

pub use dataport_core::record::Association;

bitflags! {
    /// Which categories of custom server-side logic a write bypasses.
    ///
    /// Maps to the `BypassBusinessLogicExecution` request parameter as a
    /// comma-joined value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BypassLogic: u8 {
        /// Bypass synchronous custom logic.
        const SYNC = 0b01;
        /// Bypass asynchronous custom logic.
        const ASYNC = 0b10;
        /// Bypass both.
        const ALL = 0b11;
    }
}

impl BypassLogic {
    /// The wire value for the bypass parameter, or `None` when nothing
    /// is bypassed.
    pub fn wire_value(&self) -> Option<&'static str> {
        if self.contains(BypassLogic::ALL) {
            Some("CustomSync,CustomAsync")
        } else if self.contains(BypassLogic::SYNC) {
            Some("CustomSync")
        } else if self.contains(BypassLogic::ASYNC) {
            Some("CustomAsync")
        } else {
            None
        }
    }
}

impl Default for BypassLogic {
    fn default() -> Self {
        BypassLogic::empty()
    }
}

/// Well-known per-request parameters attached to bulk calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    pub bypass_custom_logic: BypassLogic,
    pub bypass_power_automate: bool,
    pub suppress_duplicate_detection: bool,
    /// Free-form tag surfaced in server-side execution context.
    pub tag: Option<String>,
}

impl CallOptions {
    /// Renders the options as protocol parameters.
    pub fn to_parameters(&self) -> Vec<(&'static str, String)> {
        let mut parameters = Vec::new();
        if let Some(value) = self.bypass_custom_logic.wire_value() {
            parameters.push(("BypassBusinessLogicExecution", value.to_string()));
        }
        if self.bypass_power_automate {
            parameters.push(("SuppressCallbackRegistrationExpanderJob", "true".to_string()));
        }
        if self.suppress_duplicate_detection {
            parameters.push(("SuppressDuplicateDetection", "true".to_string()));
        }
        if let Some(tag) = &self.tag {
            parameters.push(("tag", tag.clone()));
        }
        parameters
    }
}

/// The four bulk write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkOperation {
    Create,
    Update,
    Upsert,
    Delete,
}

impl BulkOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOperation::Create => "CreateMultiple",
            BulkOperation::Update => "UpdateMultiple",
            BulkOperation::Upsert => "UpsertMultiple",
            BulkOperation::Delete => "DeleteMultiple",
        }
    }
}

/// The payload of a bulk request: records for writes, identifiers for
/// deletes.
#[derive(Debug, Clone)]
pub enum BulkPayload {
    Records(Vec<Record>),
    Ids(Vec<Uuid>),
}

impl BulkPayload {
    pub fn len(&self) -> usize {
        match self {
            BulkPayload::Records(records) => records.len(),
            BulkPayload::Ids(ids) => ids.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One bulk request against one entity, at most 1000 records.
#[derive(Debug, Clone)]
pub struct BulkRequest {
    pub operation: BulkOperation,
    pub entity: String,
    pub payload: BulkPayload,
    pub options: CallOptions,
}

impl BulkRequest {
    pub fn create(entity: impl Into<String>, records: Vec<Record>, options: CallOptions) -> Self {
        Self {
            operation: BulkOperation::Create,
            entity: entity.into().to_ascii_lowercase(),
            payload: BulkPayload::Records(records),
            options,
        }
    }

    pub fn update(entity: impl Into<String>, records: Vec<Record>, options: CallOptions) -> Self {
        Self {
            operation: BulkOperation::Update,
            entity: entity.into().to_ascii_lowercase(),
            payload: BulkPayload::Records(records),
            options,
        }
    }

    pub fn upsert(entity: impl Into<String>, records: Vec<Record>, options: CallOptions) -> Self {
        Self {
            operation: BulkOperation::Upsert,
            entity: entity.into().to_ascii_lowercase(),
            payload: BulkPayload::Records(records),
            options,
        }
    }

    pub fn delete(entity: impl Into<String>, ids: Vec<Uuid>, options: CallOptions) -> Self {
        Self {
            operation: BulkOperation::Delete,
            entity: entity.into().to_ascii_lowercase(),
            payload: BulkPayload::Ids(ids),
            options,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Per-record outcome of a bulk request.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOutcome {
    /// The write succeeded; `id` is the record's identifier in the target.
    Success { id: Uuid },
    /// The write failed with a server error.
    Failure { code: i32, message: String },
}

impl BulkOutcome {
    pub fn id(&self) -> Option<Uuid> {
        match self {
            BulkOutcome::Success { id } => Some(*id),
            BulkOutcome::Failure { .. } => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BulkOutcome::Success { .. })
    }
}

/// Response to a bulk request: one outcome per input, in input order.
#[derive(Debug, Clone)]
pub struct BulkResponse {
    pub outcomes: Vec<BulkOutcome>,
}

impl BulkResponse {
    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.success_count()
    }
}

/// A paged retrieval request.
#[derive(Debug, Clone)]
pub struct PageQuery {
    pub entity: String,
    pub page_size: usize,
    /// Opaque continuation cookie from the previous page.
    pub cookie: Option<String>,
}

impl PageQuery {
    pub fn first(entity: impl Into<String>, page_size: usize) -> Self {
        Self {
            entity: entity.into().to_ascii_lowercase(),
            page_size,
            cookie: None,
        }
    }

    /// The follow-up query for the next page.
    pub fn next(&self, cookie: String) -> Self {
        Self {
            entity: self.entity.clone(),
            page_size: self.page_size,
            cookie: Some(cookie),
        }
    }
}

/// One page of records.
#[derive(Debug, Clone)]
pub struct RecordPage {
    pub records: Vec<Record>,
    /// Cookie for the next page, present iff `more`.
    pub cookie: Option<String>,
    pub more: bool,
}

/// Metadata for one attribute of a target entity.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeMetadata {
    pub logical_name: String,
    pub valid_for_create: bool,
    pub valid_for_update: bool,
}

impl AttributeMetadata {
    pub fn new(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into().to_ascii_lowercase(),
            valid_for_create: true,
            valid_for_update: true,
        }
    }

    pub fn read_only(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into().to_ascii_lowercase(),
            valid_for_create: false,
            valid_for_update: false,
        }
    }
}

/// Attribute metadata for one entity.
#[derive(Debug, Clone)]
pub struct EntityAttributes {
    pub entity: String,
    pub attributes: Vec<AttributeMetadata>,
}

impl EntityAttributes {
    pub fn attribute(&self, logical_name: &str) -> Option<&AttributeMetadata> {
        let lowered = logical_name.to_ascii_lowercase();
        self.attributes
            .iter()
            .find(|attribute| attribute.logical_name == lowered)
    }
}

/// Settings applied when cloning a seed client for pooled use.
#[derive(Debug, Clone)]
pub struct CloneOptions {
    /// Disable the server-side affinity cookie so pooled clients spread
    /// across service nodes.
    pub disable_affinity_cookie: bool,
    /// Disable the transport library's internal retry; the bulk executor
    /// owns retry policy.
    pub disable_transport_retry: bool,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            disable_affinity_cookie: true,
            disable_transport_retry: true,
        }
    }
}
