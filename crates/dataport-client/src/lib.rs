//! Service client abstraction for the dataport migration engine.
//!
//! The engine core depends on a small slice of the target service's
//! organization protocol: bulk create/update/upsert/delete, paged
//! retrieval with a paging cookie, attribute metadata, many-to-many
//! association, and an existence probe. [`ServiceClient`] captures
//! exactly that slice; credential acquisition lives outside the core and
//! hands ready clients to the connection pool.
//!
//! [`memory::InMemoryService`] is a complete in-process implementation
//! used by the integration scenarios and usable as a dry-run target.

pub mod fault;
pub mod memory;
pub mod request;

use async_trait::async_trait;
use dataport_core::record::EntityRef;
use std::sync::Arc;
use uuid::Uuid;

pub use fault::{codes, ServiceFault};
pub use request::{
    Association, AttributeMetadata, BulkOperation, BulkOutcome, BulkPayload, BulkRequest,
    BulkResponse, BypassLogic, CallOptions, CloneOptions, EntityAttributes, PageQuery, RecordPage,
};

/// An authenticated client for one organization endpoint.
///
/// Implementations must be safe to share across tasks. The pool clones a
/// cached seed client per source via [`ServiceClient::clone_seed`];
/// clones disable server affinity cookies and the transport's internal
/// retry (the bulk executor owns retry policy).
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// The server-advertised recommended degree of parallelism for the
    /// authenticated user.
    fn recommended_parallelism(&self) -> usize;

    /// Executes a bulk request and returns per-record outcomes.
    ///
    /// The response carries exactly one outcome per input record, in
    /// input order. A protection limit or transport failure is reported
    /// as a [`ServiceFault`] for the whole call.
    async fn execute_bulk(&self, request: &BulkRequest) -> Result<BulkResponse, ServiceFault>;

    /// Retrieves one page of records for an entity.
    async fn retrieve_page(&self, query: &PageQuery) -> Result<RecordPage, ServiceFault>;

    /// Retrieves attribute metadata for an entity.
    async fn entity_attributes(&self, entity: &str) -> Result<EntityAttributes, ServiceFault>;

    /// Retrieves all associations of a many-to-many relationship.
    async fn retrieve_associations(
        &self,
        relationship: &str,
    ) -> Result<Vec<Association>, ServiceFault>;

    /// Creates associations between `record` and `targets` under a
    /// many-to-many relationship. Pre-existing associations are benign.
    async fn associate(
        &self,
        relationship: &str,
        record: &EntityRef,
        targets: &[EntityRef],
    ) -> Result<(), ServiceFault>;

    /// Whether a record exists in the target.
    async fn record_exists(&self, entity: &str, id: Uuid) -> Result<bool, ServiceFault>;

    /// Clones this client for pooled use.
    fn clone_seed(&self, options: &CloneOptions) -> Result<Arc<dyn ServiceClient>, ServiceFault>;
}
