//! Connection sources: auth-agnostic suppliers of one seed client each.
//!
//! Credential acquisition is out of core scope. Whatever performed it
//! hands the result to the pool as a [`ConnectionSource`]: either an
//! already-authenticated client ([`PreAuthenticatedSource`]) or a
//! connection string plus factory that authenticates lazily on first
//! use ([`ConnectionStringSource`]).

use crate::error::PoolError;
use async_trait::async_trait;
use dataport_client::{ServiceClient, ServiceFault};
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Supplies one authenticated seed client.
///
/// Sources are thread-safe; the pool calls [`seed`] at most once per
/// source per pool instance and caches the result. Sources own their
/// clients and must tolerate repeated disposal.
///
/// [`seed`]: ConnectionSource::seed
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Unique name, used for logging and as the throttle-tracker key.
    fn name(&self) -> &str;

    /// Maximum pooled handles for this source.
    fn max_pool_size(&self) -> usize;

    /// Produces the authenticated, ready seed client.
    async fn seed(&self) -> Result<Arc<dyn ServiceClient>, PoolError>;

    /// Releases owned resources. Called on pool disposal, possibly more
    /// than once.
    fn dispose(&self) {}
}

/// A source wrapping an already-authenticated client.
pub struct PreAuthenticatedSource {
    name: String,
    max_pool_size: usize,
    client: Arc<dyn ServiceClient>,
}

impl PreAuthenticatedSource {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ServiceClient>,
        max_pool_size: usize,
    ) -> Self {
        Self {
            name: name.into(),
            max_pool_size: max_pool_size.max(1),
            client,
        }
    }
}

#[async_trait]
impl ConnectionSource for PreAuthenticatedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    async fn seed(&self) -> Result<Arc<dyn ServiceClient>, PoolError> {
        Ok(Arc::clone(&self.client))
    }
}

/// Factory that authenticates a connection string into a ready client.
pub type SeedFactory = Arc<
    dyn Fn(String) -> BoxFuture<'static, Result<Arc<dyn ServiceClient>, ServiceFault>>
        + Send
        + Sync,
>;

/// A source that authenticates lazily on first use.
pub struct ConnectionStringSource {
    name: String,
    max_pool_size: usize,
    connection_string: String,
    factory: SeedFactory,
    seed: OnceCell<Arc<dyn ServiceClient>>,
}

impl ConnectionStringSource {
    pub fn new(
        name: impl Into<String>,
        connection_string: impl Into<String>,
        max_pool_size: usize,
        factory: SeedFactory,
    ) -> Self {
        Self {
            name: name.into(),
            max_pool_size: max_pool_size.max(1),
            connection_string: connection_string.into(),
            factory,
            seed: OnceCell::new(),
        }
    }
}

#[async_trait]
impl ConnectionSource for ConnectionStringSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    async fn seed(&self) -> Result<Arc<dyn ServiceClient>, PoolError> {
        let client = self
            .seed
            .get_or_try_init(|| async {
                (self.factory)(self.connection_string.clone())
                    .await
                    .map_err(|fault| PoolError::ConnectionFailed {
                        source_name: self.name.clone(),
                        reason: fault.to_string(),
                    })
            })
            .await?;
        Ok(Arc::clone(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dataport_client::memory::InMemoryService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn pre_authenticated_returns_same_seed() {
        let client: Arc<dyn ServiceClient> = Arc::new(InMemoryService::builder().build());
        let source = PreAuthenticatedSource::new("primary", client, 4);
        assert_eq!(source.name(), "primary");
        assert_eq!(source.max_pool_size(), 4);
        let first = source.seed().await.unwrap();
        let second = source.seed().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn connection_string_authenticates_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory: SeedFactory = Arc::new(move |_conn: String| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(InMemoryService::builder().build()) as Arc<dyn ServiceClient>)
            })
        });

        let source = ConnectionStringSource::new("secondary", "Url=https://org", 2, factory);
        source.seed().await.unwrap();
        source.seed().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn factory_failure_maps_to_connection_failed() {
        let factory: SeedFactory = Arc::new(|_conn: String| {
            Box::pin(async { Err(ServiceFault::new(-1, "auth refused")) })
        });
        let source = ConnectionStringSource::new("broken", "Url=https://org", 2, factory);
        let error = match source.seed().await {
            Err(error) => error,
            Ok(_) => panic!("expected seed() to fail"),
        };
        match error {
            PoolError::ConnectionFailed { source_name, reason } => {
                assert_eq!(source_name, "broken");
                assert!(reason.contains("auth refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn pool_size_floor_is_one() {
        let client: Arc<dyn ServiceClient> = Arc::new(InMemoryService::builder().build());
        let source = PreAuthenticatedSource::new("primary", client, 0);
        assert_eq!(source.max_pool_size(), 1);
    }
}
