//! Startup orchestration.

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{StoreBackend, StoreConfig};
use crate::store::{AtomicStore, MemoryStore, RedisStore, RedisStoreConfig, StoreResult};

/// Open the configured store backend.
///
/// # Errors
/// Redis connection failures are returned so startup can abort.
pub async fn connect_store(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> StoreResult<Arc<dyn AtomicStore>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; limits are not shared between instances");
            Ok(Arc::new(MemoryStore::new(clock)))
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(RedisStoreConfig {
                url: config.url.clone(),
                connect_timeout: config.connect_timeout(),
            })
            .await?;
            Ok(Arc::new(store))
        }
    }
}
