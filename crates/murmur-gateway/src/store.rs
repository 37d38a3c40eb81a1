use std::sync::Arc;

use murmur_db::Database;
use murmur_types::ChatError;
use tracing::error;

/// Run a store operation on the blocking pool, mapping every failure to
/// `ChatError::Storage`.
pub async fn run_blocking<F, T>(db: &Arc<Database>, f: F) -> Result<T, ChatError>
where
    F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || f(&db))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ChatError::Storage(anyhow::anyhow!("storage task failed: {}", e))
        })?
        .map_err(|e| {
            error!("Storage error: {:#}", e);
            ChatError::Storage(e)
        })
}
