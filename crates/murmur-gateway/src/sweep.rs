use chrono::Utc;
use tracing::{info, warn};

use murmur_types::ChatError;
use murmur_types::events::ServerEvent;
use murmur_types::models::UserId;

use crate::session::SessionGateway;
use crate::store::run_blocking;

/// Background task that flips stale online flags to offline.
///
/// Runs every `sweep_interval`. A user is swept when the store still marks them
/// online, their last_seen is older than `idle_threshold`, and the presence
/// registry holds no live connection for them.
pub async fn run_idle_sweep_loop(gateway: SessionGateway) {
    let mut interval = tokio::time::interval(gateway.config().sweep_interval);

    loop {
        interval.tick().await;

        match sweep_idle(&gateway).await {
            Ok(swept) => {
                if !swept.is_empty() {
                    info!("Idle sweep: marked {} users offline", swept.len());
                }
            }
            Err(e) => {
                warn!("Idle sweep error: {}", e);
            }
        }
    }
}

pub async fn sweep_idle(gateway: &SessionGateway) -> Result<Vec<UserId>, ChatError> {
    let threshold = chrono::Duration::from_std(gateway.config().idle_threshold)
        .map_err(|e| ChatError::Storage(anyhow::anyhow!("idle threshold out of range: {}", e)))?;
    let now = Utc::now();
    let cutoff = now - threshold;
    let live = gateway.presence().online_ids().await;

    let swept = run_blocking(gateway.db(), move |db| db.sweep_idle(cutoff, now, &live)).await?;
    for &user_id in &swept {
        gateway.presence().broadcast(ServerEvent::PresenceChanged {
            user_id,
            online: false,
        });
    }
    Ok(swept)
}
