use std::str::FromStr;
use std::time::Duration;

/// When a delivered message counts as read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadReceiptPolicy {
    /// Read as soon as the receiver is reachable at send time.
    #[default]
    OnDelivery,
    /// Read only after the receiver sends `MarkRead`.
    Explicit,
}

impl FromStr for ReadReceiptPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delivery" | "on-delivery" => Ok(Self::OnDelivery),
            "explicit" => Ok(Self::Explicit),
            other => Err(format!("unknown read receipt policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub read_receipts: ReadReceiptPolicy,
    /// Users flagged online whose last_seen is older than this are swept.
    pub idle_threshold: Duration,
    pub sweep_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            read_receipts: ReadReceiptPolicy::default(),
            idle_threshold: Duration::from_secs(10 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}
