use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use murmur_gateway::{GatewayConfig, ReadReceiptPolicy};

/// Used when `RUST_LOG` is unset. Credential disclosures go to the `audit`
/// target and must stay visible by default.
pub const DEFAULT_LOG_FILTER: &str = "murmur=debug,tower_http=debug,audit=info";

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub rename_code: String,
    /// Admin login is disabled when unset.
    pub admin_code: Option<String>,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = var("MURMUR_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("MURMUR_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let host = var("MURMUR_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = var("MURMUR_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("MURMUR_PORT must be a port number")?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let db_path: PathBuf = var("MURMUR_DB_PATH")
            .unwrap_or_else(|| "murmur.db".into())
            .into();

        let rename_code = var("MURMUR_RENAME_CODE").unwrap_or_default();
        if rename_code.is_empty() {
            tracing::warn!("MURMUR_RENAME_CODE is unset; renames will be refused");
        }
        let admin_code = var("MURMUR_ADMIN_CODE").filter(|code| !code.is_empty());

        let mut gateway = GatewayConfig::default();
        if let Some(secs) = var("MURMUR_SWEEP_INTERVAL_SECS") {
            gateway.sweep_interval = parse_secs("MURMUR_SWEEP_INTERVAL_SECS", &secs)?;
        }
        if let Some(secs) = var("MURMUR_IDLE_TIMEOUT_SECS") {
            gateway.idle_threshold = parse_secs("MURMUR_IDLE_TIMEOUT_SECS", &secs)?;
        }
        if let Some(policy) = var("MURMUR_READ_RECEIPTS") {
            gateway.read_receipts = policy
                .parse::<ReadReceiptPolicy>()
                .map_err(anyhow::Error::msg)?;
        }

        Ok(Self {
            addr,
            db_path,
            jwt_secret,
            rename_code,
            admin_code,
            gateway,
        })
    }
}

fn parse_secs(key: &str, raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds", key))?;
    if secs == 0 {
        bail!("{} must be greater than zero", key);
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<ServerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn default_log_filter_keeps_audit_records() {
        use tracing_subscriber::EnvFilter;
        use tracing_subscriber::layer::SubscriberExt;

        let subscriber = tracing_subscriber::registry().with(EnvFilter::new(DEFAULT_LOG_FILTER));
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(target: "audit", tracing::Level::INFO));
            assert!(tracing::enabled!(target: "murmur_gateway::session", tracing::Level::DEBUG));
        });
    }

    #[test]
    fn placeholder_secret_is_rejected() {
        assert!(load(&[]).is_err());
        assert!(load(&[("MURMUR_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("MURMUR_JWT_SECRET", "s3cr3t")]).unwrap();
        assert_eq!(config.addr.port(), 3000);
        assert_eq!(config.db_path, PathBuf::from("murmur.db"));
        assert!(config.admin_code.is_none());
        assert_eq!(config.gateway.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.gateway.idle_threshold, Duration::from_secs(600));
        assert_eq!(config.gateway.read_receipts, ReadReceiptPolicy::OnDelivery);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("MURMUR_JWT_SECRET", "s3cr3t"),
            ("MURMUR_PORT", "8080"),
            ("MURMUR_ADMIN_CODE", "root"),
            ("MURMUR_IDLE_TIMEOUT_SECS", "30"),
            ("MURMUR_READ_RECEIPTS", "explicit"),
        ])
        .unwrap();
        assert_eq!(config.addr.port(), 8080);
        assert_eq!(config.admin_code.as_deref(), Some("root"));
        assert_eq!(config.gateway.idle_threshold, Duration::from_secs(30));
        assert_eq!(config.gateway.read_receipts, ReadReceiptPolicy::Explicit);

        assert!(load(&[("MURMUR_JWT_SECRET", "s3cr3t"), ("MURMUR_SWEEP_INTERVAL_SECS", "0")]).is_err());
    }
}
