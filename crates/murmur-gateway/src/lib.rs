pub mod admin;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod presence;
pub mod session;
pub mod store;
pub mod sweep;

pub use config::{GatewayConfig, ReadReceiptPolicy};
pub use presence::{ConnectionHandle, Outbound, PresenceRegistry};
pub use session::SessionGateway;
