pub mod auth;
pub mod host;
pub mod log;
pub mod session;
pub mod tunnel;

// Re-export main types
pub use auth::{AuthMethod, Credentials};
pub use host::{ConnectTarget, HostConfig, HostId};
pub use log::{ConnectionEvent, ConnectionLog, LogLevel};
pub use session::{format_bytes, ConnectionStatus, SessionRecord};
pub use tunnel::{TunnelRule, TunnelStatus};
