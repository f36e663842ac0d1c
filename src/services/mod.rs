// Services module
pub mod config_service;
pub mod credentials;
pub mod exec_service;
pub mod log_service;
pub mod log_tailer;
pub mod memory_transport;
pub mod reconnect;
pub mod session;
pub mod session_registry;
pub mod ssh_service;
pub mod transport;
pub mod tunnel_service;

pub use config_service::{AppSettings, ConfigService, HostConfigStore, MemoryConfigStore};
pub use credentials::{CredentialProvider, StaticCredentials};
pub use exec_service::{
    CancelHandle, Completion, ExecEvent, ExecRequest, ExecStream, LineSink, OutputLine,
    OutputStream, StreamExecutor,
};
pub use log_service::LogService;
pub use log_tailer::LogTailer;
pub use reconnect::{ReconnectCoordinator, ReconnectOutcome, ReconnectPolicy};
pub use session::{Session, SessionEvent, SessionSettings};
pub use session_registry::SessionRegistry;
pub use tunnel_service::TunnelSet;
