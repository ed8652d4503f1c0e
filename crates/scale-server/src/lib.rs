pub mod client;
pub mod registry;
pub mod relay;
pub mod server;

pub use registry::{BroadcastReport, ConnectionRegistry, ConnectionState, Frame, SendError};
pub use relay::{FlushPolicy, Inbound, Relay, RelayConfig, RelayEvent, RelayStats};
pub use server::{shutdown_signal, start, ServerConfig, ServerHandle};
