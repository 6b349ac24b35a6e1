pub mod directory;
pub mod network;
pub mod protocol;
pub mod request;
pub mod service;

pub use directory::{PresenceIndex, PresenceStore, UserDirectory};
pub use network::{Client, ConnectionRegistry};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Relay, RelayConfig, RelayHandle,
    Shutdown,
};
