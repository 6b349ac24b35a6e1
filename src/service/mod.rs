pub use app_error::{AppError, AppResult, FrameError};
pub use config::{GeneralConfig, NetworkConfig, RelayConfig, RouterConfig, TracingConfig};
pub use relay::{Relay, RelayHandle};
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod relay;
mod shutdown;
mod tracing_config;
