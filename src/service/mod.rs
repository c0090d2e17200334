pub use app_error::{AppError, AppResult};
pub use config::{
    Framing, NetworkConfig, ProtocolConfig, SchedulerConfig, ServerConfig, ENV_PREFIX,
};
pub use context::ServerContext;
pub use handler::{
    Continuation, Disposition, EventData, LineHandler, LineMode, Mode, ObjectHandler, Resume,
    ServerHooks, UnitMode,
};
pub use server::Server;
pub use shutdown::Shutdown;
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod context;
mod handler;
mod server;
mod shutdown;
mod tracing_config;
