mod network;
mod service;
mod utils;

pub use network::{
    canonicalize, BufferSettings, ByteRead, Connection, ConnectionSettings, Encoding, Extract,
    Line, ListenStream, PollHandle, ReadStream, Socket, TransportBuffer, UnitCheck, UnitParser,
    WriteStatus, WriteStream,
};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, Continuation, Disposition,
    EventData, Framing, LineHandler, LineMode, Mode, NetworkConfig, ObjectHandler,
    ProtocolConfig, Resume, SchedulerConfig, Server, ServerConfig, ServerContext, ServerHooks,
    Shutdown, TracingGuard, UnitMode, ENV_PREFIX,
};
pub use utils::{Event, EventId, EventScheduler, When};
