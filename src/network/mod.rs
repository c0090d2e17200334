//! Socket transport and per-connection framing.
//!
//! Everything here works on non-blocking sockets driven by a single
//! readiness poller:
//! - `TransportBuffer`: growable read buffer with putback plus a write queue
//! - `ReadStream` / `WriteStream` / `ListenStream`: the handles the server
//!   loop and the hooks use instead of blocking calls
//! - `Connection`: turns buffered bytes into lines or protocol units

pub use connection::{Connection, ConnectionSettings};
pub use encoding::{canonicalize, Encoding};
pub use line::{Extract, Line};
pub use poll::{PollHandle, DEFAULT_EVENTS_CAPACITY};
pub use socket::Socket;
pub use stream::{ListenStream, ReadStream, WriteStream};
pub use transport::{BufferSettings, ByteRead, TransportBuffer, WriteStatus};
pub use unit::{UnitCheck, UnitParser};

mod connection;
mod encoding;
mod line;
mod poll;
mod socket;
mod stream;
mod transport;
mod unit;
