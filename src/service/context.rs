use std::net::SocketAddr;
use std::time::Duration;

use mio::net::TcpStream;
use tracing::debug;

use super::{ServerConfig, Shutdown};
use crate::network::{
    Connection, ConnectionSettings, ListenStream, PollHandle, ReadStream, WriteStream,
};
use crate::utils::{EventId, EventScheduler, When};

/// Server state visible to hooks: the connection table, the listener and
/// the event scheduler.
///
/// Teardown requested from inside a hook is deferred until the hook
/// returns, so a slot never changes hands in the middle of a dispatch.
pub struct ServerContext<E> {
    pub(super) config: ServerConfig,
    pub(super) settings: ConnectionSettings,
    pub(super) connections: Vec<Option<Connection>>,
    pub(super) num_connections: usize,
    pub(super) current: Option<usize>,
    pub(super) listener: Option<ListenStream>,
    pub(super) poll: PollHandle,
    pub(super) scheduler: EventScheduler<E>,
    pub(super) shutdown: Shutdown,
    pub(super) doomed: Vec<usize>,
    pub(super) cancelled: Vec<E>,
    pub(super) firing: Option<EventId>,
    pub(super) firing_cancelled: bool,
}

impl<E> ServerContext<E> {
    pub(super) fn new(config: ServerConfig, poll: PollHandle, listener: ListenStream) -> Self {
        let settings = ConnectionSettings::from(&config);
        let max = config.network.max_connections;
        let shutdown = Shutdown::new(poll.waker());
        ServerContext {
            config,
            settings,
            connections: std::iter::repeat_with(|| None).take(max).collect(),
            num_connections: 0,
            current: None,
            listener: Some(listener),
            poll,
            scheduler: EventScheduler::new(),
            shutdown,
            doomed: Vec::new(),
            cancelled: Vec::new(),
            firing: None,
            firing_cancelled: false,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn active_connections(&self) -> usize {
        self.num_connections
    }

    pub fn max_connections(&self) -> usize {
        self.connections.len()
    }

    /// Slot whose hook is running, if any.
    pub fn current_connection(&self) -> Option<usize> {
        self.current
    }

    pub fn is_connected(&self, slot: usize) -> bool {
        matches!(self.connections.get(slot), Some(Some(_)))
    }

    /// Occupied slots in ascending order.
    pub fn slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.connections
            .iter()
            .enumerate()
            .filter_map(|(slot, conn)| conn.as_ref().map(|_| slot))
    }

    pub fn connection(&self, slot: usize) -> Option<&Connection> {
        self.connections.get(slot).and_then(Option::as_ref)
    }

    pub fn connection_mut(&mut self, slot: usize) -> Option<&mut Connection> {
        self.connections.get_mut(slot).and_then(Option::as_mut)
    }

    pub fn socket_handle(&self, slot: usize) -> Option<&TcpStream> {
        self.connection(slot).map(Connection::socket)
    }

    pub fn peer_addr(&self, slot: usize) -> Option<SocketAddr> {
        self.connection(slot).and_then(Connection::peer_addr)
    }

    pub fn input(&mut self, slot: usize) -> Option<ReadStream<'_, TcpStream>> {
        self.connection_mut(slot).map(Connection::reader)
    }

    /// Output for `slot`. Queued bytes are flushed when the server finishes
    /// with the slot, or earlier through [`WriteStream::flush_output`].
    pub fn output(&mut self, slot: usize) -> Option<WriteStream<'_, TcpStream>> {
        self.connection_mut(slot).map(Connection::writer)
    }

    /// Bound address of the listener, `None` after shutdown.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(ListenStream::local_addr)
    }

    /// Schedules teardown of `slot` once the running hook returns.
    pub fn disconnect(&mut self, slot: usize) {
        if self.is_connected(slot) && !self.doomed.contains(&slot) {
            debug!(slot, "disconnect requested");
            self.doomed.push(slot);
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.request_shutdown();
    }

    /// A handle other threads can use to stop the loop.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// Schedules `data` to be handed to `on_timed_event`. A zero `interval`
    /// fires once.
    pub fn add_event(&mut self, when: When, data: E, interval: Duration) -> EventId {
        self.scheduler.add_event(when, data, interval)
    }

    /// Cancels a pending event; its `on_event_done` runs once the current
    /// hook returns. An event may cancel itself from `on_timed_event`.
    pub fn cancel_event(&mut self, id: EventId) -> bool {
        if self.firing == Some(id) {
            self.firing_cancelled = true;
            return true;
        }
        match self.scheduler.cancel(id) {
            Some(data) => {
                debug!(event = id.as_u64(), "event cancelled");
                self.cancelled.push(data);
                true
            }
            None => false,
        }
    }

    pub fn pending_events(&self) -> usize {
        self.scheduler.len()
    }

    pub(super) fn free_slot(&self) -> Option<usize> {
        self.connections.iter().position(Option::is_none)
    }

    pub(super) fn has_deferred(&self) -> bool {
        !self.doomed.is_empty() || !self.cancelled.is_empty()
    }
}
