use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::TcpStream;
use mio::{Interest, Token};
use tracing::{debug, error, info, trace, warn};

use super::context::ServerContext;
use super::handler::{
    Continuation, Disposition, EventData, LineHandler, LineMode, Mode, ObjectHandler, Resume,
    ServerHooks, UnitMode,
};
use super::{ServerConfig, Shutdown};
use crate::network::{
    Connection, Extract, ListenStream, PollHandle, WriteStatus, DEFAULT_EVENTS_CAPACITY,
};
use crate::utils::{EventId, When};
use crate::{AppError, AppResult};

/// Single-threaded connection multiplexer.
///
/// Each pass of the loop accepts at most one new connection, waits once for
/// readiness across every socket, services connections round-robin, runs
/// background work and fires due events. See [`Server::run_once`].
pub struct Server<M: Mode> {
    mode: M,
    ctx: ServerContext<EventData<M>>,
    continuations: Vec<Option<Continuation<M::Handler>>>,
    last_serviced: usize,
    background_pending: bool,
    tick: Duration,
}

impl<H: LineHandler> Server<LineMode<H>> {
    /// A server that frames input as lines and hands them to `handler`.
    pub fn lines(config: ServerConfig, handler: H) -> AppResult<Self> {
        Server::with_mode(config, LineMode(handler))
    }
}

impl<H: ObjectHandler> Server<UnitMode<H>> {
    /// A server that frames input with the handler's unit parser.
    pub fn units(config: ServerConfig, handler: H) -> AppResult<Self> {
        Server::with_mode(config, UnitMode(handler))
    }
}

impl<M: Mode> Server<M> {
    #[tracing::instrument(skip(config, mode), fields(port = config.network.port))]
    fn with_mode(mut config: ServerConfig, mode: M) -> AppResult<Self> {
        config.protocol.framing = M::FRAMING;
        config.validate()?;
        let addr = config.listen_addr()?;
        let poll = PollHandle::new(DEFAULT_EVENTS_CAPACITY)?;
        let listener = ListenStream::bind(addr, &poll)?;
        let max = config.network.max_connections;
        let tick = config.tick();
        info!(
            max_connections = max,
            framing = ?config.protocol.framing,
            encoding = ?config.protocol.encoding,
            "server ready"
        );
        Ok(Server {
            mode,
            ctx: ServerContext::new(config, poll, listener),
            continuations: std::iter::repeat_with(|| None).take(max).collect(),
            last_serviced: max.saturating_sub(1),
            background_pending: false,
            tick,
        })
    }

    /// The listener is up; false once the server has been shut down.
    pub fn good(&self) -> bool {
        self.ctx.listener.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ctx.local_addr()
    }

    pub fn handler(&self) -> &M::Handler {
        self.mode.handler()
    }

    pub fn handler_mut(&mut self) -> &mut M::Handler {
        self.mode.handler_mut()
    }

    pub fn context(&self) -> &ServerContext<EventData<M>> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut ServerContext<EventData<M>> {
        &mut self.ctx
    }

    pub fn active_connections(&self) -> usize {
        self.ctx.active_connections()
    }

    pub fn max_connections(&self) -> usize {
        self.ctx.max_connections()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.ctx.shutdown_handle()
    }

    pub fn request_shutdown(&self) {
        self.ctx.request_shutdown();
    }

    pub fn add_event(&mut self, when: When, data: EventData<M>, interval: Duration) -> EventId {
        self.ctx.add_event(when, data, interval)
    }

    /// Cancels a pending event and runs its `on_event_done`.
    pub fn cancel_event(&mut self, id: EventId) -> bool {
        let cancelled = self.ctx.cancel_event(id);
        self.finish_deferred();
        cancelled
    }

    fn has_continuations(&self) -> bool {
        self.continuations.iter().any(Option::is_some)
    }

    /// Opens a connection to `addr` and places it in a free slot, exactly
    /// like an accepted one. Blocks for at most `timeout` while connecting.
    pub fn connect_to(&mut self, addr: SocketAddr, timeout: Duration) -> AppResult<usize> {
        if self.ctx.free_slot().is_none() {
            return Err(AppError::IllegalStateError(format!(
                "connection table full ({} slots), cannot connect to {}",
                self.ctx.max_connections(),
                addr
            )));
        }
        let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        self.install(TcpStream::from_std(stream), addr)
    }

    fn install(&mut self, mut stream: TcpStream, peer: SocketAddr) -> AppResult<usize> {
        let slot = self.ctx.free_slot().ok_or_else(|| {
            AppError::IllegalStateError("no free slot for new connection".to_string())
        })?;
        self.ctx.poll.register(
            &mut stream,
            Token(slot),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.ctx.connections[slot] = Some(Connection::new(stream, &self.ctx.settings));
        self.ctx.num_connections += 1;
        // bytes may have landed before registration
        self.ctx.poll.mark_readable(slot);
        info!(
            slot,
            %peer,
            active = self.ctx.num_connections,
            "connection established"
        );

        self.ctx.current = Some(slot);
        self.mode.handler_mut().on_connect(&mut self.ctx, slot);
        self.ctx.current = None;
        self.finish_deferred();
        Ok(slot)
    }

    /// Tears down `slot` now: `on_disconnect` runs, queued output gets one
    /// last flush attempt, and the slot becomes free. Returns false for an
    /// empty slot.
    pub fn disconnect(&mut self, slot: usize) -> bool {
        if !self.ctx.is_connected(slot) {
            return false;
        }
        self.ctx.current = Some(slot);
        self.mode.handler_mut().on_disconnect(&mut self.ctx, slot);
        self.ctx.current = None;

        let Some(mut conn) = self.ctx.connections[slot].take() else {
            return false;
        };
        conn.transport().set_non_blocking_writes(true);
        match conn.flush() {
            Ok(WriteStatus::Flushed) => {}
            Ok(WriteStatus::Pending) => {
                debug!(slot, unsent = conn.output_pending(), "dropping unsent output")
            }
            Err(e) => debug!(slot, "final flush failed: {}", e),
        }
        if let Err(e) = self.ctx.poll.deregister(conn.socket_mut()) {
            debug!(slot, "deregister failed: {}", e);
        }
        self.ctx.poll.forget(slot);
        self.ctx.doomed.retain(|&doomed| doomed != slot);
        self.continuations[slot] = None;
        self.ctx.num_connections -= 1;
        info!(
            slot,
            peer = ?conn.peer_addr(),
            active = self.ctx.num_connections,
            "connection closed"
        );
        true
    }

    /// Completes teardown and event cleanup requested by hooks.
    fn finish_deferred(&mut self) {
        while self.ctx.has_deferred() {
            while let Some(slot) = self.ctx.doomed.pop() {
                self.disconnect(slot);
            }
            while let Some(data) = self.ctx.cancelled.pop() {
                self.mode.handler_mut().on_event_done(&mut self.ctx, data);
            }
        }
    }

    /// Runs one pass of the loop, returning whether anything happened.
    ///
    /// 1. Accept one connection if a slot is free, waiting up to `timeout`
    ///    (bounded by the next event) only when nothing else needs attention.
    /// 2. Wait once for readiness across all sockets.
    /// 3. Service connections round-robin after the last one serviced.
    /// 4. Run background work, then fire due events.
    /// 5. Flush output still queued.
    pub fn run_once(&mut self, timeout: Duration) -> AppResult<bool> {
        let mut busy = false;

        let accepted = self.accept_step(timeout)?;
        busy |= accepted;

        let wait = self.readiness_timeout(timeout, accepted);
        self.ctx.poll.wait(Some(wait))?;

        busy |= self.service_connections();

        let idle = !busy;
        self.background_pending = self.mode.handler_mut().on_background_work(&mut self.ctx, idle);
        self.finish_deferred();
        busy |= self.background_pending;

        busy |= self.fire_due_events();
        self.flush_all();
        Ok(busy)
    }

    fn accept_step(&mut self, timeout: Duration) -> AppResult<bool> {
        if self.ctx.num_connections >= self.ctx.max_connections() {
            return Ok(false);
        }
        let accept_timeout = if self.ctx.num_connections > 0 || self.background_pending {
            Duration::ZERO
        } else {
            match self.ctx.scheduler.time_until_next(Instant::now()) {
                Some(until_event) => timeout.min(until_event),
                None => timeout,
            }
        };
        let Some(listener) = self.ctx.listener.as_mut() else {
            return Ok(false);
        };
        match listener.await_connection(&mut self.ctx.poll, accept_timeout) {
            Ok(Some((stream, peer))) => {
                self.install(stream, peer)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e @ AppError::Accept(_)) => {
                error!("accept failed: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn readiness_timeout(&mut self, timeout: Duration, accepted: bool) -> Duration {
        if self.ctx.num_connections == 0 || accepted || self.background_pending {
            // the accept step already did the waiting
            return Duration::ZERO;
        }
        if self.ctx.poll.has_readable() || self.unread_input_waiting() {
            return Duration::ZERO;
        }
        if self.has_continuations() {
            return self.tick;
        }
        match self.ctx.scheduler.time_until_next(Instant::now()) {
            Some(until_event) => timeout.min(until_event),
            None => timeout,
        }
    }

    /// A connection holds buffered bytes it could make progress on without
    /// any new readiness.
    fn unread_input_waiting(&mut self) -> bool {
        let continuations = &self.continuations;
        self.ctx
            .connections
            .iter_mut()
            .enumerate()
            .any(|(slot, conn)| match conn {
                Some(conn) => {
                    continuations[slot].is_none()
                        && conn.buffered_input() > 0
                        && conn.output_pending() == 0
                }
                None => false,
            })
    }

    fn service_connections(&mut self) -> bool {
        let max = self.ctx.max_connections();
        let mut busy = false;
        for offset in 1..=max {
            let slot = (self.last_serviced + offset) % max;
            if !self.ctx.is_connected(slot) {
                continue;
            }
            if self.service_slot(slot) {
                busy = true;
                self.last_serviced = slot;
            }
            self.finish_deferred();
        }
        busy
    }

    /// Returns whether the slot was serviced.
    fn service_slot(&mut self, slot: usize) -> bool {
        let readable = self.ctx.poll.take_readable(slot);
        let writable = self.ctx.poll.take_writable(slot);
        let suspended = self.continuations[slot].is_some();
        let Some(conn) = self.ctx.connection_mut(slot) else {
            return false;
        };

        if readable {
            match conn.fill() {
                Ok(n) => trace!(slot, bytes = n, "filled"),
                Err(e) if e.is_retryable() => debug!(slot, "fill deferred: {}", e),
                Err(e) => {
                    warn!(slot, "read failed: {}", e);
                    self.ctx.disconnect(slot);
                    return true;
                }
            }
        }
        if !readable && !writable && !suspended && conn.buffered_input() == 0 {
            return false;
        }
        if conn.connection_died() && !conn.has_partial() {
            debug!(slot, "peer gone");
            self.ctx.disconnect(slot);
            return true;
        }
        if conn.output_pending() > 0 {
            trace!(slot, "output still draining, skipping input");
            return writable;
        }

        if let Some(mut resume) = self.continuations[slot].take() {
            self.ctx.current = Some(slot);
            let state = resume(self.mode.handler_mut(), &mut self.ctx, slot);
            self.ctx.current = None;
            match state {
                Resume::Pending => {
                    self.continuations[slot] = Some(resume);
                    self.flush_slot(slot);
                    return true;
                }
                Resume::Done => trace!(slot, "continuation done"),
            }
        }

        self.drain_slot(slot);
        self.flush_slot(slot);
        true
    }

    /// Dispatches complete items until the hook stops it or input runs out.
    fn drain_slot(&mut self, slot: usize) {
        loop {
            if self.ctx.doomed.contains(&slot) || !self.ctx.is_connected(slot) {
                return;
            }
            match self.mode.dispatch_next(&mut self.ctx, slot) {
                Ok(Extract::Ready(Disposition::Continue)) => {}
                Ok(Extract::Ready(Disposition::Disconnect)) => {
                    self.ctx.disconnect(slot);
                    return;
                }
                Ok(Extract::Ready(Disposition::Suspend(resume))) => {
                    trace!(slot, "continuation installed");
                    self.continuations[slot] = Some(resume);
                    return;
                }
                Ok(Extract::Pending) => return,
                Ok(Extract::Closed) => {
                    self.ctx.disconnect(slot);
                    return;
                }
                Err(e) if e.is_retryable() => {
                    debug!(slot, "extraction deferred: {}", e);
                    return;
                }
                Err(e) => {
                    warn!(slot, "dropping connection: {}", e);
                    self.ctx.disconnect(slot);
                    return;
                }
            }
        }
    }

    fn flush_slot(&mut self, slot: usize) {
        let Some(conn) = self.ctx.connection_mut(slot) else {
            return;
        };
        if let Err(e) = conn.flush() {
            warn!(slot, "write failed: {}", e);
            self.ctx.disconnect(slot);
        }
    }

    fn flush_all(&mut self) {
        for slot in 0..self.ctx.max_connections() {
            let pending = match self.ctx.connection_mut(slot) {
                Some(conn) => conn.output_pending() > 0,
                None => false,
            };
            if pending {
                self.flush_slot(slot);
            }
        }
        self.finish_deferred();
    }

    fn fire_due_events(&mut self) -> bool {
        let now = Instant::now();
        let mut fired = false;
        while let Some(mut event) = self.ctx.scheduler.pop_due(now) {
            fired = true;
            let id = event.id();
            self.ctx.firing = Some(id);
            self.ctx.firing_cancelled = false;
            let repeat = self
                .mode
                .handler_mut()
                .on_timed_event(&mut self.ctx, id, event.data_mut());
            let repeat = repeat && !self.ctx.firing_cancelled;
            self.ctx.firing = None;
            trace!(event = id.as_u64(), repeat, "event fired");
            if let Some(data) = self.ctx.scheduler.reschedule(event, repeat, Instant::now()) {
                self.mode.handler_mut().on_event_done(&mut self.ctx, data);
            }
            self.finish_deferred();
        }
        fired
    }

    /// Runs passes until shutdown is requested, or until `timeout` has
    /// elapsed and nothing is left to do: no connections, no background work
    /// and no continuations.
    pub fn run(&mut self, timeout: Duration) -> AppResult<()> {
        let deadline = Instant::now().checked_add(timeout);
        loop {
            if self.ctx.shutdown.is_shutdown() {
                info!("shutdown requested, leaving server loop");
                break;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => timeout,
            };
            let pass_timeout = if remaining.is_zero() && self.ctx.num_connections > 0 {
                timeout.max(self.tick)
            } else {
                remaining
            };
            self.run_once(pass_timeout)?;

            let expired = deadline.is_some_and(|deadline| Instant::now() >= deadline);
            if expired
                && self.ctx.num_connections == 0
                && !self.background_pending
                && !self.has_continuations()
            {
                debug!("run timeout elapsed with no connections");
                break;
            }
        }
        Ok(())
    }

    /// Disconnects every connection, ends every event through
    /// `on_event_done` and closes the listener.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&mut self) {
        for slot in 0..self.ctx.max_connections() {
            self.disconnect(slot);
        }
        self.finish_deferred();
        for data in self.ctx.scheduler.drain() {
            self.mode.handler_mut().on_event_done(&mut self.ctx, data);
        }
        self.finish_deferred();
        if let Some(listener) = self.ctx.listener.take() {
            listener.close(&self.ctx.poll);
        }
        info!("server shut down");
    }
}

impl<M: Mode> Drop for Server<M> {
    fn drop(&mut self) {
        if let Some(listener) = self.ctx.listener.take() {
            listener.close(&self.ctx.poll);
        }
        debug!(active = self.ctx.num_connections, "server dropped");
    }
}
