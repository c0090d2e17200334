use std::fmt;

use tracing::trace;

use super::context::ServerContext;
use super::Framing;
use crate::network::{Extract, Line, UnitParser};
use crate::utils::EventId;
use crate::AppResult;

/// Hooks every server handler may override. All of them default to doing
/// nothing.
///
/// Hooks run on the server loop itself and must return promptly; work that
/// cannot finish before the next readiness check belongs in a
/// [`Continuation`].
pub trait ServerHooks {
    /// Data attached to scheduled events, handed back when they fire and
    /// again when they are done.
    type EventData;

    fn on_connect(&mut self, _ctx: &mut ServerContext<Self::EventData>, _slot: usize) {}

    /// Called once per connection, before its slot is cleared.
    fn on_disconnect(&mut self, _ctx: &mut ServerContext<Self::EventData>, _slot: usize) {}

    /// Runs once per pass. `idle` is true when no connection did anything
    /// this pass. Returning true keeps the loop from blocking.
    fn on_background_work(
        &mut self,
        _ctx: &mut ServerContext<Self::EventData>,
        _idle: bool,
    ) -> bool {
        false
    }

    /// Returning false stops a repeating event.
    fn on_timed_event(
        &mut self,
        _ctx: &mut ServerContext<Self::EventData>,
        _id: EventId,
        _data: &mut Self::EventData,
    ) -> bool {
        false
    }

    /// The event expired or was cancelled; release what it holds.
    fn on_event_done(&mut self, _ctx: &mut ServerContext<Self::EventData>, _data: Self::EventData) {
    }
}

/// Handler for servers framing input as lines.
pub trait LineHandler: ServerHooks + Sized {
    fn on_line_received(
        &mut self,
        ctx: &mut ServerContext<Self::EventData>,
        slot: usize,
        line: Line,
    ) -> Disposition<Self>;
}

/// Handler for servers framing input as protocol units.
pub trait ObjectHandler: ServerHooks + Sized {
    type Parser: UnitParser;

    fn parser(&self) -> &Self::Parser;

    fn on_object_received(
        &mut self,
        ctx: &mut ServerContext<Self::EventData>,
        slot: usize,
        unit: <Self::Parser as UnitParser>::Unit,
    ) -> Disposition<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// call again on a later pass
    Pending,
    Done,
}

/// Unfinished work for one connection. While installed, the server calls it
/// instead of extracting further input from that connection.
pub type Continuation<H> = Box<
    dyn FnMut(&mut H, &mut ServerContext<<H as ServerHooks>::EventData>, usize) -> Resume,
>;

/// What a receive hook wants done with its connection.
pub enum Disposition<H: ServerHooks> {
    Continue,
    Disconnect,
    Suspend(Continuation<H>),
}

impl<H: ServerHooks> Disposition<H> {
    pub fn suspend<F>(resume: F) -> Self
    where
        F: FnMut(&mut H, &mut ServerContext<H::EventData>, usize) -> Resume + 'static,
    {
        Disposition::Suspend(Box::new(resume))
    }
}

/// `true` keeps the connection, `false` drops it.
impl<H: ServerHooks> From<bool> for Disposition<H> {
    fn from(keep: bool) -> Self {
        if keep {
            Disposition::Continue
        } else {
            Disposition::Disconnect
        }
    }
}

impl<H: ServerHooks> fmt::Debug for Disposition<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Continue => f.write_str("Continue"),
            Disposition::Disconnect => f.write_str("Disconnect"),
            Disposition::Suspend(_) => f.write_str("Suspend(..)"),
        }
    }
}

/// Binds a handler to the framing it understands. Implemented by
/// [`LineMode`] and [`UnitMode`].
pub trait Mode {
    type Handler: ServerHooks;

    const FRAMING: Framing;

    fn handler(&self) -> &Self::Handler;

    fn handler_mut(&mut self) -> &mut Self::Handler;

    /// Extracts the next complete item from `slot` and passes it to the
    /// receive hook.
    fn dispatch_next(
        &mut self,
        ctx: &mut ServerContext<EventData<Self>>,
        slot: usize,
    ) -> AppResult<Extract<Disposition<Self::Handler>>>;
}

pub type EventData<M> = <<M as Mode>::Handler as ServerHooks>::EventData;

#[derive(Debug)]
pub struct LineMode<H>(pub(crate) H);

impl<H: LineHandler> Mode for LineMode<H> {
    type Handler = H;

    const FRAMING: Framing = Framing::Lines;

    fn handler(&self) -> &H {
        &self.0
    }

    fn handler_mut(&mut self) -> &mut H {
        &mut self.0
    }

    fn dispatch_next(
        &mut self,
        ctx: &mut ServerContext<H::EventData>,
        slot: usize,
    ) -> AppResult<Extract<Disposition<H>>> {
        let extracted = match ctx.connection_mut(slot) {
            Some(conn) => conn.next_line()?,
            None => return Ok(Extract::Closed),
        };
        match extracted {
            Extract::Ready(line) => {
                trace!(slot, chars = line.text().chars().count(), "line received");
                ctx.current = Some(slot);
                let disposition = self.0.on_line_received(ctx, slot, line);
                ctx.current = None;
                Ok(Extract::Ready(disposition))
            }
            Extract::Pending => Ok(Extract::Pending),
            Extract::Closed => Ok(Extract::Closed),
        }
    }
}

#[derive(Debug)]
pub struct UnitMode<H>(pub(crate) H);

impl<H: ObjectHandler> Mode for UnitMode<H> {
    type Handler = H;

    const FRAMING: Framing = Framing::Units;

    fn handler(&self) -> &H {
        &self.0
    }

    fn handler_mut(&mut self) -> &mut H {
        &mut self.0
    }

    fn dispatch_next(
        &mut self,
        ctx: &mut ServerContext<H::EventData>,
        slot: usize,
    ) -> AppResult<Extract<Disposition<H>>> {
        let extracted = match ctx.connection_mut(slot) {
            Some(conn) => conn.next_unit(self.0.parser())?,
            None => return Ok(Extract::Closed),
        };
        match extracted {
            Extract::Ready(unit) => {
                trace!(slot, "unit received");
                ctx.current = Some(slot);
                let disposition = self.0.on_object_received(ctx, slot, unit);
                ctx.current = None;
                Ok(Extract::Ready(disposition))
            }
            Extract::Pending => Ok(Extract::Pending),
            Extract::Closed => Ok(Extract::Closed),
        }
    }
}
