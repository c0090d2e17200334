use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use tracing::trace;

use crate::AppResult;

pub const WAKER: Token = Token(usize::MAX);
pub const LISTENER: Token = Token(usize::MAX - 1);

pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// One readiness wait covering every registered socket.
///
/// mio reports readiness edges, so whatever a wait observes is remembered
/// until the loop takes it; a wait done while accepting never loses a
/// connection's signal.
#[derive(Debug)]
pub struct PollHandle {
    poller: Poll,
    events: Events,
    readable: BTreeSet<usize>,
    writable: BTreeSet<usize>,
    listener_ready: bool,
    waker: Arc<Waker>,
}

impl PollHandle {
    pub fn new(events_capacity: usize) -> AppResult<Self> {
        let poller = Poll::new()?;
        let waker = Waker::new(poller.registry(), WAKER)?;
        Ok(PollHandle {
            poller,
            events: Events::with_capacity(events_capacity),
            readable: BTreeSet::new(),
            writable: BTreeSet::new(),
            listener_ready: false,
            waker: Arc::new(waker),
        })
    }

    pub fn registry(&self) -> &Registry {
        self.poller.registry()
    }

    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    pub fn register<S>(&self, src: &mut S, token: Token, interest: Interest) -> AppResult<()>
    where
        S: Source + ?Sized,
    {
        self.poller.registry().register(src, token, interest)?;
        Ok(())
    }

    pub fn deregister<S>(&self, src: &mut S) -> AppResult<()>
    where
        S: Source + ?Sized,
    {
        self.poller.registry().deregister(src)?;
        Ok(())
    }

    /// Blocks up to `timeout` (`None` waits indefinitely) and records what
    /// became ready. Returns the number of events seen.
    pub fn wait(&mut self, timeout: Option<Duration>) -> AppResult<usize> {
        match self.poller.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e.into()),
        }
        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            match event.token() {
                WAKER => trace!("poller woken"),
                LISTENER => self.listener_ready = true,
                Token(slot) => {
                    // closure and error states surface through the next read
                    if event.is_readable() || event.is_read_closed() || event.is_error() {
                        self.readable.insert(slot);
                    }
                    if event.is_writable() || event.is_write_closed() {
                        self.writable.insert(slot);
                    }
                }
            }
        }
        Ok(count)
    }

    pub fn take_readable(&mut self, slot: usize) -> bool {
        self.readable.remove(&slot)
    }

    pub fn take_writable(&mut self, slot: usize) -> bool {
        self.writable.remove(&slot)
    }

    pub fn take_listener_ready(&mut self) -> bool {
        std::mem::take(&mut self.listener_ready)
    }

    /// Treats `slot` as readable on the next pass, e.g. for a socket whose
    /// first bytes may have arrived before it was registered.
    pub fn mark_readable(&mut self, slot: usize) {
        self.readable.insert(slot);
    }

    pub fn has_readable(&self) -> bool {
        !self.readable.is_empty()
    }

    /// Drops any readiness remembered for a slot being torn down, so the
    /// next connection placed there starts clean.
    pub fn forget(&mut self, slot: usize) {
        self.readable.remove(&slot);
        self.writable.remove(&slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpStream as StdTcpStream;

    use mio::net::TcpListener;

    #[test]
    fn test_poll_times_out_empty() {
        let mut poller = PollHandle::new(16).unwrap();
        let n = poller.wait(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
        assert!(!poller.has_readable());
    }

    #[test]
    fn test_readiness_is_remembered_until_taken() -> AppResult<()> {
        let mut poller = PollHandle::new(16)?;
        let mut listener = TcpListener::bind("127.0.0.1:0".parse().unwrap())?;
        poller.register(&mut listener, LISTENER, Interest::READABLE)?;

        let mut client = StdTcpStream::connect(listener.local_addr()?)?;
        poller.wait(Some(Duration::from_secs(1)))?;
        assert!(poller.take_listener_ready());
        assert!(!poller.take_listener_ready());

        let (mut accepted, _) = listener.accept()?;
        poller.register(&mut accepted, Token(3), Interest::READABLE)?;
        client.write_all(b"ping")?;
        poller.wait(Some(Duration::from_secs(1)))?;

        // an unrelated wait does not clear what was recorded
        poller.wait(Some(Duration::from_millis(1)))?;
        assert!(poller.take_readable(3));
        assert!(!poller.take_readable(3));
        Ok(())
    }

    #[test]
    fn test_waker_breaks_wait() -> AppResult<()> {
        let mut poller = PollHandle::new(16)?;
        poller.waker().wake()?;
        let n = poller.wait(Some(Duration::from_secs(5)))?;
        assert_eq!(n, 1);
        Ok(())
    }
}
