use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tracing::trace;

/// Handle for a scheduled event, stable across repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(u64);

impl EventId {
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Stand-in due time for delays too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `base + delay`, clamped to a far-future instant instead of overflowing.
fn later(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

/// When an event should first fire.
#[derive(Debug, Clone, Copy)]
pub enum When {
    /// relative to the moment the event is added
    In(Duration),
    /// wall-clock time; a time already past fires on the next pass
    At(DateTime<Local>),
    AtInstant(Instant),
}

impl When {
    fn resolve(self, now: Instant) -> Instant {
        match self {
            When::In(delay) => later(now, delay),
            When::AtInstant(instant) => instant,
            When::At(time) => {
                let delay = time
                    .signed_duration_since(Local::now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                later(now, delay)
            }
        }
    }
}

/// A scheduled callback's bookkeeping: due time, repeat interval and the
/// data handed back to the hooks.
#[derive(Debug)]
pub struct Event<T> {
    id: EventId,
    due: Instant,
    interval: Duration,
    data: T,
}

impl<T> Event<T> {
    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn due(&self) -> Instant {
        self.due
    }

    /// Zero means one-shot.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut T {
        &mut self.data
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

/// Time-ordered event list. Ties fire in the order they were added.
#[derive(Debug)]
pub struct EventScheduler<T> {
    queue: BTreeMap<(Instant, u64), Event<T>>,
    index: HashMap<EventId, (Instant, u64)>,
    next_seq: u64,
    next_id: u64,
}

impl<T> Default for EventScheduler<T> {
    fn default() -> Self {
        EventScheduler {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            next_id: 0,
        }
    }
}

impl<T> EventScheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn add_event(&mut self, when: When, data: T, interval: Duration) -> EventId {
        self.add_event_at(when, data, interval, Instant::now())
    }

    fn add_event_at(&mut self, when: When, data: T, interval: Duration, now: Instant) -> EventId {
        let id = EventId(self.next_id);
        self.next_id += 1;
        let due = when.resolve(now);
        trace!(event = id.0, ?interval, "event scheduled");
        self.insert(Event {
            id,
            due,
            interval,
            data,
        });
        id
    }

    fn insert(&mut self, event: Event<T>) {
        let key = (event.due, self.next_seq);
        self.next_seq += 1;
        self.index.insert(event.id, key);
        self.queue.insert(key, event);
    }

    /// Removes an event before it fires, returning its data.
    pub fn cancel(&mut self, id: EventId) -> Option<T> {
        let key = self.index.remove(&id)?;
        self.queue.remove(&key).map(Event::into_data)
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Time until the earliest event is due, zero if already overdue.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        self.next_due()
            .map(|due| due.saturating_duration_since(now))
    }

    /// Takes the earliest event if it is due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<Event<T>> {
        let (&key, _) = self.queue.iter().next().filter(|(key, _)| key.0 <= now)?;
        let event = self.queue.remove(&key)?;
        self.index.remove(&event.id);
        Some(event)
    }

    /// Puts a fired event back if it asked to repeat and has an interval.
    /// A repeat whose next time has already passed is moved to `now +
    /// interval` instead of firing again immediately. Otherwise the data is
    /// returned for cleanup.
    pub fn reschedule(&mut self, mut event: Event<T>, repeat: bool, now: Instant) -> Option<T> {
        if !repeat || event.interval.is_zero() {
            return Some(event.data);
        }
        let naive = later(event.due, event.interval);
        event.due = if naive <= now {
            later(now, event.interval)
        } else {
            naive
        };
        self.insert(event);
        None
    }

    /// Removes every event, earliest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.index.clear();
        std::mem::take(&mut self.queue)
            .into_values()
            .map(Event::into_data)
            .collect()
    }
}
