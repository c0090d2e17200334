pub use event_scheduler::{Event, EventId, EventScheduler, When};

mod event_scheduler;
