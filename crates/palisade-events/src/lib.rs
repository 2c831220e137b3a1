//! Palisade Events - the in-process event bus.
//!
//! Chat events, container state transitions, error reports, and budget
//! alerts all flow through one broker. Each subscriber holds a bounded
//! queue and an optional filter; the publisher never blocks — a subscriber
//! whose queue fills is disconnected instead.
//!
//! Payloads are PII-scrubbed once at publish time, before any fan-out, so
//! no delivery path can see the raw string.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod bus;
mod event;
mod filter;
mod scrub;

pub use bus::{EventBus, EventReceiver, SequencedEvent, DEFAULT_QUEUE_CAPACITY};
pub use event::{BridgeEvent, ChatEvent};
pub use filter::EventFilter;
pub use scrub::Scrubber;
