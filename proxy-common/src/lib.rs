//! Shared building blocks for the webmod workspace.
//!
//! This crate carries the pieces every engine needs: the ordered header
//! multimap used by flow records and the wire codec, the event bus that
//! fans engine events out to subscribers, and the pure analyzer kernels
//! (decoder, sequencer statistics, comparer diff).

pub mod bus;
pub mod comparer;
pub mod decoder;
pub mod headers;
pub mod sequencer;

pub use bus::{Event, EventBus, Subscription, Topic};
pub use headers::Headers;
