//! Streaming protocol decoding
//!
//! - [`decoder::StreamDecoder`] turns a server-sent-event response body into
//!   typed [`decoder::StreamEvent`]s.
//! - [`accumulator::ToolCallAccumulator`] reassembles fragmented, index-keyed
//!   tool-call deltas into complete calls.

pub mod accumulator;
pub mod decoder;

pub use accumulator::ToolCallAccumulator;
pub use decoder::{StreamDecoder, StreamEvent};
