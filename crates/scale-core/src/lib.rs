//! Core data model for the weight relay: samples, the bounded history
//! window, inbound reading decoding and outbound envelopes.

pub mod envelope;
pub mod history;
pub mod ids;
pub mod reading;
pub mod sample;

pub use envelope::Envelope;
pub use history::{HistoryBuffer, DEFAULT_CAPACITY, DEFAULT_REPLAY_LIMIT};
pub use ids::ClientId;
pub use reading::{DecodeError, Reading};
pub use sample::Sample;
