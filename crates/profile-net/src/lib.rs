//! Wire framing for the profile server protocol.
//!
//! Connection state, handshake, and dispatch live in `profiled`; this crate
//! only owns the length-prefixed envelope codec shared by the client,
//! application-service, and neighbor-interface listeners.

pub mod framing;

pub use framing::{Envelope, EnvelopeCodec, FrameError, MessageKind};
