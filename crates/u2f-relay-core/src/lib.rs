//! u2f-relay-core: Shared protocol library for the U2F message relay.
//!
//! Provides the page-facing request/response envelopes, the frame signals,
//! hex codec, an in-memory duplex message channel, and the abstract device
//! transport traits the relay forwards to.

pub mod channel;
pub mod codec;
pub mod error;
pub mod messages;
pub mod transport;

// Re-export commonly used items at crate root.
pub use channel::{MessageChannel, MessagePort, PortReceiver, PortSender};
pub use codec::{decode_hex, encode_hex};
pub use error::{RelayError, RelayResult};
pub use messages::{
    Call, ErrorBody, OpenArgs, Request, Response, SendArgs, Signal, SystemMessage, BEGIN_SIGNAL,
    END_SIGNAL, READY_SIGNAL,
};
pub use transport::{
    status_word, Apdu, BoxFuture, DeviceSession, DeviceTransport, SessionOptions, STATUS_OK,
};
