//! Abstract device transport traits.
//!
//! The relay never speaks USB itself. A [`DeviceTransport`] enumerates and
//! opens devices; each open device is a [`DeviceSession`] that exchanges
//! APDUs. Methods return boxed `Send` futures so both traits stay object safe
//! and can be driven from spawned tasks.

use crate::error::RelayResult;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Status word signalling success.
pub const STATUS_OK: u16 = 0x9000;

/// Boxed future returned by transport methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A command APDU: header bytes plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

/// Per-session settings applied when a device is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    /// Log every exchange at debug level.
    pub debug: bool,
    /// Key used by the transport to scramble U2F payloads.
    pub scramble_key: String,
    /// Upper bound for a single APDU exchange.
    pub exchange_timeout: Duration,
}

/// Capability that enumerates and opens hardware security keys.
pub trait DeviceTransport: Send + Sync {
    /// Whether this environment can talk to devices at all.
    fn is_supported(&self) -> BoxFuture<'_, RelayResult<bool>>;

    /// Paths of the currently attached devices, in enumeration order.
    fn list(&self) -> BoxFuture<'_, RelayResult<Vec<String>>>;

    /// Open a session with the device at `path`.
    fn open<'a>(
        &'a self,
        path: &'a str,
        options: &'a SessionOptions,
    ) -> BoxFuture<'a, RelayResult<Box<dyn DeviceSession>>>;
}

/// An open connection to one device.
pub trait DeviceSession: Send {
    /// Exchange one APDU. The response includes the trailing status word,
    /// which must be one of `status_list`.
    fn send<'a>(
        &'a mut self,
        apdu: &'a Apdu,
        status_list: &'a [u16],
    ) -> BoxFuture<'a, RelayResult<Vec<u8>>>;

    /// Release the device.
    fn close(&mut self) -> BoxFuture<'_, RelayResult<()>>;
}

/// Extract the trailing status word of an APDU response.
pub fn status_word(response: &[u8]) -> Option<u16> {
    match response {
        [.., hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}
