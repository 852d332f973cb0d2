//! In-process virtual security keys.
//!
//! A [`VirtualTransport`] exposes a fixed set of [`VirtualDevice`]s through the
//! [`DeviceTransport`] trait. Each device either echoes the command payload
//! back with a `9000` status word or replays a scripted list of responses.
//! Exchanged APDUs are recorded so callers can inspect what reached the
//! device.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use u2f_relay_core::transport::status_word;
use u2f_relay_core::{
    encode_hex, Apdu, BoxFuture, DeviceSession, DeviceTransport, RelayError, RelayResult,
    SessionOptions,
};

#[derive(Debug, Clone)]
enum Behavior {
    Echo,
    Scripted(Arc<Mutex<VecDeque<Vec<u8>>>>),
}

/// A virtual device. Clones share state, so a test can keep a handle after
/// handing the device to a transport.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    path: String,
    behavior: Behavior,
    latency: Duration,
    exchanges: Arc<Mutex<Vec<Apdu>>>,
    open: Arc<AtomicBool>,
}

impl VirtualDevice {
    /// A device that answers every APDU with its payload followed by `9000`.
    pub fn echo(path: impl Into<String>) -> Self {
        Self::with_behavior(path, Behavior::Echo)
    }

    /// A device that answers with `responses` in order.
    pub fn scripted(path: impl Into<String>, responses: Vec<Vec<u8>>) -> Self {
        Self::with_behavior(
            path,
            Behavior::Scripted(Arc::new(Mutex::new(responses.into()))),
        )
    }

    fn with_behavior(path: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            path: path.into(),
            behavior,
            latency: Duration::ZERO,
            exchanges: Arc::new(Mutex::new(Vec::new())),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Delay every exchange by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Path reported by `list` and matched by `open`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether a session currently holds this device.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// APDUs this device has received so far.
    pub async fn exchanges(&self) -> Vec<Apdu> {
        self.exchanges.lock().await.clone()
    }

    async fn respond(&self, apdu: &Apdu) -> RelayResult<Vec<u8>> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.exchanges.lock().await.push(apdu.clone());

        match &self.behavior {
            Behavior::Echo => {
                let mut response = apdu.data.clone();
                response.extend_from_slice(&[0x90, 0x00]);
                Ok(response)
            }
            Behavior::Scripted(queue) => queue
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| RelayError::Device("no scripted response remaining".into())),
        }
    }
}

/// A [`DeviceTransport`] backed by virtual devices.
#[derive(Debug, Clone)]
pub struct VirtualTransport {
    supported: bool,
    devices: Vec<VirtualDevice>,
}

impl VirtualTransport {
    /// A supported transport with no devices attached.
    pub fn new() -> Self {
        Self {
            supported: true,
            devices: Vec::new(),
        }
    }

    /// A transport that reports itself unsupported.
    pub fn unsupported() -> Self {
        Self {
            supported: false,
            devices: Vec::new(),
        }
    }

    pub fn with_device(mut self, device: VirtualDevice) -> Self {
        self.devices.push(device);
        self
    }

    pub fn device(&self, path: &str) -> Option<&VirtualDevice> {
        self.devices.iter().find(|d| d.path() == path)
    }
}

impl Default for VirtualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTransport for VirtualTransport {
    fn is_supported(&self) -> BoxFuture<'_, RelayResult<bool>> {
        Box::pin(async move { Ok(self.supported) })
    }

    fn list(&self) -> BoxFuture<'_, RelayResult<Vec<String>>> {
        Box::pin(async move {
            if !self.supported {
                return Ok(Vec::new());
            }
            Ok(self.devices.iter().map(|d| d.path().to_string()).collect())
        })
    }

    fn open<'a>(
        &'a self,
        path: &'a str,
        options: &'a SessionOptions,
    ) -> BoxFuture<'a, RelayResult<Box<dyn DeviceSession>>> {
        Box::pin(async move {
            if !self.supported {
                return Err(RelayError::Device("transport not supported".into()));
            }
            let device = self
                .device(path)
                .ok_or_else(|| RelayError::Device(format!("device not found: {path}")))?;

            if device.open.swap(true, Ordering::SeqCst) {
                return Err(RelayError::Device(format!("device busy: {path}")));
            }

            debug!(
                path = %path,
                scramble_key = %options.scramble_key,
                timeout_ms = options.exchange_timeout.as_millis() as u64,
                "virtual device opened"
            );

            let session: Box<dyn DeviceSession> = Box::new(VirtualSession {
                device: device.clone(),
                options: options.clone(),
                closed: false,
            });
            Ok(session)
        })
    }
}

/// Session over a [`VirtualDevice`].
struct VirtualSession {
    device: VirtualDevice,
    options: SessionOptions,
    closed: bool,
}

impl DeviceSession for VirtualSession {
    fn send<'a>(
        &'a mut self,
        apdu: &'a Apdu,
        status_list: &'a [u16],
    ) -> BoxFuture<'a, RelayResult<Vec<u8>>> {
        Box::pin(async move {
            if self.closed {
                return Err(RelayError::Device("session closed".into()));
            }

            if self.options.debug {
                debug!(
                    path = %self.device.path,
                    header = %encode_hex(&[apdu.cla, apdu.ins, apdu.p1, apdu.p2]),
                    data = %encode_hex(&apdu.data),
                    "=> apdu"
                );
            }

            let response = tokio::time::timeout(
                self.options.exchange_timeout,
                self.device.respond(apdu),
            )
            .await
            .map_err(|_| RelayError::Timeout)??;

            if self.options.debug {
                debug!(path = %self.device.path, data = %encode_hex(&response), "<= apdu");
            }

            match status_word(&response) {
                Some(sw) if status_list.contains(&sw) => Ok(response),
                Some(sw) => Err(RelayError::StatusWord { code: sw }),
                None => Err(RelayError::Device(format!(
                    "short response ({} bytes)",
                    response.len()
                ))),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, RelayResult<()>> {
        Box::pin(async move {
            if self.closed {
                return Err(RelayError::Device("session already closed".into()));
            }
            self.closed = true;
            self.device.open.store(false, Ordering::SeqCst);
            debug!(path = %self.device.path, "virtual device closed");
            Ok(())
        })
    }
}

impl Drop for VirtualSession {
    fn drop(&mut self) {
        if !self.closed {
            self.device.open.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(timeout_ms: u64) -> SessionOptions {
        SessionOptions {
            debug: true,
            scramble_key: "ONT".into(),
            exchange_timeout: Duration::from_millis(timeout_ms),
        }
    }

    fn apdu(data: &[u8]) -> Apdu {
        Apdu {
            cla: 0xe0,
            ins: 0x01,
            p1: 0,
            p2: 0,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn list_in_order() {
        let transport = VirtualTransport::new()
            .with_device(VirtualDevice::echo("a"))
            .with_device(VirtualDevice::echo("b"));
        assert_eq!(transport.list().await.unwrap(), vec!["a", "b"]);
        assert!(transport.is_supported().await.unwrap());
    }

    #[tokio::test]
    async fn unsupported_lists_nothing() {
        let transport = VirtualTransport::unsupported();
        assert!(!transport.is_supported().await.unwrap());
        assert!(transport.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn echo_appends_status() {
        let device = VirtualDevice::echo("a");
        let transport = VirtualTransport::new().with_device(device.clone());
        let opts = options(1000);
        let mut session = transport.open("a", &opts).await.unwrap();

        let response = session.send(&apdu(&[0xab, 0x01]), &[0x9000]).await.unwrap();
        assert_eq!(response, vec![0xab, 0x01, 0x90, 0x00]);
        assert_eq!(device.exchanges().await, vec![apdu(&[0xab, 0x01])]);
    }

    #[tokio::test]
    async fn scripted_status_word_checked() {
        let transport = VirtualTransport::new().with_device(VirtualDevice::scripted(
            "a",
            vec![vec![0x69, 0x85], vec![0x69, 0x85]],
        ));
        let opts = options(1000);
        let mut session = transport.open("a", &opts).await.unwrap();

        let err = session.send(&apdu(&[]), &[0x9000]).await.unwrap_err();
        assert!(matches!(err, RelayError::StatusWord { code: 0x6985 }));

        let ok = session.send(&apdu(&[]), &[0x9000, 0x6985]).await.unwrap();
        assert_eq!(ok, vec![0x69, 0x85]);

        let err = session.send(&apdu(&[]), &[0x9000]).await.unwrap_err();
        assert_eq!(err.code(), "device_error");
    }

    #[tokio::test]
    async fn exchange_timeout() {
        let transport = VirtualTransport::new()
            .with_device(VirtualDevice::echo("slow").with_latency(Duration::from_millis(200)));
        let opts = options(10);
        let mut session = transport.open("slow", &opts).await.unwrap();
        let err = session.send(&apdu(&[1]), &[0x9000]).await.unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
    }

    #[tokio::test]
    async fn busy_until_closed() {
        let device = VirtualDevice::echo("a");
        let transport = VirtualTransport::new().with_device(device.clone());
        let opts = options(1000);

        let mut first = transport.open("a", &opts).await.unwrap();
        assert!(device.is_open());
        assert!(transport.open("a", &opts).await.is_err());

        first.close().await.unwrap();
        assert!(!device.is_open());
        assert!(first.close().await.is_err());
        assert!(first.send(&apdu(&[]), &[0x9000]).await.is_err());

        let second = transport.open("a", &opts).await.unwrap();
        drop(second);
        assert!(!device.is_open());
    }

    #[tokio::test]
    async fn unknown_path() {
        let transport = VirtualTransport::new();
        let opts = options(1000);
        let err = transport.open("missing", &opts).await.err().unwrap();
        assert_eq!(err.to_string(), "device error: device not found: missing");
    }
}
