//! Request dispatch and the device session slot.
//!
//! A single worker task owns the [`Dispatcher`] and drains a bounded job
//! queue, so at most one device call is in flight per relay. Every request
//! produces exactly one [`Response`], posted on the endpoint it arrived on.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use u2f_relay_core::{
    decode_hex, encode_hex, Apdu, Call, DeviceSession, DeviceTransport, OpenArgs, PortSender,
    RelayError, RelayResult, Request, Response, SendArgs, SessionOptions,
};

/// Work queued for the dispatcher.
#[derive(Debug)]
pub enum Job {
    /// A raw request from the endpoint of the given generation.
    Request {
        generation: u64,
        message: Value,
        reply: PortSender,
    },
    /// The endpoint was torn down: close the device session and drop any
    /// queued requests from generations before `generation`.
    Release { generation: u64 },
}

/// Translates requests into device transport calls.
pub struct Dispatcher {
    /// Device access shared with the rest of the process.
    transport: Arc<dyn DeviceTransport>,
    /// Fills in `open` arguments the page leaves out.
    defaults: SessionOptions,
    /// The session opened by the last successful `open`, if any.
    session: Option<Box<dyn DeviceSession>>,
    /// Newest released generation; requests tagged older are dropped.
    generation: u64,
}

impl Dispatcher {
    /// Create a dispatcher with no open session.
    ///
    /// `defaults` fill in any `open` argument the page leaves out.
    pub fn new(transport: Arc<dyn DeviceTransport>, defaults: SessionOptions) -> Self {
        Self {
            transport,
            defaults,
            session: None,
            generation: 0,
        }
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Handle one raw request and build its response. Never fails: errors
    /// become error responses under the request's id.
    pub async fn handle(&mut self, message: Value) -> Response {
        let request = match Request::parse(message) {
            Ok(r) => r,
            Err((id, e)) => {
                warn!(id = %id, error = %e, "rejected request");
                return Response::err(id, &e);
            }
        };

        let method = request.call.method();
        debug!(id = %request.id, method, "dispatching request");

        match self.call(request.call).await {
            Ok(result) => Response::ok(request.id, result),
            Err(e) => {
                warn!(id = %request.id, method, error = %e, "request failed");
                Response::err(request.id, &e)
            }
        }
    }

    async fn call(&mut self, call: Call) -> RelayResult<Value> {
        match call {
            Call::IsSupported => Ok(Value::Bool(self.transport.is_supported().await?)),
            Call::List => Ok(Value::from(self.transport.list().await?)),
            Call::Open(args) => {
                self.open(args).await?;
                Ok(Value::Null)
            }
            Call::Close => {
                self.close().await?;
                Ok(Value::Null)
            }
            Call::Send(args) => self.send(args).await.map(Value::String),
        }
    }

    async fn open(&mut self, args: OpenArgs) -> RelayResult<()> {
        self.release().await;

        let path = match args.path {
            Some(path) => path,
            None => self
                .transport
                .list()
                .await?
                .into_iter()
                .next()
                .ok_or(RelayError::NoDevice)?,
        };

        let options = SessionOptions {
            debug: args.is_debug.unwrap_or(self.defaults.debug),
            scramble_key: args
                .scramble_key
                .unwrap_or_else(|| self.defaults.scramble_key.clone()),
            exchange_timeout: args
                .timeout
                .map(Duration::from_millis)
                .unwrap_or(self.defaults.exchange_timeout),
        };

        let session = self.transport.open(&path, &options).await?;
        info!(path = %path, debug = options.debug, "device session opened");
        self.session = Some(session);
        Ok(())
    }

    async fn close(&mut self) -> RelayResult<()> {
        let mut session = self.session.take().ok_or(RelayError::NoSession)?;
        session.close().await?;
        info!("device session closed");
        Ok(())
    }

    async fn send(&mut self, args: SendArgs) -> RelayResult<String> {
        let session = self.session.as_mut().ok_or(RelayError::NoSession)?;
        let apdu = Apdu {
            cla: args.cla,
            ins: args.ins,
            p1: args.p1,
            p2: args.p2,
            data: decode_hex(&args.data)?,
        };
        let response = session.send(&apdu, &args.status_list).await?;
        Ok(encode_hex(&response))
    }

    /// Close the open session, if any. Close failures are logged only.
    pub async fn release(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.close().await {
                Ok(()) => info!("device session released"),
                Err(e) => warn!(error = %e, "failed to close device session"),
            }
        }
    }

    async fn run(mut self, mut jobs: mpsc::Receiver<Job>) {
        while let Some(job) = jobs.recv().await {
            match job {
                Job::Request {
                    generation,
                    message,
                    reply,
                } => {
                    if generation < self.generation {
                        debug!(generation, "dropping request for a closed endpoint");
                        continue;
                    }
                    let response = self.handle(message).await;
                    if reply.post_message(response.to_value()).is_err() {
                        warn!(id = %response.id, "endpoint closed before response was posted");
                    }
                }
                Job::Release { generation } => {
                    self.generation = self.generation.max(generation);
                    self.release().await;
                }
            }
        }
        self.release().await;
        debug!("dispatcher stopped");
    }
}

/// Sending side of the dispatcher queue.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    jobs: mpsc::Sender<Job>,
}

impl DispatcherHandle {
    /// Queue a request from the endpoint of `generation`.
    pub async fn submit(&self, generation: u64, message: Value, reply: PortSender) -> RelayResult<()> {
        self.jobs
            .send(Job::Request {
                generation,
                message,
                reply,
            })
            .await
            .map_err(|_| RelayError::Channel("dispatcher stopped".into()))
    }

    /// Queue a session release; requests from older generations are dropped.
    pub async fn release(&self, generation: u64) -> RelayResult<()> {
        self.jobs
            .send(Job::Release { generation })
            .await
            .map_err(|_| RelayError::Channel("dispatcher stopped".into()))
    }
}

/// Spawn the worker task. The worker exits once every handle is dropped.
///
/// # Arguments
///
/// * `dispatcher` - Owned by the worker for its whole life.
/// * `queue_depth` - Capacity of the job queue (at least 1).
pub fn spawn(dispatcher: Dispatcher, queue_depth: usize) -> (DispatcherHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let task = tokio::spawn(dispatcher.run(rx));
    (DispatcherHandle { jobs: tx }, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{VirtualDevice, VirtualTransport};
    use serde_json::json;
    use u2f_relay_core::MessageChannel;

    fn defaults() -> SessionOptions {
        SessionOptions {
            debug: false,
            scramble_key: "ONT".into(),
            exchange_timeout: Duration::from_millis(500),
        }
    }

    fn dispatcher(transport: VirtualTransport) -> Dispatcher {
        Dispatcher::new(Arc::new(transport), defaults())
    }

    #[tokio::test]
    async fn is_supported() {
        let mut d = dispatcher(VirtualTransport::new());
        let resp = d.handle(json!({"id": "1", "method": "isSupported"})).await;
        assert_eq!(resp.to_value(), json!({"id": "1", "result": true}));

        let mut d = dispatcher(VirtualTransport::unsupported());
        let resp = d.handle(json!({"id": "1", "method": "isSupported"})).await;
        assert_eq!(resp.to_value(), json!({"id": "1", "result": false}));
    }

    #[tokio::test]
    async fn list_paths() {
        let mut d = dispatcher(
            VirtualTransport::new()
                .with_device(VirtualDevice::echo("hid:1"))
                .with_device(VirtualDevice::echo("hid:2")),
        );
        let resp = d.handle(json!({"id": 3, "method": "list"})).await;
        assert_eq!(resp.to_value(), json!({"id": 3, "result": ["hid:1", "hid:2"]}));
    }

    #[tokio::test]
    async fn open_without_devices_reports_diagnostic() {
        let mut d = dispatcher(VirtualTransport::new());
        let resp = d.handle(json!({"id": "o", "method": "open"})).await;
        assert_eq!(
            resp.to_value(),
            json!({"id": "o", "error": {"code": "no_device", "message": "USB Error: No device found."}})
        );
        assert!(!d.has_session());
    }

    #[tokio::test]
    async fn open_picks_first_device() {
        let first = VirtualDevice::echo("hid:1");
        let second = VirtualDevice::echo("hid:2");
        let mut d = dispatcher(
            VirtualTransport::new()
                .with_device(first.clone())
                .with_device(second.clone()),
        );
        let resp = d.handle(json!({"id": "o", "method": "open"})).await;
        assert_eq!(resp.to_value(), json!({"id": "o", "result": null}));
        assert!(first.is_open());
        assert!(!second.is_open());
    }

    #[tokio::test]
    async fn open_explicit_path_and_reopen() {
        let first = VirtualDevice::echo("hid:1");
        let second = VirtualDevice::echo("hid:2");
        let mut d = dispatcher(
            VirtualTransport::new()
                .with_device(first.clone())
                .with_device(second.clone()),
        );
        let resp = d
            .handle(json!({
                "id": 1, "method": "open", "path": "hid:2",
                "isDebug": true, "scrambleKey": "w0w", "timeout": 1000
            }))
            .await;
        assert!(resp.is_ok());
        assert!(second.is_open());

        // Re-opening releases the previous session first.
        let resp = d.handle(json!({"id": 2, "method": "open", "path": "hid:1"})).await;
        assert!(resp.is_ok());
        assert!(first.is_open());
        assert!(!second.is_open());
    }

    #[tokio::test]
    async fn send_without_session_fails_fast() {
        let mut d = dispatcher(VirtualTransport::new().with_device(VirtualDevice::echo("a")));
        let resp = d
            .handle(json!({
                "id": "s", "method": "send", "cla": 0, "ins": 1, "p1": 0, "p2": 0,
                "data": "ab01", "statusList": [0x9000]
            }))
            .await;
        assert_eq!(resp.error.unwrap().code, "no_session");
    }

    #[tokio::test]
    async fn send_hex_round_trip() {
        let device = VirtualDevice::scripted("a", vec![vec![0x90, 0x00]]);
        let mut d = dispatcher(VirtualTransport::new().with_device(device.clone()));
        assert!(d.handle(json!({"id": "1", "method": "open"})).await.is_ok());

        let resp = d
            .handle(json!({
                "id": "2", "method": "send", "cla": 0, "ins": 1, "p1": 0, "p2": 0,
                "data": "AB01", "statusList": [0x9000]
            }))
            .await;
        assert_eq!(resp.to_value(), json!({"id": "2", "result": "9000"}));

        let sent = device.exchanges().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data, vec![0xab, 0x01]);
        assert_eq!((sent[0].cla, sent[0].ins), (0, 1));
    }

    #[tokio::test]
    async fn send_without_data_is_rejected() {
        let device = VirtualDevice::echo("a");
        let mut d = dispatcher(VirtualTransport::new().with_device(device.clone()));
        assert!(d.handle(json!({"id": 1, "method": "open"})).await.is_ok());

        let resp = d
            .handle(json!({"id": 2, "method": "send", "cla": 0, "ins": 1, "p1": 0, "p2": 0}))
            .await;
        assert_eq!(resp.id, json!(2));
        assert_eq!(resp.error.unwrap().code, "invalid_request");
        assert!(device.exchanges().await.is_empty());
    }

    #[tokio::test]
    async fn send_bad_hex() {
        let mut d = dispatcher(VirtualTransport::new().with_device(VirtualDevice::echo("a")));
        d.handle(json!({"id": 1, "method": "open"})).await;
        let resp = d
            .handle(json!({"id": 2, "method": "send", "cla": 0, "ins": 0, "p1": 0, "p2": 0, "data": "xyz"}))
            .await;
        assert_eq!(resp.error.unwrap().code, "invalid_hex");
    }

    #[tokio::test]
    async fn send_rejected_status_word() {
        let device = VirtualDevice::scripted("a", vec![vec![0x6a, 0x80]]);
        let mut d = dispatcher(VirtualTransport::new().with_device(device));
        d.handle(json!({"id": 1, "method": "open"})).await;
        let resp = d
            .handle(json!({"id": 2, "method": "send", "cla": 0, "ins": 0, "p1": 0, "p2": 0, "data": ""}))
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, "status_word");
        assert_eq!(err.message, "unexpected status word 0x6a80");
    }

    #[tokio::test]
    async fn close_twice() {
        let device = VirtualDevice::echo("a");
        let mut d = dispatcher(VirtualTransport::new().with_device(device.clone()));
        d.handle(json!({"id": 1, "method": "open"})).await;

        let resp = d.handle(json!({"id": 2, "method": "close"})).await;
        assert_eq!(resp.to_value(), json!({"id": 2, "result": null}));
        assert!(!device.is_open());

        let resp = d.handle(json!({"id": 3, "method": "close"})).await;
        assert_eq!(resp.error.unwrap().code, "no_session");
    }

    #[tokio::test]
    async fn unknown_method_is_an_explicit_error() {
        let mut d = dispatcher(VirtualTransport::new());
        let resp = d.handle(json!({"id": "u", "method": "format"})).await;
        assert_eq!(
            resp.to_value(),
            json!({"id": "u", "error": {"code": "unknown_method", "message": "unknown method: format"}})
        );
    }

    #[tokio::test]
    async fn worker_serializes_and_replies_in_order() {
        let device = VirtualDevice::echo("a").with_latency(Duration::from_millis(20));
        let d = dispatcher(VirtualTransport::new().with_device(device.clone()));
        let (handle, task) = spawn(d, 8);
        let (mut page, frame) = MessageChannel::new();
        let (reply, _rx) = frame.split();

        handle.submit(0, json!({"id": 0, "method": "open"}), reply.clone()).await.unwrap();
        for i in 1..=3u8 {
            let msg = json!({
                "id": i, "method": "send", "cla": 0, "ins": i, "p1": 0, "p2": 0, "data": format!("{i:02x}")
            });
            handle.submit(0, msg, reply.clone()).await.unwrap();
        }

        assert_eq!(page.recv().await.unwrap(), json!({"id": 0, "result": null}));
        for i in 1..=3u8 {
            assert_eq!(
                page.recv().await.unwrap(),
                json!({"id": i, "result": format!("{i:02x}9000")})
            );
        }
        let ins: Vec<u8> = device.exchanges().await.iter().map(|a| a.ins).collect();
        assert_eq!(ins, vec![1, 2, 3]);

        drop(handle);
        task.await.unwrap();
        assert!(!device.is_open());
    }

    #[tokio::test]
    async fn release_drops_stale_requests() {
        let device = VirtualDevice::echo("a");
        let d = dispatcher(VirtualTransport::new().with_device(device.clone()));
        let (handle, task) = spawn(d, 8);
        let (mut page, frame) = MessageChannel::new();
        let (reply, _rx) = frame.split();

        handle.submit(0, json!({"id": 1, "method": "open"}), reply.clone()).await.unwrap();
        handle.release(1).await.unwrap();
        handle.submit(0, json!({"id": 2, "method": "isSupported"}), reply.clone()).await.unwrap();
        handle.submit(1, json!({"id": 3, "method": "isSupported"}), reply.clone()).await.unwrap();

        assert_eq!(page.recv().await.unwrap(), json!({"id": 1, "result": null}));
        assert_eq!(page.recv().await.unwrap(), json!({"id": 3, "result": true}));
        assert!(!device.is_open());

        drop(handle);
        task.await.unwrap();
    }
}
