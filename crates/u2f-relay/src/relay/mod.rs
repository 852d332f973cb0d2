//! The relay: frame-level handshake and teardown, plus request forwarding.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized --run()--> AwaitingHandshake --"init"+port--> Active
//!                                  ^                             |
//!                                  +---- "close" / port closed --+
//! ```
//!
//! The control task owns the active endpoint. Requests read from it are
//! queued on the [`dispatcher`], which owns the device session and replies
//! on the same endpoint.

pub mod dispatcher;

pub use dispatcher::{Dispatcher, DispatcherHandle};

use crate::policy::{OriginPolicy, OriginPolicyEnforcer};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use u2f_relay_core::{
    DeviceTransport, PortReceiver, PortSender, RelayError, RelayResult, SessionOptions, Signal,
    SystemMessage, READY_SIGNAL,
};

/// Observable relay lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Uninitialized,
    AwaitingHandshake,
    Active,
}

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Which page origins may hand the relay a port.
    pub policy: OriginPolicy,
    /// Capacity of the dispatcher queue.
    pub queue_depth: usize,
    /// Applied to `open` requests that leave fields out.
    pub session_defaults: SessionOptions,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            policy: OriginPolicy::default(),
            queue_depth: 32,
            session_defaults: SessionOptions {
                debug: true,
                scramble_key: "ONT".to_string(),
                exchange_timeout: Duration::from_millis(5000),
            },
        }
    }
}

/// The endpoint adopted during the last handshake.
struct ActiveEndpoint {
    origin: String,
    tx: PortSender,
    rx: PortReceiver,
}

/// Bridges one page message channel to a device transport.
pub struct Relay {
    transport: Arc<dyn DeviceTransport>,
    options: RelayOptions,
    enforcer: OriginPolicyEnforcer,
    endpoint: Option<ActiveEndpoint>,
    /// Bumped on every teardown so queued requests of a closed endpoint are
    /// dropped instead of reaching the device.
    generation: u64,
    phase: watch::Sender<RelayPhase>,
}

impl Relay {
    pub fn new(transport: Arc<dyn DeviceTransport>, options: RelayOptions) -> Self {
        let enforcer = OriginPolicyEnforcer::new(&options.policy);
        let (phase, _) = watch::channel(RelayPhase::Uninitialized);
        Self {
            transport,
            options,
            enforcer,
            endpoint: None,
            generation: 0,
            phase,
        }
    }

    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    /// Run on a background task, returning a handle for delivering system
    /// messages.
    pub fn spawn(self, inbox_capacity: usize) -> RelayHandle {
        let (inbox, rx) = mpsc::channel(inbox_capacity.max(1));
        let phase = self.phase.subscribe();
        let task = tokio::spawn(self.run(rx));
        RelayHandle { inbox, phase, task }
    }

    /// Process system messages until the inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<SystemMessage>) {
        let dispatcher = Dispatcher::new(
            self.transport.clone(),
            self.options.session_defaults.clone(),
        );
        let (jobs, worker) = dispatcher::spawn(dispatcher, self.options.queue_depth);

        self.set_phase(RelayPhase::AwaitingHandshake);
        info!("relay awaiting handshake");

        loop {
            tokio::select! {
                message = inbox.recv() => match message {
                    Some(message) => self.handle_system(message, &jobs).await,
                    None => {
                        debug!("system inbox closed");
                        break;
                    }
                },

                incoming = next_request(&mut self.endpoint) => match incoming {
                    Some((message, reply)) => {
                        debug!(message = %message, "message from page");
                        if let Err(e) = jobs.submit(self.generation, message, reply).await {
                            error!(error = %e, "failed to queue request");
                        }
                    }
                    None => {
                        info!("page closed the message port");
                        self.teardown(&jobs).await;
                    }
                },
            }
        }

        self.teardown(&jobs).await;
        drop(jobs);
        if let Err(e) = worker.await {
            error!(error = %e, "dispatcher task failed");
        }
        info!("relay stopped");
    }

    async fn handle_system(&mut self, message: SystemMessage, jobs: &DispatcherHandle) {
        match message.signal() {
            Signal::Begin => self.handshake(message, jobs).await,
            Signal::End => self.end(&message.origin, jobs).await,
            Signal::Unrecognized => {
                error!(
                    origin = %message.origin,
                    data = %message.data,
                    "relay received non-init/close message"
                );
            }
        }
    }

    async fn handshake(&mut self, mut message: SystemMessage, jobs: &DispatcherHandle) {
        if let Err(e) = self.enforcer.check(&message.origin) {
            warn!(origin = %message.origin, error = %e, "handshake rejected");
            return;
        }

        if self.endpoint.is_some() {
            info!(origin = %message.origin, "replacing active endpoint");
            self.teardown(jobs).await;
        }

        let (tx, rx) = message.ports.remove(0).split();
        if let Err(e) = tx.post_message(Value::from(READY_SIGNAL)) {
            warn!(origin = %message.origin, error = %e, "port closed during handshake");
            return;
        }

        info!(origin = %message.origin, "handshake complete");
        self.endpoint = Some(ActiveEndpoint {
            origin: message.origin,
            tx,
            rx,
        });
        self.set_phase(RelayPhase::Active);
    }

    async fn end(&mut self, origin: &str, jobs: &DispatcherHandle) {
        let active_origin = self.endpoint.as_ref().map(|e| e.origin.clone());
        match active_origin {
            None => warn!(origin = %origin, "close received with no active endpoint"),
            Some(active) if active != origin => {
                let e = RelayError::OriginDenied(origin.to_string());
                warn!(active_origin = %active, error = %e, "close from foreign origin ignored");
            }
            Some(_) => {
                self.teardown(jobs).await;
                info!(origin = %origin, "relay torn down");
            }
        }
    }

    /// Close the active endpoint and release the device session.
    async fn teardown(&mut self, jobs: &DispatcherHandle) {
        if let Some(endpoint) = self.endpoint.take() {
            drop(endpoint);
            self.generation += 1;
            if let Err(e) = jobs.release(self.generation).await {
                error!(error = %e, "failed to queue session release");
            }
        }
        self.set_phase(RelayPhase::AwaitingHandshake);
    }

    fn set_phase(&self, phase: RelayPhase) {
        self.phase.send_replace(phase);
    }
}

/// Next request from the active endpoint, with the sender to reply on.
/// Pends forever while no endpoint is active.
async fn next_request(endpoint: &mut Option<ActiveEndpoint>) -> Option<(Value, PortSender)> {
    match endpoint {
        Some(endpoint) => {
            let message = endpoint.rx.recv().await?;
            Some((message, endpoint.tx.clone()))
        }
        None => std::future::pending().await,
    }
}

/// Handle to a spawned [`Relay`].
pub struct RelayHandle {
    inbox: mpsc::Sender<SystemMessage>,
    phase: watch::Receiver<RelayPhase>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Deliver a system message to the relay.
    pub async fn deliver(&self, message: SystemMessage) -> RelayResult<()> {
        self.inbox
            .send(message)
            .await
            .map_err(|_| RelayError::Channel("relay stopped".into()))
    }

    pub fn phase(&self) -> RelayPhase {
        *self.phase.borrow()
    }

    /// Wait until the relay reaches `phase`.
    pub async fn wait_for(&self, phase: RelayPhase) -> RelayResult<()> {
        let mut rx = self.phase.clone();
        rx.wait_for(|p| *p == phase)
            .await
            .map(|_| ())
            .map_err(|_| RelayError::Channel("relay stopped".into()))
    }

    /// Close the inbox and wait for the relay to finish.
    pub async fn shutdown(self) {
        drop(self.inbox);
        if let Err(e) = self.task.await {
            error!(error = %e, "relay task failed");
        }
    }
}
