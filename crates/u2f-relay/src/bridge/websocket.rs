//! WebSocket host bridge using tokio-tungstenite.
//!
//! Stands in for the hosting frame when the relay runs natively. Each
//! WebSocket connection gets its own [`Relay`]; the `Origin` header of the
//! upgrade request becomes the origin of every system message. Text frames
//! are JSON (bare `init` / `close` words are accepted too):
//!
//! - `"init"` creates a message channel and transfers one end to the relay.
//!   Everything the relay posts on it (`"ready"`, responses) is written back
//!   to the socket.
//! - `"close"` is delivered as the teardown signal.
//! - Anything else goes over the active channel, or is delivered as a system
//!   message when no channel is active.

use crate::relay::{Relay, RelayHandle, RelayOptions};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use u2f_relay_core::{
    DeviceTransport, MessageChannel, MessagePort, RelayError, RelayResult, SystemMessage,
    BEGIN_SIGNAL, END_SIGNAL,
};

/// Origin used when the upgrade request carries no `Origin` header.
const OPAQUE_ORIGIN: &str = "null";

/// Bind the WebSocket listener.
pub async fn bind(addr: &str) -> RelayResult<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| RelayError::Channel(format!("WS bind failed: {e}")))?;
    info!(addr = %addr, "WebSocket bridge listening");
    Ok(listener)
}

/// Accept connections forever, running one relay per connection.
pub async fn serve(
    listener: TcpListener,
    transport: Arc<dyn DeviceTransport>,
    options: RelayOptions,
) -> RelayResult<()> {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let transport = transport.clone();
                let options = options.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, remote, transport, options).await {
                        warn!(remote = %remote, error = %e, "frame connection ended with error");
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "TCP accept failed");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    transport: Arc<dyn DeviceTransport>,
    options: RelayOptions,
) -> RelayResult<()> {
    let mut origin = OPAQUE_ORIGIN.to_string();
    let capture_origin = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(value) = req.headers().get("origin").and_then(|v| v.to_str().ok()) {
            origin = value.to_string();
        }
        Ok(resp)
    };
    let ws = tokio_tungstenite::accept_hdr_async(stream, capture_origin)
        .await
        .map_err(|e| RelayError::Channel(format!("WebSocket handshake failed: {e}")))?;

    info!(remote = %remote, origin = %origin, "frame connected");

    let relay = Relay::new(transport, options).spawn(16);
    let (mut sink, mut stream) = ws.split();
    let mut page: Option<MessagePort> = None;

    let result = loop {
        tokio::select! {
            outgoing = next_page_message(&mut page) => match outgoing {
                Some(value) => {
                    if let Err(e) = sink.send(Message::Text(value.to_string().into())).await {
                        break Err(RelayError::Channel(format!("WS send failed: {e}")));
                    }
                }
                None => {
                    debug!(remote = %remote, "relay closed the page port");
                    page = None;
                }
            },

            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = forward_text(&text, &origin, &relay, &mut page).await {
                        break Err(e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => break Err(RelayError::Channel(format!("WS recv failed: {e}"))),
            },
        }
    };

    relay.shutdown().await;
    info!(remote = %remote, "frame disconnected");
    result
}

/// Route one text frame from the page.
async fn forward_text(
    text: &str,
    origin: &str,
    relay: &RelayHandle,
    page: &mut Option<MessagePort>,
) -> RelayResult<()> {
    let value = parse_frame(text);

    match value.as_str() {
        Some(BEGIN_SIGNAL) => {
            let (page_port, frame_port) = MessageChannel::new();
            relay
                .deliver(SystemMessage::new(origin, value).with_port(frame_port))
                .await?;
            *page = Some(page_port);
        }
        Some(END_SIGNAL) => relay.deliver(SystemMessage::new(origin, value)).await?,
        _ => match page {
            Some(port) => {
                if let Err(e) = port.post_message(value) {
                    warn!(error = %e, "dropping page message");
                }
            }
            None => relay.deliver(SystemMessage::new(origin, value)).await?,
        },
    }
    Ok(())
}

/// JSON if it parses, otherwise the raw text as a string value.
fn parse_frame(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.trim().to_string()))
}

async fn next_page_message(page: &mut Option<MessagePort>) -> Option<Value> {
    match page {
        Some(port) => port.recv().await,
        None => std::future::pending().await,
    }
}
