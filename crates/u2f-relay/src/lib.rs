//! u2f-relay: bridges a hosting page's message channel to a U2F device
//! transport.
//!
//! The page hands the relay one end of a message channel with an `init`
//! signal; the relay answers `"ready"` and then turns each `{id, method, ...}`
//! request into a call on a [`DeviceTransport`](u2f_relay_core::DeviceTransport),
//! replying with `{id, result}` or `{id, error}`.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use u2f_relay::device::{VirtualDevice, VirtualTransport};
//! use u2f_relay::relay::{Relay, RelayOptions};
//! use u2f_relay_core::{MessageChannel, SystemMessage};
//!
//! # async fn example() -> u2f_relay_core::RelayResult<()> {
//! let transport = VirtualTransport::new().with_device(VirtualDevice::echo("virtual:0"));
//! let relay = Relay::new(Arc::new(transport), RelayOptions::default()).spawn(16);
//!
//! let (mut page, frame) = MessageChannel::new();
//! relay
//!     .deliver(SystemMessage::new("https://wallet.example", json!("init")).with_port(frame))
//!     .await?;
//! assert_eq!(page.recv().await, Some(json!("ready")));
//!
//! page.post_message(json!({"id": 1, "method": "isSupported"}))?;
//! let reply = page.recv().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod config;
pub mod device;
pub mod policy;
pub mod relay;

pub use config::{ConfigOverrides, RelayConfig};
pub use policy::{OriginPolicy, OriginPolicyEnforcer};
pub use relay::{Relay, RelayHandle, RelayOptions, RelayPhase};

// Re-export core error types for convenience.
pub use u2f_relay_core::{RelayError, RelayResult};
