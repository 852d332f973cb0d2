//! Device transports available to the relay binary.

pub mod virtual_device;

pub use virtual_device::{VirtualDevice, VirtualTransport};

/// Build the transport described by the device section of the config:
/// one echoing virtual device per configured path.
pub fn virtual_transport(supported: bool, paths: &[String]) -> VirtualTransport {
    let base = if supported {
        VirtualTransport::new()
    } else {
        VirtualTransport::unsupported()
    };
    paths
        .iter()
        .fold(base, |t, path| t.with_device(VirtualDevice::echo(path.clone())))
}
