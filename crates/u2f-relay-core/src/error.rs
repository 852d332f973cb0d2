use thiserror::Error;

/// Errors produced by the relay protocol layer and the device transport.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("USB Error: No device found.")]
    NoDevice,

    #[error("no device session is open")]
    NoSession,

    #[error("hex error: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("device error: {0}")]
    Device(String),

    #[error("unexpected status word 0x{code:04x}")]
    StatusWord { code: u16 },

    #[error("timeout")]
    Timeout,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("origin denied: {0}")]
    OriginDenied(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Stable machine-readable code carried in error responses.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidRequest(_) => "invalid_request",
            RelayError::UnknownMethod(_) => "unknown_method",
            RelayError::NoDevice => "no_device",
            RelayError::NoSession => "no_session",
            RelayError::Hex(_) => "invalid_hex",
            RelayError::Device(_) => "device_error",
            RelayError::StatusWord { .. } => "status_word",
            RelayError::Timeout => "timeout",
            RelayError::Channel(_) => "channel_error",
            RelayError::OriginDenied(_) => "origin_denied",
            RelayError::Config(_) => "config_error",
            RelayError::Io(_) => "io_error",
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_device_message_is_human_readable() {
        assert_eq!(RelayError::NoDevice.to_string(), "USB Error: No device found.");
        assert_eq!(RelayError::NoDevice.code(), "no_device");
    }

    #[test]
    fn status_word_is_formatted_as_hex() {
        let err = RelayError::StatusWord { code: 0x6985 };
        assert_eq!(err.to_string(), "unexpected status word 0x6985");
    }

    #[test]
    fn origin_denied_code() {
        let err = RelayError::OriginDenied("https://evil.example".into());
        assert_eq!(err.code(), "origin_denied");
        assert_eq!(err.to_string(), "origin denied: https://evil.example");
    }

    #[test]
    fn hex_errors_convert() {
        let err: RelayError = hex::decode("zz").unwrap_err().into();
        assert_eq!(err.code(), "invalid_hex");
    }
}
