//! # Modbus Emulator Error Handling
//!
//! Error types shared by every stage of the emulator: reading a capture,
//! decoding captured frames, correlating transactions, replaying them and
//! serving the emulated register banks.
//!
//! ## Error Categories
//!
//! ### Setup Errors (fatal)
//! - **Capture Errors**: the capture file cannot be opened or filtered
//! - **Connection Errors**: a listener cannot be bound
//! - **Configuration Errors**: the configuration is missing or malformed
//! - **I/O Errors**: file system or socket failures during start-up
//!
//! ### Stream Errors (skip the event, keep the stream alive)
//! - **Frame Errors**: a captured payload is too short or carries an
//!   unknown protocol identifier
//! - **Invalid Function**: a function code outside the supported set
//! - **Invalid Address**: `address + quantity` leaves the 0..65535 range
//! - **Correlation Errors**: a response without a recorded request
//!
//! ### Control Errors
//! - **Server Errors**: unknown server id, rewind outside the history, or a
//!   server that is no longer playing
//!
//! ## Usage
//!
//! ```rust
//! use modbus_emulator::{ModbusError, ModbusResult};
//!
//! fn handle(result: ModbusResult<()>) {
//!     match result {
//!         Ok(()) => {}
//!         Err(error) if error.is_fatal() => eprintln!("setup failed: {}", error),
//!         Err(error) => eprintln!("skipping event: {}", error),
//!     }
//! }
//! ```

use thiserror::Error;

/// Result type alias for emulator operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Emulator error types
///
/// Each variant carries enough context to be logged on its own; the replay
/// and correlation loops log stream errors and move on to the next event.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (files, sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Listener bind or accept failures
    ///
    /// # Examples
    /// - Emulate socket already in use
    /// - Permission denied on a privileged port
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Capture source failures
    ///
    /// Raised when the capture file cannot be opened, the BPF filter cannot
    /// be applied, or the link type carries no IP payload we can slice.
    #[error("Capture error: {message}")]
    Capture { message: String },

    /// Frame decoding errors
    ///
    /// The frame is shorter than its function code requires, or the MBAP
    /// protocol identifier is not the reserved Modbus value.
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Unsupported function code
    #[error("Invalid function code: {code}")]
    InvalidFunction { code: u8 },

    /// Address range leaves the register bank
    ///
    /// `start + count` must not exceed 65536.
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Data that cannot be normalized
    ///
    /// # Examples
    /// - Response payload shorter than the requested quantity
    /// - Handshake mixing TCP and RTU-over-TCP halves
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// Response without a matching request
    #[error("Correlation error: {message}")]
    Correlation { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Control operations on the server registry
    #[error("Server {server_id}: {message}")]
    Server { server_id: usize, message: String },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new capture error
    pub fn capture<S: Into<String>>(message: S) -> Self {
        Self::Capture { message: message.into() }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a correlation error
    pub fn correlation<S: Into<String>>(message: S) -> Self {
        Self::Correlation { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a server control error
    pub fn server<S: Into<String>>(server_id: usize, message: S) -> Self {
        Self::Server { server_id, message: message.into() }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error stops start-up
    ///
    /// Setup failures are reported immediately and never retried. Every
    /// other error concerns a single frame or event, which is skipped.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use modbus_emulator::ModbusError;
    ///
    /// assert!(ModbusError::capture("no such file").is_fatal());
    /// assert!(!ModbusError::frame("too short").is_fatal());
    /// ```
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Connection { .. }
                | Self::Capture { .. }
                | Self::Configuration { .. }
        )
    }

    /// Check if the error comes from decoding or correlating captured frames
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::Frame { .. }
                | Self::InvalidFunction { .. }
                | Self::InvalidAddress { .. }
                | Self::InvalidData { .. }
                | Self::Correlation { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from libpcap errors
impl From<pcap::Error> for ModbusError {
    fn from(err: pcap::Error) -> Self {
        Self::capture(err.to_string())
    }
}

/// Convert from TOML parse errors
impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(format!("TOML parse error: {}", err))
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_data(format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = ModbusError::capture("cannot open dump.pcapng");
        assert!(err.is_fatal());
        assert!(!err.is_decode_error());

        let err = ModbusError::frame("payload shorter than 8 bytes");
        assert!(!err.is_fatal());
        assert!(err.is_decode_error());

        let err = ModbusError::server(3, "rewind index out of range");
        assert!(!err.is_fatal());
        assert!(!err.is_decode_error());
    }

    #[test]
    fn test_error_display() {
        let err = ModbusError::invalid_address(65530, 10);
        let msg = format!("{}", err);
        assert!(msg.contains("65530"));
        assert!(msg.contains("10"));

        let err = ModbusError::server(2, "not working");
        assert_eq!(format!("{}", err), "Server 2: not working");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use");
        let err: ModbusError = io.into();
        assert!(matches!(err, ModbusError::Io { .. }));
        assert!(err.is_fatal());
    }
}
