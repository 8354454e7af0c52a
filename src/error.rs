//! This module defines the custom error types used throughout the
//! `victron-ess` library.
//!
//! Protocol engines and decoders return these errors; the binary maps them
//! into `anyhow` contexts. Frame-level failures in the decoders are expected
//! during normal operation (line noise, partial reads) and are handled by
//! dropping the frame and resynchronizing.

/// Represents errors raised by the serial protocol engines and decoders.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A serial transport failure. The owning link closes the port; the next
    /// operation reopens it.
    #[error("serial port failed: {0}")]
    Io(#[from] std::io::Error),

    /// No complete frame arrived within the protocol receive timeout.
    #[error("receive timeout after {0:?}")]
    Timeout(std::time::Duration),

    /// An unexpected response byte, a length mismatch or a bad frame
    /// checksum.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The meter frame failed its HDLC check or produced implausible
    /// plaintext after decryption.
    #[error("cannot decode meter frame: {0}")]
    Decrypt(String),

    /// A required configuration key is missing or cannot be parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// Publishing to the message bus failed. Not retried; the next reading
    /// carries full state.
    #[error("bus publish failed: {0}")]
    Bus(String),

    /// ESS setpoint writes are refused until the assistant scan has located
    /// the setpoint RAM slot.
    #[error("ess assistant not scanned, refusing RAM write")]
    AssistantNotScanned,
}

impl Error {
    /// Shorthand used by the receive path and response validators.
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }
}
