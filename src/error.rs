//! Crate-wide error taxonomy.

use thiserror::Error;

/// Everything that can go wrong while running the discovery/session core.
#[derive(Debug, Error)]
pub enum PortsError {
    #[error("connection code must be 8 symbols from the alphabet")]
    InvalidCode,

    #[error("datagram has the wrong size for its role")]
    BadSize,

    #[error("CRC-32 mismatch, datagram is corrupt")]
    BadCrc,

    #[error("packet sequence number out of order")]
    OutOfOrder,

    #[error("no free multicast channel after exhausting all candidates")]
    NoChannel,

    #[error("none of the preferred listening ports could be bound")]
    NoListenPort,

    #[error("no ACK received within the handshake retry budget")]
    HandshakeTimeout,

    #[error("a session to this peer already exists")]
    AlreadyConnected,

    #[error("send attempted on a closed session")]
    TransportClosed,

    #[error("authentication challenge failed to verify")]
    AuthenticationFailed,

    #[error("no session with this id is known to the manager")]
    UnknownSession,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PortsError>;
