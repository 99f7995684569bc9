//! # galena-net: the asynchronous cluster transport
//!
//! A protocol-stack dispatcher atop non-blocking TCP sockets:
//!
//! - [`NetHeader`] / [`Datagram`] — the 8-byte frame header with optional
//!   CRC-32 / CRC-32C integrity, and the buffer container frames travel in
//! - [`FairSendQueue`] — per-segment round-robin outbound queueing so no
//!   one segment hogs a relay's bandwidth
//! - [`TcpSocket`] / [`TcpAcceptor`] — the socket state machine with
//!   streaming frame reassembly and deferred close
//! - [`Protolay`] / [`Protostack`] — layered protocols passing datagrams
//!   up and down
//! - [`Protonet`] — the poll-based reactor driving it all
//!
//! The reactor is single-threaded and cooperative; only
//! [`protonet::InterruptHandle`] and the [`Protonet::enter`] critical
//! section are meant to be touched from other threads.

pub mod datagram;
pub mod fair_queue;
pub mod protonet;
pub mod protostack;
pub mod socket;

use thiserror::Error;

pub use datagram::{ChecksumKind, Datagram, NetHeader, NET_HEADER_SIZE};
pub use fair_queue::FairSendQueue;
pub use protonet::{InterruptHandle, Protonet};
pub use protostack::{ProtoDownMeta, ProtoUpMeta, Protolay, Protostack, SocketId};
pub use socket::{SocketState, SocketStats, TcpAcceptor, TcpSocket};

/// Result type for transport operations.
pub type NetResult<T> = Result<T, NetError>;

/// Errors raised by the transport.
#[derive(Debug, Error)]
pub enum NetError {
    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The send queue is full; retry when the socket signals writable.
    #[error("send queue full")]
    WouldBlock,

    /// Socket is not in a state that can send.
    #[error("socket not connected")]
    NotConnected,

    /// Payload does not fit the 24-bit frame length field.
    #[error("message too long: {len}")]
    FrameTooLong { len: usize },

    /// Frame advertises a protocol version we do not speak.
    #[error("invalid protocol version {version}")]
    ProtocolVersion { version: u8 },

    /// Frame advertises flags outside the checksum bits.
    #[error("invalid frame flags {flags:#x}")]
    InvalidFlags { flags: u8 },

    /// Frame checksum mismatch; the frame is dropped and the connection
    /// closed.
    #[error("frame checksum mismatch")]
    ChecksumMismatch,
}
