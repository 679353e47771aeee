//! Cluster Transport Library
//!
//! Wire format and non-blocking UDP plumbing for the artifact exchange
//! between baseband servers. The pipeline's RX/TX threads live in the
//! `baseband` crate; this crate only knows how to frame, parse and move
//! datagrams.

pub mod packet;
pub mod socket;

use thiserror::Error;

pub use packet::{PacketHeader, PacketKind, HEADER_LEN, MAX_PACKET_LEN};
pub use socket::UdpEndpoint;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("unknown packet kind {0}")]
    UnknownKind(u8),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("send failed to {dest}: {source}")]
    SendFailed {
        dest: std::net::SocketAddr,
        source: std::io::Error,
    },
}
