//! Non-blocking UDP Endpoint
//!
//! Thin wrapper over `std::net::UdpSocket` tuned for busy-polling: the
//! socket never blocks, and the kernel receive buffer is enlarged so frame
//! bursts survive scheduling hiccups.

use std::io;
use std::net::{SocketAddr, UdpSocket};

use tracing::warn;

use crate::TransportError;

/// Kernel receive/send buffer request, in bytes.
const SOCKET_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// A pinned thread's UDP socket.
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Bind a non-blocking endpoint. RX queues bind concrete ports; TX
    /// threads bind an ephemeral port with `addr` = `0.0.0.0:0`.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        enlarge_buffers(&socket);
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }

    /// Poll for one datagram. `Ok(None)` means the queue is empty right
    /// now; any other error is a real NIC/socket failure.
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, TransportError> {
        match self.socket.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    /// Send one datagram. Errors are surfaced to the caller, which treats
    /// them as fatal per the no-retransmission policy.
    pub fn send_to(&self, datagram: &[u8], dest: SocketAddr) -> Result<(), TransportError> {
        match self.socket.send_to(datagram, dest) {
            Ok(sent) if sent == datagram.len() => Ok(()),
            Ok(sent) => Err(TransportError::SendFailed {
                dest,
                source: io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short send: {sent} of {} bytes", datagram.len()),
                ),
            }),
            Err(e) => Err(TransportError::SendFailed { dest, source: e }),
        }
    }
}

/// Ask the kernel for large socket buffers; failure is survivable and only
/// logged, the run continues with the defaults.
fn enlarge_buffers(socket: &UdpSocket) {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = socket.as_raw_fd();
        let bytes = SOCKET_BUFFER_BYTES as libc::c_int;
        for opt in [libc::SO_RCVBUF, libc::SO_SNDBUF] {
            // SAFETY: plain setsockopt on a valid owned fd with a stack
            // c_int value.
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    opt,
                    &bytes as *const libc::c_int as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                warn!("setsockopt({opt}) failed; keeping kernel default buffer size");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_datagram() {
        let rx = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let tx = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let dest = rx.local_addr().unwrap();

        let mut buf = [0u8; 64];
        assert!(rx.try_recv(&mut buf).unwrap().is_none());

        tx.send_to(b"frame-artifact", dest).unwrap();
        // Loopback delivery is fast but not instant under load.
        let mut received = None;
        for _ in 0..1000 {
            if let Some((len, _)) = rx.try_recv(&mut buf).unwrap() {
                received = Some(len);
                break;
            }
            std::thread::sleep(std::time::Duration::from_micros(100));
        }
        assert_eq!(received, Some(14));
        assert_eq!(&buf[..14], b"frame-artifact");
    }
}
