//! Raw link and UDP socket handles.
//!
//! Both are trait-backed so the relay and the tunnel can run without
//! `CAP_NET_RAW`:
//! - [`FrameLink`] abstracts whatever carries raw 802.11 frames
//! - [`SocketFactory`] opens the pair of handles a tunnel needs

use std::io;
use std::mem::{self, MaybeUninit};
use std::net::{SocketAddrV4, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;

use tracing::debug;

use crate::directory::WirelessInterfaceInfo;
use crate::error::SocketError;

/// Something that carries whole frames, one per read or write.
pub trait FrameLink: AsRawFd {
    /// Read one frame into `buf`. `Ok(None)` means a frame was consumed but
    /// must not be forwarded.
    fn recv_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>>;

    /// Write one frame verbatim.
    fn send_frame(&self, frame: &[u8]) -> io::Result<usize>;
}

/// Opens the handles a tunnel endpoint needs.
pub trait SocketFactory {
    type Link: FrameLink;

    fn open_link(&self, monitor: &WirelessInterfaceInfo) -> Result<Self::Link, SocketError>;

    fn open_udp(&self, local: SocketAddrV4) -> Result<UdpSocket, SocketError>;
}

/// Opens real `AF_PACKET` and UDP sockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSockets;

impl SocketFactory for SystemSockets {
    type Link = RawSocket;

    fn open_link(&self, monitor: &WirelessInterfaceInfo) -> Result<RawSocket, SocketError> {
        RawSocket::open(monitor.index)
    }

    fn open_udp(&self, local: SocketAddrV4) -> Result<UdpSocket, SocketError> {
        open_udp(local)
    }
}

/// Non-blocking `AF_PACKET` socket bound to one interface, all protocols.
#[derive(Debug)]
pub struct RawSocket {
    fd: OwnedFd,
    ifindex: u32,
}

impl RawSocket {
    const KIND: &'static str = "raw link";

    pub fn open(ifindex: u32) -> Result<Self, SocketError> {
        let protocol = (libc::ETH_P_ALL as u16).to_be();

        // SAFETY: plain syscall, the returned descriptor is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::c_int::from(protocol),
            )
        };
        if raw < 0 {
            return Err(SocketError::OpenFailed {
                kind: Self::KIND,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: `raw` is a freshly opened descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let bind_failed = |source| SocketError::BindFailed {
            kind: Self::KIND,
            target: format!("ifindex {ifindex}"),
            source,
        };

        // SAFETY: sockaddr_ll is plain old data, all-zero is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = libc::c_int::try_from(ifindex)
            .map_err(|_| bind_failed(io::Error::from(io::ErrorKind::InvalidInput)))?;
        addr.sll_pkttype = libc::PACKET_HOST;

        // SAFETY: `addr` outlives the call and the length matches its type.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                (&raw const addr).cast::<libc::sockaddr>(),
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(bind_failed(io::Error::last_os_error()));
        }

        debug!(ifindex, "raw link socket bound");
        Ok(Self { fd, ifindex })
    }

    pub const fn ifindex(&self) -> u32 {
        self.ifindex
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl FrameLink for RawSocket {
    /// Frames the kernel tags `PACKET_OUTGOING` are our own injections
    /// looping back and are reported as `None`.
    fn recv_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        let mut from = MaybeUninit::<libc::sockaddr_ll>::zeroed();
        let mut from_len = mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

        // SAFETY: `buf` and `from` are valid for writes of the given lengths.
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                from.as_mut_ptr().cast(),
                &raw mut from_len,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: zero-initialized and possibly filled in by the kernel.
        let from = unsafe { from.assume_init() };
        if from.sll_pkttype == libc::PACKET_OUTGOING {
            return Ok(None);
        }
        Ok(Some(n.unsigned_abs()))
    }

    fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        // SAFETY: `frame` is valid for reads of its length.
        let n = unsafe { libc::send(self.fd.as_raw_fd(), frame.as_ptr().cast(), frame.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n.unsigned_abs())
    }
}

/// A connected datagram socket carries one frame per datagram.
impl FrameLink for UnixDatagram {
    fn recv_frame(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        self.recv(buf).map(Some)
    }

    fn send_frame(&self, frame: &[u8]) -> io::Result<usize> {
        self.send(frame)
    }
}

/// Bind a non-blocking UDP socket on `local`.
pub fn open_udp(local: SocketAddrV4) -> Result<UdpSocket, SocketError> {
    let socket = UdpSocket::bind(local).map_err(|source| SocketError::BindFailed {
        kind: "udp",
        target: local.to_string(),
        source,
    })?;
    socket
        .set_nonblocking(true)
        .map_err(|source| SocketError::OpenFailed {
            kind: "udp",
            source,
        })?;
    debug!(%local, "udp socket bound");
    Ok(socket)
}
