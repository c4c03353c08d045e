//! The relay loop: moves frames between the raw link and the UDP peer.
//!
//! One buffer, one unit per readable descriptor per cycle, nothing queued.
//! A frame read from the link goes out as a single datagram to the peer; a
//! datagram goes verbatim to the link. In server role the peer is whoever
//! sent the last datagram, and link frames are dropped until one arrives.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::config::RelaySettings;
use crate::error::{Endpoint, RelayError};
use crate::metrics::{self, Direction};
use crate::network::{FrameLink, Poller};

/// Which end of the tunnel this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Learns its peer from incoming datagrams.
    Server,
    /// Sends to a fixed peer.
    Client { peer: Ipv4Addr },
}

/// Handles and peer state the relay owns.
#[derive(Debug)]
pub struct RelayContext<L> {
    pub link: L,
    pub udp: UdpSocket,
    pub peer: Option<SocketAddr>,
    pub role: Role,
}

impl<L> RelayContext<L> {
    /// A client starts with `peer:port` as its peer; a server with none.
    pub fn new(link: L, udp: UdpSocket, role: Role, port: u16) -> Self {
        let peer = match role {
            Role::Server => None,
            Role::Client { peer } => Some(SocketAddr::from((peer, port))),
        };
        Self {
            link,
            udp,
            peer,
            role,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Ready,
    Polling,
    Forwarding,
    Error,
    Teardown,
}

/// Per-run counters, mirrored into the metrics registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub uplink_frames: u64,
    pub downlink_frames: u64,
    pub dropped: u64,
    pub io_errors: u64,
    pub peer_changes: u64,
}

/// How a relay run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    Shutdown { stats: RelayStats },
}

pub struct Relay<L, P> {
    context: RelayContext<L>,
    poller: P,
    buffer: Vec<u8>,
    poll_timeout: Duration,
    state: RelayState,
    stats: RelayStats,
}

impl<L: FrameLink, P: Poller> Relay<L, P> {
    pub fn new(context: RelayContext<L>, poller: P, settings: &RelaySettings) -> Self {
        Self {
            context,
            poller,
            buffer: vec![0; settings.max_frame_size],
            poll_timeout: settings.poll_timeout(),
            state: RelayState::Ready,
            stats: RelayStats::default(),
        }
    }

    pub const fn state(&self) -> RelayState {
        self.state
    }

    pub const fn peer(&self) -> Option<SocketAddr> {
        self.context.peer
    }

    /// Run until `running` is cleared or a fatal condition occurs.
    ///
    /// Consumes the relay: its sockets are closed when this returns.
    pub fn run(mut self, running: &AtomicBool) -> Result<RelayExit, RelayError> {
        info!(role = ?self.context.role, peer = ?self.context.peer, "relay started");

        let result = self.cycle(running);
        if let Err(err) = &result {
            self.transition(RelayState::Error);
            tracing::error!("relay stopped: {err}");
        }
        self.transition(RelayState::Teardown);

        let stats = self.stats;
        info!(
            uplink = stats.uplink_frames,
            downlink = stats.downlink_frames,
            dropped = stats.dropped,
            io_errors = stats.io_errors,
            "relay finished"
        );
        result
    }

    fn cycle(&mut self, running: &AtomicBool) -> Result<RelayExit, RelayError> {
        let fds = [
            self.context.link.as_raw_fd(),
            self.context.udp.as_raw_fd(),
        ];

        loop {
            if !running.load(Ordering::SeqCst) {
                return Ok(RelayExit::Shutdown { stats: self.stats });
            }

            self.transition(RelayState::Polling);
            let [link, udp] = self
                .poller
                .wait(fds, self.poll_timeout)
                .map_err(RelayError::Wait)?;

            self.transition(RelayState::Forwarding);
            if link.failed {
                return Err(RelayError::Descriptor {
                    endpoint: Endpoint::Link,
                });
            }
            if udp.failed {
                return Err(RelayError::Descriptor {
                    endpoint: Endpoint::Udp,
                });
            }

            if link.readable {
                self.forward_uplink();
            }
            if udp.readable {
                self.forward_downlink();
            }
        }
    }

    fn transition(&mut self, next: RelayState) {
        if self.state != next {
            trace!(from = ?self.state, to = ?next, "relay state");
            self.state = next;
        }
    }

    fn forward_uplink(&mut self) {
        let len = match self.context.link.recv_frame(&mut self.buffer) {
            Ok(Some(len)) => len,
            Ok(None) => return,
            Err(err) => return self.io_failure("link_read", &err),
        };

        let Some(peer) = self.context.peer else {
            debug!(len, "no peer yet, dropping frame");
            self.stats.dropped += 1;
            metrics::record_dropped("no_peer");
            return;
        };

        match self.context.udp.send_to(&self.buffer[..len], peer) {
            Ok(_) => {
                trace!(len, %peer, "frame forwarded");
                self.stats.uplink_frames += 1;
                metrics::record_forwarded(Direction::Uplink, len);
            }
            Err(err) => self.io_failure("udp_send", &err),
        }
    }

    fn forward_downlink(&mut self) {
        let (len, source) = match self.context.udp.recv_from(&mut self.buffer) {
            Ok(received) => received,
            Err(err) => return self.io_failure("udp_recv", &err),
        };

        if self.context.role == Role::Server && self.context.peer != Some(source) {
            match self.context.peer.replace(source) {
                None => info!(peer = %source, "peer learned"),
                Some(previous) => info!(peer = %source, %previous, "peer changed"),
            }
            self.stats.peer_changes += 1;
            metrics::record_peer_change();
        }

        match self.context.link.send_frame(&self.buffer[..len]) {
            Ok(_) => {
                trace!(len, %source, "datagram injected");
                self.stats.downlink_frames += 1;
                metrics::record_forwarded(Direction::Downlink, len);
            }
            Err(err) => self.io_failure("link_send", &err),
        }
    }

    fn io_failure(&mut self, op: &'static str, err: &io::Error) {
        if err.kind() == io::ErrorKind::WouldBlock {
            return;
        }
        warn!(op, "relay I/O failed: {err}");
        self.stats.io_errors += 1;
        metrics::record_io_error(op);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::os::fd::RawFd;
    use std::os::unix::net::UnixDatagram;
    use std::sync::Arc;

    use super::*;
    use crate::network::Readiness;

    const LINK: [Readiness; 2] = [
        Readiness {
            readable: true,
            failed: false,
        },
        Readiness {
            readable: false,
            failed: false,
        },
    ];
    const UDP: [Readiness; 2] = [
        Readiness {
            readable: false,
            failed: false,
        },
        Readiness {
            readable: true,
            failed: false,
        },
    ];

    /// Replays canned wait results, then clears the running flag.
    struct ScriptedPoller {
        steps: VecDeque<io::Result<[Readiness; 2]>>,
        running: Arc<AtomicBool>,
        calls: usize,
    }

    impl ScriptedPoller {
        fn new(
            steps: impl IntoIterator<Item = io::Result<[Readiness; 2]>>,
            running: &Arc<AtomicBool>,
        ) -> Self {
            Self {
                steps: steps.into_iter().collect(),
                running: Arc::clone(running),
                calls: 0,
            }
        }
    }

    impl Poller for ScriptedPoller {
        fn wait(&mut self, _fds: [RawFd; 2], _timeout: Duration) -> io::Result<[Readiness; 2]> {
            self.calls += 1;
            let step = self
                .steps
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::other("script exhausted")));
            if self.steps.is_empty() {
                self.running.store(false, Ordering::SeqCst);
            }
            step
        }
    }

    fn loopback_udp() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        socket
    }

    fn remote() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn settings() -> RelaySettings {
        RelaySettings {
            max_frame_size: 512,
            ..RelaySettings::default()
        }
    }

    fn running() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn should_return_immediately_when_already_stopped() {
        let (link, _air) = UnixDatagram::pair().unwrap();
        let running = Arc::new(AtomicBool::new(false));
        let context = RelayContext::new(link, loopback_udp(), Role::Server, 8888);
        let relay = Relay::new(context, ScriptedPoller::new([], &running), &settings());
        assert_eq!(relay.state(), RelayState::Ready);

        let exit = relay.run(&running).unwrap();
        assert_eq!(
            exit,
            RelayExit::Shutdown {
                stats: RelayStats::default()
            }
        );
    }

    #[test]
    fn should_stop_on_wait_failure() {
        let (link, _air) = UnixDatagram::pair().unwrap();
        let running = running();
        let context = RelayContext::new(link, loopback_udp(), Role::Server, 8888);
        let poller = ScriptedPoller::new([Err(io::Error::other("boom"))], &running);

        let err = Relay::new(context, poller, &settings())
            .run(&running)
            .unwrap_err();
        assert!(matches!(err, RelayError::Wait(_)));
    }

    #[test]
    fn should_stop_on_descriptor_error() {
        let (link, _air) = UnixDatagram::pair().unwrap();
        let running = running();
        let context = RelayContext::new(link, loopback_udp(), Role::Server, 8888);
        let failed = Readiness {
            readable: false,
            failed: true,
        };
        let poller = ScriptedPoller::new([Ok([Readiness::default(), failed])], &running);

        let err = Relay::new(context, poller, &settings())
            .run(&running)
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Descriptor {
                endpoint: Endpoint::Udp
            }
        ));
    }

    #[test]
    fn should_start_client_with_fixed_peer() {
        let (link, _air) = UnixDatagram::pair().unwrap();
        let context = RelayContext::new(
            link,
            loopback_udp(),
            Role::Client {
                peer: Ipv4Addr::new(169, 254, 1, 2),
            },
            8888,
        );
        assert_eq!(context.peer, Some("169.254.1.2:8888".parse().unwrap()));
    }

    #[test]
    fn should_forward_link_frames_to_client_peer() {
        let (link, air) = UnixDatagram::pair().unwrap();
        let peer = remote();
        let port = peer.local_addr().unwrap().port();
        let running = running();
        let context = RelayContext::new(
            link,
            loopback_udp(),
            Role::Client {
                peer: Ipv4Addr::LOCALHOST,
            },
            port,
        );
        air.send(b"\x08\x02beacon").unwrap();

        let exit = Relay::new(context, ScriptedPoller::new([Ok(LINK)], &running), &settings())
            .run(&running)
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x08\x02beacon");
        let RelayExit::Shutdown { stats } = exit;
        assert_eq!(stats.uplink_frames, 1);
    }

    #[test]
    fn should_drop_link_frames_until_server_learns_peer() {
        let (link, air) = UnixDatagram::pair().unwrap();
        air.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let udp = loopback_udp();
        let server_addr = udp.local_addr().unwrap();
        let peer = remote();
        let running = running();

        air.send(b"early").unwrap();
        peer.send_to(b"hello", server_addr).unwrap();
        air.send(b"late").unwrap();

        let context = RelayContext::new(link, udp, Role::Server, 8888);
        let poller = ScriptedPoller::new([Ok(LINK), Ok(UDP), Ok(LINK)], &running);
        let exit = Relay::new(context, poller, &settings())
            .run(&running)
            .unwrap();

        let mut buf = [0u8; 64];
        let n = air.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"late");

        let RelayExit::Shutdown { stats } = exit;
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.peer_changes, 1);
        assert_eq!(stats.uplink_frames, 1);
        assert_eq!(stats.downlink_frames, 1);
    }

    #[test]
    fn should_ignore_spurious_readiness() {
        let (link, _air) = UnixDatagram::pair().unwrap();
        link.set_nonblocking(true).unwrap();
        let running = running();
        let context = RelayContext::new(link, loopback_udp(), Role::Server, 8888);
        let poller = ScriptedPoller::new([Ok(LINK), Ok(UDP)], &running);

        let exit = Relay::new(context, poller, &settings())
            .run(&running)
            .unwrap();
        assert_eq!(
            exit,
            RelayExit::Shutdown {
                stats: RelayStats::default()
            }
        );
    }

    #[test]
    fn should_truncate_oversized_datagrams() {
        let (link, air) = UnixDatagram::pair().unwrap();
        air.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let udp = loopback_udp();
        let server_addr = udp.local_addr().unwrap();
        let peer = remote();
        let running = running();
        peer.send_to(&[0xabu8; 1024], server_addr).unwrap();

        let settings = RelaySettings {
            max_frame_size: 256,
            ..RelaySettings::default()
        };
        let context = RelayContext::new(link, udp, Role::Server, 8888);
        Relay::new(context, ScriptedPoller::new([Ok(UDP)], &running), &settings)
            .run(&running)
            .unwrap();

        let mut buf = [0u8; 2048];
        assert_eq!(air.recv(&mut buf).unwrap(), 256);
    }
}
