//! Tunnel startup composition and teardown.
//!
//! Check the transport interface, provision the monitor interface, put the
//! derived link-local address on the transport and hand both sockets to the
//! relay. A monitor created here is removed if startup fails; once the relay
//! runs, removal follows `remove_on_exit`.
//! Whatever was acquired is released exactly once on the way out, whether
//! the relay stopped cleanly, failed, or never started.

use std::net::SocketAddrV4;
use std::sync::atomic::AtomicBool;

use tracing::info;

use crate::config::{Config, RelaySettings};
use crate::directory::InterfaceDirectory;
use crate::error::Result;
use crate::network::{Poller, SocketFactory};
use crate::provision::monitor::lookup_failed;
use crate::provision::{AddressLease, MonitorRemoval, derive_link_local, provision_monitor};
use crate::relay::{Relay, RelayContext, RelayExit, Role};

/// Everything one tunnel endpoint needs to start.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub role: Role,
    /// Interface whose radio gets the monitor interface.
    pub wireless_interface: String,
    /// Interface carrying the UDP transport.
    pub transport_interface: String,
    pub relay: RelaySettings,
    pub remove_monitor_on_exit: bool,
}

impl TunnelSettings {
    pub fn new(
        role: Role,
        wireless_interface: impl Into<String>,
        transport_interface: impl Into<String>,
        config: &Config,
    ) -> Self {
        Self {
            role,
            wireless_interface: wireless_interface.into(),
            transport_interface: transport_interface.into(),
            relay: config.relay.clone(),
            remove_monitor_on_exit: config.monitor.remove_on_exit,
        }
    }
}

/// Releases the address lease, then removes the monitor interface.
struct Teardown<'a, D: InterfaceDirectory + ?Sized> {
    lease: Option<AddressLease<'a, D>>,
    removal: Option<MonitorRemoval<'a, D>>,
}

impl<D: InterfaceDirectory + ?Sized> Drop for Teardown<'_, D> {
    fn drop(&mut self) {
        info!("tearing down tunnel");
        if let Some(lease) = self.lease.take() {
            lease.release();
        }
        drop(self.removal.take());
    }
}

/// Bring the tunnel up and relay until `running` is cleared.
pub fn run<D, S, P>(
    directory: &D,
    sockets: &S,
    poller: P,
    settings: &TunnelSettings,
    running: &AtomicBool,
) -> Result<RelayExit>
where
    D: InterfaceDirectory + ?Sized,
    S: SocketFactory,
    P: Poller,
{
    let transport = directory
        .get_link(&settings.transport_interface)
        .map_err(|source| lookup_failed(&settings.transport_interface, source))?;
    info!(
        transport = %transport.name,
        mac = %transport.hardware_address,
        oper_state = ?transport.oper_state,
        carrier = transport.carrier,
        "transport interface"
    );

    let (monitor, provenance) = provision_monitor(directory, &settings.wireless_interface)?;
    let mut teardown = Teardown {
        lease: None,
        removal: Some(MonitorRemoval::new(directory, &monitor, provenance)),
    };

    let address = derive_link_local(transport.hardware_address);
    teardown.lease = Some(AddressLease::acquire(
        directory,
        &transport.name,
        address,
        settings.relay.prefix_len,
    ));

    let port = settings.relay.port;
    let link = sockets.open_link(&monitor)?;
    let udp = sockets.open_udp(SocketAddrV4::new(address, port))?;
    info!(
        monitor = %monitor.name,
        local = %SocketAddrV4::new(address, port),
        "tunnel endpoint ready"
    );

    if let Some(removal) = teardown.removal.as_mut() {
        removal.disarm_unless(settings.remove_monitor_on_exit);
    }
    let context = RelayContext::new(link, udp, settings.role, port);
    let exit = Relay::new(context, poller, &settings.relay).run(running)?;
    Ok(exit)
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::{Ipv4Addr, UdpSocket};
    use std::os::fd::RawFd;
    use std::os::unix::net::UnixDatagram;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::directory::WirelessInterfaceInfo;
    use crate::directory::tests::{MockDirectory, Op};
    use crate::error::{Error, SocketError};
    use crate::network::Readiness;

    /// Loopback sockets standing in for the raw link and the transport.
    #[derive(Default)]
    struct FakeSockets {
        air: Mutex<Vec<UnixDatagram>>,
        requested: Mutex<Vec<SocketAddrV4>>,
        refuse_udp: bool,
    }

    impl SocketFactory for FakeSockets {
        type Link = UnixDatagram;

        fn open_link(
            &self,
            _monitor: &WirelessInterfaceInfo,
        ) -> std::result::Result<UnixDatagram, SocketError> {
            let (link, air) = UnixDatagram::pair().map_err(|source| SocketError::OpenFailed {
                kind: "raw link",
                source,
            })?;
            self.air.lock().push(air);
            Ok(link)
        }

        fn open_udp(&self, local: SocketAddrV4) -> std::result::Result<UdpSocket, SocketError> {
            self.requested.lock().push(local);
            if self.refuse_udp {
                return Err(SocketError::BindFailed {
                    kind: "udp",
                    target: local.to_string(),
                    source: io::Error::from(io::ErrorKind::AddrNotAvailable),
                });
            }
            crate::network::open_udp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
        }
    }

    struct FailingPoller;

    impl Poller for FailingPoller {
        fn wait(&mut self, _fds: [RawFd; 2], _timeout: Duration) -> io::Result<[Readiness; 2]> {
            Err(io::Error::other("wait failed"))
        }
    }

    fn settings(role: Role, remove_monitor_on_exit: bool) -> TunnelSettings {
        TunnelSettings {
            remove_monitor_on_exit,
            ..TunnelSettings::new(role, "wlan0", "eth0", &Config::default())
        }
    }

    const LEASED: Ipv4Addr = Ipv4Addr::new(169, 254, 4, 42);

    #[test]
    fn should_bind_udp_on_derived_address_and_port() {
        let directory = MockDirectory::with_station(0);
        let sockets = FakeSockets::default();
        let running = AtomicBool::new(false);

        let exit = run(
            &directory,
            &sockets,
            FailingPoller,
            &settings(Role::Server, false),
            &running,
        )
        .unwrap();

        assert!(matches!(exit, RelayExit::Shutdown { .. }));
        assert_eq!(
            sockets.requested.lock().as_slice(),
            &[SocketAddrV4::new(LEASED, 8888)]
        );
        assert_eq!(directory.calls(Op::AddAddress), 1);
        assert_eq!(directory.calls(Op::RemoveAddress), 1);
        assert!(!directory.has_address("eth0", LEASED));
        assert!(directory.link_named("mon0").is_some());
    }

    #[test]
    fn should_tear_down_once_after_wait_failure() {
        let directory = MockDirectory::with_station(0);
        directory.fail(Op::RemoveAddress);
        let sockets = FakeSockets::default();
        let running = AtomicBool::new(true);

        let err = run(
            &directory,
            &sockets,
            FailingPoller,
            &settings(
                Role::Client {
                    peer: Ipv4Addr::new(169, 254, 9, 9),
                },
                true,
            ),
            &running,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Relay(_)));
        assert_eq!(directory.calls(Op::RemoveAddress), 1);
        assert_eq!(directory.calls(Op::Delete), 1);
        assert!(directory.link_named("mon0").is_none());
    }

    #[test]
    fn should_keep_preexisting_monitor_on_exit() {
        let directory = MockDirectory::with_station(0);
        crate::provision::ensure_monitor(&directory, "wlan0").unwrap();
        let running = AtomicBool::new(false);

        run(
            &directory,
            &FakeSockets::default(),
            FailingPoller,
            &settings(Role::Server, true),
            &running,
        )
        .unwrap();

        assert_eq!(directory.calls(Op::Delete), 0);
        assert!(directory.link_named("mon0").is_some());
    }

    #[test]
    fn should_report_unknown_transport_as_configuration_error() {
        let directory = MockDirectory::with_station(0);
        let running = AtomicBool::new(true);
        let settings = TunnelSettings {
            transport_interface: "eth9".into(),
            ..settings(Role::Server, false)
        };

        let err = run(
            &directory,
            &FakeSockets::default(),
            FailingPoller,
            &settings,
            &running,
        )
        .unwrap_err();

        assert!(err.is_configuration());
        assert_eq!(directory.calls(Op::Create), 0);
        assert_eq!(directory.calls(Op::AddAddress), 0);
        assert_eq!(directory.calls(Op::Delete), 0);
        assert!(directory.link_named("mon0").is_none());
    }

    #[test]
    fn should_release_address_when_socket_fails() {
        let directory = MockDirectory::with_station(0);
        let sockets = FakeSockets {
            refuse_udp: true,
            ..FakeSockets::default()
        };
        let running = AtomicBool::new(true);

        let err = run(
            &directory,
            &sockets,
            FailingPoller,
            &settings(Role::Server, false),
            &running,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Socket(SocketError::BindFailed { .. })));
        assert_eq!(directory.calls(Op::RemoveAddress), 1);
        assert!(!directory.has_address("eth0", LEASED));
        assert_eq!(directory.calls(Op::Delete), 1);
        assert!(directory.link_named("mon0").is_none());
    }

    #[test]
    fn should_fail_before_any_socket_when_wireless_interface_is_unknown() {
        let directory = MockDirectory::with_station(0);
        let sockets = FakeSockets::default();
        let running = AtomicBool::new(true);
        let settings = TunnelSettings {
            wireless_interface: "wlan5".into(),
            ..settings(Role::Server, false)
        };

        let err = run(&directory, &sockets, FailingPoller, &settings, &running).unwrap_err();

        assert!(err.is_configuration());
        assert!(sockets.requested.lock().is_empty());
        assert!(sockets.air.lock().is_empty());
    }
}
