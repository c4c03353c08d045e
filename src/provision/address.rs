//! Link-local address provisioning on the transport interface.

use std::net::Ipv4Addr;

use pnet::util::MacAddr;
use tracing::{debug, info, warn};

use crate::directory::{AddressChange, InterfaceDirectory};

/// `169.254.<mac[4]>.<mac[5]>`, unique enough on a two-node segment.
pub const fn derive_link_local(mac: MacAddr) -> Ipv4Addr {
    Ipv4Addr::new(169, 254, mac.4, mac.5)
}

/// Add `address/prefix_len` to `interface`. An address already present counts
/// as success. Failures are logged and reported as `false`.
pub fn assign<D>(directory: &D, interface: &str, address: Ipv4Addr, prefix_len: u8) -> bool
where
    D: InterfaceDirectory + ?Sized,
{
    match directory.add_address(interface, address, prefix_len) {
        Ok(AddressChange::Added) => {
            info!(%interface, "assigned {address}/{prefix_len}");
            true
        }
        Ok(AddressChange::AlreadyPresent) => {
            debug!(%interface, "{address}/{prefix_len} already assigned");
            true
        }
        Err(err) => {
            warn!(%interface, "failed to assign {address}/{prefix_len}: {err}");
            false
        }
    }
}

/// Remove `address/prefix_len` from `interface`. An absent address counts as
/// released. Failures are logged and reported as `false`.
pub fn release<D>(directory: &D, interface: &str, address: Ipv4Addr, prefix_len: u8) -> bool
where
    D: InterfaceDirectory + ?Sized,
{
    match directory.remove_address(interface, address, prefix_len) {
        Ok(()) => {
            info!(%interface, "released {address}/{prefix_len}");
            true
        }
        Err(err) if err.is_not_found() => {
            debug!(%interface, "{address}/{prefix_len} was not assigned");
            true
        }
        Err(err) => {
            warn!(%interface, "failed to release {address}/{prefix_len}: {err}");
            false
        }
    }
}

/// An address assigned for the lifetime of the lease.
///
/// Released exactly once: through [`AddressLease::release`] or on drop.
pub struct AddressLease<'a, D: InterfaceDirectory + ?Sized> {
    directory: &'a D,
    interface: String,
    address: Ipv4Addr,
    prefix_len: u8,
    assigned: bool,
    released: bool,
}

impl<'a, D: InterfaceDirectory + ?Sized> AddressLease<'a, D> {
    /// Assign the address (best effort) and hold it.
    pub fn acquire(directory: &'a D, interface: &str, address: Ipv4Addr, prefix_len: u8) -> Self {
        let assigned = assign(directory, interface, address, prefix_len);
        Self {
            directory,
            interface: interface.to_owned(),
            address,
            prefix_len,
            assigned,
            released: false,
        }
    }

    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Whether the assignment succeeded.
    pub const fn is_assigned(&self) -> bool {
        self.assigned
    }

    pub fn release(mut self) -> bool {
        self.release_once()
    }

    fn release_once(&mut self) -> bool {
        if self.released {
            return true;
        }
        self.released = true;
        release(self.directory, &self.interface, self.address, self.prefix_len)
    }
}

impl<D: InterfaceDirectory + ?Sized> Drop for AddressLease<'_, D> {
    fn drop(&mut self) {
        self.release_once();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::tests::{MockDirectory, Op};

    const ADDRESS: Ipv4Addr = Ipv4Addr::new(169, 254, 4, 42);

    #[test]
    fn should_derive_address_from_last_two_mac_octets() {
        let mac = MacAddr::new(0x02, 0x11, 0x22, 0x33, 0x04, 0x2a);
        let address = derive_link_local(mac);
        assert_eq!(address, ADDRESS);
        assert_eq!(address.to_string(), "169.254.4.42");
    }

    #[test]
    fn should_treat_second_assign_as_success() {
        let directory = MockDirectory::with_station(0);

        assert!(assign(&directory, "eth0", ADDRESS, 16));
        assert!(assign(&directory, "eth0", ADDRESS, 16));
        assert!(directory.has_address("eth0", ADDRESS));
    }

    #[test]
    fn should_report_failures_without_escalating() {
        let directory = MockDirectory::with_station(0);
        directory.fail(Op::AddAddress);
        directory.fail(Op::RemoveAddress);

        assert!(!assign(&directory, "eth0", ADDRESS, 16));
        assert!(!release(&directory, "eth0", ADDRESS, 16));
    }

    #[test]
    fn should_treat_absent_address_as_released() {
        let directory = MockDirectory::with_station(0);
        assert!(release(&directory, "eth0", ADDRESS, 16));
    }

    #[test]
    fn should_release_lease_exactly_once() {
        let directory = MockDirectory::with_station(0);

        let lease = AddressLease::acquire(&directory, "eth0", ADDRESS, 16);
        assert!(lease.is_assigned());
        assert_eq!(lease.address(), ADDRESS);
        assert!(lease.release());

        assert_eq!(directory.calls(Op::RemoveAddress), 1);
        assert!(!directory.has_address("eth0", ADDRESS));
    }

    #[test]
    fn should_release_on_drop_even_when_release_fails() {
        let directory = MockDirectory::with_station(0);
        directory.fail(Op::RemoveAddress);

        {
            let _lease = AddressLease::acquire(&directory, "eth0", ADDRESS, 16);
        }

        assert_eq!(directory.calls(Op::RemoveAddress), 1);
    }
}
