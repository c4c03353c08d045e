//! Monitor interface provisioning.
//!
//! Every radio gets at most one monitor interface, named `mon<phy index>`.
//! Provisioning is idempotent: running it twice for the same radio yields the
//! same device.

use tracing::{debug, info, warn};

use crate::directory::{
    InterfaceDirectory, InterfaceType, LinkFlags, WirelessInterfaceInfo, WirelessInterfaceRequest,
};
use crate::error::{DirectoryError, ProvisionError};

/// Name of the monitor interface for radio `phy`.
pub fn monitor_name(phy: u32) -> String {
    format!("mon{phy}")
}

/// Whether the monitor interface was found or created by this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Existing,
    Created,
}

/// Find or create the monitor interface on the radio behind
/// `wireless_interface`, bring it up and return its authoritative state.
pub fn ensure_monitor<D>(
    directory: &D,
    wireless_interface: &str,
) -> Result<WirelessInterfaceInfo, ProvisionError>
where
    D: InterfaceDirectory + ?Sized,
{
    provision_monitor(directory, wireless_interface).map(|(monitor, _)| monitor)
}

/// Like [`ensure_monitor`], also reporting whether the device was created.
pub fn provision_monitor<D>(
    directory: &D,
    wireless_interface: &str,
) -> Result<(WirelessInterfaceInfo, Provenance), ProvisionError>
where
    D: InterfaceDirectory + ?Sized,
{
    let wireless = directory
        .get_wireless_interface(wireless_interface)
        .map_err(|source| lookup_failed(wireless_interface, source))?;
    let phy = directory
        .get_phy(wireless.phy.index)
        .map_err(|source| lookup_failed(&wireless.phy.name, source))?;

    let name = monitor_name(phy.index);
    debug!(wireless = %wireless.name, phy = %phy.name, monitor = %name, "resolved radio");

    let provenance = match directory.get_wireless_interface(&name) {
        Ok(existing) => {
            if existing.interface_type != InterfaceType::Monitor {
                warn!(
                    monitor = %name,
                    interface_type = %existing.interface_type,
                    "existing interface is not in monitor mode, using it as found"
                );
            }
            Provenance::Existing
        }
        Err(err) if err.is_not_found() => {
            let request = WirelessInterfaceRequest {
                name: name.clone(),
                interface_type: InterfaceType::Monitor,
                phy_index: phy.index,
            };
            directory
                .create_wireless_interface(&request)
                .map_err(|source| ProvisionError::ProvisionFailed {
                    name: name.clone(),
                    source,
                })?;
            info!(monitor = %name, phy = %phy.name, "created monitor interface");
            Provenance::Created
        }
        Err(source) => return Err(ProvisionError::ProvisionFailed { name, source }),
    };

    let mut monitor = directory
        .get_wireless_interface(&name)
        .map_err(|source| ProvisionError::ProvisionFailed {
            name: name.clone(),
            source,
        })?;

    monitor.link.flags.insert(LinkFlags::UP);
    directory
        .set_link(&monitor.link)
        .map_err(|source| ProvisionError::ActivationFailed {
            name: name.clone(),
            source,
        })?;

    info!(
        monitor = %monitor.name,
        ifindex = monitor.index,
        oper_state = ?monitor.link.oper_state,
        carrier = monitor.link.carrier,
        "monitor interface up"
    );
    Ok((monitor, provenance))
}

/// Only a missing device is the operator's mistake; anything else the kernel
/// or the channel reports is a provisioning failure.
pub(crate) fn lookup_failed(name: &str, source: DirectoryError) -> ProvisionError {
    if source.is_not_found() {
        ProvisionError::NotFound {
            name: name.to_owned(),
            source,
        }
    } else {
        ProvisionError::ProvisionFailed {
            name: name.to_owned(),
            source,
        }
    }
}

/// Deletes a monitor interface on drop, if this run created it.
///
/// Armed from creation so a failed startup leaves nothing behind; call
/// [`MonitorRemoval::disarm_unless`] once the monitor is in service.
pub struct MonitorRemoval<'a, D: InterfaceDirectory + ?Sized> {
    directory: &'a D,
    monitor: Option<WirelessInterfaceInfo>,
}

impl<'a, D: InterfaceDirectory + ?Sized> MonitorRemoval<'a, D> {
    pub fn new(directory: &'a D, monitor: &WirelessInterfaceInfo, provenance: Provenance) -> Self {
        let monitor = (provenance == Provenance::Created).then(|| monitor.clone());
        Self { directory, monitor }
    }

    /// Keep the monitor at drop unless `remove_on_exit` is set.
    pub fn disarm_unless(&mut self, remove_on_exit: bool) {
        if !remove_on_exit {
            self.monitor = None;
        }
    }

    /// Whether dropping this guard will delete anything.
    pub const fn is_armed(&self) -> bool {
        self.monitor.is_some()
    }
}

impl<D: InterfaceDirectory + ?Sized> Drop for MonitorRemoval<'_, D> {
    fn drop(&mut self) {
        let Some(monitor) = self.monitor.take() else {
            return;
        };
        match self.directory.delete_wireless_interface(&monitor) {
            Ok(()) => info!(monitor = %monitor.name, "removed monitor interface"),
            Err(err) => warn!(monitor = %monitor.name, "failed to remove monitor interface: {err}"),
        }
    }
}
