//! Provisioning of the kernel state the tunnel runs on.
//!
//! - [`monitor`]: find or create the `mon<phy>` monitor interface and bring it up
//! - [`address`]: derive and (de)assign the link-local transport address

pub mod address;
pub mod monitor;

pub use address::{AddressLease, assign, derive_link_local, release};
pub use monitor::{MonitorRemoval, Provenance, ensure_monitor, monitor_name, provision_monitor};
