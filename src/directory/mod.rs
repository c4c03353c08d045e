//! Interface directory: the kernel's view of links, addresses and radios.
//!
//! The tunnel never talks netlink directly. It goes through the
//! [`InterfaceDirectory`] trait so that provisioning can be tested against an
//! in-memory directory and run for real against [`NetlinkDirectory`].

use std::fmt;
use std::net::Ipv4Addr;

use pnet::util::MacAddr;

use crate::error::DirectoryError;

mod attributes;
mod netlink;

pub use attributes::Attributes;
pub use netlink::{NetlinkDirectory, ReplyHandler};

/// Administrative and operational link flags (subset of `IFF_*`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LinkFlags(u32);

impl LinkFlags {
    pub const UP: Self = Self(libc::IFF_UP as u32);
    pub const BROADCAST: Self = Self(libc::IFF_BROADCAST as u32);
    pub const LOOPBACK: Self = Self(libc::IFF_LOOPBACK as u32);
    pub const RUNNING: Self = Self(libc::IFF_RUNNING as u32);
    pub const PROMISC: Self = Self(libc::IFF_PROMISC as u32);
    pub const MULTICAST: Self = Self(libc::IFF_MULTICAST as u32);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for LinkFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// RFC 2863 operational state as reported in `IFLA_OPERSTATE`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperState {
    #[default]
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

impl From<u8> for OperState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::NotPresent,
            2 => Self::Down,
            3 => Self::LowerLayerDown,
            4 => Self::Testing,
            5 => Self::Dormant,
            6 => Self::Up,
            _ => Self::Unknown,
        }
    }
}

/// One kernel network device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub flags: LinkFlags,
    pub oper_state: OperState,
    pub carrier: bool,
    pub hardware_address: MacAddr,
    pub mtu: u32,
}

impl LinkInfo {
    pub const fn is_up(&self) -> bool {
        self.flags.contains(LinkFlags::UP)
    }
}

/// One wireless radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhyInfo {
    pub index: u32,
    pub name: String,
}

/// nl80211 interface type (`enum nl80211_iftype`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Unspecified,
    Adhoc,
    Station,
    Ap,
    ApVlan,
    Wds,
    Monitor,
    MeshPoint,
    P2pClient,
    P2pGo,
    P2pDevice,
    Ocb,
    Nan,
    Other(u32),
}

impl From<u32> for InterfaceType {
    fn from(value: u32) -> Self {
        match value {
            0 => Self::Unspecified,
            1 => Self::Adhoc,
            2 => Self::Station,
            3 => Self::Ap,
            4 => Self::ApVlan,
            5 => Self::Wds,
            6 => Self::Monitor,
            7 => Self::MeshPoint,
            8 => Self::P2pClient,
            9 => Self::P2pGo,
            10 => Self::P2pDevice,
            11 => Self::Ocb,
            12 => Self::Nan,
            other => Self::Other(other),
        }
    }
}

impl From<InterfaceType> for u32 {
    fn from(value: InterfaceType) -> Self {
        match value {
            InterfaceType::Unspecified => 0,
            InterfaceType::Adhoc => 1,
            InterfaceType::Station => 2,
            InterfaceType::Ap => 3,
            InterfaceType::ApVlan => 4,
            InterfaceType::Wds => 5,
            InterfaceType::Monitor => 6,
            InterfaceType::MeshPoint => 7,
            InterfaceType::P2pClient => 8,
            InterfaceType::P2pGo => 9,
            InterfaceType::P2pDevice => 10,
            InterfaceType::Ocb => 11,
            InterfaceType::Nan => 12,
            InterfaceType::Other(other) => other,
        }
    }
}

impl fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => f.write_str("unspecified"),
            Self::Adhoc => f.write_str("adhoc"),
            Self::Station => f.write_str("station"),
            Self::Ap => f.write_str("ap"),
            Self::ApVlan => f.write_str("ap-vlan"),
            Self::Wds => f.write_str("wds"),
            Self::Monitor => f.write_str("monitor"),
            Self::MeshPoint => f.write_str("mesh-point"),
            Self::P2pClient => f.write_str("p2p-client"),
            Self::P2pGo => f.write_str("p2p-go"),
            Self::P2pDevice => f.write_str("p2p-device"),
            Self::Ocb => f.write_str("ocb"),
            Self::Nan => f.write_str("nan"),
            Self::Other(n) => write!(f, "type-{n}"),
        }
    }
}

/// A wireless (802.11-capable) network device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirelessInterfaceInfo {
    pub index: u32,
    pub name: String,
    pub interface_type: InterfaceType,
    pub phy: PhyInfo,
    pub link: LinkInfo,
}

/// What the kernel needs to create a wireless interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirelessInterfaceRequest {
    pub name: String,
    pub interface_type: InterfaceType,
    pub phy_index: u32,
}

/// Outcome of an address add.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressChange {
    Added,
    AlreadyPresent,
}

/// Query and mutate kernel network devices.
///
/// Methods take `&self` so that scoped guards (address leases, monitor
/// removal) can hold a shared borrow for as long as the tunnel runs.
pub trait InterfaceDirectory {
    /// Look up a link by name.
    fn get_link(&self, name: &str) -> Result<LinkInfo, DirectoryError>;

    /// Push the administrative state and MTU of `link` to the kernel.
    fn set_link(&self, link: &LinkInfo) -> Result<(), DirectoryError>;

    /// Add an IPv4 address to an interface.
    fn add_address(
        &self,
        interface: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<AddressChange, DirectoryError>;

    /// Remove an IPv4 address from an interface.
    fn remove_address(
        &self,
        interface: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), DirectoryError>;

    /// Look up a radio by index.
    fn get_phy(&self, index: u32) -> Result<PhyInfo, DirectoryError>;

    /// Look up a wireless interface by name.
    fn get_wireless_interface(&self, name: &str) -> Result<WirelessInterfaceInfo, DirectoryError>;

    /// Create a wireless interface on a radio.
    fn create_wireless_interface(
        &self,
        request: &WirelessInterfaceRequest,
    ) -> Result<(), DirectoryError>;

    /// Delete a wireless interface.
    fn delete_wireless_interface(
        &self,
        interface: &WirelessInterfaceInfo,
    ) -> Result<(), DirectoryError>;
}
