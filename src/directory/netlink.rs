//! Interface directory backed by route netlink and nl80211.
//!
//! Each protocol gets its own connection object owned by
//! [`NetlinkDirectory`]. Requests always ask for an ack; the replies are fed
//! to a [`ReplyHandler`] until the kernel acks, errors or finishes.

use std::fmt::Debug;
use std::net::Ipv4Addr;

use neli::consts::nl::{NlType, NlmF, NlmFFlags};
use neli::consts::rtnl::{
    Arphrd, Ifa, IfaFFlags, Iff, IffFlags, Ifla, RtAddrFamily, RtScope, Rtm,
};
use neli::consts::socket::NlFamily;
use neli::err::NlError;
use neli::genl::{Genlmsghdr, Nlattr};
use neli::nl::{NlPayload, Nlmsghdr};
use neli::rtnl::{Ifaddrmsg, Ifinfomsg, Rtattr};
use neli::socket::NlSocketHandle;
use neli::types::{Buffer, GenlBuffer, RtBuffer};
use neli::{FromBytesWithInput, Size, ToBytes};
use parking_lot::Mutex;
use pnet::util::MacAddr;
use tracing::{debug, trace};

use super::{
    AddressChange, Attributes, InterfaceDirectory, InterfaceType, LinkFlags, LinkInfo, OperState,
    PhyInfo, WirelessInterfaceInfo, WirelessInterfaceRequest,
};
use crate::error::DirectoryError;

const NL80211_FAMILY: &str = "nl80211";
const NL80211_VERSION: u8 = 1;

const NL80211_CMD_GET_WIPHY: u8 = 1;
const NL80211_CMD_GET_INTERFACE: u8 = 5;
const NL80211_CMD_NEW_INTERFACE: u8 = 7;
const NL80211_CMD_DEL_INTERFACE: u8 = 8;

const NL80211_ATTR_WIPHY: u16 = 1;
const NL80211_ATTR_WIPHY_NAME: u16 = 2;
const NL80211_ATTR_IFINDEX: u16 = 3;
const NL80211_ATTR_IFNAME: u16 = 4;
const NL80211_ATTR_IFTYPE: u16 = 5;

const INTERFACE_ATTRIBUTES: [u16; 4] = [
    NL80211_ATTR_WIPHY,
    NL80211_ATTR_IFINDEX,
    NL80211_ATTR_IFNAME,
    NL80211_ATTR_IFTYPE,
];

const PHY_ATTRIBUTES: [u16; 2] = [NL80211_ATTR_WIPHY, NL80211_ATTR_WIPHY_NAME];

const LINK_ATTRIBUTES: [Ifla; 5] = [
    Ifla::Ifname,
    Ifla::Address,
    Ifla::Mtu,
    Ifla::Operstate,
    Ifla::Carrier,
];

type GenlMessage = Genlmsghdr<u8, u16>;

/// The roles a reply can play for an outstanding request.
///
/// `valid` is called for each data message, then exactly one of `ack`,
/// `finish` or `error` ends the exchange.
pub trait ReplyHandler<P> {
    fn valid(&mut self, payload: P) -> Result<(), DirectoryError>;

    fn finish(&mut self) {}

    fn ack(&mut self) {}

    fn error(&mut self, op: &'static str, errno: i32) -> DirectoryError {
        DirectoryError::from_errno(op, errno)
    }
}

/// Ignores data messages; used for requests that only expect an ack.
struct AckOnly;

impl<P> ReplyHandler<P> for AckOnly {
    fn valid(&mut self, _payload: P) -> Result<(), DirectoryError> {
        Ok(())
    }
}

/// Decodes the first data message with `decode`.
struct Decode<T, F> {
    decode: F,
    value: Option<T>,
}

impl<T, F> Decode<T, F> {
    const fn new(decode: F) -> Self {
        Self {
            decode,
            value: None,
        }
    }

    fn into_value(self, op: &'static str) -> Result<T, DirectoryError> {
        self.value
            .ok_or_else(|| DirectoryError::transport(op, "kernel acked without a reply"))
    }
}

impl<P, T, F> ReplyHandler<P> for Decode<T, F>
where
    F: FnMut(&P) -> Result<T, DirectoryError>,
{
    fn valid(&mut self, payload: P) -> Result<(), DirectoryError> {
        if self.value.is_none() {
            self.value = Some((self.decode)(&payload)?);
        }
        Ok(())
    }
}

/// One connected netlink socket.
struct Channel {
    name: &'static str,
    socket: NlSocketHandle,
}

impl Channel {
    fn connect(name: &'static str, family: NlFamily) -> Result<Self, DirectoryError> {
        let socket = NlSocketHandle::connect(family, None, &[]).map_err(|e| {
            DirectoryError::Connect {
                channel: name,
                message: e.to_string(),
            }
        })?;
        debug!(channel = name, "netlink channel connected");
        Ok(Self { name, socket })
    }

    fn transact<T, P, H>(
        &mut self,
        op: &'static str,
        request: Nlmsghdr<T, P>,
        handler: &mut H,
    ) -> Result<(), DirectoryError>
    where
        T: NlType + Debug,
        P: Size + ToBytes + Debug + for<'a> FromBytesWithInput<'a, Input = usize>,
        H: ReplyHandler<P>,
    {
        trace!(channel = self.name, op, "sending request");
        self.socket
            .send(request)
            .map_err(|e| DirectoryError::transport(op, e.to_string()))?;

        loop {
            let reply: Option<Nlmsghdr<T, P>> = match self.socket.recv() {
                Ok(reply) => reply,
                Err(NlError::Nlmsgerr(err)) => return Err(handler.error(op, -err.error)),
                Err(e) => return Err(DirectoryError::transport(op, format!("{e:?}"))),
            };

            let Some(reply) = reply else {
                handler.finish();
                return Ok(());
            };

            match reply.nl_payload {
                NlPayload::Payload(payload) => handler.valid(payload)?,
                NlPayload::Ack(_) => {
                    handler.ack();
                    return Ok(());
                }
                NlPayload::Err(err) if err.error == 0 => {
                    handler.ack();
                    return Ok(());
                }
                NlPayload::Err(err) => return Err(handler.error(op, -err.error)),
                NlPayload::Empty => {
                    handler.finish();
                    return Ok(());
                }
            }
        }
    }
}

/// Production [`InterfaceDirectory`] speaking route netlink and nl80211.
///
/// Dropping the directory closes both control channels.
pub struct NetlinkDirectory {
    route: Mutex<Channel>,
    generic: Mutex<Channel>,
    nl80211: u16,
}

impl NetlinkDirectory {
    /// Connect both channels and resolve the nl80211 family.
    pub fn connect() -> Result<Self, DirectoryError> {
        let route = Channel::connect("route netlink", NlFamily::Route)?;
        let mut generic = Channel::connect("generic netlink", NlFamily::Generic)?;
        let nl80211 = generic
            .socket
            .resolve_genl_family(NL80211_FAMILY)
            .map_err(|e| DirectoryError::Connect {
                channel: "nl80211",
                message: e.to_string(),
            })?;
        debug!(family = nl80211, "resolved nl80211 family");

        Ok(Self {
            route: Mutex::new(route),
            generic: Mutex::new(generic),
            nl80211,
        })
    }

    fn genl_request(&self, cmd: u8, attrs: GenlBuffer<u16, Buffer>) -> Nlmsghdr<u16, GenlMessage> {
        Nlmsghdr::new(
            None,
            self.nl80211,
            request_flags(&[]),
            None,
            None,
            NlPayload::Payload(Genlmsghdr::new(cmd, NL80211_VERSION, attrs)),
        )
    }
}

impl Drop for NetlinkDirectory {
    fn drop(&mut self) {
        debug!("closing netlink control channels");
    }
}

impl InterfaceDirectory for NetlinkDirectory {
    fn get_link(&self, name: &str) -> Result<LinkInfo, DirectoryError> {
        const OP: &str = "get link";

        let mut attrs = RtBuffer::new();
        attrs.push(rtattr(OP, Ifla::Ifname, nul_terminated(name).as_slice())?);
        let msg = Ifinfomsg::new(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            0,
            IffFlags::empty(),
            IffFlags::empty(),
            attrs,
        );
        let request = Nlmsghdr::new(
            None,
            Rtm::Getlink,
            request_flags(&[]),
            None,
            None,
            NlPayload::Payload(msg),
        );

        let mut handler = Decode::new(decode_link);
        self.route.lock().transact(OP, request, &mut handler)?;
        handler.into_value(OP)
    }

    fn set_link(&self, link: &LinkInfo) -> Result<(), DirectoryError> {
        const OP: &str = "set link";

        let mut attrs = RtBuffer::new();
        if link.mtu > 0 {
            attrs.push(rtattr(OP, Ifla::Mtu, link.mtu)?);
        }
        let flags = if link.is_up() {
            IffFlags::new(&[Iff::Up])
        } else {
            IffFlags::empty()
        };
        let msg = Ifinfomsg::new(
            RtAddrFamily::Unspecified,
            Arphrd::Netrom,
            ifindex(OP, link.index)?,
            flags,
            IffFlags::new(&[Iff::Up]),
            attrs,
        );
        let request = Nlmsghdr::new(
            None,
            Rtm::Setlink,
            request_flags(&[]),
            None,
            None,
            NlPayload::Payload(msg),
        );

        self.route.lock().transact(OP, request, &mut AckOnly)
    }

    fn add_address(
        &self,
        interface: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<AddressChange, DirectoryError> {
        const OP: &str = "add address";

        let link = self.get_link(interface)?;
        let request = Nlmsghdr::new(
            None,
            Rtm::Newaddr,
            request_flags(&[NlmF::Create, NlmF::Excl]),
            None,
            None,
            NlPayload::Payload(address_message(OP, &link, address, prefix_len)?),
        );

        match self.route.lock().transact(OP, request, &mut AckOnly) {
            Ok(()) => Ok(AddressChange::Added),
            Err(DirectoryError::AlreadyExists { .. }) => Ok(AddressChange::AlreadyPresent),
            Err(err) => Err(err),
        }
    }

    fn remove_address(
        &self,
        interface: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), DirectoryError> {
        const OP: &str = "remove address";

        let link = self.get_link(interface)?;
        let request = Nlmsghdr::new(
            None,
            Rtm::Deladdr,
            request_flags(&[]),
            None,
            None,
            NlPayload::Payload(address_message(OP, &link, address, prefix_len)?),
        );

        self.route.lock().transact(OP, request, &mut AckOnly)
    }

    fn get_phy(&self, index: u32) -> Result<PhyInfo, DirectoryError> {
        const OP: &str = "get wiphy";

        let mut attrs = GenlBuffer::new();
        attrs.push(nlattr(OP, NL80211_ATTR_WIPHY, index)?);
        let request = self.genl_request(NL80211_CMD_GET_WIPHY, attrs);

        let mut handler = Decode::new(|msg: &GenlMessage| {
            let handle = msg.get_attr_handle();
            let attrs = Attributes::from_pairs(PHY_ATTRIBUTES.into_iter().filter_map(|kind| {
                handle
                    .get_attribute(kind)
                    .map(|attr| (kind, attr.nla_payload.as_ref()))
            }));
            phy_from_attributes(&attrs)
        });
        self.generic.lock().transact(OP, request, &mut handler)?;
        handler.into_value(OP)
    }

    fn get_wireless_interface(&self, name: &str) -> Result<WirelessInterfaceInfo, DirectoryError> {
        const OP: &str = "get interface";

        let link = self.get_link(name)?;
        let mut attrs = GenlBuffer::new();
        attrs.push(nlattr(OP, NL80211_ATTR_IFINDEX, link.index)?);
        let request = self.genl_request(NL80211_CMD_GET_INTERFACE, attrs);

        let mut handler = Decode::new(|msg: &GenlMessage| {
            let handle = msg.get_attr_handle();
            let attrs =
                Attributes::from_pairs(INTERFACE_ATTRIBUTES.into_iter().filter_map(|kind| {
                    handle
                        .get_attribute(kind)
                        .map(|attr| (kind, attr.nla_payload.as_ref()))
                }));
            interface_from_attributes(&attrs)
        });
        self.generic.lock().transact(OP, request, &mut handler)?;
        let reply = handler.into_value(OP)?;

        let phy = self.get_phy(reply.phy)?;
        Ok(WirelessInterfaceInfo {
            index: reply.index,
            name: reply.name,
            interface_type: reply.interface_type,
            phy,
            link,
        })
    }

    fn create_wireless_interface(
        &self,
        request: &WirelessInterfaceRequest,
    ) -> Result<(), DirectoryError> {
        const OP: &str = "new interface";

        let mut attrs = GenlBuffer::new();
        attrs.push(nlattr(OP, NL80211_ATTR_WIPHY, request.phy_index)?);
        attrs.push(nlattr(
            OP,
            NL80211_ATTR_IFNAME,
            nul_terminated(&request.name).as_slice(),
        )?);
        attrs.push(nlattr(
            OP,
            NL80211_ATTR_IFTYPE,
            u32::from(request.interface_type),
        )?);
        let message = self.genl_request(NL80211_CMD_NEW_INTERFACE, attrs);

        self.generic.lock().transact(OP, message, &mut AckOnly)
    }

    fn delete_wireless_interface(
        &self,
        interface: &WirelessInterfaceInfo,
    ) -> Result<(), DirectoryError> {
        const OP: &str = "del interface";

        let mut attrs = GenlBuffer::new();
        attrs.push(nlattr(OP, NL80211_ATTR_IFINDEX, interface.index)?);
        let message = self.genl_request(NL80211_CMD_DEL_INTERFACE, attrs);

        self.generic.lock().transact(OP, message, &mut AckOnly)
    }
}

/// Fields of an `NL80211_CMD_NEW_INTERFACE` style reply.
#[derive(Debug, PartialEq, Eq)]
struct InterfaceReply {
    phy: u32,
    index: u32,
    name: String,
    interface_type: InterfaceType,
}

fn interface_from_attributes(attrs: &Attributes<'_>) -> Result<InterfaceReply, DirectoryError> {
    Ok(InterfaceReply {
        phy: attrs.u32(NL80211_ATTR_WIPHY, "NL80211_ATTR_WIPHY")?,
        index: attrs.u32(NL80211_ATTR_IFINDEX, "NL80211_ATTR_IFINDEX")?,
        name: attrs.string(NL80211_ATTR_IFNAME, "NL80211_ATTR_IFNAME")?,
        interface_type: InterfaceType::from(attrs.u32(NL80211_ATTR_IFTYPE, "NL80211_ATTR_IFTYPE")?),
    })
}

fn phy_from_attributes(attrs: &Attributes<'_>) -> Result<PhyInfo, DirectoryError> {
    Ok(PhyInfo {
        index: attrs.u32(NL80211_ATTR_WIPHY, "NL80211_ATTR_WIPHY")?,
        name: attrs.string(NL80211_ATTR_WIPHY_NAME, "NL80211_ATTR_WIPHY_NAME")?,
    })
}

fn decode_link(msg: &Ifinfomsg) -> Result<LinkInfo, DirectoryError> {
    let handle = msg.rtattrs.get_attr_handle();
    let attrs = Attributes::from_pairs(LINK_ATTRIBUTES.into_iter().filter_map(|kind| {
        handle
            .get_attribute(kind)
            .map(|attr| (u16::from(kind), attr.rta_payload.as_ref()))
    }));

    let index = u32::try_from(msg.ifi_index).map_err(|_| DirectoryError::MalformedAttribute {
        attribute: "ifi_index",
        len: 4,
    })?;

    let hardware_address = match attrs.get(u16::from(Ifla::Address)) {
        Some(_) => MacAddr::from(attrs.array::<6>(u16::from(Ifla::Address), "IFLA_ADDRESS")?),
        None => MacAddr::zero(),
    };

    Ok(LinkInfo {
        index,
        name: attrs.string(u16::from(Ifla::Ifname), "IFLA_IFNAME")?,
        flags: link_flags(&msg.ifi_flags),
        oper_state: attrs
            .optional_u8(u16::from(Ifla::Operstate), "IFLA_OPERSTATE")?
            .map_or(OperState::Unknown, OperState::from),
        carrier: attrs
            .optional_u8(u16::from(Ifla::Carrier), "IFLA_CARRIER")?
            .is_some_and(|carrier| carrier != 0),
        hardware_address,
        mtu: attrs.optional_u32(u16::from(Ifla::Mtu), "IFLA_MTU")?.unwrap_or(0),
    })
}

fn managed_flags() -> [(Iff, LinkFlags); 6] {
    [
        (Iff::Up, LinkFlags::UP),
        (Iff::Broadcast, LinkFlags::BROADCAST),
        (Iff::Loopback, LinkFlags::LOOPBACK),
        (Iff::Running, LinkFlags::RUNNING),
        (Iff::Promisc, LinkFlags::PROMISC),
        (Iff::Multicast, LinkFlags::MULTICAST),
    ]
}

fn link_flags(flags: &IffFlags) -> LinkFlags {
    managed_flags()
        .into_iter()
        .filter(|(iff, _)| flags.contains(iff))
        .fold(LinkFlags::empty(), |acc, (_, flag)| acc | flag)
}

fn address_message(
    op: &'static str,
    link: &LinkInfo,
    address: Ipv4Addr,
    prefix_len: u8,
) -> Result<Ifaddrmsg, DirectoryError> {
    let octets = address.octets();
    let mut attrs = RtBuffer::new();
    attrs.push(rtattr(op, Ifa::Local, &octets[..])?);
    attrs.push(rtattr(op, Ifa::Address, &octets[..])?);

    Ok(Ifaddrmsg {
        ifa_family: RtAddrFamily::Inet,
        ifa_prefixlen: prefix_len,
        ifa_flags: IfaFFlags::empty(),
        ifa_scope: RtScope::Universe.into(),
        ifa_index: ifindex(op, link.index)?,
        rtattrs: attrs,
    })
}

fn request_flags(extra: &[NlmF]) -> NlmFFlags {
    let mut flags = vec![NlmF::Request, NlmF::Ack];
    flags.extend_from_slice(extra);
    NlmFFlags::new(&flags)
}

fn nul_terminated(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes
}

fn ifindex(op: &'static str, index: u32) -> Result<libc::c_int, DirectoryError> {
    libc::c_int::try_from(index)
        .map_err(|_| DirectoryError::transport(op, format!("ifindex {index} out of range")))
}

fn rtattr<T, P>(op: &'static str, kind: T, payload: P) -> Result<Rtattr<T, Buffer>, DirectoryError>
where
    T: neli::consts::rtnl::RtaType,
    P: Size + ToBytes,
{
    Rtattr::new(None, kind, payload).map_err(|e| DirectoryError::transport(op, e.to_string()))
}

fn nlattr<P>(op: &'static str, kind: u16, payload: P) -> Result<Nlattr<u16, Buffer>, DirectoryError>
where
    P: Size + ToBytes,
{
    Nlattr::new(false, false, kind, payload).map_err(|e| DirectoryError::transport(op, e.to_string()))
}
