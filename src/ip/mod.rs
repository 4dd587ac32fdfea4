//! IPv4 (component I).

pub mod route;

use crate::arp::ArpTable;
use crate::device::{Device, Family, Iface, Registry};
use crate::error::IpError;
use crate::ether::EtherType;
use crate::octet::checksum;
use route::RouteTable;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

pub const VERSION: u8 = 4;
pub const HDR_SIZE_MIN: usize = 20;
pub const HDR_SIZE_MAX: usize = 60;

pub const PROTOCOL_ICMP: u8 = 1;
pub const PROTOCOL_TCP: u8 = 6;
pub const PROTOCOL_UDP: u8 = 17;

/// The pseudo-header UDP and TCP fold into their checksum seed before
/// summing header+payload: `{src, dst, zero, protocol, length}` (`spec.md`
/// §4.10/§4.11). Returns the running sum, not yet folded or complemented,
/// ready to pass as `seed` to [`crate::octet::checksum`].
pub(crate) fn pseudo_header_seed(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, length: u16) -> u32 {
    let mut buf = [0u8; 12];
    buf[0..4].copy_from_slice(&src.octets());
    buf[4..8].copy_from_slice(&dst.octets());
    buf[9] = protocol;
    buf[10..12].copy_from_slice(&length.to_be_bytes());
    crate::octet::sum16(&buf, 0)
}

/// `(addr, port)`, as used by UDP and TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A parsed IPv4 header. Input parses bytes into this value object rather
/// than aliasing the input buffer as a packed struct, per `spec.md` §9's
/// "never alias arbitrary input bytes as a typed struct" note.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub ihl: u8,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub flags: u8,
    pub frag_offset: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Header {
    pub fn header_len(&self) -> usize {
        self.ihl as usize * 4
    }

    /// Parses the fixed 20-byte header plus whatever IHL adds; options
    /// (a declared non-goal) are skipped rather than interpreted.
    pub fn parse(data: &[u8]) -> Option<(Header, &[u8])> {
        if data.len() < HDR_SIZE_MIN {
            return None;
        }
        let (version, ihl) = crate::ether::split_nibbles(data[0]);
        if version != VERSION {
            return None;
        }
        let header_len = ihl as usize * 4;
        if header_len < HDR_SIZE_MIN || header_len > HDR_SIZE_MAX || data.len() < header_len {
            return None;
        }
        let total_len = u16::from_be_bytes([data[2], data[3]]);
        if (total_len as usize) < header_len || (total_len as usize) > data.len() {
            return None;
        }
        if !crate::octet::checksum_valid(&data[..header_len]) {
            return None;
        }
        let flags_frag = u16::from_be_bytes([data[6], data[7]]);
        let header = Header {
            ihl,
            tos: data[1],
            total_len,
            id: u16::from_be_bytes([data[4], data[5]]),
            flags: (flags_frag >> 13) as u8,
            frag_offset: flags_frag & 0x1fff,
            ttl: data[8],
            protocol: data[9],
            checksum: u16::from_be_bytes([data[10], data[11]]),
            src: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            dst: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
        };
        Some((header, &data[header_len..total_len as usize]))
    }

    /// Serializes a fixed 20-byte header (no options are ever emitted) with
    /// the checksum computed last.
    pub fn build(id: u16, ttl: u8, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
        let total_len = (HDR_SIZE_MIN + payload_len) as u16;
        let mut bytes = vec![0u8; HDR_SIZE_MIN];
        bytes[0] = (VERSION << 4) | 5; // IHL = 5 words, no options
        bytes[1] = 0;
        bytes[2..4].copy_from_slice(&total_len.to_be_bytes());
        bytes[4..6].copy_from_slice(&id.to_be_bytes());
        bytes[6..8].copy_from_slice(&0u16.to_be_bytes()); // flags/offset = 0
        bytes[8] = ttl;
        bytes[9] = protocol;
        bytes[10..12].copy_from_slice(&0u16.to_be_bytes());
        bytes[12..16].copy_from_slice(&src.octets());
        bytes[16..20].copy_from_slice(&dst.octets());
        let sum = checksum(&bytes, 0);
        bytes[10..12].copy_from_slice(&sum.to_be_bytes());
        bytes
    }
}

/// A cheap-to-clone snapshot of an IP interface, passed to upper-layer
/// protocol handlers instead of a borrow into the device's interface list.
#[derive(Clone)]
pub struct IpIfaceInfo {
    pub unicast: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
    pub dev: Arc<Device>,
}

impl IpIfaceInfo {
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask) == u32::from(self.unicast) & u32::from(self.netmask)
    }
}

/// The IP-family interface attached to a device. Composition stand-in for
/// the reference's first-member "struct inheritance" (`spec.md` §9).
pub struct IpInterface {
    base: Iface,
    pub unicast: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub broadcast: Ipv4Addr,
}

impl IpInterface {
    pub fn new(dev: &Arc<Device>, unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let broadcast = Ipv4Addr::from(u32::from(unicast) | !u32::from(netmask));
        IpInterface { base: Iface::new(dev, Family::Ip), unicast, netmask, broadcast }
    }

    pub fn base(&self) -> &Iface {
        &self.base
    }

    delegate::delegate! {
        to self.base {
            pub fn dev(&self) -> Option<Arc<Device>>;
            pub fn family(&self) -> Family;
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.unicast) & u32::from(self.netmask))
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & u32::from(self.netmask) == u32::from(self.network())
    }

    pub fn info(&self) -> Option<IpIfaceInfo> {
        Some(IpIfaceInfo { unicast: self.unicast, netmask: self.netmask, broadcast: self.broadcast, dev: self.dev()? })
    }
}

type ProtocolHandler = Arc<dyn Fn(&[u8], Ipv4Addr, Ipv4Addr, &IpIfaceInfo) + Send + Sync>;

/// The IPv4 layer: interface lookup, routing, checksum/header handling,
/// and protocol demultiplexing.
pub struct IpStack {
    registry: Arc<Registry>,
    arp: Arc<ArpTable>,
    routes: RouteTable,
    protocols: Mutex<HashMap<u8, ProtocolHandler>>,
    next_id: AtomicU16,
}

impl IpStack {
    pub fn new(registry: Arc<Registry>, arp: Arc<ArpTable>) -> Arc<Self> {
        Arc::new(IpStack {
            registry,
            arp,
            routes: RouteTable::new(),
            protocols: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(128),
        })
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Registers `handler` for `protocol`; idempotency-checked, matching
    /// `ip_protocol_register`.
    pub fn protocol_register(&self, protocol: u8, handler: ProtocolHandler) -> Result<(), IpError> {
        let mut protocols = self.protocols.lock().expect("ip protocol table poisoned");
        if protocols.contains_key(&protocol) {
            return Err(IpError::ProtocolInUse(protocol));
        }
        protocols.insert(protocol, handler);
        Ok(())
    }

    /// Registers an IP interface on `dev` and attaches it. Mirrors
    /// `ip_iface_alloc` + `ip_iface_register`.
    pub fn iface_register(&self, dev: &Arc<Device>, unicast: Ipv4Addr, netmask: Ipv4Addr) {
        dev.add_iface(crate::device::Interface::Ip(IpInterface::new(dev, unicast, netmask)));
    }

    /// Finds the IP interface whose unicast address is exactly `addr`.
    /// Mirrors `ip_iface_select`.
    pub fn iface_select(&self, addr: Ipv4Addr) -> Option<IpIfaceInfo> {
        self.registry.iter().into_iter().find_map(|dev| {
            let info = dev.with_ip_iface(|iface| iface.info()).flatten()?;
            (info.unicast == addr).then_some(info)
        })
    }

    /// Picks a source address for a PCB that hasn't bound one yet: the
    /// unicast address of the directly-connected interface if one already
    /// covers `dst`, else the unicast address of whatever interface the
    /// routing table would send it out of. Used by UDP `sendto` and TCP's
    /// active-open path (`spec.md` §4.10 "pick the source address from the
    /// routing table").
    pub fn source_for(&self, dst: Ipv4Addr) -> Option<Ipv4Addr> {
        for dev in self.registry.iter() {
            if let Some(info) = dev.with_ip_iface(|iface| iface.info()).flatten() {
                if info.contains(dst) {
                    return Some(info.unicast);
                }
            }
        }
        let route = self.routes.lookup(dst)?;
        route.iface.with_ip_iface(|iface| iface.unicast)
    }

    /// Called from the soft-IRQ drain with a frame whose ethertype was
    /// [`EtherType::Ip`]. Never returns an error to the caller — validation
    /// failures are logged and the packet is dropped, per `spec.md` §7.
    pub fn input(&self, data: &[u8], dev: &Arc<Device>) {
        let Some((header, payload)) = Header::parse(data) else {
            log::debug!("ip: dropping malformed datagram on {}", dev.name);
            return;
        };
        if header.flags & 0b001 != 0 || header.frag_offset != 0 {
            log::debug!("ip: dropping fragmented datagram (unsupported)");
            return;
        }
        let Some(iface) = dev.with_ip_iface(|iface| iface.info()).flatten() else {
            log::debug!("ip: {} has no IP interface", dev.name);
            return;
        };
        let accepted = header.dst == iface.unicast || header.dst == iface.broadcast || header.dst == Ipv4Addr::BROADCAST;
        if !accepted {
            log::debug!("ip: datagram for {} not addressed to {}", header.dst, iface.unicast);
            return;
        }
        let handler = self.protocols.lock().expect("ip protocol table poisoned").get(&header.protocol).cloned();
        match handler {
            Some(handler) => handler(payload, header.src, header.dst, &iface),
            None => log::debug!("ip: no handler for protocol {}", header.protocol),
        }
    }

    /// Builds and transmits an IPv4 datagram. Mirrors `ip_output` +
    /// `ip_output_device`.
    pub fn output(&self, protocol: u8, data: &[u8], src: Ipv4Addr, dst: Ipv4Addr) -> Result<usize, IpError> {
        if src == Ipv4Addr::UNSPECIFIED {
            return Err(IpError::NoSuchSource);
        }
        let iface = self.iface_select(src).ok_or(IpError::NoSuchSource)?;

        let reachable = dst == Ipv4Addr::BROADCAST || iface.contains(dst) || self.routes.lookup(dst).is_some();
        if !reachable {
            return Err(IpError::Unreachable);
        }

        if HDR_SIZE_MIN + data.len() > iface.dev.mtu as usize {
            return Err(IpError::Mtu { len: data.len(), mtu: iface.dev.mtu as usize });
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut packet = Header::build(id, 255, protocol, src, dst, data.len());
        packet.extend_from_slice(data);

        self.output_device(&iface, dst, &packet)?;
        Ok(packet.len())
    }

    fn output_device(&self, iface: &IpIfaceInfo, dst: Ipv4Addr, packet: &[u8]) -> Result<(), IpError> {
        let dev = &iface.dev;
        let needs_arp = dev.flags().contains(crate::device::DeviceFlags::NEED_ARP);
        let hw: Vec<u8> = if !needs_arp {
            Vec::new()
        } else if dst == Ipv4Addr::BROADCAST || dst == iface.broadcast {
            dev.broadcast.to_vec()
        } else {
            self.arp.resolve(dev, dst)?.0.to_vec()
        };
        dev.output(u16::from(EtherType::Ip), packet, &hw).map_err(IpError::from)
    }
}
