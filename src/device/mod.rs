//! Device/interface registry (component E).

pub mod dummy;
pub mod loopback;
#[cfg(all(unix, feature = "tap"))]
pub mod tap;

use crate::error::DeviceError;
use crate::ether::EtherAddr;
use crate::ip::IpInterface;
use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum DeviceType {
    Dummy = 0x0000,
    Loopback = 0x0001,
    Ethernet = 0x0002,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u16 {
        const UP        = 0x0001;
        const LOOPBACK  = 0x0010;
        const BROADCAST = 0x0020;
        const P2P       = 0x0040;
        const NEED_ARP  = 0x0100;
    }
}

/// Address family of an [`Interface`] attached to a device. `spec.md` §9
/// calls for composition over the reference's first-member "struct
/// inheritance" trick; this crate only implements the IP family (IPv6 is a
/// declared non-goal) but keeps the tagged-variant shape so a future family
/// is additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ip,
}

/// The family-independent part of an interface: which device it rides on.
/// Held as a non-owning handle per `spec.md` §9 ("the device↔interface
/// back-reference is a non-owning handle").
#[derive(Debug, Clone)]
pub struct Iface {
    dev: Weak<Device>,
    family: Family,
}

impl Iface {
    pub fn new(dev: &Arc<Device>, family: Family) -> Self {
        Iface { dev: Arc::downgrade(dev), family }
    }

    pub fn dev(&self) -> Option<Arc<Device>> {
        self.dev.upgrade()
    }

    pub fn family(&self) -> Family {
        self.family
    }
}

/// A family-tagged interface attached to a device. At most one per family
/// per device (`spec.md` §3).
pub enum Interface {
    Ip(IpInterface),
}

impl Interface {
    pub fn family(&self) -> Family {
        match self {
            Interface::Ip(iface) => iface.base().family(),
        }
    }
}

/// Driver hooks a device registers, replacing the reference's
/// `net_device_ops` function-pointer table with a trait object.
pub trait DeviceOps: Send + Sync {
    fn open(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn close(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// `dst` is the link-layer destination address, already resolved by
    /// the caller (ARP, or the device's broadcast address).
    fn transmit(&self, ethertype: u16, data: &[u8], dst: &[u8]) -> Result<(), DeviceError>;
}

/// Immutable after registration except `flags` and `ifaces`, matching
/// `spec.md` §3.
pub struct Device {
    pub index: u32,
    pub name: String,
    pub kind: DeviceType,
    pub mtu: u16,
    flags: AtomicU16,
    pub hlen: u16,
    pub alen: u16,
    pub addr: SmallVec<[u8; 16]>,
    pub broadcast: SmallVec<[u8; 16]>,
    ops: Arc<dyn DeviceOps>,
    ifaces: Mutex<Vec<Interface>>,
}

impl Device {
    pub fn flags(&self) -> DeviceFlags {
        DeviceFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: DeviceFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub fn is_up(&self) -> bool {
        self.flags().contains(DeviceFlags::UP)
    }

    pub fn ether_addr(&self) -> EtherAddr {
        let mut octets = [0u8; 6];
        octets.copy_from_slice(&self.addr[..6.min(self.addr.len())]);
        EtherAddr(octets)
    }

    pub fn add_iface(&self, iface: Interface) {
        self.ifaces.lock().expect("device iface list poisoned").push(iface);
    }

    pub fn with_ip_iface<R>(&self, f: impl FnOnce(&IpInterface) -> R) -> Option<R> {
        let ifaces = self.ifaces.lock().expect("device iface list poisoned");
        ifaces.iter().find_map(|iface| match iface {
            Interface::Ip(ip) => Some(f(ip)),
        })
    }

    /// Validates `UP` and MTU, then hands off to the driver. Mirrors
    /// `net_device_output`.
    pub fn output(&self, ethertype: u16, data: &[u8], dst: &[u8]) -> Result<(), DeviceError> {
        if !self.is_up() {
            return Err(DeviceError::NotUp(self.name.clone()));
        }
        if data.len() > self.mtu as usize {
            return Err(DeviceError::Mtu { len: data.len(), mtu: self.mtu as usize });
        }
        self.ops.transmit(ethertype, data, dst)
    }
}

pub struct DeviceParams {
    pub kind: DeviceType,
    pub mtu: u16,
    pub flags: DeviceFlags,
    pub hlen: u16,
    pub alen: u16,
    pub addr: SmallVec<[u8; 16]>,
    pub broadcast: SmallVec<[u8; 16]>,
    pub ops: Arc<dyn DeviceOps>,
}

/// Append-only device list. Mutated only at setup, matching `spec.md` §5:
/// "The device list is append-only after init and is not mutated during
/// run".
#[derive(Default)]
pub struct Registry {
    devices: Mutex<Vec<Arc<Device>>>,
    next_index: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Registry { devices: Mutex::new(Vec::new()), next_index: AtomicU32::new(0) }
    }

    /// Allocates the next index, assigns the `netN` name, and registers
    /// `params` as a new device. Mirrors `net_device_alloc` +
    /// `net_device_register`.
    pub fn register(&self, params: DeviceParams) -> Arc<Device> {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let dev = Arc::new(Device {
            index,
            name: format!("net{index}"),
            kind: params.kind,
            mtu: params.mtu,
            flags: AtomicU16::new(params.flags.bits()),
            hlen: params.hlen,
            alen: params.alen,
            addr: params.addr,
            broadcast: params.broadcast,
            ops: params.ops,
            ifaces: Mutex::new(Vec::new()),
        });
        self.devices.lock().expect("device list poisoned").push(dev.clone());
        log::info!("device {} registered, type={:?}", dev.name, dev.kind);
        dev
    }

    pub fn iter(&self) -> Vec<Arc<Device>> {
        self.devices.lock().expect("device list poisoned").clone()
    }

    pub fn open_all(&self) -> Result<(), DeviceError> {
        for dev in self.iter() {
            dev.ops.open()?;
            dev.set_flags(dev.flags() | DeviceFlags::UP);
        }
        Ok(())
    }

    pub fn close_all(&self) -> Result<(), DeviceError> {
        for dev in self.iter() {
            dev.set_flags(dev.flags() - DeviceFlags::UP);
            dev.ops.close()?;
        }
        Ok(())
    }
}
