//! Lifecycle wiring (`net_init`/`net_run`/`net_shutdown`).
//!
//! Owns every component and reproduces the reference's `net_input_handler`
//! demultiplex: a driver ISR (or, for TAP, a dedicated reader thread) parses
//! a link frame and hands `(ethertype, payload, dev)` to [`InputDemux`],
//! which copies it onto the matching protocol's receive queue and raises
//! the soft-IRQ; the worker thread's soft-IRQ handler drains every queue
//! and calls the registered protocol handler (IP or ARP) from there, never
//! from the driver's own thread. Grounded on `examples/original_source/net.c`
//! (`net_input_handler`/`net_softirq_handler`).

use crate::arp::ArpTable;
use crate::config::StackConfig;
use crate::device::dummy::DummyDriver;
use crate::device::loopback::LoopbackDriver;
use crate::device::{Device, DeviceFlags, DeviceParams, DeviceType, Registry};
use crate::error::Error;
use crate::ether::{self, EtherAddr, EtherType};
use crate::event::EventBus;
use crate::icmp::IcmpStack;
use crate::interrupt::{Interrupts, IrqFlags};
use crate::ip::IpStack;
use crate::queue::Fifo;
use crate::tcp::TcpStack;
use crate::udp::UdpStack;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[cfg(all(unix, feature = "tap"))]
use crate::device::tap::TapDriver;

type EtherHandler = Arc<dyn Fn(&[u8], &Arc<Device>) + Send + Sync>;

struct QueuedFrame {
    data: Vec<u8>,
    dev: Arc<Device>,
}

struct ProtoSlot {
    handler: EtherHandler,
    queue: Fifo<QueuedFrame>,
}

/// The ethertype-keyed demultiplexer standing in for the reference's
/// per-protocol receive queues (`spec.md` §4.5 `net_input_handler`).
struct InputDemux {
    slots: Mutex<HashMap<u16, ProtoSlot>>,
}

impl InputDemux {
    fn new() -> Self {
        InputDemux { slots: Mutex::new(HashMap::new()) }
    }

    fn register(&self, ethertype: u16, handler: EtherHandler) {
        self.slots.lock().expect("demux table poisoned").insert(ethertype, ProtoSlot { handler, queue: Fifo::new() });
    }

    /// Copies `data` onto the matching protocol queue. Unknown ethertypes
    /// are dropped silently, matching `spec.md` §4.5.
    fn input(&self, ethertype: u16, data: &[u8], dev: &Arc<Device>) {
        let mut slots = self.slots.lock().expect("demux table poisoned");
        match slots.get_mut(&ethertype) {
            Some(slot) => slot.queue.push(QueuedFrame { data: data.to_vec(), dev: dev.clone() }),
            None => log::debug!("net: no handler for ethertype 0x{ethertype:04x}"),
        }
    }

    /// Drains every protocol queue. Run from the worker's soft-IRQ handler,
    /// never from a driver's own thread.
    fn drain(&self) {
        let mut slots = self.slots.lock().expect("demux table poisoned");
        for slot in slots.values_mut() {
            while let Some(frame) = slot.queue.pop() {
                (slot.handler)(&frame.data, &frame.dev);
            }
        }
    }
}

/// Everything a running stack owns. Construct with [`init`], bring devices
/// up with [`Stack::run`], tear down with [`Stack::shutdown`].
pub struct Stack {
    pub interrupts: Arc<Interrupts>,
    pub registry: Arc<Registry>,
    pub arp: Arc<ArpTable>,
    pub ip: Arc<IpStack>,
    pub icmp: Arc<IcmpStack>,
    pub udp: Arc<UdpStack>,
    pub tcp: Arc<TcpStack>,
    pub events: Arc<EventBus>,
    #[allow(dead_code)]
    demux: Arc<InputDemux>,
    pub devices: Vec<Arc<Device>>,
}

/// Pushes a parsed frame onto the protocol queue and wakes the worker.
/// Shared by every link driver's ISR/reader-thread callback.
fn net_input_handler(demux: &InputDemux, interrupts: &Interrupts, ethertype: u16, data: &[u8], dev: &Arc<Device>) {
    demux.input(ethertype, data, dev);
    interrupts.raise_softirq();
}

impl Stack {
    /// Brings every configured device `UP`. Mirrors starting the reference
    /// binary's event loop after `net_init` has registered everything.
    pub fn run(&self) -> Result<(), Error> {
        self.registry.open_all().map_err(Error::from)
    }

    /// Closes devices first, then stops the interrupt worker, matching
    /// `spec.md` §5 "Shutdown closes devices first, then stops the
    /// interrupt loop".
    pub fn shutdown(&self) {
        if let Err(err) = self.registry.close_all() {
            log::error!("net: error closing devices during shutdown: {err}");
        }
        self.interrupts.shutdown();
    }

    /// Broadcasts an interruption to every blocked UDP/TCP call. Mirrors
    /// `net_raise_event` (Ctrl-C cancellation).
    pub fn raise_event(&self) {
        self.events.raise();
    }

    /// Registers a handler to run on every future [`Stack::raise_event`].
    /// Mirrors `net_event_subscribe`.
    pub fn event_subscribe<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.subscribe(handler);
    }
}

/// Builds the full stack from `config`: devices, IP interfaces, routes,
/// and every protocol module, wired together but not yet brought `UP` —
/// call [`Stack::run`] for that. Mirrors `net_init`.
pub fn init(config: StackConfig) -> Result<Arc<Stack>, Error> {
    let interrupts = Interrupts::new();
    let registry = Arc::new(Registry::new());
    let arp = ArpTable::new();
    arp.install_expiry_sweeper(&interrupts);
    let ip = IpStack::new(registry.clone(), arp.clone());
    let events = Arc::new(EventBus::new());
    let icmp = IcmpStack::init(ip.clone());
    let udp = UdpStack::init(ip.clone(), &events);
    let tcp = TcpStack::init(ip.clone(), &events);

    let demux = Arc::new(InputDemux::new());
    let ip_handler = ip.clone();
    demux.register(u16::from(EtherType::Ip), Arc::new(move |data, dev| ip_handler.input(data, dev)));
    let arp_handler = arp.clone();
    demux.register(u16::from(EtherType::Arp), Arc::new(move |data, dev| arp_handler.input(data, dev)));

    let softirq_demux = demux.clone();
    interrupts.set_softirq_handler(move || softirq_demux.drain());

    let mut devices = Vec::with_capacity(config.devices.len());
    for device_config in &config.devices {
        let dev = match device_config.kind {
            DeviceType::Loopback => add_loopback(&registry, &interrupts, &demux),
            DeviceType::Dummy => add_dummy(&registry, &interrupts),
            DeviceType::Ethernet => add_tap(&registry, &interrupts, &demux, device_config.tap_name.as_deref())?,
        };
        ip.iface_register(&dev, device_config.unicast, device_config.netmask);
        if let Some(gateway) = device_config.gateway {
            ip.routes().set_default_gateway(dev.clone(), gateway);
        }
        devices.push(dev);
    }

    for route in &config.routes {
        let iface = devices.get(route.device_index).ok_or_else(|| Error::Init(format!("no device at index {}", route.device_index)))?;
        ip.routes().add(route.network, route.netmask, route.nexthop, iface.clone());
    }

    Ok(Arc::new(Stack { interrupts, registry, arp, ip, icmp, udp, tcp, events, demux, devices }))
}

fn add_loopback(registry: &Arc<Registry>, interrupts: &Arc<Interrupts>, demux: &Arc<InputDemux>) -> Arc<Device> {
    let driver = LoopbackDriver::new(registry.iter().len() as u32, interrupts.clone());
    let dev = registry.register(DeviceParams {
        kind: DeviceType::Loopback,
        mtu: u16::MAX,
        flags: DeviceFlags::LOOPBACK,
        hlen: 0,
        alen: 0,
        addr: Default::default(),
        broadcast: Default::default(),
        ops: driver.clone(),
    });

    let dev_for_irq = dev.clone();
    let demux_for_irq = demux.clone();
    let interrupts_for_irq = interrupts.clone();
    interrupts
        .request_irq(driver.irq(), dev.name.as_str(), IrqFlags::Exclusive, move || {
            driver.drain(|ethertype, data| {
                net_input_handler(&demux_for_irq, &interrupts_for_irq, ethertype, data, &dev_for_irq);
            });
        })
        .expect("loopback: irq already has an exclusive handler");
    dev
}

fn add_dummy(registry: &Arc<Registry>, interrupts: &Arc<Interrupts>) -> Arc<Device> {
    let driver = DummyDriver::new(registry.iter().len() as u32, interrupts.clone());
    let dev = registry.register(DeviceParams {
        kind: DeviceType::Dummy,
        mtu: u16::MAX,
        flags: DeviceFlags::empty(),
        hlen: 0,
        alen: 0,
        addr: Default::default(),
        broadcast: Default::default(),
        ops: driver.clone(),
    });
    interrupts.request_irq(driver.irq(), dev.name.as_str(), IrqFlags::Shared, || {}).expect("dummy: irq registration failed");
    dev
}

#[cfg(all(unix, feature = "tap"))]
fn add_tap(
    registry: &Arc<Registry>,
    interrupts: &Arc<Interrupts>,
    demux: &Arc<InputDemux>,
    name: Option<&str>,
) -> Result<Arc<Device>, Error> {
    let name = name.ok_or_else(|| Error::Init("tap device requires a host interface name".into()))?;
    let driver = TapDriver::open(name).map_err(|err| Error::Init(format!("failed to open tap device {name}: {err}")))?;
    let hwaddr = driver.hwaddr();
    let dev = registry.register(DeviceParams {
        kind: DeviceType::Ethernet,
        mtu: ether::PAYLOAD_SIZE_MAX as u16,
        flags: DeviceFlags::BROADCAST | DeviceFlags::NEED_ARP,
        hlen: ether::HDR_SIZE as u16,
        alen: ether::ADDR_LEN as u16,
        addr: hwaddr.0.to_vec().into(),
        broadcast: EtherAddr::BROADCAST.0.to_vec().into(),
        ops: driver.clone(),
    });

    let dev_for_reader = dev.clone();
    let demux_for_reader = demux.clone();
    let interrupts_for_reader = interrupts.clone();
    std::thread::Builder::new()
        .name(format!("tap-{name}"))
        .spawn(move || loop {
            let mut buf = [0u8; ether::FRAME_SIZE_MAX];
            match driver.read_frame(&mut buf) {
                Ok(0) => return,
                Ok(n) => {
                    if let Some(frame) = ether::parse_frame(&buf[..n], hwaddr) {
                        net_input_handler(&demux_for_reader, &interrupts_for_reader, frame.ethertype, frame.payload, &dev_for_reader);
                    }
                }
                Err(err) => {
                    log::error!("tap: read failed: {err}");
                    return;
                }
            }
        })
        .expect("failed to spawn tap reader thread");
    Ok(dev)
}

#[cfg(not(all(unix, feature = "tap")))]
fn add_tap(
    _registry: &Arc<Registry>,
    _interrupts: &Arc<Interrupts>,
    _demux: &Arc<InputDemux>,
    _name: Option<&str>,
) -> Result<Arc<Device>, Error> {
    Err(crate::error::DeviceError::Open("tap support is not compiled in on this platform".into()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn loopback_icmp_echo_round_trips_through_softirq_drain() {
        let config = StackConfig::new().add_loopback(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0));
        let stack = init(config).unwrap();
        stack.run().unwrap();
        assert!(stack.registry.iter()[0].is_up());

        stack
            .icmp
            .output(crate::icmp::TYPE_ECHO, 0, 7, b"hello", Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(127, 0, 0, 1))
            .unwrap();

        thread::sleep(Duration::from_millis(20));
        stack.shutdown();
    }

    #[test]
    fn raise_event_interrupts_a_blocked_udp_recvfrom() {
        let config = StackConfig::new().add_loopback(Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(255, 0, 0, 0));
        let stack = init(config).unwrap();
        stack.run().unwrap();

        let pcb = stack.udp.open().unwrap();
        stack.udp.bind(pcb, crate::ip::Endpoint { addr: Ipv4Addr::new(127, 0, 0, 1), port: 9001 }).unwrap();

        let udp = stack.udp.clone();
        let worker = thread::spawn(move || {
            let mut buf = [0u8; 16];
            udp.recvfrom(pcb, &mut buf)
        });

        thread::sleep(Duration::from_millis(20));
        stack.raise_event();
        assert!(matches!(worker.join().unwrap(), Err(crate::error::UdpError::Interrupted)));
        stack.shutdown();
    }

    #[test]
    fn unregistered_ethertype_is_dropped_without_panicking() {
        let demux = InputDemux::new();
        let registry = Registry::new();
        let driver = DummyDriver::new(0, Interrupts::new());
        let dev = registry.register(DeviceParams {
            kind: DeviceType::Dummy,
            mtu: u16::MAX,
            flags: DeviceFlags::empty(),
            hlen: 0,
            alen: 0,
            addr: Default::default(),
            broadcast: Default::default(),
            ops: driver,
        });
        demux.input(0x9999, &[1, 2, 3], &dev);
        demux.drain();
    }
}
