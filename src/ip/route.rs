//! IPv4 routing table (component I, new over the reference implementation).
//!
//! `examples/original_source/ip.c` has no routing table at all — `ip_output`
//! only ever checks whether the destination shares the outgoing interface's
//! subnet. `spec.md` §3/§4.8/§4.11 names a real linear routing table with
//! longest-prefix match and a default-gateway entry; this module is the
//! implementation of that addition.

use crate::device::Device;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct Route {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub nexthop: Ipv4Addr,
    pub iface: Arc<Device>,
}

#[derive(Default)]
pub struct RouteTable {
    routes: Mutex<Vec<Route>>,
}

impl RouteTable {
    pub fn new() -> Self {
        RouteTable { routes: Mutex::new(Vec::new()) }
    }

    pub fn add(&self, network: Ipv4Addr, netmask: Ipv4Addr, nexthop: Ipv4Addr, iface: Arc<Device>) {
        self.routes.lock().expect("route table poisoned").push(Route { network, netmask, nexthop, iface });
    }

    /// A default-gateway entry is `network=0.0.0.0/0`.
    pub fn set_default_gateway(&self, iface: Arc<Device>, gateway: Ipv4Addr) {
        self.add(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, gateway, iface);
    }

    /// Longest-prefix match; ties keep the first-inserted entry, matching
    /// `spec.md` §3 "ties resolved by table order".
    pub fn lookup(&self, dst: Ipv4Addr) -> Option<Route> {
        let routes = self.routes.lock().expect("route table poisoned");
        let mut best: Option<&Route> = None;
        for route in routes.iter() {
            let mask = u32::from(route.netmask);
            if u32::from(dst) & mask != u32::from(route.network) & mask {
                continue;
            }
            match best {
                Some(b) if mask.count_ones() <= u32::from(b.netmask).count_ones() => {}
                _ => best = Some(route),
            }
        }
        best.cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceFlags, DeviceOps, DeviceParams, DeviceType, Registry};
    use crate::error::DeviceError;
    use smallvec::smallvec;

    struct NullOps;
    impl DeviceOps for NullOps {
        fn transmit(&self, _: u16, _: &[u8], _: &[u8]) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn test_device() -> Arc<Device> {
        let registry = Registry::new();
        registry.register(DeviceParams {
            kind: DeviceType::Loopback,
            mtu: u16::MAX,
            flags: DeviceFlags::UP,
            hlen: 0,
            alen: 0,
            addr: smallvec![],
            broadcast: smallvec![],
            ops: Arc::new(NullOps),
        })
    }

    #[test]
    fn longest_prefix_wins_over_default_gateway() {
        let table = RouteTable::new();
        let dev = test_device();
        table.set_default_gateway(dev.clone(), "203.0.113.1".parse().unwrap());
        table.add(
            "192.0.2.0".parse().unwrap(),
            "255.255.255.0".parse().unwrap(),
            "192.0.2.1".parse().unwrap(),
            dev.clone(),
        );

        let route = table.lookup("192.0.2.42".parse().unwrap()).unwrap();
        assert_eq!(route.nexthop, "192.0.2.1".parse::<Ipv4Addr>().unwrap());

        let route = table.lookup("198.51.100.7".parse().unwrap()).unwrap();
        assert_eq!(route.nexthop, "203.0.113.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn no_route_returns_none() {
        let table = RouteTable::new();
        assert!(table.lookup("10.0.0.1".parse().unwrap()).is_none());
    }
}
