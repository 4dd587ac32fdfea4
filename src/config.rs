//! Stack configuration (component P, new).
//!
//! Replaces the per-`test/stepNN.c` hardcoded `main()` drivers `spec.md` §1
//! excludes from scope: a caller describes devices, IP interfaces, and
//! routes, then hands the result to [`crate::net::init`].

use crate::device::DeviceType;
use std::net::Ipv4Addr;

/// One device to bring up, with the IP interface and (optionally) default
/// route riding on it.
pub struct DeviceConfig {
    pub kind: DeviceType,
    pub unicast: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Option<Ipv4Addr>,
    /// TAP device name on the host, e.g. `"tap0"`. Only meaningful for
    /// [`DeviceType::Ethernet`]; ignored otherwise.
    pub tap_name: Option<String>,
}

/// A static route beyond any per-device default gateway.
pub struct RouteConfig {
    pub network: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub nexthop: Ipv4Addr,
    pub device_index: usize,
}

/// Builder collecting the devices/routes [`crate::net::init`] should bring
/// up. Mirrors the shape of the example drivers' setup code without being
/// tied to any one of them.
#[derive(Default)]
pub struct StackConfig {
    pub(crate) devices: Vec<DeviceConfig>,
    pub(crate) routes: Vec<RouteConfig>,
}

impl StackConfig {
    pub fn new() -> Self {
        StackConfig::default()
    }

    pub fn add_loopback(mut self, unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.devices.push(DeviceConfig { kind: DeviceType::Loopback, unicast, netmask, gateway: None, tap_name: None });
        self
    }

    pub fn add_dummy(mut self, unicast: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.devices.push(DeviceConfig { kind: DeviceType::Dummy, unicast, netmask, gateway: None, tap_name: None });
        self
    }

    #[cfg(all(unix, feature = "tap"))]
    pub fn add_tap(mut self, tap_name: impl Into<String>, unicast: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr>) -> Self {
        self.devices.push(DeviceConfig {
            kind: DeviceType::Ethernet,
            unicast,
            netmask,
            gateway,
            tap_name: Some(tap_name.into()),
        });
        self
    }

    pub fn add_route(mut self, network: Ipv4Addr, netmask: Ipv4Addr, nexthop: Ipv4Addr, device_index: usize) -> Self {
        self.routes.push(RouteConfig { network, netmask, nexthop, device_index });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_devices_and_routes_in_order() {
        let config = StackConfig::new()
            .add_loopback("127.0.0.1".parse().unwrap(), "255.0.0.0".parse().unwrap())
            .add_dummy("192.0.2.1".parse().unwrap(), "255.255.255.0".parse().unwrap())
            .add_route(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, "192.0.2.254".parse().unwrap(), 1);

        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].kind, DeviceType::Loopback);
        assert_eq!(config.devices[1].kind, DeviceType::Dummy);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].device_index, 1);
    }
}
