/// Tap device descriptor handed to a guest as a virtual network interface.
/// Creating and destroying the host-side device is left to the operator.
use crate::config::types::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapDevice {
    pub name: String,
    pub ip_addr: Ipv4Addr,
}

impl TapDevice {
    /// `ip_addr` must have the shape 192.168.N.1
    pub fn new(name: impl Into<String>, ip_addr: Ipv4Addr) -> Result<Self> {
        let [a, b, _, d] = ip_addr.octets();
        if (a, b, d) != (192, 168, 1) {
            return Err(SandboxError::Config(format!(
                "Unexpected kind of IP address for tap device: {}",
                ip_addr
            )));
        }
        Ok(Self {
            name: name.into(),
            ip_addr,
        })
    }

    /// Device for slot `index`: `tap_tmc<index>` at 192.168.<start + index>.1
    pub fn for_slot(index: usize, range_start: u8) -> Result<Self> {
        let octet = u8::try_from(usize::from(range_start) + index).map_err(|_| {
            SandboxError::Config(format!(
                "Slot {} does not fit in the private IP range starting at {}",
                index, range_start
            ))
        })?;
        Self::new(
            format!("tap_tmc{}", index),
            Ipv4Addr::new(192, 168, octet, 1),
        )
    }

    /// e.g. "192.168.12.0/24"
    pub fn subnet(&self) -> String {
        let [a, b, c, _] = self.ip_addr.octets();
        format!("{}.{}.{}.0/24", a, b, c)
    }

    pub fn broadcast_addr(&self) -> Ipv4Addr {
        let [a, b, c, _] = self.ip_addr.octets();
        Ipv4Addr::new(a, b, c, 255)
    }

    /// Guest kernel argument for interface `iface`
    pub fn guest_arg(&self, iface: &str) -> String {
        format!("{}=tuntap,{},,{}", iface, self.name, self.ip_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_device_addresses() {
        let tap = TapDevice::for_slot(2, 10).unwrap();
        assert_eq!(tap.name, "tap_tmc2");
        assert_eq!(tap.ip_addr, Ipv4Addr::new(192, 168, 12, 1));
        assert_eq!(tap.subnet(), "192.168.12.0/24");
        assert_eq!(tap.broadcast_addr(), Ipv4Addr::new(192, 168, 12, 255));
        assert_eq!(tap.guest_arg("eth0"), "eth0=tuntap,tap_tmc2,,192.168.12.1");
    }

    #[test]
    fn test_rejects_foreign_addresses() {
        assert!(TapDevice::new("tap0", Ipv4Addr::new(10, 0, 0, 1)).is_err());
        assert!(TapDevice::new("tap0", Ipv4Addr::new(192, 168, 3, 7)).is_err());
        assert!(TapDevice::for_slot(10, 250).is_err());
    }
}
