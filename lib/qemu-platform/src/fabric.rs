// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The interface to the local network fabric a cluster runs on.
//!
//! The fabric owns the bridge, the DHCP server, and the directory served to
//! guests as their config drive. A cluster only ever asks it for taps,
//! interface addresses, and leases; it never configures the network itself.

use std::{fmt, net::Ipv4Addr, os::fd::OwnedFd, str::FromStr};

use camino::Utf8PathBuf;
use thiserror::Error;

/// A 48-bit Ethernet hardware address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

#[derive(Debug, Error)]
#[error("invalid hardware address {0:?}")]
pub struct MacAddrParseError(String);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts
                .next()
                .filter(|p| p.len() == 2)
                .ok_or_else(|| MacAddrParseError(s.to_owned()))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| MacAddrParseError(s.to_owned()))?;
        }
        if parts.next().is_some() {
            return Err(MacAddrParseError(s.to_owned()));
        }
        Ok(Self(bytes))
    }
}

/// The addressing the fabric has assigned to one guest network interface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interface {
    pub hardware_addr: MacAddr,

    /// The DHCP lease for `hardware_addr`, if the guest has obtained one
    /// yet.
    pub dhcp_lease: Option<Ipv4Addr>,
}

/// Returns a tap to the fabric when called.
type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// The fabric-side reservation backing a tap device. Releasing it returns the
/// device to the fabric; dropping an unreleased lease releases it.
pub struct TapLease {
    release: Option<ReleaseFn>,
}

impl TapLease {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self { release: Some(Box::new(release)) }
    }

    /// Returns the tap to the fabric. Calls after the first do nothing.
    pub fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }
}

impl fmt::Debug for TapLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TapLease")
            .field("released", &self.is_released())
            .finish()
    }
}

impl Drop for TapLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// A freshly created, unconfigured tap device bound to a bridge.
#[derive(Debug)]
pub struct Tap {
    /// The device's descriptor. This is handed to the hypervisor.
    pub fd: OwnedFd,
    pub hardware_addr: MacAddr,
    pub lease: TapLease,
}

/// The local network fabric shared by every machine in a cluster.
///
/// Implementations must tolerate repeated `create_tap` calls on the same
/// bridge without colliding device names.
pub trait Fabric: Send + Sync {
    /// Creates a new tap device attached to `bridge`.
    fn create_tap(&self, bridge: &str) -> anyhow::Result<Tap>;

    /// Allocates the addressing for a new guest interface on `bridge`.
    fn interface_for(&self, bridge: &str) -> anyhow::Result<Interface>;

    /// Looks up the DHCP lease currently held by `mac`.
    fn dhcp_lease(&self, mac: MacAddr) -> Option<Ipv4Addr>;

    /// The directory served to guests as their config drive.
    fn config_drive_dir(&self) -> Utf8PathBuf;

    /// Tears down the fabric. Called exactly once, after every machine on it
    /// has been destroyed.
    fn destroy(&self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[test]
    fn mac_addr_display_and_parse() {
        let mac = MacAddr([0x52, 0x54, 0x00, 0x0a, 0xbc, 0x01]);
        assert_eq!(mac.to_string(), "52:54:00:0a:bc:01");
        assert_eq!("52:54:00:0A:BC:01".parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn mac_addr_rejects_malformed_input() {
        for bad in [
            "",
            "52:54:00:0a:bc",
            "52:54:00:0a:bc:01:02",
            "5:54:00:0a:bc:01",
            "zz:54:00:0a:bc:01",
        ] {
            assert!(bad.parse::<MacAddr>().is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn tap_lease_releases_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let mut lease = TapLease::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        lease.release();
        lease.release();
        assert!(lease.is_released());
        drop(lease);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_tap_lease_is_released() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        drop(TapLease::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
