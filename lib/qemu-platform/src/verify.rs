// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Readiness verification: confirming a guest booted the expected OS.
//!
//! This is a single attempt. Waiting for a slow boot is up to the caller,
//! and is bounded by the remote shell's own connection timeout.

use std::net::Ipv4Addr;

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    fabric::MacAddr,
    remote::{RemoteError, RemoteShell},
};

/// Prints the guest's `ID=<distro>` line from os-release.
pub const OS_RELEASE_ID_COMMAND: &str = "grep ^ID= /etc/os-release";

#[derive(Debug, Error)]
pub enum VerificationError {
    /// The guest hasn't obtained an address, so it can't be reached yet.
    #[error("guest with hardware address {mac} has no DHCP lease")]
    NoLease { mac: MacAddr },

    #[error("guest at {addr} is unreachable: {source}")]
    Unreachable {
        addr: Ipv4Addr,
        #[source]
        source: RemoteError,
    },

    #[error("guest at {addr} identified as {actual:?}, expected {expected:?}")]
    UnexpectedOs { addr: Ipv4Addr, expected: String, actual: String },
}

/// Asks the guest at `addr` for its OS identification and checks that it is
/// exactly `expected` (for example `ID=coreos`) once surrounding whitespace
/// is trimmed.
pub fn verify_guest(
    shell: &dyn RemoteShell,
    addr: Ipv4Addr,
    expected: &str,
) -> Result<(), VerificationError> {
    let out = shell
        .output(addr, OS_RELEASE_ID_COMMAND)
        .map_err(|source| VerificationError::Unreachable { addr, source })?;

    let actual = out.trim_ascii();
    if actual != expected.as_bytes() {
        let actual = String::from_utf8_lossy(actual).into_owned();
        warn!(%addr, %actual, expected, "Guest reported unexpected OS");
        return Err(VerificationError::UnexpectedOs {
            addr,
            expected: expected.to_owned(),
            actual,
        });
    }

    info!(%addr, expected, "Guest OS verified");
    Ok(())
}
