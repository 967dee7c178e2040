// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Handles to individual guest machines.

use std::{
    fmt,
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cluster::ClusterShared,
    fabric::{Interface, MacAddr, TapLease},
    launcher::{HypervisorProcess, TerminateError},
    remote::RemoteError,
    verify::{self, VerificationError},
};

#[derive(Debug, Error)]
#[error("machine {id} ({mac}) has no DHCP lease")]
pub struct AddressError {
    pub id: Uuid,
    pub mac: MacAddr,
}

#[derive(Debug, Error)]
pub enum RemoteExecutionError {
    #[error(transparent)]
    NoAddress(#[from] AddressError),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Error)]
#[error("failed to destroy machine {id}: {source}")]
pub struct DestroyError {
    pub id: Uuid,
    #[source]
    pub source: TerminateError,
}

/// A guest machine running under a hypervisor process.
///
/// Machines are created by [`crate::Cluster::new_machine`] and are only
/// handed out once their guest has been verified.
pub struct Machine {
    id: Uuid,
    cluster: Arc<ClusterShared>,
    interface: Interface,
    process: Mutex<HypervisorProcess>,
    tap_lease: Mutex<TapLease>,
    tracing_span: tracing::Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Machine {
    pub(crate) fn new(
        id: Uuid,
        cluster: Arc<ClusterShared>,
        interface: Interface,
        process: HypervisorProcess,
        tap_lease: TapLease,
        tracing_span: tracing::Span,
    ) -> Self {
        Self {
            id,
            cluster,
            interface,
            process: Mutex::new(process),
            tap_lease: Mutex::new(tap_lease),
            tracing_span,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn hardware_addr(&self) -> MacAddr {
        self.interface.hardware_addr
    }

    /// The IPv4 address the fabric's DHCP server has leased to this
    /// machine.
    pub fn address(&self) -> Result<Ipv4Addr, AddressError> {
        let mac = self.interface.hardware_addr;
        self.cluster
            .fabric
            .dhcp_lease(mac)
            .or(self.interface.dhcp_lease)
            .ok_or(AddressError { id: self.id, mac })
    }

    /// Runs `command` on the guest in a new session and returns its output
    /// with surrounding whitespace removed.
    pub fn execute(
        &self,
        command: &str,
    ) -> Result<String, RemoteExecutionError> {
        let _span = self.tracing_span.enter();
        let addr = self.address()?;
        let out = self.cluster.shell.output(addr, command)?;
        Ok(String::from_utf8_lossy(out.trim_ascii()).into_owned())
    }

    /// Checks that the guest booted the cluster's expected OS.
    pub(crate) fn verify(&self) -> Result<(), VerificationError> {
        let _span = self.tracing_span.enter();
        let addr = self.address().map_err(|e| VerificationError::NoLease {
            mac: e.mac,
        })?;
        verify::verify_guest(
            self.cluster.shell.as_ref(),
            addr,
            &self.cluster.config.expected_os_release_id(),
        )
    }

    /// Kills the hypervisor process, waits for it to exit, and returns the
    /// machine's tap to the fabric.
    ///
    /// Destroying an already-destroyed machine does nothing.
    pub fn destroy(&self) -> Result<(), DestroyError> {
        let _span = self.tracing_span.enter();
        let mut process = lock(&self.process);
        let result = process.terminate();

        // A process that couldn't be signalled may still be using the tap,
        // so the lease stays held for as long as this machine exists. The
        // lease releases itself when the machine is finally dropped.
        if !process.is_running() {
            let mut lease = lock(&self.tap_lease);
            if !lease.is_released() {
                info!("Releasing tap");
                lease.release();
            }
        }

        result.map_err(|source| {
            warn!(error = %source, "Failed to destroy machine");
            DestroyError { id: self.id, source }
        })
    }

    #[cfg(test)]
    pub(crate) fn pid(&self) -> u32 {
        lock(&self.process).pid()
    }
}

impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("interface", &self.interface)
            .field("process", &self.process)
            .finish()
    }
}
