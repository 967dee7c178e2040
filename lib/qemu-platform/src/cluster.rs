// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clusters of QEMU guests sharing one local network fabric.

use std::{fmt, sync::Arc};

use thiserror::Error;
use tracing::{error, info, info_span, warn};
use uuid::Uuid;

use crate::{
    config::{ClusterConfig, ConfigError},
    disk::{self, DiskError},
    fabric::Fabric,
    handles::{HandleRole, HandleTable},
    launcher::{self, LaunchError, LaunchSpec},
    machine::{DestroyError, Machine},
    remote::RemoteShell,
    verify::VerificationError,
};

/// Errors that can arise while creating a machine. Any partially created
/// machine has already been torn down when one of these is returned.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("cluster has already been destroyed")]
    ClusterDestroyed,

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("network fabric failure: {0:#}")]
    Fabric(anyhow::Error),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Verification(#[from] VerificationError),
}

/// Errors reported by [`Cluster::destroy`]. Teardown runs to completion
/// before this is returned.
#[derive(Debug, Default)]
pub struct ClusterDestroyError {
    pub machines: Vec<DestroyError>,
    pub fabric: Option<anyhow::Error>,
}

impl fmt::Display for ClusterDestroyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cluster teardown finished with {} machine failure(s)",
            self.machines.len()
        )?;
        if let Some(e) = &self.fabric {
            write!(f, "; fabric teardown failed: {e:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ClusterDestroyError {}

/// State shared between a cluster and its machines.
pub(crate) struct ClusterShared {
    pub(crate) config: ClusterConfig,
    pub(crate) fabric: Arc<dyn Fabric>,
    pub(crate) shell: Arc<dyn RemoteShell>,
}

/// A set of QEMU machines on one network fabric.
///
/// Machines are created one at a time; the cluster is not meant to be driven
/// from several threads at once.
pub struct Cluster {
    shared: Arc<ClusterShared>,
    machines: Vec<Arc<Machine>>,
    destroyed: bool,
}

impl Cluster {
    /// Creates an empty cluster on `fabric`, reaching guests through
    /// `shell`.
    pub fn new(
        config: ClusterConfig,
        fabric: Arc<dyn Fabric>,
        shell: Arc<dyn RemoteShell>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(?config, "Creating cluster");
        Ok(Self {
            shared: Arc::new(ClusterShared { config, fabric, shell }),
            machines: Vec::new(),
            destroyed: false,
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.shared.config
    }

    /// Boots a new machine and waits for its guest to pass readiness
    /// verification.
    ///
    /// The machine is added to the cluster only if every step succeeds. On
    /// failure, whatever was created (the hypervisor process, the disk copy,
    /// the tap) is torn down before the error is returned.
    pub fn new_machine(&mut self) -> Result<Arc<Machine>, ProvisionError> {
        if self.destroyed {
            return Err(ProvisionError::ClusterDestroyed);
        }

        let id = Uuid::new_v4();
        let span = info_span!(parent: None, "machine", %id);
        let config = &self.shared.config;
        let fabric = &self.shared.fabric;

        let machine = {
            let _guard = span.enter();
            info!("Creating machine");

            let disk = disk::stage_disk(
                &config.base_image,
                config.tmp_directory.as_deref(),
            )?;

            let interface = fabric
                .interface_for(&config.bridge)
                .map_err(ProvisionError::Fabric)?;
            let tap = fabric
                .create_tap(&config.bridge)
                .map_err(ProvisionError::Fabric)?;

            let mut handles = HandleTable::new();
            handles.insert(HandleRole::Disk, disk.into_owned_fd());
            handles.insert(HandleRole::Tap, tap.fd);

            let spec = LaunchSpec {
                id,
                mac: interface.hardware_addr,
                config_dir: fabric.config_drive_dir(),
                cpus: config.cpus,
                memory_mib: config.memory_mib,
            };

            // If this fails the tap's lease is dropped, returning it to the
            // fabric.
            let process = launcher::launch(
                &config.hypervisor_command,
                &spec,
                handles,
                config.hypervisor_output,
                config.log_directory.as_deref(),
            )?;

            Machine::new(
                id,
                self.shared.clone(),
                interface,
                process,
                tap.lease,
                span.clone(),
            )
        };

        if let Err(e) = machine.verify() {
            error!(%id, error = %e, "Machine failed verification");
            if let Err(destroy_err) = machine.destroy() {
                warn!(%id, error = %destroy_err,
                      "Failed to clean up unverified machine");
            }
            return Err(e.into());
        }

        info!(%id, "Machine is ready");
        let machine = Arc::new(machine);
        self.machines.push(machine.clone());
        Ok(machine)
    }

    /// The cluster's machines, in the order they were created.
    pub fn machines(&self) -> Vec<Arc<Machine>> {
        self.machines.clone()
    }

    /// Destroys every machine, then tears down the network fabric.
    ///
    /// A machine that fails to tear down doesn't stop the others from being
    /// destroyed; all failures are logged and returned together once the
    /// fabric has been released. Destroying a cluster a second time does
    /// nothing.
    pub fn destroy(&mut self) -> Result<(), ClusterDestroyError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;

        info!(machines = self.machines.len(), "Destroying cluster");
        let mut errors = ClusterDestroyError::default();
        for machine in self.machines.drain(..) {
            if let Err(e) = machine.destroy() {
                warn!(error = %e, "Machine teardown failed");
                errors.machines.push(e);
            }
        }

        if let Err(e) = self.shared.fabric.destroy() {
            warn!(error = %e, "Fabric teardown failed");
            errors.fabric = Some(e);
        }

        if errors.machines.is_empty() && errors.fabric.is_none() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if self.destroyed {
            return;
        }

        info!("Destroying cluster that was dropped");
        if let Err(e) = self.destroy() {
            warn!(error = %e, "Dropped cluster did not tear down cleanly");
        }
    }
}
