// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Boots clusters of QEMU/KVM guests for integration testing.
//!
//! A [`Cluster`] hands out [`Machine`]s. Each one runs from a private copy of
//! a golden disk image, is attached to a tap on a local network fabric, and
//! is only returned once its guest answers over a remote shell and reports
//! the expected operating system. Destroying a machine or its cluster kills
//! the hypervisor and hands the network resources back to the fabric.

pub mod cluster;
pub mod config;
pub mod disk;
pub mod fabric;
pub mod handles;
pub mod launcher;
pub mod machine;
pub mod remote;
pub mod verify;

pub use cluster::{Cluster, ClusterDestroyError, ProvisionError};
pub use config::{ClusterConfig, ConfigError, OutputMode, SshConfig};
pub use fabric::{Fabric, Interface, MacAddr, Tap, TapLease};
pub use machine::{DestroyError, Machine, RemoteExecutionError};
pub use remote::{OpenSshShell, RemoteError, RemoteShell};
pub use verify::VerificationError;
