// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ownership of descriptors destined for a hypervisor process.
//!
//! Staging and network attachment produce open descriptors; the launcher
//! consumes them. A [`HandleTable`] holds each one under the logical role it
//! plays in the guest, and that role fixes the descriptor number the child
//! sees it under.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};

/// The part a descriptor plays in a hypervisor process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleRole {
    /// The staged boot disk.
    Disk,

    /// The machine's tap device.
    Tap,
}

impl HandleRole {
    pub const ALL: [HandleRole; 2] = [HandleRole::Disk, HandleRole::Tap];

    /// The descriptor number the child process receives this role's handle
    /// under.
    pub const fn child_fd(self) -> RawFd {
        match self {
            HandleRole::Disk => 3,
            HandleRole::Tap => 4,
        }
    }

    const fn index(self) -> usize {
        match self {
            HandleRole::Disk => 0,
            HandleRole::Tap => 1,
        }
    }
}

/// The lowest descriptor number above every role's child descriptor.
pub(crate) const FIRST_SCRATCH_FD: RawFd = HandleRole::Tap.child_fd() + 1;

/// Descriptors keyed by the role they will play in a child process.
///
/// Dropping the table closes every descriptor it still holds.
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: [Option<OwnedFd>; HandleRole::ALL.len()],
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `fd` under `role`, returning the descriptor it displaced.
    pub fn insert(&mut self, role: HandleRole, fd: OwnedFd) -> Option<OwnedFd> {
        self.slots[role.index()].replace(fd)
    }

    pub fn get(&self, role: HandleRole) -> Option<&OwnedFd> {
        self.slots[role.index()].as_ref()
    }

    pub fn take(&mut self, role: HandleRole) -> Option<OwnedFd> {
        self.slots[role.index()].take()
    }

    /// Returns the roles that have no descriptor yet.
    pub fn missing_roles(&self) -> Vec<HandleRole> {
        HandleRole::ALL
            .into_iter()
            .filter(|role| self.get(*role).is_none())
            .collect()
    }

    /// Yields `(host descriptor, child descriptor)` pairs for every occupied
    /// slot. The host descriptors stay valid only as long as `self` does.
    pub(crate) fn child_mappings(&self) -> Vec<(RawFd, RawFd)> {
        HandleRole::ALL
            .into_iter()
            .filter_map(|role| {
                self.get(role).map(|fd| (fd.as_raw_fd(), role.child_fd()))
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scratch_fd() -> OwnedFd {
        tempfile::tempfile().unwrap().into()
    }

    #[test]
    fn roles_map_to_distinct_child_descriptors() {
        assert_eq!(HandleRole::Disk.child_fd(), 3);
        assert_eq!(HandleRole::Tap.child_fd(), 4);
        assert_eq!(FIRST_SCRATCH_FD, 5);
    }

    #[test]
    fn insert_and_take() {
        let mut table = HandleTable::new();
        assert_eq!(
            table.missing_roles(),
            vec![HandleRole::Disk, HandleRole::Tap]
        );

        let disk = scratch_fd();
        let disk_raw = disk.as_raw_fd();
        assert!(table.insert(HandleRole::Disk, disk).is_none());
        assert_eq!(table.missing_roles(), vec![HandleRole::Tap]);
        assert_eq!(table.child_mappings(), vec![(disk_raw, 3)]);

        assert!(table.insert(HandleRole::Disk, scratch_fd()).is_some());

        table.insert(HandleRole::Tap, scratch_fd());
        assert!(table.missing_roles().is_empty());
        assert_eq!(table.child_mappings().len(), 2);

        assert!(table.take(HandleRole::Tap).is_some());
        assert!(table.take(HandleRole::Tap).is_none());
    }
}
