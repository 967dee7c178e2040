// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Remote command execution on guests.

use std::{
    net::Ipv4Addr,
    process::{Command, ExitStatus, Stdio},
};

use thiserror::Error;
use tracing::debug;

use crate::config::SshConfig;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// No session could be established: the guest is unreachable or
    /// rejected our credentials.
    #[error("failed to open session to {addr}: {reason}")]
    Session { addr: Ipv4Addr, reason: String },

    /// The session was established but the command failed.
    #[error("command `{command}` on {addr} failed: {status}")]
    CommandFailed { addr: Ipv4Addr, command: String, status: String },
}

/// Runs commands on guests over an authenticated session.
///
/// Each call is expected to use a fresh session.
#[cfg_attr(test, mockall::automock)]
pub trait RemoteShell: Send + Sync {
    /// Runs `command` on the guest at `addr` and returns its standard output.
    /// The command's standard error goes to the host's standard error.
    fn output(
        &self,
        addr: Ipv4Addr,
        command: &str,
    ) -> Result<Vec<u8>, RemoteError>;
}

/// The exit status OpenSSH's client reserves for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// A [`RemoteShell`] that shells out to the system OpenSSH client.
#[derive(Clone, Debug)]
pub struct OpenSshShell {
    config: SshConfig,
}

impl OpenSshShell {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn command(&self, addr: Ipv4Addr, remote_command: &str) -> Command {
        let mut cmd = Command::new(&self.config.program);

        // Guests are ephemeral, so their host keys are never worth
        // remembering, and a password prompt would hang the caller.
        cmd.args([
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "BatchMode=yes",
        ]);
        let timeout = self.config.connect_timeout_secs;
        cmd.arg("-o").arg(format!("ConnectTimeout={timeout}"));
        cmd.args([
            "-o",
            "ServerAliveInterval=5",
            "-o",
            "ServerAliveCountMax=3",
        ]);
        if let Some(identity) = &self.config.identity_file {
            cmd.arg("-i").arg(identity.as_str());
        }
        cmd.arg("-l").arg(&self.config.user);
        cmd.arg(addr.to_string()).arg("--").arg(remote_command);
        cmd
    }
}

impl RemoteShell for OpenSshShell {
    fn output(
        &self,
        addr: Ipv4Addr,
        command: &str,
    ) -> Result<Vec<u8>, RemoteError> {
        debug!(%addr, command, "Running remote command");
        let output = self
            .command(addr, command)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| RemoteError::Session {
                addr,
                reason: format!("failed to run {}: {e}", self.config.program),
            })?;

        check_status(addr, command, output.status)?;
        Ok(output.stdout)
    }
}

fn check_status(
    addr: Ipv4Addr,
    command: &str,
    status: ExitStatus,
) -> Result<(), RemoteError> {
    match status.code() {
        Some(0) => Ok(()),
        Some(SSH_CLIENT_FAILURE) => Err(RemoteError::Session {
            addr,
            reason: "ssh could not connect or authenticate".to_owned(),
        }),
        _ => Err(RemoteError::CommandFailed {
            addr,
            command: command.to_owned(),
            status: status.to_string(),
        }),
    }
}
