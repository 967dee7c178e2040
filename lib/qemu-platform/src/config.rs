// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration for QEMU-backed clusters.
//!
//! A [`ClusterConfig`] is passed explicitly to [`crate::Cluster::new`]; there
//! is no process-wide state. Configs can be built in code or read from a TOML
//! file with [`parse`].

use std::{fs::File, path::Path, process::Stdio, str::FromStr};

use camino::{Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] ConfigError),
}

/// A configuration that is well-formed but can't be used to run machines.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("hypervisor_command must name a program")]
    EmptyHypervisorCommand,

    #[error("cpus must be nonzero")]
    ZeroCpus,

    #[error("memory_mib must be nonzero")]
    ZeroMemory,

    #[error("file output mode requires log_directory")]
    MissingLogDirectory,
}

/// Configuration shared by every machine a cluster creates.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// The golden disk image each machine's disk is copied from.
    pub base_image: Utf8PathBuf,

    /// The hypervisor program followed by any leading arguments. The
    /// machine arguments are appended after these, so wrappers such as
    /// `sudo` can be placed in front of the emulator.
    #[serde(default = "default_hypervisor_command")]
    pub hypervisor_command: Vec<String>,

    /// The bridge to which each machine's tap is attached.
    #[serde(default = "default_bridge")]
    pub bridge: String,

    #[serde(default = "default_cpus")]
    pub cpus: u8,

    #[serde(default = "default_memory_mib")]
    pub memory_mib: u64,

    /// The distribution ID the guest must report in `/etc/os-release`.
    #[serde(default = "default_expected_os_id")]
    pub expected_os_id: String,

    /// The directory in which disk copies are staged. Uses the system
    /// temporary directory if unset.
    #[serde(default)]
    pub tmp_directory: Option<Utf8PathBuf>,

    /// Where the hypervisor's stdout and stderr go.
    #[serde(default)]
    pub hypervisor_output: OutputMode,

    /// The directory to write hypervisor logs into when
    /// `hypervisor_output` is [`OutputMode::TmpFile`].
    #[serde(default)]
    pub log_directory: Option<Utf8PathBuf>,

    #[serde(default)]
    pub ssh: SshConfig,
}

fn default_hypervisor_command() -> Vec<String> {
    vec!["qemu-system-x86_64".to_owned()]
}

fn default_bridge() -> String {
    "br0".to_owned()
}

fn default_cpus() -> u8 {
    2
}

fn default_memory_mib() -> u64 {
    1024
}

fn default_expected_os_id() -> String {
    "coreos".to_owned()
}

impl ClusterConfig {
    /// Creates a config that boots machines from `base_image` with every
    /// other setting at its default.
    pub fn new(base_image: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base_image: base_image.into(),
            hypervisor_command: default_hypervisor_command(),
            bridge: default_bridge(),
            cpus: default_cpus(),
            memory_mib: default_memory_mib(),
            expected_os_id: default_expected_os_id(),
            tmp_directory: None,
            hypervisor_output: OutputMode::default(),
            log_directory: None,
            ssh: SshConfig::default(),
        }
    }

    /// The exact line a correctly booted guest prints in response to the
    /// readiness command.
    pub fn expected_os_release_id(&self) -> String {
        format!("ID={}", self.expected_os_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hypervisor_command.is_empty() {
            return Err(ConfigError::EmptyHypervisorCommand);
        }
        if self.cpus == 0 {
            return Err(ConfigError::ZeroCpus);
        }
        if self.memory_mib == 0 {
            return Err(ConfigError::ZeroMemory);
        }
        if let OutputMode::TmpFile = self.hypervisor_output {
            if self.log_directory.is_none() {
                return Err(ConfigError::MissingLogDirectory);
            }
        }
        Ok(())
    }
}

/// Parameters for the OpenSSH-based remote shell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// The `ssh` client binary.
    #[serde(default = "default_ssh_program")]
    pub program: String,

    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// A private key to authenticate with. If unset, `ssh` falls back to
    /// its agent and default keys.
    #[serde(default)]
    pub identity_file: Option<Utf8PathBuf>,

    /// Bounds how long a single connection attempt may take.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u32,
}

fn default_ssh_program() -> String {
    "ssh".to_owned()
}

fn default_ssh_user() -> String {
    "core".to_owned()
}

fn default_connect_timeout_secs() -> u32 {
    30
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: default_ssh_program(),
            user: default_ssh_user(),
            identity_file: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Specifies where output from hypervisor processes should be written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// Write to files in the configured log directory.
    #[serde(rename = "file", alias = "tmpfile")]
    TmpFile,

    /// Send stderr to the host's stderr and discard stdout.
    #[default]
    Stdio,

    /// Redirect stdout/stderr to /dev/null.
    Null,
}

impl FromStr for OutputMode {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" | "tmpfile" => Ok(OutputMode::TmpFile),
            "stdio" => Ok(OutputMode::Stdio),
            "null" => Ok(OutputMode::Null),
            _ => Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                s.to_string(),
            )),
        }
    }
}

impl OutputMode {
    /// Returns the stdout/stderr handles to pass to a hypervisor process.
    ///
    /// # Parameters
    ///
    /// - directory: The directory in which to store any files written under
    ///   the selected discipline. Required for [`OutputMode::TmpFile`].
    /// - file_prefix: The prefix to add to the names of any files written
    ///   under the selected discipline.
    pub(crate) fn get_handles(
        &self,
        directory: Option<&Utf8Path>,
        file_prefix: &str,
    ) -> std::io::Result<(Stdio, Stdio)> {
        match self {
            OutputMode::TmpFile => {
                let directory = directory.ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "file output mode requires a log directory",
                    )
                })?;
                let stdout_path =
                    directory.join(format!("{file_prefix}.stdout.log"));
                let stderr_path =
                    directory.join(format!("{file_prefix}.stderr.log"));

                info!(
                    %stdout_path,
                    %stderr_path,
                    "Opening hypervisor log files"
                );
                let stdout = File::create(&stdout_path)?.into();
                let stderr = File::create(&stderr_path)?.into();
                Ok((stdout, stderr))
            }
            OutputMode::Stdio => Ok((Stdio::null(), Stdio::inherit())),
            OutputMode::Null => Ok((Stdio::null(), Stdio::null())),
        }
    }
}

/// Parses a TOML file into a cluster configuration and validates it.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<ClusterConfig, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<ClusterConfig>(&contents)?;
    cfg.validate()?;
    Ok(cfg)
}
