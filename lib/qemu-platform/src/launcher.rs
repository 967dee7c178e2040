// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routines and data structures for launching hypervisor processes.
//!
//! The launcher never hands paths to the hypervisor for the disk or the tap.
//! Both are passed as inherited descriptors (see [`HandleTable`]), and the
//! host's copies are closed as soon as the process has been started.

use std::{
    io,
    os::unix::process::CommandExt,
    process::{Child, Command, Stdio},
};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::OutputMode,
    fabric::MacAddr,
    handles::{HandleRole, HandleTable, FIRST_SCRATCH_FD},
};

/// The mount tag guests look for when mounting their config drive.
pub const CONFIG_DRIVE_MOUNT_TAG: &str = "config-2";

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("hypervisor command is empty")]
    EmptyCommand,

    #[error("no descriptor supplied for {0:?}")]
    MissingHandle(HandleRole),

    #[error("failed to set up hypervisor output: {0}")]
    Output(#[source] io::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("failed to signal hypervisor process {pid}: {source}")]
    Kill {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for hypervisor process {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: io::Error,
    },
}

/// The guest-facing parameters of one hypervisor process.
#[derive(Clone, Debug)]
pub struct LaunchSpec {
    pub id: Uuid,
    pub mac: MacAddr,

    /// Exported read-only to the guest over virtio-9p.
    pub config_dir: Utf8PathBuf,
    pub cpus: u8,
    pub memory_mib: u64,
}

impl LaunchSpec {
    /// Produces the hypervisor's command-line arguments. The disk and tap are
    /// referenced by their inherited descriptor numbers.
    pub fn args(&self) -> Vec<String> {
        let disk_fd = HandleRole::Disk.child_fd();
        let tap_fd = HandleRole::Tap.child_fd();
        vec![
            "-machine".to_owned(),
            "accel=kvm".to_owned(),
            "-cpu".to_owned(),
            "host".to_owned(),
            "-smp".to_owned(),
            self.cpus.to_string(),
            "-m".to_owned(),
            self.memory_mib.to_string(),
            "-uuid".to_owned(),
            self.id.to_string(),
            "-display".to_owned(),
            "none".to_owned(),
            "-add-fd".to_owned(),
            format!("fd={disk_fd},set=1"),
            "-drive".to_owned(),
            "file=/dev/fdset/1,media=disk,if=virtio".to_owned(),
            "-netdev".to_owned(),
            format!("tap,id=tap,fd={tap_fd}"),
            "-device".to_owned(),
            format!("virtio-net,netdev=tap,mac={}", self.mac),
            "-fsdev".to_owned(),
            format!(
                "local,id=cfg,security_model=none,readonly,path={}",
                self.config_dir
            ),
            "-device".to_owned(),
            format!(
                "virtio-9p-pci,fsdev=cfg,mount_tag={CONFIG_DRIVE_MOUNT_TAG}"
            ),
        ]
    }
}

/// Spawns `cmd` with every descriptor in `handles` installed at its role's
/// child descriptor number, then closes the host's copies.
///
/// The descriptors are closed whether or not the spawn succeeds.
pub fn spawn_with_handles(
    cmd: &mut Command,
    handles: HandleTable,
) -> io::Result<Child> {
    let mappings = handles.child_mappings();

    // Safety: the hook runs between fork and exec, so it must not allocate
    // or take locks. It only calls fcntl(2) and dup2(2) on descriptors that
    // `handles` keeps open until the spawn returns.
    unsafe {
        cmd.pre_exec(move || {
            // Move every source above the child range first so a source that
            // already occupies another role's number isn't clobbered by the
            // dup2 below. The scratch copies are close-on-exec.
            let mut scratch = [-1; HandleRole::ALL.len()];
            for (slot, (host_fd, _)) in scratch.iter_mut().zip(&mappings) {
                let fd = libc::fcntl(
                    *host_fd,
                    libc::F_DUPFD_CLOEXEC,
                    FIRST_SCRATCH_FD,
                );
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                *slot = fd;
            }

            for (scratch_fd, (_, child_fd)) in scratch.iter().zip(&mappings) {
                if libc::dup2(*scratch_fd, *child_fd) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }

            Ok(())
        });
    }

    let child = cmd.spawn();
    drop(handles);
    child
}

/// Starts a hypervisor process.
///
/// `command` is the program and any leading arguments; the machine arguments
/// from `spec` follow them. This does not wait for the guest to boot.
pub fn launch(
    command: &[String],
    spec: &LaunchSpec,
    handles: HandleTable,
    output: OutputMode,
    log_directory: Option<&Utf8Path>,
) -> Result<HypervisorProcess, LaunchError> {
    let (program, leading_args) =
        command.split_first().ok_or(LaunchError::EmptyCommand)?;

    if let Some(role) = handles.missing_roles().into_iter().next() {
        return Err(LaunchError::MissingHandle(role));
    }

    let (stdout, stderr) = output
        .get_handles(log_directory, &spec.id.to_string())
        .map_err(LaunchError::Output)?;

    let args = spec.args();
    info!(%program, ?leading_args, ?args, "Launching hypervisor");

    let mut cmd = Command::new(program);
    cmd.args(leading_args)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    let child = spawn_with_handles(&mut cmd, handles).map_err(|source| {
        LaunchError::Spawn { program: program.clone(), source }
    })?;

    info!("Launched hypervisor with pid {}", child.id());
    Ok(HypervisorProcess { pid: child.id(), child: Some(child) })
}

/// A running hypervisor process.
///
/// The process is killed and reaped when this is dropped, if
/// [`HypervisorProcess::terminate`] hasn't already done so.
#[derive(Debug)]
pub struct HypervisorProcess {
    pid: u32,
    child: Option<Child>,
}

impl HypervisorProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns `true` until the process has been reaped.
    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Kills the process and waits for it to exit.
    ///
    /// Once the process has been reaped this does nothing, so calling it
    /// again never blocks. If waiting fails the process is treated as gone;
    /// the error is returned so the caller can surface it.
    pub fn terminate(&mut self) -> Result<(), TerminateError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let pid = self.pid;

        match child.kill() {
            Ok(()) => {}
            // Older toolchains report a child that already exited this way.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(source) => {
                // The process may still be alive; keep it so a later attempt
                // can try again.
                self.child = Some(child);
                return Err(TerminateError::Kill { pid, source });
            }
        }

        let status = child
            .wait()
            .map_err(|source| TerminateError::Wait { pid, source })?;
        info!(pid, ?status, "Hypervisor process exited");
        Ok(())
    }
}

impl Drop for HypervisorProcess {
    fn drop(&mut self) {
        if self.child.is_none() {
            return;
        }

        info!(pid = self.pid, "Killing hypervisor process that was dropped");
        if let Err(e) = self.terminate() {
            warn!(error = %e, "Failed to clean up dropped hypervisor process");
        }
    }
}

#[cfg(test)]
mod test {
    use std::{
        fs::File,
        io::{Read, Seek, SeekFrom, Write},
        os::fd::{FromRawFd, OwnedFd},
    };

    use super::*;

    fn spec() -> LaunchSpec {
        LaunchSpec {
            id: Uuid::parse_str("6f1c2a3e-2b0c-4f43-9a53-0d3a1f2b7c11")
                .unwrap(),
            mac: MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
            config_dir: "/run/cfg".into(),
            cpus: 2,
            memory_mib: 1024,
        }
    }

    fn file_with(contents: &[u8]) -> OwnedFd {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.into()
    }

    fn full_table() -> HandleTable {
        let mut handles = HandleTable::new();
        handles.insert(HandleRole::Disk, file_with(b"disk"));
        handles.insert(HandleRole::Tap, file_with(b"tap"));
        handles
    }

    /// A stand-in hypervisor: `sh -c <script> qemu <machine args...>`.
    fn fake_hypervisor(script: &str) -> Vec<String> {
        vec![
            "sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
            "qemu".to_owned(),
        ]
    }

    fn process_exists(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn args_follow_hypervisor_contract() {
        let args = spec().args().join(" ");
        assert_eq!(
            args,
            "-machine accel=kvm -cpu host -smp 2 -m 1024 \
             -uuid 6f1c2a3e-2b0c-4f43-9a53-0d3a1f2b7c11 -display none \
             -add-fd fd=3,set=1 \
             -drive file=/dev/fdset/1,media=disk,if=virtio \
             -netdev tap,id=tap,fd=4 \
             -device virtio-net,netdev=tap,mac=52:54:00:12:34:56 \
             -fsdev local,id=cfg,security_model=none,readonly,path=/run/cfg \
             -device virtio-9p-pci,fsdev=cfg,mount_tag=config-2"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn child_sees_handles_at_role_descriptors() {
        let mut cmd = Command::new("sh");
        cmd.args([
            "-c",
            r#"test "$(cat <&3)" = disk && test "$(cat <&4)" = tap"#,
        ]);
        let mut child = spawn_with_handles(&mut cmd, full_table()).unwrap();
        assert!(child.wait().unwrap().success());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn host_copies_are_closed_after_spawn() {
        let mut fds = [0; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(rc, 0);
        let mut read_end = unsafe { File::from_raw_fd(fds[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let mut handles = HandleTable::new();
        handles.insert(HandleRole::Disk, file_with(b"disk"));
        handles.insert(HandleRole::Tap, write_end);

        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo hello >&4"]);
        let mut child = spawn_with_handles(&mut cmd, handles).unwrap();
        assert!(child.wait().unwrap().success());

        // EOF only arrives if neither the child nor the host still holds the
        // write end.
        let mut received = String::new();
        read_end.read_to_string(&mut received).unwrap();
        assert_eq!(received, "hello\n");
    }

    #[test]
    fn launch_requires_every_handle() {
        let mut handles = HandleTable::new();
        handles.insert(HandleRole::Disk, file_with(b"disk"));
        let err = launch(
            &fake_hypervisor("exit 0"),
            &spec(),
            handles,
            OutputMode::Null,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::MissingHandle(HandleRole::Tap)));
    }

    #[test]
    fn launch_rejects_empty_command() {
        let err =
            launch(&[], &spec(), full_table(), OutputMode::Null, None)
                .unwrap_err();
        assert!(matches!(err, LaunchError::EmptyCommand));
    }

    #[test]
    fn missing_executable_is_a_spawn_error() {
        let err = launch(
            &["/nonexistent/qemu-system-x86_64".to_owned()],
            &spec(),
            full_table(),
            OutputMode::Null,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[test]
    fn terminate_reaps_and_is_idempotent() {
        let mut process = launch(
            &fake_hypervisor("exec sleep 30"),
            &spec(),
            full_table(),
            OutputMode::Null,
            None,
        )
        .unwrap();
        let pid = process.pid();
        assert!(process.is_running());
        assert!(process_exists(pid));

        process.terminate().unwrap();
        assert!(!process.is_running());
        assert!(!process_exists(pid));

        process.terminate().unwrap();
    }

    #[test]
    fn terminate_after_exit_succeeds() {
        let mut process = launch(
            &fake_hypervisor("exit 0"),
            &spec(),
            full_table(),
            OutputMode::Null,
            None,
        )
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        process.terminate().unwrap();
    }

    #[test]
    fn dropping_process_reaps_it() {
        let process = launch(
            &fake_hypervisor("exec sleep 30"),
            &spec(),
            full_table(),
            OutputMode::Null,
            None,
        )
        .unwrap();
        let pid = process.pid();
        drop(process);
        assert!(!process_exists(pid));
    }
}
