// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Staging of per-machine guest disks.
//!
//! Every machine boots from a private, writable copy of the cluster's golden
//! image. The copy is an anonymous temporary file: it has no path that other
//! processes can discover, and its storage is reclaimed as soon as the last
//! descriptor referring to it is closed.

use std::{
    fs::File,
    io::{Seek, SeekFrom},
    os::fd::OwnedFd,
};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{error, info};

/// Errors that can arise while staging a disk.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("failed to open base image {path}: {source}")]
    OpenBaseImage {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create temporary disk: {0}")]
    CreateCopy(#[source] std::io::Error),

    #[error("failed to copy base image {path}: {source}")]
    Copy {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A private read/write copy of a base image.
#[derive(Debug)]
pub struct StagedDisk {
    file: File,
    len: u64,
}

impl StagedDisk {
    /// The size of the copy in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Gives up the disk's open handle. Whoever holds the returned
    /// descriptor holds the only reference to the disk's contents.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.file.into()
    }
}

/// Copies `base_image` into a new anonymous file created in `tmp_directory`
/// (or the system temporary directory) and returns it opened for reading and
/// writing, positioned at the start.
///
/// If the copy fails partway the partial file is closed, which discards it.
pub fn stage_disk(
    base_image: &Utf8Path,
    tmp_directory: Option<&Utf8Path>,
) -> Result<StagedDisk, DiskError> {
    let mut src = File::open(base_image).map_err(|source| {
        DiskError::OpenBaseImage { path: base_image.to_owned(), source }
    })?;

    let mut dst = match tmp_directory {
        Some(dir) => tempfile::tempfile_in(dir),
        None => tempfile::tempfile(),
    }
    .map_err(DiskError::CreateCopy)?;

    info!(source = %base_image, "Copying base image to create temporary disk");

    let copy_result = std::io::copy(&mut src, &mut dst)
        .and_then(|len| dst.seek(SeekFrom::Start(0)).map(|_| len));

    match copy_result {
        Ok(len) => Ok(StagedDisk { file: dst, len }),
        Err(source) => {
            error!(
                %source,
                source_image = %base_image,
                "Failed to copy base image"
            );
            drop(dst);
            Err(DiskError::Copy { path: base_image.to_owned(), source })
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};

    use super::*;

    fn write_image(dir: &tempfile::TempDir, contents: &[u8]) -> Utf8PathBuf {
        let path =
            Utf8PathBuf::from_path_buf(dir.path().join("coreos-v1.img"))
                .unwrap();
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn staged_disk_is_byte_exact_and_writable() {
        let dir = tempfile::tempdir().unwrap();
        let contents: Vec<u8> =
            (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let image = write_image(&dir, &contents);

        let disk = stage_disk(&image, None).unwrap();
        assert_eq!(disk.len(), contents.len() as u64);

        let mut file = File::from(disk.into_owned_fd());
        let mut copied = Vec::new();
        file.read_to_end(&mut copied).unwrap();
        assert_eq!(copied, contents);

        file.write_all(b"scribble").unwrap();
        assert_eq!(std::fs::read(&image).unwrap(), contents);
    }

    #[test]
    fn staged_disk_leaves_no_file_in_tmp_directory() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_image(&dir, b"boot sector");
        let staging = tempfile::tempdir().unwrap();
        let staging_path = Utf8Path::from_path(staging.path()).unwrap();

        let disk = stage_disk(&image, Some(staging_path)).unwrap();
        assert!(!disk.is_empty());
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_base_image_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing =
            Utf8PathBuf::from_path_buf(dir.path().join("absent.img")).unwrap();

        match stage_disk(&missing, None) {
            Err(DiskError::OpenBaseImage { path, source }) => {
                assert_eq!(path, missing);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected OpenBaseImage, got {other:?}"),
        }
    }

    #[test]
    fn failed_copy_discards_partial_disk() {
        // A directory opens fine but fails on the first read.
        let dir = tempfile::tempdir().unwrap();
        let not_an_image = Utf8Path::from_path(dir.path()).unwrap();
        let staging = tempfile::tempdir().unwrap();
        let staging_path = Utf8Path::from_path(staging.path()).unwrap();

        match stage_disk(not_an_image, Some(staging_path)) {
            Err(DiskError::Copy { path, .. }) => {
                assert_eq!(path, not_an_image);
            }
            other => panic!("expected Copy, got {other:?}"),
        }
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[test]
    fn missing_tmp_directory_is_a_create_error() {
        let dir = tempfile::tempdir().unwrap();
        let image = write_image(&dir, b"boot sector");
        let bogus =
            Utf8PathBuf::from_path_buf(dir.path().join("nope")).unwrap();

        assert!(matches!(
            stage_disk(&image, Some(bogus.as_path())),
            Err(DiskError::CreateCopy(_))
        ));
    }
}
