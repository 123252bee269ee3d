// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsStr,
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::util;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IoError: failed to read {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("IoError: failed to write {0:?}")]
    Write(PathBuf, #[source] io::Error),
    #[error("IoError: failed to replace {0:?}")]
    Persist(PathBuf, #[source] tempfile::PersistError),
}

type Result<T> = std::result::Result<T, Error>;

/// An image buffer with an optional commit target. All edits happen on the
/// in-memory copy; nothing reaches disk unless [`ImageFile::commit`] runs,
/// and the commit itself goes through a temporary file in the target's
/// directory so a failed signing run never leaves a partial write behind.
pub struct ImageFile {
    data: Vec<u8>,
    target: Option<PathBuf>,
}

impl ImageFile {
    /// Open read-only. The buffer can be inspected and scribbled on, but
    /// there is nothing to commit.
    pub fn open_ro(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::Read(path.to_owned(), e))?;

        Ok(Self { data, target: None })
    }

    /// Open for in-place signing: edits are committed back to `path`.
    pub fn open_rw(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::Read(path.to_owned(), e))?;

        Ok(Self {
            data,
            target: Some(path.to_owned()),
        })
    }

    /// Read `input` and commit the edited copy to `output`, leaving the
    /// input untouched.
    pub fn open_copy(input: &Path, output: &Path) -> Result<Self> {
        let data = fs::read(input).map_err(|e| Error::Read(input.to_owned(), e))?;

        Ok(Self {
            data,
            target: Some(output.to_owned()),
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Flush the buffer to the target path via a temporary file in the same
    /// directory, then atomically rename it over the target. Dropping the
    /// image without calling this discards every edit.
    pub fn commit(self) -> Result<()> {
        let Some(target) = self.target else {
            return Ok(());
        };

        let mut temp = NamedTempFile::with_prefix_in(
            target.file_name().unwrap_or_else(|| OsStr::new("vbsign.tmp")),
            util::parent_path(&target),
        )
        .map_err(|e| Error::Write(target.clone(), e))?;

        temp.write_all(&self.data)
            .and_then(|()| temp.flush())
            .map_err(|e| Error::Write(target.clone(), e))?;

        temp.persist(&target)
            .map_err(|e| Error::Persist(target.clone(), e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, b"original").unwrap();

        let mut image = ImageFile::open_rw(&path).unwrap();
        image.data_mut()[0] = b'O';
        image.commit().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"Original");
    }

    #[test]
    fn drop_discards_edits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.bin");
        fs::write(&path, b"original").unwrap();

        let mut image = ImageFile::open_rw(&path).unwrap();
        image.data_mut()[0] = b'X';
        drop(image);

        assert_eq!(fs::read(&path).unwrap(), b"original");
    }

    #[test]
    fn copy_mode_leaves_input_alone() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.bin");
        let output = dir.path().join("output.bin");
        fs::write(&input, b"original").unwrap();

        let mut image = ImageFile::open_copy(&input, &output).unwrap();
        image.data_mut()[0] = b'X';
        image.commit().unwrap();

        assert_eq!(fs::read(&input).unwrap(), b"original");
        assert_eq!(fs::read(&output).unwrap(), b"Xriginal");
    }
}
