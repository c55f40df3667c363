use crate::error::{KeelError, KeelResult};
use anyhow::Context;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{self, prelude::*};
use std::path::{Path, PathBuf};

const LOCK_FILE_EXT: &str = "lock";

bitflags! {
    pub struct LockfileFlags: u8 {
        const SET_READONLY = 1;
    }
}

/// guards mutation of a file: all writes go to `<path>.lock` (created with
/// exclusive-create semantics) and are renamed over the target on commit.
/// losing the creation race surfaces as [`KeelError::LockBusy`]; conflicts are
/// never retried here, the caller decides.
#[derive(Debug)]
pub struct Lockfile {
    // the file this lockfile is guarding, `None` if it does not exist yet
    file: Option<File>,
    // the lockfile itself
    lockfile: File,
    flags: LockfileFlags,
    path: PathBuf,
    lockfile_path: PathBuf,
    committed: Cell<bool>,
    rolled_back: Cell<bool>,
}

impl Write for Lockfile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.lockfile.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.lockfile.flush()
    }
}

impl Lockfile {
    /// accepts the path to the file to be locked and creates `<path>.lock`
    // consumers should never hold the lockfile directly, they go through the
    // `with_` apis which commit or roll back for them
    fn open(path: impl AsRef<Path>, flags: LockfileFlags) -> KeelResult<Self> {
        let path = path.as_ref();
        assert!(!path.exists() || path.is_file(), "cannot create lock on symlinks or directories");
        let lockfile_path = path.with_extension(LOCK_FILE_EXT);
        path.parent().map(std::fs::create_dir_all).transpose()?;
        let lockfile = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&lockfile_path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => anyhow!(KeelError::LockBusy(path.to_path_buf())),
                _ => anyhow!(err)
                    .context(format!("failed to create lock file `{}`", lockfile_path.display())),
            })?;

        let file = path.exists().then(|| File::open(path)).transpose()?;

        Ok(Self {
            file,
            lockfile,
            flags,
            lockfile_path,
            path: path.to_path_buf(),
            committed: Cell::new(false),
            rolled_back: Cell::new(false),
        })
    }

    // never hand out mutable access to `self.file`,
    // writes must go to the lockfile only
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn with_readonly<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&Self) -> KeelResult<R>,
    ) -> KeelResult<R> {
        Self::open(path, flags)?.with_readonly_inner(f)
    }

    /// runs a function under the lock without write access, never commits
    fn with_readonly_inner<R>(&self, f: impl FnOnce(&Self) -> KeelResult<R>) -> KeelResult<R> {
        let r = f(self);
        self.rollback();
        r
    }

    pub fn with_mut<R>(
        path: impl AsRef<Path>,
        flags: LockfileFlags,
        f: impl FnOnce(&mut Self) -> KeelResult<R>,
    ) -> KeelResult<R> {
        Self::open(path, flags)?.with_mut_inner(f)
    }

    /// runs a function under the lock with write access to the lockfile;
    /// if the closure errors the transaction is rolled back, otherwise committed
    fn with_mut_inner<R>(mut self, f: impl FnOnce(&mut Self) -> KeelResult<R>) -> KeelResult<R> {
        match f(&mut self) {
            Ok(r) => {
                self.commit().with_context(|| anyhow!(
                        "failed to write lockfile to `{}`; the updated contents are stored in `{}`; please remove this file when done",
                        self.path.display(),
                        self.lockfile_path.display()
                    )
                )?;
                Ok(r)
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    /// commits this file by renaming it over the target file
    fn commit(&self) -> io::Result<()> {
        if self.rolled_back.get() {
            return Ok(());
        }
        let set_readonly = self.flags.contains(LockfileFlags::SET_READONLY);
        if set_readonly && self.path.exists() {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(false);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        std::fs::rename(&self.lockfile_path, &self.path)?;
        self.committed.set(true);

        if set_readonly {
            let mut permissions = self.path.metadata()?.permissions();
            permissions.set_readonly(true);
            std::fs::set_permissions(&self.path, permissions)?;
        }

        Ok(())
    }

    fn cleanup(&self) -> KeelResult<()> {
        std::fs::remove_file(&self.lockfile_path).with_context(|| {
            format!("failed to remove lockfile `{}`", self.lockfile_path.display())
        })
    }

    pub fn rollback(&self) {
        // don't do anything until the drop impl
        self.rolled_back.set(true);
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        // can't be both rolled_back and committed
        assert!(!self.rolled_back.get() || !self.committed.get());
        // if either explicitly rolled back, or not explicitly committed, then rollback
        if self.rolled_back.get() || !self.committed.get() {
            self.cleanup().unwrap();
        }
    }
}

#[cfg(test)]
mod tests;
