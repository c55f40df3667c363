use super::*;
use crate::error::{KeelResult, KeelResultExt};
use std::io::Write;
use tempfile::tempdir;

#[test]
fn commit_renames_lock_over_target() -> KeelResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("foo");
    Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
        write!(lockfile, "random stuff")?;
        Ok(())
    })?;

    assert_eq!(std::fs::read_to_string(&path)?, "random stuff");
    assert!(!path.with_extension("lock").exists());
    Ok(())
}

#[test]
fn erroring_closure_rolls_back() -> KeelResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("foo");
    let result: KeelResult<()> = Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
        write!(lockfile, "to be discarded")?;
        bail!("nope")
    });

    assert!(result.is_err());
    assert!(!path.exists());
    assert!(!path.with_extension("lock").exists());
    Ok(())
}

#[test]
fn losing_the_race_is_lock_busy() -> KeelResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("foo");

    Lockfile::with_mut(&path, LockfileFlags::empty(), |outer| {
        write!(outer, "winner")?;
        let inner = Lockfile::with_mut(&path, LockfileFlags::empty(), |inner| {
            write!(inner, "loser")?;
            Ok(())
        });
        assert!(inner.is_lock_busy());
        Ok(())
    })?;

    assert_eq!(std::fs::read_to_string(&path)?, "winner");
    Ok(())
}

#[test]
fn readonly_never_commits() -> KeelResult<()> {
    let dir = tempdir()?;
    let path = dir.path().join("foo");
    std::fs::write(&path, "original")?;

    Lockfile::with_readonly(&path, LockfileFlags::empty(), |lockfile| {
        assert!(lockfile.file().is_some());
        Ok(())
    })?;

    assert_eq!(std::fs::read_to_string(&path)?, "original");
    assert!(!path.with_extension("lock").exists());
    Ok(())
}
