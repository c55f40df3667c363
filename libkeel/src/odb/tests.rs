use super::*;
use crate::error::{KeelError, KeelErrorExt, KeelResult, KeelResultExt};
use crate::obj::{KeelObjType, Oid, PartialOid};
use crate::test_utils::with_test_repo;
use std::io::Write as _;
use std::str::FromStr;

#[test]
fn write_then_read_round_trips() -> KeelResult<()> {
    with_test_repo(|repo| {
        for (obj_type, bytes) in [
            (KeelObjType::Blob, b"hello\n".to_vec()),
            (KeelObjType::Blob, vec![]),
            (KeelObjType::Blob, vec![0u8; 4096]),
        ] {
            let oid = repo.write_raw(obj_type, &bytes)?;
            let raw = repo.odb()?.read_raw(oid.into())?;
            assert_eq!(raw.obj_type, obj_type);
            assert_eq!(raw.bytes, bytes);

            let header = repo.read_obj_header(oid)?;
            assert_eq!(header.obj_type, obj_type);
            assert_eq!(header.size, bytes.len() as u64);
        }
        Ok(())
    })
}

#[test]
fn rewriting_an_existing_id_is_a_noop() -> KeelResult<()> {
    with_test_repo(|repo| {
        let first = repo.write_raw(KeelObjType::Blob, b"same bytes")?;
        let second = repo.write_raw(KeelObjType::Blob, b"same bytes")?;
        assert_eq!(first, second);
        Ok(())
    })
}

#[test]
fn missing_object_is_not_found() -> KeelResult<()> {
    with_test_repo(|repo| {
        let err = repo.odb()?.read_raw(Oid::EMPTY_BLOB.into()).unwrap_err();
        assert!(err.is_not_found_err());
        assert!(!repo.obj_exists(Oid::EMPTY_BLOB)?);
        Ok(())
    })
}

#[test]
fn ambiguous_prefix_reports_candidates() -> KeelResult<()> {
    with_test_repo(|repo| {
        // craft two loose files sharing a 4-hex prefix
        let dir = repo.objects_dir().join("ab");
        std::fs::create_dir_all(&dir)?;
        for rest in ["cd111111111111111111111111111111111111", "cd222222222222222222222222222222222222"] {
            let mut file = std::fs::File::create(dir.join(rest))?;
            file.write_all(b"")?;
        }

        let prefix = PartialOid::from_str("abcd")?;
        let err = repo.expand_prefix(prefix).unwrap_err();
        match err.try_into_keel_error()? {
            KeelError::AmbiguousPrefix(p, candidates) => {
                assert_eq!(p, prefix);
                assert_eq!(candidates.len(), 2);
            }
            err => panic!("expected ambiguous prefix error, got {:?}", err),
        }
        Ok(())
    })
}

#[test]
fn unique_prefix_expands() -> KeelResult<()> {
    with_test_repo(|repo| {
        let oid = repo.write_raw(KeelObjType::Blob, b"some contents")?;
        let prefix = PartialOid::from_str(&oid.to_hex()[..6])?;
        assert_eq!(repo.expand_prefix(prefix)?, oid);
        Ok(())
    })
}

#[test]
fn enumerate_loose_is_sorted() -> KeelResult<()> {
    with_test_repo(|repo| {
        let mut written = vec![
            repo.write_raw(KeelObjType::Blob, b"one")?,
            repo.write_raw(KeelObjType::Blob, b"two")?,
            repo.write_raw(KeelObjType::Blob, b"three")?,
        ];
        written.sort_unstable();

        assert_eq!(repo.odb()?.enumerate_loose()?, written);
        Ok(())
    })
}

#[test]
fn alternates_are_searched() -> KeelResult<()> {
    with_test_repo(|alternate| {
        let oid = alternate.write_raw(KeelObjType::Blob, b"shared history")?;

        with_test_repo(|repo| {
            assert!(!repo.obj_exists(oid)?);

            let alternates_path = repo.objects_dir().join(ALTERNATES_FILE_PATH);
            std::fs::create_dir_all(alternates_path.parent().unwrap())?;
            std::fs::write(
                &alternates_path,
                format!("# shared store\n{}\n", alternate.objects_dir().display()),
            )?;

            // the odb is rebuilt on a fresh load so the alternate is seen
            let repo = crate::repo::KeelRepo::load(&repo.workdir)?;
            assert!(repo.obj_exists(oid)?);
            let raw = repo.odb()?.read_raw(oid.into())?;
            assert_eq!(raw.bytes, b"shared history");
            Ok(())
        })
    })
}

#[test]
fn cyclic_alternates_terminate() -> KeelResult<()> {
    with_test_repo(|repo| {
        let alternates_path = repo.objects_dir().join(ALTERNATES_FILE_PATH);
        std::fs::create_dir_all(alternates_path.parent().unwrap())?;
        // an alternate chain pointing back at ourselves
        std::fs::write(&alternates_path, format!("{}\n", repo.objects_dir().display()))?;

        let repo = crate::repo::KeelRepo::load(&repo.workdir)?;
        let oid = repo.write_raw(KeelObjType::Blob, b"contents")?;
        assert!(repo.obj_exists(oid)?);
        Ok(())
    })
}

#[test]
fn strict_mode_rejects_identity_mismatch() -> KeelResult<()> {
    use crate::repo::RepoOpts;
    crate::test_utils::with_test_repo_opts(
        RepoOpts { strict: true, track_refs: false },
        |repo| {
            let oid = repo.write_raw(KeelObjType::Blob, b"good bytes")?;

            // move the object file under a wrong name
            let hex = oid.to_hex();
            let good = repo.objects_dir().join(&hex[..2]).join(&hex[2..]);
            let bad = repo
                .objects_dir()
                .join("ee")
                .join("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee");
            std::fs::create_dir_all(bad.parent().unwrap())?;
            std::fs::copy(&good, &bad)?;

            let bad_oid = Oid::from_str("eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee")?;
            assert!(repo.odb()?.read_raw(bad_oid.into()).is_err());
            Ok(())
        },
    )
}
