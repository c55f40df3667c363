use super::*;
use crate::error::{KeelResult, KeelResultExt};
use crate::test_utils::with_test_repo;

#[test]
fn head_starts_symbolic() -> KeelResult<()> {
    with_test_repo(|repo| {
        let head = repo.read_head()?;
        assert_eq!(head, KeelRef::Symbolic(SymbolicRef::new("refs/heads/master")));
        Ok(())
    })
}

#[test]
fn symbolic_head_resolves_through_branch() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        // HEAD -> refs/heads/master -> tip
        assert_eq!(repo.resolve_head()?, commits[0]);
        Ok(())
    })
}

#[test]
fn update_ref_compare_and_swap() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(2)?;
        let branch = SymbolicRef::branch("master");

        // wrong expectation refuses the update and leaves the ref untouched
        let result =
            repo.update_ref(&branch, commits[0], RefExpectation::MustBe(commits[0]));
        assert!(result.is_err());
        assert_eq!(repo.refdb()?.read_resolved(&branch)?, commits[1]);

        repo.update_ref(&branch, commits[0], RefExpectation::MustBe(commits[1]))?;
        assert_eq!(repo.refdb()?.read_resolved(&branch)?, commits[0]);
        Ok(())
    })
}

#[test]
fn concurrent_update_loses_to_the_lock() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(2)?;
        let branch = SymbolicRef::branch("concurrent");

        // simulate the other writer by holding the lock file
        let lock_path = repo.keeldir.join("refs/heads/concurrent.lock");
        std::fs::create_dir_all(lock_path.parent().unwrap())?;
        std::fs::write(&lock_path, b"")?;

        let result = repo.update_ref(&branch, commits[0], RefExpectation::Any);
        assert!(result.is_lock_busy());
        assert!(!repo.refdb()?.exists(&branch));

        std::fs::remove_file(&lock_path)?;
        repo.update_ref(&branch, commits[0], RefExpectation::Any)?;
        assert_eq!(repo.refdb()?.read_resolved(&branch)?, commits[0]);
        Ok(())
    })
}

#[test]
fn ref_files_are_single_lines() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        let contents = std::fs::read_to_string(repo.keeldir.join("refs/heads/master"))?;
        assert_eq!(contents, format!("{}\n", commits[0]));

        repo.create_symref(&SymbolicRef::new("refs/heads/alias"), &SymbolicRef::branch("master"))?;
        let contents = std::fs::read_to_string(repo.keeldir.join("refs/heads/alias"))?;
        assert_eq!(contents, "ref: refs/heads/master\n");

        assert_eq!(repo.refdb()?.read_resolved(&SymbolicRef::new("refs/heads/alias"))?, commits[0]);
        Ok(())
    })
}

#[test]
fn symbolic_cycles_are_broken_by_depth() -> KeelResult<()> {
    with_test_repo(|repo| {
        let a = SymbolicRef::new("refs/heads/a");
        let b = SymbolicRef::new("refs/heads/b");
        repo.create_symref(&a, &b)?;
        repo.create_symref(&b, &a)?;

        assert!(repo.refdb()?.read_resolved(&a).is_err());
        Ok(())
    })
}

#[test]
fn resolution_stays_within_the_ref_namespace() -> KeelResult<()> {
    with_test_repo(|repo| {
        let escape = SymbolicRef::new("refs/heads/escape");
        repo.create_symref(&escape, &SymbolicRef::new("config"))?;
        let err = repo.refdb()?.read_resolved(&escape).unwrap_err();
        assert!(err.to_string().contains("ref namespace") || err.to_string().contains("config"));
        Ok(())
    })
}

#[test]
fn for_each_ref_visits_sorted_and_skips_broken() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        let tip = commits[0];
        repo.update_ref(&SymbolicRef::branch("beta"), tip, RefExpectation::Any)?;
        repo.update_ref(&SymbolicRef::tag("alpha"), tip, RefExpectation::Any)?;
        // a dangling symref resolves to nothing and is skipped
        repo.create_symref(
            &SymbolicRef::new("refs/heads/dangling"),
            &SymbolicRef::new("refs/heads/nonexistent"),
        )?;

        let mut seen = vec![];
        repo.for_each_ref(|sym, oid| {
            assert_eq!(oid, tip);
            seen.push(sym.name().to_owned());
            Ok(())
        })?;
        assert_eq!(seen, vec!["refs/heads/beta", "refs/heads/master", "refs/tags/alpha"]);
        Ok(())
    })
}

#[test]
fn ref_name_validation() {
    assert!(is_valid_name("refs/heads/master"));
    assert!(is_valid_name("refs/tags/v1.0"));
    assert!(!is_valid_name("refs/heads/.hidden"));
    assert!(!is_valid_name("refs/../escape"));
    assert!(!is_valid_name("/leading/slash"));
    assert!(!is_valid_name("refs//double"));
    assert!(!is_valid_name("refs/heads/trailing/"));
    assert!(!is_valid_name("refs/heads/with space"));
    assert!(!is_valid_name("refs/heads/foo.lock"));
    assert!(!is_valid_name(""));
}

#[test]
fn parse_direct_and_symbolic() -> KeelResult<()> {
    let direct: KeelRef = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".parse()?;
    assert!(direct.is_direct());

    let symbolic: KeelRef = "ref: refs/heads/master".parse()?;
    assert_eq!(symbolic, KeelRef::Symbolic(SymbolicRef::new("refs/heads/master")));

    // `@` is an alias for HEAD
    let at: KeelRef = "@".parse()?;
    assert_eq!(at, KeelRef::Symbolic(SymbolicRef::head()));
    Ok(())
}
