use super::*;
use crate::error::{KeelErrorExt, KeelResult};
use crate::obj::{FileMode, KeelObjType};
use crate::refs::RefExpectation;
use crate::test_utils::with_test_repo;

#[test]
fn parse_revspec_grammar() -> KeelResult<()> {
    let rev: Revspec = "master^2~3^{tree}".parse()?;
    let parsed = rev.parse()?;
    assert_eq!(
        *parsed,
        ParsedRevspec::Peel(
            Box::new(ParsedRevspec::Ancestor(
                Box::new(ParsedRevspec::Parent(
                    Box::new(ParsedRevspec::Name("master".to_owned())),
                    2
                )),
                3
            )),
            Some(KeelObjType::Tree)
        )
    );
    assert_eq!(parsed.to_string(), "master^2~3^{tree}");
    Ok(())
}

#[test]
fn parse_bare_caret_defaults_to_first_parent() -> KeelResult<()> {
    let rev: Revspec = "HEAD^".parse()?;
    assert_eq!(
        *rev.parse()?,
        ParsedRevspec::Parent(Box::new(ParsedRevspec::Name("HEAD".to_owned())), 1)
    );
    Ok(())
}

#[test]
fn full_hex_resolves_to_itself() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        let oid = commits[0];
        assert_eq!(repo.resolve_rev_str(&oid.to_hex())?, oid);
        Ok(())
    })
}

#[test]
fn abbreviated_hex_resolves() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        let oid = commits[0];
        assert_eq!(repo.resolve_rev_str(&oid.to_hex()[..8])?, oid);
        Ok(())
    })
}

#[test]
fn head_and_branch_names_resolve() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(2)?;
        let tip = commits[1];
        assert_eq!(repo.resolve_rev_str("HEAD")?, tip);
        assert_eq!(repo.resolve_rev_str("@")?, tip);
        assert_eq!(repo.resolve_rev_str("master")?, tip);
        assert_eq!(repo.resolve_rev_str("refs/heads/master")?, tip);
        Ok(())
    })
}

#[test]
fn parent_and_ancestor_selectors() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(3)?;
        assert_eq!(repo.resolve_rev_str("HEAD^")?, commits[1]);
        assert_eq!(repo.resolve_rev_str("HEAD^1")?, commits[1]);
        assert_eq!(repo.resolve_rev_str("HEAD^^")?, commits[0]);
        assert_eq!(repo.resolve_rev_str("HEAD~0")?, commits[2]);
        assert_eq!(repo.resolve_rev_str("HEAD~1")?, commits[1]);
        assert_eq!(repo.resolve_rev_str("HEAD~2")?, commits[0]);
        // ^0 is the commit itself
        assert_eq!(repo.resolve_rev_str("HEAD^0")?, commits[2]);

        assert!(repo.resolve_rev_str("HEAD~3").is_err());
        assert!(repo.resolve_rev_str("HEAD^2").is_err());
        Ok(())
    })
}

#[test]
fn nth_parent_of_merge() -> KeelResult<()> {
    with_test_repo(|repo| {
        let blob = repo.write_test_blob(b"contents\n")?;
        let tree = repo.write_test_tree(vec![(FileMode::REG, "file", blob)])?;
        let left = repo.write_test_commit(tree, &[], 100)?;
        let right = repo.write_test_commit(tree, &[], 200)?;
        let merge = repo.write_test_commit(tree, &[left, right], 300)?;

        assert_eq!(repo.resolve_rev_str(&format!("{}^1", merge))?, left);
        assert_eq!(repo.resolve_rev_str(&format!("{}^2", merge))?, right);
        Ok(())
    })
}

#[test]
fn peel_tag_chain_to_commit() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        let inner = repo.write_test_tag(commits[0], KeelObjType::Commit, "inner")?;
        let outer = repo.write_test_tag(inner, KeelObjType::Tag, "v1.0")?;
        repo.update_ref(&crate::refs::SymbolicRef::tag("v1.0"), outer, RefExpectation::Any)?;

        // two dereferences reach the commit
        assert_eq!(repo.resolve_rev_str("v1.0^{commit}")?, commits[0]);
        // an empty peel just strips tags
        assert_eq!(repo.resolve_rev_str("v1.0^{}")?, commits[0]);
        // and the tag ref alone resolves to the outer tag object
        assert_eq!(repo.resolve_rev_str("v1.0")?, outer);
        Ok(())
    })
}

#[test]
fn peel_commit_to_tree_and_blob_fails() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        let tree = repo.read_obj(commits[0])?.into_commit()?.tree;
        assert_eq!(repo.resolve_rev_str("HEAD^{tree}")?, tree);

        // a commit never dereferences to a blob
        assert!(repo.resolve_rev_str("HEAD^{blob}").is_err());
        Ok(())
    })
}

#[test]
fn ambiguous_prefix_is_an_error() -> KeelResult<()> {
    with_test_repo(|repo| {
        use std::io::Write as _;
        let dir = repo.objects_dir().join("ab");
        std::fs::create_dir_all(&dir)?;
        for rest in ["cd111111111111111111111111111111111111", "cd222222222222222222222222222222222222"] {
            let mut file = std::fs::File::create(dir.join(rest))?;
            file.write_all(b"")?;
        }

        let err = repo.resolve_rev_str("abcd").unwrap_err();
        assert!(matches!(
            err.try_into_keel_error()?,
            crate::error::KeelError::AmbiguousPrefix(..)
        ));
        Ok(())
    })
}

#[test]
fn unknown_names_are_not_found() -> KeelResult<()> {
    with_test_repo(|repo| {
        repo.commit_test_chain(1)?;
        assert!(repo.resolve_rev_str("no-such-branch").is_err());
        assert!(repo.resolve_rev_str("refs/../escape").is_err());
        Ok(())
    })
}

#[test]
fn tag_name_resolution_prefers_tags_over_heads() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(2)?;
        // the same short name exists as a tag and a branch
        repo.update_ref(&crate::refs::SymbolicRef::tag("both"), commits[0], RefExpectation::Any)?;
        repo.update_ref(
            &crate::refs::SymbolicRef::branch("both"),
            commits[1],
            RefExpectation::Any,
        )?;

        // refs/tags comes before refs/heads in the prefix order
        assert_eq!(repo.resolve_rev_str("both")?, commits[0]);
        assert_eq!(repo.resolve_rev_str("refs/heads/both")?, commits[1]);
        Ok(())
    })
}
