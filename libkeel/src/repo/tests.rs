use super::*;
use crate::error::KeelResult;
use crate::graph::NodeFlags;
use crate::obj::{FileMode, Oid};
use crate::refs::{RefExpectation, SymbolicRef};
use crate::test_utils::{with_test_repo, with_test_repo_opts};

#[test]
fn init_creates_the_skeleton() -> KeelResult<()> {
    with_test_repo(|repo| {
        assert!(repo.keeldir.join("objects/pack").is_dir());
        assert!(repo.keeldir.join("refs/heads").is_dir());
        assert!(repo.keeldir.join("refs/tags").is_dir());
        assert_eq!(
            std::fs::read_to_string(repo.keeldir.join("HEAD"))?,
            "ref: refs/heads/master\n"
        );
        let version: Option<i64> = repo.config().get("core.repositoryformatversion")?;
        assert_eq!(version, Some(0));
        Ok(())
    })
}

#[test]
fn find_searches_parent_directories() -> KeelResult<()> {
    with_test_repo(|repo| {
        let nested = repo.workdir.join("some/nested/dir");
        std::fs::create_dir_all(&nested)?;
        let found = KeelRepo::find(&nested)?;
        assert_eq!(found.workdir, repo.workdir);
        Ok(())
    })
}

#[test]
fn read_obj_round_trips_through_the_store() -> KeelResult<()> {
    with_test_repo(|repo| {
        let blob = repo.write_test_blob(b"hello\n")?;
        let obj = repo.read_obj(blob)?;
        assert_eq!(obj.into_blob()?.bytes(), b"hello\n");
        Ok(())
    })
}

// commit a tiny tree, resolve HEAD, walk one step into the tree and find the
// blob whose content went in
#[test]
fn end_to_end_commit_and_walk() -> KeelResult<()> {
    with_test_repo(|repo| {
        let blob = repo.write_test_blob(b"hello\n")?;
        let tree = repo.write_test_tree(vec![(FileMode::REG, "hello", blob)])?;
        let commit_oid = repo.write_test_commit(tree, &[], 1000)?;
        repo.update_ref(
            &SymbolicRef::branch("master"),
            commit_oid,
            RefExpectation::Any,
        )?;

        let head = repo.resolve_head()?;
        assert_eq!(head, commit_oid);

        let commit = repo.read_obj(head)?.into_commit()?;
        assert_eq!(commit.tree, tree);

        let tree_obj = repo.read_obj(commit.tree)?.into_tree()?;
        let entry = tree_obj.find_entry("hello").expect("tree entry must exist");
        assert_eq!(entry.oid, blob);
        assert_eq!(repo.read_obj(entry.oid)?.into_blob()?.bytes(), b"hello\n");
        Ok(())
    })
}

#[test]
fn symref_head_points_through_branch() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(1)?;
        repo.create_symref(&SymbolicRef::head(), &SymbolicRef::branch("main"))?;
        repo.update_ref(&SymbolicRef::branch("main"), commits[0], RefExpectation::Any)?;
        assert_eq!(repo.resolve_head()?, commits[0]);
        Ok(())
    })
}

#[test]
fn abbrev_expands_until_unique() -> KeelResult<()> {
    with_test_repo(|repo| {
        let oid = repo.write_test_blob(b"abbreviate me")?;
        let abbrev = repo.abbrev_for(oid, 4)?.expect("stored object must abbreviate");
        assert!(abbrev.len() >= 4);
        assert_eq!(repo.resolve_rev_str(&abbrev)?, oid);

        // a minimum below 4 is brought up to the floor
        let abbrev = repo.abbrev_for(oid, 1)?.unwrap();
        assert!(abbrev.len() >= 4);
        Ok(())
    })
}

#[test]
fn abbrev_of_absent_object_is_none() -> KeelResult<()> {
    with_test_repo(|repo| {
        assert_eq!(repo.abbrev_for(Oid::EMPTY_BLOB, 4)?, None);
        Ok(())
    })
}

#[test]
fn abbrev_grows_past_shared_prefixes() -> KeelResult<()> {
    with_test_repo(|repo| {
        use std::io::Write as _;
        let oid = repo.write_test_blob(b"real object")?;
        // fabricate a neighbour sharing the first 10 hex digits
        let hex = oid.to_hex();
        let mut neighbour = hex.clone();
        let bump = |c: char| if c == '0' { '1' } else { '0' };
        let last = neighbour.pop().unwrap();
        neighbour.push(bump(last));

        let dir = repo.objects_dir().join(&neighbour[..2]);
        std::fs::create_dir_all(&dir)?;
        std::fs::File::create(dir.join(&neighbour[2..]))?.write_all(b"")?;

        let abbrev = repo.abbrev_for(oid, 4)?.expect("still uniquely abbreviable");
        assert_eq!(abbrev.len(), 40);
        assert_eq!(abbrev, hex);
        Ok(())
    })
}

#[test]
fn grafts_replace_parents_at_parse_time() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(3)?;
        // graft the tip directly onto the root, hiding the middle commit
        std::fs::write(
            repo.grafts_path(),
            format!("{} {}\n", commits[2], commits[0]),
        )?;

        let node = repo.parse_oid(commits[2])?;
        let graph = repo.graph();
        let commit = graph.commit(node)?;
        assert_eq!(commit.parents.len(), 1);
        assert_eq!(graph.oid(commit.parents[0]), commits[0]);
        Ok(())
    })
}

#[test]
fn pop_most_recent_walks_in_date_order() -> KeelResult<()> {
    with_test_repo(|repo| {
        let commits = repo.commit_test_chain(3)?;
        let tip = repo.parse_oid(commits[2])?;

        let mut list = vec![tip];
        repo.graph_mut().insert_flags(tip, NodeFlags::SEEN);

        let mut dates = vec![];
        let mut popped = vec![];
        while let Some(node) = repo.pop_most_recent(&mut list, NodeFlags::SEEN)? {
            dates.push(repo.graph().commit(node)?.date);
            popped.push(repo.graph().oid(node));
        }

        assert_eq!(popped, vec![commits[2], commits[1], commits[0]]);
        assert!(dates.windows(2).all(|w| w[0] >= w[1]));
        Ok(())
    })
}

#[test]
fn strict_repo_loads_and_reads() -> KeelResult<()> {
    with_test_repo_opts(RepoOpts { strict: true, track_refs: true }, |repo| {
        let commits = repo.commit_test_chain(2)?;
        assert_eq!(repo.resolve_head()?, commits[1]);
        repo.parse_oid(commits[1])?;
        Ok(())
    })
}
