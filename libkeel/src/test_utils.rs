use crate::error::KeelResult;
use crate::obj::{Blob, Commit, FileMode, KeelObjType, Oid, Tag, Tree, TreeEntry};
use crate::refs::{RefExpectation, SymbolicRef};
use crate::repo::{KeelRepo, RepoOpts};
use crate::signature::{KeelEpochTime, KeelSignature, KeelTime, KeelTimeZoneOffset};
use smallvec::SmallVec;
use tempfile::TempDir;

/// initializes a fresh repository in a tempdir and runs `f` against it
pub fn with_test_repo<R>(f: impl FnOnce(KeelRepo) -> KeelResult<R>) -> KeelResult<R> {
    with_test_repo_opts(RepoOpts::default(), f)
}

pub fn with_test_repo_opts<R>(
    opts: RepoOpts,
    f: impl FnOnce(KeelRepo) -> KeelResult<R>,
) -> KeelResult<R> {
    let dir = TempDir::new()?;
    KeelRepo::init(dir.path())?;
    let repo = KeelRepo::load_opts(dir.path(), opts)?;
    f(repo)
}

/// a fixed signature with the given date so oids are deterministic
pub fn test_signature(date: i64) -> KeelSignature {
    KeelSignature {
        name: "A U Thor".to_owned(),
        email: "author@example.com".to_owned(),
        time: KeelTime::new(KeelEpochTime::new(date), KeelTimeZoneOffset::new(0)),
    }
}

impl KeelRepo {
    pub fn write_test_blob(&self, bytes: &[u8]) -> KeelResult<Oid> {
        self.write_obj(&Blob::new(bytes.to_vec()))
    }

    pub fn write_test_tree(&self, entries: Vec<(FileMode, &str, Oid)>) -> KeelResult<Oid> {
        let entries = entries
            .into_iter()
            .map(|(mode, name, oid)| TreeEntry { mode, name: name.to_owned(), oid })
            .collect();
        self.write_obj(&Tree::new(entries))
    }

    /// commits `tree` with deterministic signatures dated `date`
    pub fn write_test_commit(&self, tree: Oid, parents: &[Oid], date: i64) -> KeelResult<Oid> {
        let signature = test_signature(date);
        let commit = Commit {
            tree,
            parents: SmallVec::from_slice(parents),
            author: signature.clone(),
            committer: signature,
            message: format!("commit at {}\n", date),
        };
        self.write_obj(&commit)
    }

    pub fn write_test_tag(
        &self,
        target: Oid,
        target_type: KeelObjType,
        name: &str,
    ) -> KeelResult<Oid> {
        let tag = Tag {
            target,
            target_type,
            name: name.to_owned(),
            tagger: test_signature(1),
            message: format!("tag {}\n", name),
        };
        self.write_obj(&tag)
    }

    /// a linear chain of commits over a one-blob tree, oldest first;
    /// `refs/heads/master` ends up at the tip
    pub fn commit_test_chain(&self, n: usize) -> KeelResult<Vec<Oid>> {
        let mut commits = vec![];
        let mut parent: Option<Oid> = None;
        for i in 0..n {
            let blob = self.write_test_blob(format!("contents {}\n", i).as_bytes())?;
            let tree = self.write_test_tree(vec![(FileMode::REG, "file", blob)])?;
            let parents: Vec<Oid> = parent.into_iter().collect();
            let commit = self.write_test_commit(tree, &parents, 1000 + i as i64)?;
            commits.push(commit);
            parent = Some(commit);
        }
        if let Some(tip) = parent {
            self.update_ref(&SymbolicRef::branch("master"), tip, RefExpectation::Any)?;
        }
        Ok(commits)
    }
}
