use super::*;
use crate::error::KeelResult;
use crate::obj::{FileMode, Oid};
use crate::refs::{RefExpectation, SymbolicRef};
use crate::repo::KeelRepo;
use crate::upload_pack::{UploadPack, UploadPackOpts};
use tempfile::TempDir;

fn temp_repo() -> KeelResult<(TempDir, KeelRepo)> {
    let dir = TempDir::new()?;
    KeelRepo::init(dir.path())?;
    let repo = KeelRepo::load(dir.path())?;
    Ok((dir, repo))
}

/// wires a client and server together over an in-memory duplex and runs the
/// full negotiation
async fn run_fetch(
    server: KeelRepo,
    client: KeelRepo,
    selection: WantSelection,
) -> KeelResult<FetchSummary> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (server_read, server_write) = tokio::io::split(server_io);
    let (client_read, client_write) = tokio::io::split(client_io);

    let server_task = tokio::spawn(
        UploadPack::new(server, server_read, server_write, UploadPackOpts::default()).run(),
    );
    let summary = Fetch::new(client, client_read, client_write, selection).run().await?;
    server_task.await??;
    Ok(summary)
}

#[tokio::test]
async fn clone_into_empty_repository() -> KeelResult<()> {
    let (_sd, server) = temp_repo()?;
    let (_cd, client) = temp_repo()?;
    let commits = server.commit_test_chain(2)?;

    let summary = run_fetch(server, client.clone(), WantSelection::AllMissing).await?;

    // advertisement carries HEAD plus the branch
    assert!(summary.refs.iter().any(|r| r.name == "HEAD"));
    assert!(summary.refs.iter().any(|r| r.name == "refs/heads/master"));
    // HEAD and master share an oid so only one want goes out
    assert_eq!(summary.wanted, vec![commits[1]]);
    assert!(summary.common.is_empty());
    // 2 commits, 2 trees, 2 blobs
    assert_eq!(summary.unpacked.len(), 6);

    for &commit in &commits {
        assert!(client.obj_exists(commit)?);
    }
    let obj = client.read_obj(commits[1])?.into_commit()?;
    assert!(client.obj_exists(obj.tree)?);
    Ok(())
}

// the client already has the parent: the pack covers exactly the child commit
// and its novel tree and blob
#[tokio::test]
async fn incremental_fetch_excludes_common_history() -> KeelResult<()> {
    let (_sd, server) = temp_repo()?;
    let (_cd, client) = temp_repo()?;
    let base = server.commit_test_chain(2)?;

    // first fetch brings the client up to date
    run_fetch(server.clone(), client.clone(), WantSelection::AllMissing).await?;
    client.update_ref(&SymbolicRef::branch("master"), base[1], RefExpectation::Any)?;

    // the server advances by one commit
    let blob = server.write_test_blob(b"new work\n")?;
    let tree = server.write_test_tree(vec![(FileMode::REG, "file", blob)])?;
    let child = server.write_test_commit(tree, &[base[1]], 9000)?;
    server.update_ref(&SymbolicRef::branch("master"), child, RefExpectation::Any)?;

    // fresh contexts so neither side carries negotiation marks over
    let server = KeelRepo::load(&server.workdir)?;
    let client = KeelRepo::load(&client.workdir)?;

    let summary =
        run_fetch(server, client.clone(), WantSelection::AllMissing).await?;

    assert_eq!(summary.wanted, vec![child]);
    // the client's have of the shared tip was acknowledged
    assert_eq!(summary.common, vec![base[1]]);
    // exactly the new commit, tree and blob travel
    assert_eq!(summary.unpacked.len(), 3);
    assert!(summary.unpacked.contains(&child));
    assert!(summary.unpacked.contains(&tree));
    assert!(summary.unpacked.contains(&blob));

    assert!(client.obj_exists(child)?);
    Ok(())
}

#[tokio::test]
async fn fetch_by_ref_name() -> KeelResult<()> {
    let (_sd, server) = temp_repo()?;
    let (_cd, client) = temp_repo()?;
    let commits = server.commit_test_chain(1)?;

    let summary = run_fetch(
        server,
        client.clone(),
        WantSelection::Names(vec!["master".to_owned()]),
    )
    .await?;
    assert_eq!(summary.wanted, vec![commits[0]]);
    assert!(client.obj_exists(commits[0])?);
    Ok(())
}

#[tokio::test]
async fn fetch_with_nothing_missing_sends_no_wants() -> KeelResult<()> {
    let (_sd, server) = temp_repo()?;
    let (_cd, client) = temp_repo()?;
    server.commit_test_chain(1)?;

    run_fetch(server.clone(), client.clone(), WantSelection::AllMissing).await?;

    let server = KeelRepo::load(&server.workdir)?;
    let client = KeelRepo::load(&client.workdir)?;
    let summary = run_fetch(server, client, WantSelection::AllMissing).await?;
    assert!(summary.wanted.is_empty());
    assert!(summary.unpacked.is_empty());
    Ok(())
}

#[tokio::test]
async fn wanting_an_unadvertised_id_is_rejected() -> KeelResult<()> {
    let (_sd, server) = temp_repo()?;
    let (_cd, client) = temp_repo()?;
    server.commit_test_chain(1)?;

    let bogus: Oid = crate::hash::hash_bytes(b"never advertised");
    let result =
        run_fetch(server, client, WantSelection::Ids(vec![bogus])).await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test]
async fn tag_refs_are_advertised_peeled() -> KeelResult<()> {
    let (_sd, server) = temp_repo()?;
    let (_cd, client) = temp_repo()?;
    let commits = server.commit_test_chain(1)?;
    let tag = server.write_test_tag(commits[0], crate::obj::KeelObjType::Commit, "v1.0")?;
    server.update_ref(&SymbolicRef::tag("v1.0"), tag, RefExpectation::Any)?;

    let summary = run_fetch(server, client.clone(), WantSelection::AllMissing).await?;
    let names: Vec<&str> = summary.refs.iter().map(|r| r.name.as_str()).collect();
    assert!(names.contains(&"refs/tags/v1.0"));
    assert!(names.contains(&"refs/tags/v1.0^{}"));

    // the tag object itself travelled too
    assert!(client.obj_exists(tag)?);
    Ok(())
}
