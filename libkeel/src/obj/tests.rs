use super::*;
use crate::error::KeelResult;
use crate::hash::hash_obj_bytes;
use crate::serialize::{DeserializeSized, Serialize};
use crate::test_utils::test_signature;
use smallvec::smallvec;
use std::io::BufReader;

#[test]
fn parse_obj_header() -> KeelResult<()> {
    let header = read_obj_header(BufReader::new(&b"blob 5\0hello"[..]))?;
    assert_eq!(header, KeelObjHeader { obj_type: KeelObjType::Blob, size: 5 });
    Ok(())
}

#[test]
fn commit_round_trips() -> KeelResult<()> {
    let commit = Commit {
        tree: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
        parents: smallvec![
            "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into(),
            "cccccccccccccccccccccccccccccccccccccccc".into(),
        ],
        author: test_signature(100),
        committer: test_signature(200),
        message: "a message\n\nspanning multiple lines\n".to_owned(),
    };
    let bytes = commit.serialize_to_vec()?;
    let parsed = Commit::deserialize_from_slice(&bytes)?;
    assert_eq!(commit, parsed);
    assert_eq!(parsed.date(), 200);
    assert_eq!(parsed.first_parent(), Some("bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into()));
    Ok(())
}

#[test]
fn commit_requires_header_order() {
    // author before tree is bogus
    let bytes = b"author A U Thor <a@example.com> 100 +0000\ntree aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n\nmsg";
    assert!(Commit::deserialize_from_slice(bytes).is_err());
}

#[test]
fn root_commit_parses_without_parents() -> KeelResult<()> {
    let commit = Commit {
        tree: "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".into(),
        parents: smallvec![],
        author: test_signature(1),
        committer: test_signature(1),
        message: String::new(),
    };
    let parsed = Commit::deserialize_from_slice(&commit.serialize_to_vec()?)?;
    assert!(parsed.parents.is_empty());
    Ok(())
}

#[test]
fn tag_round_trips() -> KeelResult<()> {
    let tag = Tag {
        target: "dddddddddddddddddddddddddddddddddddddddd".into(),
        target_type: KeelObjType::Commit,
        name: "v1.0".to_owned(),
        tagger: test_signature(42),
        message: "release\n".to_owned(),
    };
    let parsed = Tag::deserialize_from_slice(&tag.serialize_to_vec()?)?;
    assert_eq!(tag, parsed);
    Ok(())
}

#[test]
fn tree_round_trips_in_disk_order() -> KeelResult<()> {
    let tree = Tree::new(vec![
        TreeEntry {
            mode: FileMode::TREE,
            name: "a".to_owned(),
            oid: "cccccccccccccccccccccccccccccccccccccccc".into(),
        },
        TreeEntry {
            mode: FileMode::REG,
            name: "a.c".to_owned(),
            oid: "eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee".into(),
        },
    ]);
    let bytes = tree.serialize_to_vec()?;
    let parsed = Tree::deserialize_from_slice(&bytes)?;
    assert_eq!(tree, parsed);
    Ok(())
}

#[test]
fn tree_entry_order_treats_directories_with_trailing_slash() {
    // a file `a.c` sorts before a directory `a` because "a/" > "a.c"
    let dir = TreeEntry {
        mode: FileMode::TREE,
        name: "a".to_owned(),
        oid: "cccccccccccccccccccccccccccccccccccccccc".into(),
    };
    let file = TreeEntry {
        mode: FileMode::REG,
        name: "a.c".to_owned(),
        oid: "eeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee".into(),
    };
    assert!(file < dir);

    let tree = Tree::new(vec![dir.clone(), file.clone()]);
    assert_eq!(tree.entries, vec![file, dir]);
    assert!(tree.is_canonical());
}

#[test]
fn file_modes() -> KeelResult<()> {
    assert_eq!("100644".parse::<FileMode>()?, FileMode::REG);
    assert_eq!("100755".parse::<FileMode>()?, FileMode::EXEC);
    assert_eq!("40000".parse::<FileMode>()?, FileMode::TREE);
    assert_eq!("120000".parse::<FileMode>()?, FileMode::LINK);
    assert!("123456".parse::<FileMode>().is_err());
    assert!(!FileMode::REG_0664.is_standard());
    Ok(())
}

#[test]
fn serialize_with_headers_matches_identity() -> KeelResult<()> {
    let blob = Blob::new(b"hello\n".to_vec());
    let with_headers = blob.serialize_with_headers()?;
    assert!(with_headers.starts_with(b"blob 6\0"));
    assert_eq!(
        crate::hash::hash_bytes(&with_headers),
        hash_obj_bytes(KeelObjType::Blob, blob.bytes())
    );
    Ok(())
}

#[quickcheck]
fn blob_round_trips(bytes: Vec<u8>) -> KeelResult<()> {
    let blob = Blob::new(bytes);
    let parsed = Blob::deserialize_from_slice(&blob.serialize_to_vec()?)?;
    assert_eq!(blob, parsed);
    Ok(())
}
