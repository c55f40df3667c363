use crate::error::KeelResult;
use crate::obj::{self, KeelObjType, Oid, WritableObject};
use crate::serialize::{DeserializeSized, Serialize};
use crate::signature::KeelSignature;
use smallvec::SmallVec;
use std::fmt::{self, Display, Formatter};
use std::io::{prelude::*, BufRead};

#[derive(PartialEq, Clone, Debug)]
pub struct Commit {
    pub tree: Oid,
    /// parent order is significant
    pub parents: SmallVec<[Oid; 2]>,
    pub author: KeelSignature,
    pub committer: KeelSignature,
    pub message: String,
}

impl Commit {
    /// committer date in epoch seconds, the ordering key for date-sorted walks
    pub fn date(&self) -> i64 {
        self.committer.time.epoch_secs()
    }

    pub fn first_parent(&self) -> Option<Oid> {
        self.parents.first().copied()
    }
}

impl Display for Commit {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf = vec![];
        self.serialize(&mut buf).map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&buf))
    }
}

impl Serialize for Commit {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        writeln!(writer, "tree {}", self.tree)?;
        for parent in &self.parents {
            writeln!(writer, "parent {}", parent)?;
        }
        writeln!(writer, "author {}", self.author)?;
        writeln!(writer, "committer {}", self.committer)?;
        writeln!(writer)?;
        write!(writer, "{}", self.message)?;
        Ok(())
    }
}

impl DeserializeSized for Commit {
    // the header order `tree`/`parent*`/`author`/`committer`/blank/message is
    // fixed, anything else is a corrupt commit
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> KeelResult<Self> {
        let mut buf = String::new();
        r.take(size).read_to_string(&mut buf)?;
        let mut pos = 0;

        let tree_line = obj::next_header_line(&buf, &mut pos)
            .ok_or_else(|| anyhow!("empty commit object"))?;
        let tree = tree_line
            .strip_prefix("tree ")
            .ok_or_else(|| anyhow!("bogus commit object, expected `tree` line"))?
            .parse()?;

        let mut parents = SmallVec::new();
        let mut line = obj::next_header_line(&buf, &mut pos)
            .ok_or_else(|| anyhow!("truncated commit object after tree line"))?;
        while let Some(parent) = line.strip_prefix("parent ") {
            parents.push(parent.parse()?);
            line = obj::next_header_line(&buf, &mut pos)
                .ok_or_else(|| anyhow!("truncated commit object in parent list"))?;
        }

        let author = line
            .strip_prefix("author ")
            .ok_or_else(|| anyhow!("bogus commit object, expected `author` line"))?
            .parse()?;
        let committer = obj::next_header_line(&buf, &mut pos)
            .and_then(|line| line.strip_prefix("committer "))
            .ok_or_else(|| anyhow!("bogus commit object, expected `committer` line"))?
            .parse()?;

        // blank separator, then everything remaining is the message
        let message = match obj::next_header_line(&buf, &mut pos) {
            Some("") => buf[pos..].to_owned(),
            Some(line) => bail!("expected blank line before commit message, found `{}`", line),
            None => String::new(),
        };

        Ok(Self { tree, parents, author, committer, message })
    }
}

impl WritableObject for Commit {
    fn obj_ty(&self) -> KeelObjType {
        KeelObjType::Commit
    }
}
