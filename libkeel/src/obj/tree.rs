use super::FileMode;
use crate::error::KeelResult;
use crate::io::BufReadExt;
use crate::obj::{KeelObjType, Oid, WritableObject};
use crate::serialize::{Deserialize, DeserializeSized, Serialize};
use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::io::prelude::*;

/// ordered list of `(mode, name, child-id)` entries
///
/// entries are kept in disk order; whether that order is canonical is a
/// property the integrity checker verifies rather than something the parser
/// silently repairs
#[derive(PartialEq, Debug, Default, Clone)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(mut entries: Vec<TreeEntry>) -> Self {
        entries.sort();
        Self { entries }
    }

    pub fn find_entry(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// `true` when entries are unique and sorted per the directory-slash rule
    pub fn is_canonical(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].cmp(&w[1]) == Ordering::Less)
    }
}

impl Display for Tree {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "{}", entry)?;
        }
        Ok(())
    }
}

impl Serialize for Tree {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        for entry in &self.entries {
            entry.serialize(writer)?;
        }
        Ok(())
    }
}

impl DeserializeSized for Tree {
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> KeelResult<Self> {
        let r = &mut r.take(size);

        let mut tree = Self::default();
        while !r.is_at_eof()? {
            tree.entries.push(TreeEntry::deserialize(r)?);
        }
        Ok(tree)
    }
}

impl WritableObject for Tree {
    fn obj_ty(&self) -> KeelObjType {
        KeelObjType::Tree
    }
}

#[derive(PartialEq, Debug, Clone, Eq)]
pub struct TreeEntry {
    pub mode: FileMode,
    pub name: String,
    pub oid: Oid,
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    // the canonical order sorts by name with directory entries compared as if
    // they had a trailing slash, so `a.c` < `a/` even though "a" < "a.c"
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.name.as_bytes();
        let b = other.name.as_bytes();
        let len = a.len().min(b.len());
        match a[..len].cmp(&b[..len]) {
            Ordering::Equal => {}
            ord => return ord,
        }
        let c1 = a.get(len).copied().or_else(|| self.mode.is_tree().then_some(b'/'));
        let c2 = b.get(len).copied().or_else(|| other.mode.is_tree().then_some(b'/'));
        c1.cmp(&c2)
    }
}

impl Display for TreeEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\t{}", self.mode, self.mode.infer_obj_type(), self.oid, self.name)
    }
}

impl Deserialize for TreeEntry {
    fn deserialize(r: &mut impl BufRead) -> KeelResult<Self> {
        let mode: FileMode = r.read_ascii_str(0x20)?;
        let name_bytes = r.read_null_terminated_bytes()?;
        let name = String::from_utf8(name_bytes)?;

        let mut oid_bytes = [0; 20];
        r.read_exact(&mut oid_bytes)?;
        let oid = Oid::new(oid_bytes);
        Ok(Self { mode, name, oid })
    }
}

impl Serialize for TreeEntry {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        // the alternate display impl avoids the extra leading 0
        write!(writer, "{:#}", self.mode)?;
        writer.write_all(b" ")?;
        writer.write_all(self.name.as_bytes())?;
        writer.write_all(b"\0")?;
        writer.write_all(self.oid.as_ref())?;
        Ok(())
    }
}
