mod blob;
mod commit;
mod obj_id;
mod tag;
mod tree;

pub use blob::*;
pub use commit::*;
pub use obj_id::*;
pub use tag::*;
pub use tree::*;

use crate::error::{KeelGenericError, KeelResult};
use crate::io::BufReadExt;
use crate::serialize::{DeserializeSized, Serialize};
use num_enum::TryFromPrimitive;
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{BufRead, Write};
use std::str::FromStr;

/// a fully inflated object as read from the store, before typed parsing
#[derive(PartialEq, Clone)]
pub struct KeelRawObj {
    pub obj_type: KeelObjType,
    pub bytes: Vec<u8>,
}

impl Debug for KeelRawObj {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "KeelRawObj({:?}, {} bytes)", self.obj_type, self.bytes.len())
    }
}

#[derive(Copy, PartialEq, Eq, Clone, TryFromPrimitive, PartialOrd, Ord, Hash)]
#[repr(u32)]
// the ordering of variants is significant as it implements `Ord`;
// trees must be ordered after the file variants
pub enum FileMode {
    REG      = 0o100644,
    // group-writable regular files are nonstandard but accepted when lenient
    REG_0664 = 0o100664,
    EXEC     = 0o100755,
    LINK     = 0o120000,
    TREE     = 0o40000,
}

impl Display for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let n = self.as_u32();
        if f.alternate() { write!(f, "{:o}", n) } else { write!(f, "{:06o}", n) }
    }
}

impl Debug for FileMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl FileMode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn is_link(self) -> bool {
        matches!(self, FileMode::LINK)
    }

    pub fn is_file(self) -> bool {
        matches!(self, FileMode::EXEC | FileMode::REG | FileMode::REG_0664)
    }

    pub fn is_blob(self) -> bool {
        !self.is_tree()
    }

    pub fn is_tree(self) -> bool {
        matches!(self, FileMode::TREE)
    }

    /// `true` for the modes allowed without leniency
    pub fn is_standard(self) -> bool {
        !matches!(self, FileMode::REG_0664)
    }

    pub fn try_new(u: u32) -> KeelResult<Self> {
        Self::try_from(u).map_err(|_| anyhow!("invalid filemode `{:06o}`", u))
    }

    pub fn infer_obj_type(self) -> KeelObjType {
        match self {
            Self::TREE => KeelObjType::Tree,
            _ => KeelObjType::Blob,
        }
    }
}

impl FromStr for FileMode {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_new(u32::from_str_radix(s, 8)?)
    }
}

#[derive(PartialEq, Debug)]
pub struct KeelObjHeader {
    pub obj_type: KeelObjType,
    pub size: u64,
}

/// a parsed object of any kind
#[derive(PartialEq, Debug)]
pub enum KeelObjKind {
    Blob(Box<Blob>),
    Commit(Box<Commit>),
    Tree(Box<Tree>),
    Tag(Box<Tag>),
}

impl KeelObjKind {
    pub fn obj_type(&self) -> KeelObjType {
        match self {
            KeelObjKind::Blob(_) => KeelObjType::Blob,
            KeelObjKind::Commit(_) => KeelObjType::Commit,
            KeelObjKind::Tree(_) => KeelObjType::Tree,
            KeelObjKind::Tag(_) => KeelObjType::Tag,
        }
    }

    pub fn deserialize(raw: &KeelRawObj) -> KeelResult<Self> {
        let bytes = raw.bytes.as_slice();
        match raw.obj_type {
            KeelObjType::Commit =>
                Commit::deserialize_from_slice(bytes).map(Box::new).map(Self::Commit),
            KeelObjType::Tree => Tree::deserialize_from_slice(bytes).map(Box::new).map(Self::Tree),
            KeelObjType::Blob => Blob::deserialize_from_slice(bytes).map(Box::new).map(Self::Blob),
            KeelObjType::Tag => Tag::deserialize_from_slice(bytes).map(Box::new).map(Self::Tag),
        }
    }

    pub fn into_commit(self) -> KeelResult<Commit> {
        match self {
            Self::Commit(commit) => Ok(*commit),
            _ => Err(anyhow!("expected commit, found `{}`", self.obj_type())),
        }
    }

    pub fn into_tree(self) -> KeelResult<Tree> {
        match self {
            Self::Tree(tree) => Ok(*tree),
            _ => Err(anyhow!("expected tree, found `{}`", self.obj_type())),
        }
    }

    pub fn into_blob(self) -> KeelResult<Blob> {
        match self {
            Self::Blob(blob) => Ok(*blob),
            _ => Err(anyhow!("expected blob, found `{}`", self.obj_type())),
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Self::Commit(..))
    }

    pub fn is_treeish(&self) -> bool {
        matches!(self, Self::Tree(..) | Self::Commit(..))
    }
}

impl Serialize for KeelObjKind {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        match self {
            KeelObjKind::Blob(blob) => blob.serialize(writer),
            KeelObjKind::Commit(commit) => commit.serialize(writer),
            KeelObjKind::Tree(tree) => tree.serialize(writer),
            KeelObjKind::Tag(tag) => tag.serialize(writer),
        }
    }
}

pub trait WritableObject: Serialize {
    fn obj_ty(&self) -> KeelObjType;

    /// serialize objects with the header `<type> <size>\0`
    fn serialize_with_headers(&self) -> KeelResult<Vec<u8>> {
        let mut buf = vec![];
        write!(buf, "{} ", self.obj_ty())?;
        let mut bytes = vec![];
        self.serialize(&mut bytes)?;
        write!(buf, "{}\0", bytes.len())?;
        buf.extend_from_slice(&bytes);
        Ok(buf)
    }
}

impl WritableObject for KeelObjKind {
    fn obj_ty(&self) -> KeelObjType {
        self.obj_type()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum KeelObjType {
    Commit = 1,
    Tree   = 2,
    Blob   = 3,
    Tag    = 4,
}

impl Display for KeelObjType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeelObjType::Commit => "commit",
            KeelObjType::Tree => "tree",
            KeelObjType::Tag => "tag",
            KeelObjType::Blob => "blob",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for KeelObjType {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(KeelObjType::Commit),
            "tree" => Ok(KeelObjType::Tree),
            "tag" => Ok(KeelObjType::Tag),
            "blob" => Ok(KeelObjType::Blob),
            _ => bail!("unknown object type `{}`", s),
        }
    }
}

pub(crate) fn read_obj_header(mut reader: impl BufRead) -> KeelResult<KeelObjHeader> {
    let obj_type = reader.read_ascii_str(0x20)?;
    let size = reader.read_ascii_num(0x00)? as u64;
    Ok(KeelObjHeader { obj_type, size })
}

/// yields the next newline-terminated header line of `buf` starting at `*pos`,
/// advancing `*pos` past it; the returned line excludes the newline
pub(crate) fn next_header_line<'a>(buf: &'a str, pos: &mut usize) -> Option<&'a str> {
    if *pos >= buf.len() {
        return None;
    }
    let rest = &buf[*pos..];
    let end = rest.find('\n').map(|i| i + 1).unwrap_or(rest.len());
    let line = &rest[..end];
    *pos += end;
    Some(line.strip_suffix('\n').unwrap_or(line))
}

#[cfg(test)]
mod tests;
