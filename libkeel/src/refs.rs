use crate::error::{KeelError, KeelGenericError, KeelResult};
use crate::lockfile::{Lockfile, LockfileFlags};
use crate::obj::Oid;
use crate::serialize::{Deserialize, Serialize};
use lazy_static::lazy_static;
use regex::Regex;
use std::fmt::{self, Display, Formatter};
use std::io::prelude::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use walkdir::WalkDir;

/// symbolic chains longer than this are assumed to be cyclic
const MAX_SYMREF_DEPTH: usize = 5;

lazy_static! {
    /// what makes a reference name invalid (anything else is valid):
    /// a component starting with `.`, any `..`, special characters,
    /// a trailing `/` or `.lock`, or a leading `/`
    static ref INVALID_REF_REGEX: Regex =
        Regex::new(r#"^/|^\.|/\.|\.\.|//|\*|:|\?|\[|\\|\^|~| |\t|/$|\.lock$|@\{"#).unwrap();
}

pub fn is_valid_name(s: &str) -> bool {
    !s.is_empty() && !INVALID_REF_REGEX.is_match(s)
}

/// non-validated parsed representation of a reference
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum KeelRef {
    /// refers directly to an object
    Direct(Oid),
    /// contains the name of another reference
    Symbolic(SymbolicRef),
}

impl From<Oid> for KeelRef {
    fn from(oid: Oid) -> Self {
        Self::Direct(oid)
    }
}

impl From<SymbolicRef> for KeelRef {
    fn from(sym: SymbolicRef) -> Self {
        Self::Symbolic(sym)
    }
}

impl Display for KeelRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KeelRef::Direct(oid) => write!(f, "{}", oid),
            KeelRef::Symbolic(sym) => write!(f, "{}", sym),
        }
    }
}

impl Serialize for KeelRef {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        match self {
            KeelRef::Direct(oid) => writeln!(writer, "{}", oid)?,
            KeelRef::Symbolic(sym) => writeln!(writer, "ref: {}", sym)?,
        };
        Ok(())
    }
}

impl Deserialize for KeelRef {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        let mut s = String::new();
        reader.read_to_string(&mut s)?;
        s.parse()
    }
}

impl FromStr for KeelRef {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // a valid oid is assumed not to be a refname
        if let Ok(oid) = Oid::from_str(s) {
            return Ok(Self::Direct(oid));
        }
        SymbolicRef::from_str(s).map(Self::Symbolic)
    }
}

impl KeelRef {
    pub fn head() -> Self {
        Self::Symbolic(SymbolicRef::head())
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct(..))
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Self::Symbolic(..))
    }

    pub fn into_direct(self) -> Oid {
        if let Self::Direct(oid) = self { oid } else { panic!("expected direct ref") }
    }
}

// a symbolic ref in a file is of the form `ref: <name>`
const SYMBOLIC_REF_PREFIX: &str = "ref: ";

#[derive(Debug, Hash, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct SymbolicRef {
    name: String,
}

impl SymbolicRef {
    pub const HEAD_NAME: &'static str = "HEAD";

    pub fn head() -> Self {
        Self::new(Self::HEAD_NAME)
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn new_valid(name: impl Into<String>) -> KeelResult<Self> {
        let sym = Self::new(name);
        // only `HEAD` may live outside `refs/`
        ensure!(
            sym.is_head() || (sym.name().starts_with("refs/") && is_valid_name(sym.name())),
            KeelError::BadRef(sym.name().to_owned())
        );
        Ok(sym)
    }

    pub fn branch(name: &str) -> Self {
        Self::new(format!("refs/heads/{}", name))
    }

    pub fn tag(name: &str) -> Self {
        Self::new(format!("refs/tags/{}", name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_head(&self) -> bool {
        self.name() == Self::HEAD_NAME
    }

    /// abbreviated representation with well-known prefixes stripped
    pub fn short(&self) -> &str {
        const PREFIXES: &[&str] = &["refs/heads/", "refs/tags/", "refs/remotes/"];
        for prefix in PREFIXES {
            if let Some(short) = self.name().strip_prefix(prefix) {
                return short;
            }
        }
        self.name()
    }
}

impl Display for SymbolicRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if f.alternate() { write!(f, "{}", self.short()) } else { write!(f, "{}", self.name()) }
    }
}

impl FromStr for SymbolicRef {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let r = s.strip_prefix(SYMBOLIC_REF_PREFIX).unwrap_or(s).trim_end();
        // `@` is an alias for HEAD
        let name = if r == "@" { Self::HEAD_NAME } else { r };
        Ok(Self::new(name))
    }
}

/// the caller's expectation of the current value in a compare-and-swap update
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RefExpectation {
    /// update unconditionally
    Any,
    /// fail unless the ref currently resolves to this oid
    MustBe(Oid),
    /// fail unless the ref does not exist yet
    MustBeAbsent,
}

pub struct KeelRefDb {
    keeldir: PathBuf,
}

impl KeelRefDb {
    pub fn new(keeldir: impl Into<PathBuf>) -> Self {
        Self { keeldir: keeldir.into() }
    }

    fn ref_path(&self, sym: &SymbolicRef) -> PathBuf {
        self.keeldir.join(sym.name())
    }

    pub fn exists(&self, sym: &SymbolicRef) -> bool {
        self.ref_path(sym).is_file()
    }

    /// reads a single ref file without following symbolic targets
    pub fn read(&self, sym: &SymbolicRef) -> KeelResult<KeelRef> {
        let path = self.ref_path(sym);
        if !path.is_file() {
            bail!(KeelError::NonExistentSymRef(sym.name().to_owned()));
        }
        // a concurrent writer commits by rename so a read either sees the old
        // or the new contents; a torn parse is retried once
        match Self::read_inner(&path) {
            Ok(r) => Ok(r),
            Err(..) => Self::read_inner(&path),
        }
    }

    fn read_inner(path: &Path) -> KeelResult<KeelRef> {
        KeelRef::deserialize_unbuffered(std::fs::File::open(path)?)
    }

    /// follows symbolic chains until a direct oid is found;
    /// every hop must stay within the ref namespace
    pub fn resolve(&self, reference: &KeelRef) -> KeelResult<Oid> {
        let mut reference = reference.clone();
        for _ in 0..MAX_SYMREF_DEPTH {
            match reference {
                KeelRef::Direct(oid) => return Ok(oid),
                KeelRef::Symbolic(sym) => {
                    ensure!(
                        sym.is_head() || sym.name().starts_with("refs/"),
                        KeelError::BadRef(sym.name().to_owned())
                    );
                    reference = self.read(&sym)?;
                }
            }
        }
        bail!(KeelError::BadRef(format!("symbolic ref chain exceeds depth {}", MAX_SYMREF_DEPTH)))
    }

    pub fn read_resolved(&self, sym: &SymbolicRef) -> KeelResult<Oid> {
        self.resolve(&KeelRef::Symbolic(sym.clone()))
    }

    /// compare-and-swap update through `<name>.lock`; losing the race to the
    /// lock or failing the expectation refuses the update
    pub fn update(
        &self,
        sym: &SymbolicRef,
        to: Oid,
        expected: RefExpectation,
    ) -> KeelResult<()> {
        self.update_inner(sym, &KeelRef::Direct(to), expected)
    }

    /// writes `ref: <target>` under the same lock protocol
    pub fn create_symref(&self, sym: &SymbolicRef, target: &SymbolicRef) -> KeelResult<()> {
        self.update_inner(sym, &KeelRef::Symbolic(target.clone()), RefExpectation::Any)
    }

    fn update_inner(
        &self,
        sym: &SymbolicRef,
        to: &KeelRef,
        expected: RefExpectation,
    ) -> KeelResult<()> {
        let path = self.ref_path(sym);
        Lockfile::with_mut(&path, LockfileFlags::empty(), |lockfile| {
            let current = match lockfile.file() {
                Some(mut file) => Some(KeelRef::deserialize_unbuffered(&mut file)?),
                None => None,
            };
            match expected {
                RefExpectation::Any => {}
                RefExpectation::MustBe(oid) => {
                    let current = match &current {
                        Some(KeelRef::Direct(oid)) => Some(*oid),
                        Some(KeelRef::Symbolic(target)) => Some(self.read_resolved(target)?),
                        None => None,
                    };
                    ensure!(
                        current == Some(oid),
                        "ref `{}` is at `{}`, expected `{}`",
                        sym,
                        current.map(|oid| oid.to_string()).unwrap_or_else(|| "<absent>".into()),
                        oid
                    );
                }
                RefExpectation::MustBeAbsent => {
                    ensure!(current.is_none(), "a reference `{}` already exists", sym);
                }
            }
            to.serialize(lockfile)
        })
    }

    pub fn delete(&self, sym: &SymbolicRef) -> KeelResult<()> {
        Lockfile::with_mut(&self.ref_path(sym), LockfileFlags::empty(), |_lockfile| Ok(()))?;
        std::fs::remove_file(self.ref_path(sym))?;
        Ok(())
    }

    /// walks the ref hierarchy in sorted name order invoking `f(name, oid)`
    /// per resolvable name; unresolvable refs are skipped with a warning
    pub fn for_each_ref(
        &self,
        mut f: impl FnMut(&SymbolicRef, Oid) -> KeelResult<()>,
    ) -> KeelResult<()> {
        let refs_dir = self.keeldir.join("refs");
        if !refs_dir.exists() {
            return Ok(());
        }

        let mut names = vec![];
        for entry in WalkDir::new(&refs_dir).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .strip_prefix(&self.keeldir)?
                .to_str()
                .ok_or_else(|| anyhow!("non-utf8 ref name"))?
                .to_owned();
            names.push(name);
        }
        names.sort();

        for name in names {
            let sym = SymbolicRef::new(name);
            match self.read_resolved(&sym) {
                Ok(oid) => f(&sym, oid)?,
                Err(err) => warn!("skipping unresolvable ref `{}`: {}", sym, err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
