use crate::error::{KeelError, KeelGenericError, KeelResult, KeelResultExt};
use crate::obj::{KeelObjType, Oid, PartialOid};
use crate::refs::{self, SymbolicRef};
use crate::repo::KeelRepo;
use once_cell::unsync::OnceCell;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

// <rev> ::=
//   | <oid>
//   | <partial-oid>
//   | <refname>
//   | <rev>^<n>?
//   | <rev>~<n>?
//   | <rev>^{<kind>?}
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedRevspec {
    Name(String),
    /// nth parent selector; `^` defaults to 1, `^0` peels to a commit
    Parent(Box<ParsedRevspec>, usize),
    /// `~<n>`: n-fold first-parent ancestor, `~0` is the rev itself
    Ancestor(Box<ParsedRevspec>, usize),
    /// `^{<kind>}`: dereference until the requested kind is reached;
    /// an empty kind just peels tags
    Peel(Box<ParsedRevspec>, Option<KeelObjType>),
}

impl Display for ParsedRevspec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ParsedRevspec::Name(name) => write!(f, "{}", name),
            ParsedRevspec::Parent(rev, 1) => write!(f, "{}^", rev),
            ParsedRevspec::Parent(rev, n) => write!(f, "{}^{}", rev, n),
            ParsedRevspec::Ancestor(rev, n) => write!(f, "{}~{}", rev, n),
            ParsedRevspec::Peel(rev, Some(kind)) => write!(f, "{}^{{{}}}", rev, kind),
            ParsedRevspec::Peel(rev, None) => write!(f, "{}^{{}}", rev),
        }
    }
}

/// a revspec string parsed lazily; parsing needs no repository but resolution
/// does, so the two steps are split
#[derive(Debug)]
pub struct Revspec {
    src: String,
    parsed: OnceCell<ParsedRevspec>,
}

impl Revspec {
    pub fn parse(&self) -> KeelResult<&ParsedRevspec> {
        self.parsed.get_or_try_init(|| RevspecParser::new(&self.src).parse())
    }
}

impl Display for Revspec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.src)
    }
}

impl FromStr for Revspec {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ensure!(!s.is_empty(), "empty revspec");
        Ok(Self { src: s.to_owned(), parsed: Default::default() })
    }
}

const REV_SEPS: &[char] = &['^', '~'];

struct RevspecParser<'a> {
    src: &'a str,
}

impl<'a> RevspecParser<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src }
    }

    // moves src past the next separator and returns the str before it
    fn next(&mut self) -> &str {
        let i = self.src.find(REV_SEPS).unwrap_or(self.src.len());
        let s = &self.src[..i];
        self.src = &self.src[i..];
        s
    }

    fn accept_num(&mut self) -> Option<usize> {
        let digits = self.src.find(|c: char| !c.is_ascii_digit()).unwrap_or(self.src.len());
        if digits == 0 {
            return None;
        }
        let n = self.src[..digits].parse().ok()?;
        self.src = &self.src[digits..];
        Some(n)
    }

    fn parse_peel_kind(&mut self) -> KeelResult<Option<KeelObjType>> {
        debug_assert!(self.src.starts_with('{'));
        let close = self
            .src
            .find('}')
            .ok_or_else(|| anyhow!("unterminated `^{{` in revspec"))?;
        let kind = &self.src[1..close];
        self.src = &self.src[close + 1..];
        if kind.is_empty() { Ok(None) } else { kind.parse().map(Some) }
    }

    pub fn parse(mut self) -> KeelResult<ParsedRevspec> {
        let base = self.next();
        ensure!(!base.is_empty(), "revspec has no base name");
        let mut rev = ParsedRevspec::Name(base.to_owned());

        while !self.src.is_empty() {
            let (c, cs) = self.src.split_at(1);
            self.src = cs;
            match c {
                "^" =>
                    if self.src.starts_with('{') {
                        rev = ParsedRevspec::Peel(Box::new(rev), self.parse_peel_kind()?);
                    } else {
                        let n = self.accept_num().unwrap_or(1);
                        // we do not do more than 9 parents
                        ensure!(n <= 9, "parent selector `^{}` out of range", n);
                        rev = ParsedRevspec::Parent(Box::new(rev), n);
                    },
                "~" => {
                    let n = self.accept_num().unwrap_or(1);
                    rev = ParsedRevspec::Ancestor(Box::new(rev), n);
                }
                _ => bail!("unexpected token `{}` while parsing revspec", c),
            }
        }
        Ok(rev)
    }
}

impl KeelRepo {
    /// resolves a revspec expression to an object id
    pub fn resolve_rev(&self, rev: &Revspec) -> KeelResult<Oid> {
        self.resolve_rev_internal(rev.parse()?)
    }

    pub fn resolve_rev_str(&self, s: &str) -> KeelResult<Oid> {
        self.resolve_rev(&s.parse()?)
    }

    fn resolve_rev_internal(&self, rev: &ParsedRevspec) -> KeelResult<Oid> {
        match rev {
            ParsedRevspec::Name(name) => self.resolve_base_name(name),
            ParsedRevspec::Parent(inner, n) => {
                let oid = self.resolve_rev_internal(inner)?;
                // `^0` peels to the commit itself
                if *n == 0 {
                    return self.peel_to(oid, Some(KeelObjType::Commit));
                }
                let commit_oid = self.peel_to(oid, Some(KeelObjType::Commit))?;
                let node = self.parse_oid(commit_oid)?;
                let graph = self.graph();
                let commit = graph.commit(node)?;
                match commit.parents.get(n - 1) {
                    Some(&parent) => Ok(graph.oid(parent)),
                    None if commit.parents.is_empty() =>
                        bail!("revision `{}` refers to the parent of a root commit", rev),
                    None => bail!(
                        "commit `{}` does not have parent {} (it has {} parents)",
                        commit_oid,
                        n,
                        commit.parents.len()
                    ),
                }
            }
            ParsedRevspec::Ancestor(inner, n) => {
                let mut oid = self.resolve_rev_internal(inner)?;
                for _ in 0..*n {
                    let commit_oid = self.peel_to(oid, Some(KeelObjType::Commit))?;
                    let node = self.parse_oid(commit_oid)?;
                    let graph = self.graph();
                    let commit = graph.commit(node)?;
                    match commit.parents.first() {
                        Some(&parent) => oid = graph.oid(parent),
                        None => bail!("revision `{}` walks past a root commit", rev),
                    }
                }
                Ok(oid)
            }
            ParsedRevspec::Peel(inner, kind) => {
                let oid = self.resolve_rev_internal(inner)?;
                self.peel_to(oid, *kind)
            }
        }
    }

    /// dereferences `oid` until `kind` is reached: tags dereference to their
    /// target, commits to their tree. `None` just peels tags.
    pub fn peel_to(&self, oid: Oid, kind: Option<KeelObjType>) -> KeelResult<Oid> {
        use crate::graph::ParsedNode;

        let mut node = self.parse_oid(oid)?;
        loop {
            let next = {
                let graph = self.graph();
                let obj_type = graph
                    .obj_type(node)
                    .ok_or_else(|| anyhow!(KeelError::ObjectNotFound(graph.oid(node).into())))?;
                if kind == Some(obj_type) {
                    return Ok(graph.oid(node));
                }
                match (graph.parsed(node), kind) {
                    (Some(ParsedNode::Tag { target, .. }), _) => *target,
                    // an empty peel stops at the first non-tag
                    (Some(..), None) => return Ok(graph.oid(node)),
                    (Some(ParsedNode::Commit(commit)), Some(..)) => commit.tree,
                    (_, Some(kind)) => bail!(
                        "`{}` dereferences to {} type, expected {} type",
                        oid,
                        obj_type,
                        kind
                    ),
                    (_, None) => bail!(KeelError::ObjectNotFound(graph.oid(node).into())),
                }
            };
            self.parse_node(next)?;
            node = next;
        }
    }

    /// base-name resolution, attempted in order: 40-hex literal, abbreviated
    /// hex, then ref lookup through the standard prefixes
    fn resolve_base_name(&self, name: &str) -> KeelResult<Oid> {
        if name.len() == 40 {
            if let Ok(oid) = Oid::from_str(name) {
                return Ok(oid);
            }
        }

        if let Ok(prefix) = PartialOid::from_str(name) {
            match self.expand_prefix(prefix) {
                Ok(oid) => return Ok(oid),
                // ambiguous prefixes are a hard error, anything else falls
                // through to ref lookup
                Err(err) if !err.is_not_found_err() => return Err(err),
                Err(..) => {}
            }
        }

        if name == SymbolicRef::HEAD_NAME || name == "@" {
            let sym = SymbolicRef::head();
            if self.refdb()?.exists(&sym) {
                return self.refdb()?.read_resolved(&sym);
            }
        } else if refs::is_valid_name(name) {
            // only unambiguous ref paths are accepted
            const PREFIXES: &[&str] = &["", "refs/", "refs/tags/", "refs/heads/"];
            for prefix in PREFIXES {
                let sym = SymbolicRef::new(format!("{}{}", prefix, name));
                if self.refdb()?.exists(&sym) {
                    return self.refdb()?.read_resolved(&sym);
                }
            }
        }

        bail!("unknown revision `{}`", name)
    }
}

#[cfg(test)]
mod tests;
