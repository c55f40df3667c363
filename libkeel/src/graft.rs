use crate::error::KeelResult;
use crate::obj::Oid;
use smallvec::SmallVec;
use std::path::Path;

/// synthetic parent override for a single commit, read from the grafts file
/// where each line is `child [parent...]` in hex (`#` lines are comments)
#[derive(Debug, Clone, PartialEq)]
pub struct CommitGraft {
    pub child: Oid,
    pub parents: SmallVec<[Oid; 2]>,
}

/// grafts sorted by child oid for binary search; an absent grafts file loads
/// as an empty list (loaded-vs-absent is not distinguished after load)
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Grafts {
    grafts: Vec<CommitGraft>,
}

impl Grafts {
    pub fn load(path: &Path) -> KeelResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(s: &str) -> KeelResult<Self> {
        let mut grafts = vec![];
        for line in s.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            // the format is just `Commit Parent1 Parent2 ...`
            if (line.len() + 1) % 41 != 0 {
                warn!("bad graft data: {}", line);
                continue;
            }
            let mut oids = line.split(' ').map(str::parse::<Oid>);
            let child = match oids.next() {
                Some(Ok(child)) => child,
                _ => {
                    warn!("bad graft data: {}", line);
                    continue;
                }
            };
            let parents = match oids.collect::<Result<SmallVec<_>, _>>() {
                Ok(parents) => parents,
                Err(..) => {
                    warn!("bad graft data: {}", line);
                    continue;
                }
            };
            grafts.push(CommitGraft { child, parents });
        }

        grafts.sort_by_key(|graft| graft.child);
        let before = grafts.len();
        grafts.dedup_by_key(|graft| graft.child);
        if grafts.len() != before {
            warn!("duplicate graft data dropped");
        }
        Ok(Self { grafts })
    }

    pub fn lookup(&self, child: Oid) -> Option<&CommitGraft> {
        self.grafts
            .binary_search_by_key(&child, |graft| graft.child)
            .ok()
            .map(|idx| &self.grafts[idx])
    }

    pub fn is_empty(&self) -> bool {
        self.grafts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.grafts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelResult;

    #[test]
    fn parse_grafts() -> KeelResult<()> {
        let a = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let b = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let c = "cccccccccccccccccccccccccccccccccccccccc";
        let grafts = Grafts::parse(&format!("# comment\n{} {} {}\n{}\n", a, b, c, b))?;
        assert_eq!(grafts.len(), 2);

        let graft = grafts.lookup(a.parse()?).unwrap();
        assert_eq!(graft.parents.as_slice(), [b.parse()?, c.parse()?]);

        // a graft with no parents turns the commit into a root
        let graft = grafts.lookup(b.parse()?).unwrap();
        assert!(graft.parents.is_empty());

        assert!(grafts.lookup(c.parse()?).is_none());
        Ok(())
    }

    #[test]
    fn malformed_graft_lines_are_skipped() -> KeelResult<()> {
        let grafts = Grafts::parse("zzz\nshort aaaa\n")?;
        assert!(grafts.is_empty());
        Ok(())
    }
}
