use crate::error::KeelResult;
use crate::graft::Grafts;
use crate::obj::{KeelObjKind, KeelObjType, Oid, TreeEntry};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};

/// index of a node in the graph arena
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// transient marks used by traversals and the negotiation state machines
    pub struct NodeFlags: u32 {
        /// the peer has this object (and everything reachable from it)
        const THEY_HAVE = 1 << 0;
        /// advertised by us during ref advertisement
        const OUR_REF   = 1 << 1;
        /// requested via a `want` line
        const WANTED    = 1 << 2;
        /// reachable from the root set
        const REACHABLE = 1 << 3;
        /// referenced by some parsed object
        const USED      = 1 << 4;
        /// generic traversal mark
        const SEEN      = 1 << 5;
    }
}

/// an outbound reference with the kind the referent is expected to have
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct NodeRef {
    pub node: NodeId,
    pub expected: KeelObjType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommit {
    pub tree: NodeId,
    /// parent order is significant; grafts may have replaced the on-disk list
    pub parents: SmallVec<[NodeId; 2]>,
    /// committer date in epoch seconds
    pub date: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedNode {
    Blob { size: u64 },
    Tree { entries: Vec<TreeEntry> },
    Commit(ParsedCommit),
    Tag { target: NodeId, target_type: KeelObjType, name: String },
}

impl ParsedNode {
    pub fn obj_type(&self) -> KeelObjType {
        match self {
            ParsedNode::Blob { .. } => KeelObjType::Blob,
            ParsedNode::Tree { .. } => KeelObjType::Tree,
            ParsedNode::Commit(..) => KeelObjType::Commit,
            ParsedNode::Tag { .. } => KeelObjType::Tag,
        }
    }
}

pub struct Node {
    oid: Oid,
    flags: NodeFlags,
    parsed: Option<ParsedNode>,
    /// outbound references, populated at parse time when tracking is enabled
    refs: Vec<NodeRef>,
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("oid", &self.oid)
            .field("flags", &self.flags)
            .field("parsed", &self.parsed.is_some())
            .finish()
    }
}

/// the process-wide node table: one node per identity ever looked up, interned
/// through an index kept sorted by oid for binary search. nodes are never
/// evicted.
pub struct ObjGraph {
    nodes: Vec<Node>,
    index: Vec<(Oid, NodeId)>,
    track_refs: bool,
}

impl ObjGraph {
    pub fn new(track_refs: bool) -> Self {
        Self { nodes: vec![], index: vec![], track_refs }
    }

    pub fn track_refs(&self) -> bool {
        self.track_refs
    }

    /// returns the node for `oid`, creating a typeless placeholder if absent
    pub fn lookup(&mut self, oid: Oid) -> NodeId {
        match self.index.binary_search_by_key(&oid, |&(oid, _)| oid) {
            Ok(pos) => self.index[pos].1,
            Err(pos) => {
                let node = NodeId(self.nodes.len() as u32);
                self.nodes.push(Node { oid, flags: NodeFlags::empty(), parsed: None, refs: vec![] });
                self.index.insert(pos, (oid, node));
                node
            }
        }
    }

    pub fn try_lookup(&self, oid: Oid) -> Option<NodeId> {
        self.index.binary_search_by_key(&oid, |&(oid, _)| oid).ok().map(|pos| self.index[pos].1)
    }

    /// all interned nodes in oid order
    pub fn sorted_nodes(&self) -> Vec<NodeId> {
        self.index.iter().map(|&(_, node)| node).collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn oid(&self, node: NodeId) -> Oid {
        self.nodes[node.index()].oid
    }

    #[inline]
    pub fn is_parsed(&self, node: NodeId) -> bool {
        self.nodes[node.index()].parsed.is_some()
    }

    pub fn parsed(&self, node: NodeId) -> Option<&ParsedNode> {
        self.nodes[node.index()].parsed.as_ref()
    }

    pub fn obj_type(&self, node: NodeId) -> Option<KeelObjType> {
        self.parsed(node).map(ParsedNode::obj_type)
    }

    pub fn commit(&self, node: NodeId) -> KeelResult<&ParsedCommit> {
        match self.parsed(node) {
            Some(ParsedNode::Commit(commit)) => Ok(commit),
            Some(parsed) =>
                bail!("object `{}` is a {}, not a commit", self.oid(node), parsed.obj_type()),
            None => bail!("object `{}` has not been parsed", self.oid(node)),
        }
    }

    pub fn node_refs(&self, node: NodeId) -> &[NodeRef] {
        &self.nodes[node.index()].refs
    }

    #[inline]
    pub fn flags(&self, node: NodeId) -> NodeFlags {
        self.nodes[node.index()].flags
    }

    #[inline]
    pub fn insert_flags(&mut self, node: NodeId, flags: NodeFlags) {
        self.nodes[node.index()].flags.insert(flags)
    }

    #[inline]
    pub fn remove_flags(&mut self, node: NodeId, flags: NodeFlags) {
        self.nodes[node.index()].flags.remove(flags)
    }

    /// sets `flags`, returning whether they were already all set
    pub fn test_and_set(&mut self, node: NodeId, flags: NodeFlags) -> bool {
        let node_flags = &mut self.nodes[node.index()].flags;
        let was_set = node_flags.contains(flags);
        node_flags.insert(flags);
        was_set
    }

    /// clears `flags` on every node
    pub fn clear_flags(&mut self, flags: NodeFlags) {
        for node in &mut self.nodes {
            node.flags.remove(flags);
        }
    }

    /// fills in the kind-specific fields of `node` from a parsed object,
    /// interning children. idempotent.
    pub fn parse_raw(&mut self, node: NodeId, obj: &KeelObjKind, grafts: &Grafts) -> KeelResult<()> {
        if self.is_parsed(node) {
            return Ok(());
        }

        let mut refs = vec![];
        let parsed = match obj {
            KeelObjKind::Blob(blob) => ParsedNode::Blob { size: blob.len() as u64 },
            KeelObjKind::Tree(tree) => {
                for entry in &tree.entries {
                    let child = self.lookup(entry.oid);
                    refs.push(NodeRef { node: child, expected: entry.mode.infer_obj_type() });
                }
                ParsedNode::Tree { entries: tree.entries.clone() }
            }
            KeelObjKind::Commit(commit) => {
                let tree = self.lookup(commit.tree);
                refs.push(NodeRef { node: tree, expected: KeelObjType::Tree });

                // when a graft matches, the on-disk parents are ignored
                let parent_oids: SmallVec<[Oid; 2]> =
                    match grafts.lookup(self.oid(node)) {
                        Some(graft) => graft.parents.clone(),
                        None => commit.parents.clone(),
                    };
                let parents = parent_oids
                    .into_iter()
                    .map(|oid| {
                        let parent = self.lookup(oid);
                        refs.push(NodeRef { node: parent, expected: KeelObjType::Commit });
                        parent
                    })
                    .collect();

                ParsedNode::Commit(ParsedCommit { tree, parents, date: commit.date() })
            }
            KeelObjKind::Tag(tag) => {
                let target = self.lookup(tag.target);
                refs.push(NodeRef { node: target, expected: tag.target_type });
                ParsedNode::Tag {
                    target,
                    target_type: tag.target_type,
                    name: tag.name.clone(),
                }
            }
        };

        if self.track_refs {
            for &NodeRef { node: referent, .. } in &refs {
                self.insert_flags(referent, NodeFlags::USED);
            }
            self.nodes[node.index()].refs = refs;
        }
        self.nodes[node.index()].parsed = Some(parsed);
        Ok(())
    }

    /// depth-first marking of `root` and everything reachable through
    /// outbound references
    pub fn mark_reachable(&mut self, root: NodeId, mask: NodeFlags) -> KeelResult<()> {
        ensure!(self.track_refs, "cannot do reachability with reference tracking disabled");
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            // if we've been here already, don't bother
            if self.test_and_set(node, mask) {
                continue;
            }
            stack.extend(self.nodes[node.index()].refs.iter().map(|r| r.node));
        }
        Ok(())
    }

    /// stable ordering of a commit list such that every commit appears before
    /// any of its ancestors present in the list.
    ///
    /// Kahn's algorithm: in-degree of a node is the number of its children in
    /// the subset; the queue is seeded with the zero-in-degree commits in
    /// input order and ties are broken by input order.
    pub fn topological_order(&self, input: &[NodeId]) -> KeelResult<Vec<NodeId>> {
        let mut indegrees: FxHashMap<NodeId, u32> =
            input.iter().map(|&node| (node, 0)).collect();

        for &node in input {
            for &parent in &self.commit(node)?.parents {
                if let Some(indegree) = indegrees.get_mut(&parent) {
                    *indegree += 1;
                }
            }
        }

        let mut queue: VecDeque<NodeId> =
            input.iter().copied().filter(|node| indegrees[node] == 0).collect();

        let mut sorted = Vec::with_capacity(input.len());
        while let Some(node) = queue.pop_front() {
            sorted.push(node);
            for &parent in &self.commit(node)?.parents {
                if let Some(indegree) = indegrees.get_mut(&parent) {
                    // parents are emitted only once all their subset children
                    // have been emitted
                    *indegree -= 1;
                    if *indegree == 0 {
                        queue.push_back(parent);
                    }
                }
            }
        }

        // a residual means a cycle, which well-formed commit graphs cannot have
        ensure_eq!(
            sorted.len(),
            input.len(),
            "cycle detected while topologically sorting commits"
        );
        Ok(sorted)
    }

    pub fn commit_date(&self, node: NodeId) -> KeelResult<i64> {
        Ok(self.commit(node)?.date)
    }

    /// inserts a commit into a date-descending list before the first entry
    /// older than it (stable for equal dates)
    pub fn insert_by_date(&self, list: &mut Vec<NodeId>, node: NodeId) -> KeelResult<()> {
        let date = self.commit_date(node)?;
        let mut pos = list.len();
        for (i, &other) in list.iter().enumerate() {
            if self.commit_date(other)? < date {
                pos = i;
                break;
            }
        }
        list.insert(pos, node);
        Ok(())
    }

    /// insertion sort by committer date descending, stable on ties
    pub fn sort_by_date(&self, list: &mut Vec<NodeId>) -> KeelResult<()> {
        let input = std::mem::take(list);
        for node in input {
            self.insert_by_date(list, node)?;
        }
        Ok(())
    }
}
