use crate::error::{KeelError, KeelResult};
use crate::graph::{NodeFlags, NodeId, ParsedNode};
use crate::obj::{KeelRawObj, Oid};
use crate::pack;
use crate::protocol::{strip_line, KeelProtocolRead, KeelProtocolWrite};
use crate::repo::KeelRepo;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// cap on the number of distinct `have` ids recorded per negotiation
pub const MAX_HAS: usize = 256;
/// the capability list advertised on the first ref frame
const CAPABILITIES: &str = "multi_ack";

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadPackOpts {
    /// bounds how long each framing read may block; `None` waits forever
    pub timeout: Option<Duration>,
}

/// the server side of the fetch/upload negotiation: advertises refs, receives
/// wants, negotiates the common set over `have`/`ACK`/`NAK`, and finally
/// streams a pack covering the closure of WANTED minus the closure of THEY_HAVE
pub struct UploadPack<R, W> {
    repo: KeelRepo,
    reader: R,
    writer: W,
    opts: UploadPackOpts,
    multi_ack: bool,
    /// distinct haves recorded, capped at [`MAX_HAS`]
    haves: Vec<NodeId>,
    wants: Vec<NodeId>,
}

impl<R, W> UploadPack<R, W>
where
    R: KeelProtocolRead,
    W: KeelProtocolWrite,
{
    pub fn new(repo: KeelRepo, reader: R, writer: W, opts: UploadPackOpts) -> Self {
        Self { repo, reader, writer, opts, multi_ack: false, haves: vec![], wants: vec![] }
    }

    pub async fn run(mut self) -> KeelResult<()> {
        self.advertise_refs().await?;
        if self.receive_wants().await? == 0 {
            return Ok(());
        }
        self.negotiate().await?;
        self.send_pack().await
    }

    async fn recv(&mut self) -> KeelResult<Vec<u8>> {
        // the connection is simply dropped on expiry
        self.reader.recv_packet_timeout(self.opts.timeout).await
    }

    /// one frame `<oid> <refname>` per ref, HEAD first; the first frame
    /// carries the capability list after a NUL. tag refs are advertised again
    /// peeled as `<refname>^{}`.
    async fn advertise_refs(&mut self) -> KeelResult<()> {
        let mut advertised = vec![];
        if let Ok(head) = self.repo.resolve_head() {
            advertised.push(("HEAD".to_owned(), head));
        }
        self.repo.for_each_ref(|sym, oid| {
            advertised.push((sym.name().to_owned(), oid));
            Ok(())
        })?;

        let mut first = true;
        for (name, oid) in advertised {
            let line = if first {
                format!("{} {}\0{}\n", oid, name, CAPABILITIES)
            } else {
                format!("{} {}\n", oid, name)
            };
            first = false;
            self.writer.write_packet(line.as_bytes()).await?;

            let node = self.repo.parse_oid(oid)?;
            self.repo.graph_mut().insert_flags(node, NodeFlags::OUR_REF);

            // a tag ref also advertises its peeled target
            let is_tag =
                matches!(self.repo.graph().parsed(node), Some(ParsedNode::Tag { .. }));
            if is_tag {
                let peeled = self.repo.peel_to(oid, None)?;
                let peeled_node = self.repo.parse_oid(peeled)?;
                self.repo.graph_mut().insert_flags(peeled_node, NodeFlags::OUR_REF);
                self.writer
                    .write_packet(format!("{} {}^{{}}\n", peeled, name).as_bytes())
                    .await?;
            }
        }
        self.writer.write_flush_packet().await?;
        Ok(())
    }

    /// reads `want` frames until the flush; ids that were not advertised are
    /// rejected. returns the number of distinct wants.
    async fn receive_wants(&mut self) -> KeelResult<usize> {
        loop {
            let line = self.recv().await?;
            if line.is_empty() {
                return Ok(self.wants.len());
            }
            let line = strip_line(&line);
            let line = std::str::from_utf8(line)
                .map_err(|_| anyhow!(KeelError::ProtocolError("non-utf8 want line".into())))?;

            let rest = line.strip_prefix("want ").ok_or_else(|| {
                anyhow!(KeelError::ProtocolError(format!(
                    "expected to get sha, not `{}`",
                    line
                )))
            })?;
            let oid = Oid::from_str(rest.get(..40).unwrap_or(rest)).map_err(|_| {
                anyhow!(KeelError::ProtocolError(format!("expected to get sha, not `{}`", line)))
            })?;

            // any frame naming the capability in its tail enables it
            if rest[40.min(rest.len())..].contains("multi_ack") {
                self.multi_ack = true;
            }

            // the peer must choose among what we advertised
            let node = {
                let graph = self.repo.graph();
                graph
                    .try_lookup(oid)
                    .filter(|&node| graph.flags(node).contains(NodeFlags::OUR_REF))
            }
            .ok_or_else(|| anyhow!(KeelError::ProtocolError(format!("not our ref {}", oid))))?;

            if !self.repo.graph_mut().test_and_set(node, NodeFlags::WANTED) {
                self.wants.push(node);
            }
        }
    }

    /// the ACK/NAK exchange over `have` lines, terminated by `done`
    async fn negotiate(&mut self) -> KeelResult<()> {
        let mut last_common = Oid::UNKNOWN;
        loop {
            let line = self.recv().await?;
            if line.is_empty() {
                // flush: NAK while nothing is common yet, and on every flush
                // under multi_ack
                if self.haves.is_empty() || self.multi_ack {
                    self.writer.write_packet(b"NAK\n").await?;
                }
                continue;
            }
            let line = strip_line(&line);
            let line = std::str::from_utf8(line)
                .map_err(|_| anyhow!(KeelError::ProtocolError("non-utf8 line".into())))?;

            if let Some(hex) = line.strip_prefix("have ") {
                let oid = Oid::from_str(hex).map_err(|_| {
                    anyhow!(KeelError::ProtocolError(format!(
                        "expected SHA1 object, got `{}`",
                        hex
                    )))
                })?;
                if self.got_oid(oid)? && (self.multi_ack || self.haves.len() == 1) {
                    if self.haves.len() >= MAX_HAS {
                        self.multi_ack = false;
                    }
                    let ack = if self.multi_ack {
                        last_common = oid;
                        format!("ACK {} continue\n", oid)
                    } else {
                        format!("ACK {}\n", oid)
                    };
                    self.writer.write_packet(ack.as_bytes()).await?;
                }
                continue;
            }

            if line == "done" {
                if !self.haves.is_empty() {
                    if self.multi_ack {
                        self.writer
                            .write_packet(format!("ACK {}\n", last_common).as_bytes())
                            .await?;
                    }
                    return Ok(());
                }
                self.writer.write_packet(b"NAK\n").await?;
                return Ok(());
            }

            bail!(KeelError::ProtocolError(format!("expected SHA1 list, got `{}`", line)));
        }
    }

    /// records a `have`: when the object is present locally, it and its
    /// recursive commit-parent closure are flagged THEY_HAVE. returns whether
    /// the object is present.
    fn got_oid(&mut self, oid: Oid) -> KeelResult<bool> {
        if !self.repo.obj_exists(oid)? {
            return Ok(false);
        }
        if self.haves.len() < MAX_HAS {
            let node = self.repo.parse_oid(oid)?;
            if self.repo.graph().flags(node).contains(NodeFlags::THEY_HAVE) {
                return Ok(false);
            }
            self.mark_they_have(node)?;
            self.haves.push(node);
        }
        Ok(true)
    }

    fn mark_they_have(&self, root: NodeId) -> KeelResult<()> {
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if self.repo.graph_mut().test_and_set(node, NodeFlags::THEY_HAVE) {
                continue;
            }
            // a parent that cannot be parsed bounds the closure rather than
            // failing the negotiation
            if self.repo.parse_node(node).is_err() {
                continue;
            }
            if let Ok(commit) = self.repo.graph().commit(node) {
                stack.extend(commit.parents.iter().copied());
            }
        }
        Ok(())
    }

    /// children of a parsed node in the reference relation: commit → tree +
    /// parents, tree → entries, tag → target
    fn children_of(&self, node: NodeId) -> Vec<NodeId> {
        let mut children = vec![];
        let entry_oids: Vec<Oid> = {
            let graph = self.repo.graph();
            match graph.parsed(node) {
                Some(ParsedNode::Commit(commit)) => {
                    children.push(commit.tree);
                    children.extend(commit.parents.iter().copied());
                    return children;
                }
                Some(ParsedNode::Tag { target, .. }) => {
                    children.push(*target);
                    return children;
                }
                Some(ParsedNode::Tree { entries }) =>
                    entries.iter().map(|entry| entry.oid).collect(),
                _ => return children,
            }
        };
        let mut graph = self.repo.graph_mut();
        entry_oids.into_iter().map(|oid| graph.lookup(oid)).collect()
    }

    /// walks the tree closures of everything the peer has, so that shared
    /// subtrees are excluded from the pack
    fn close_over_they_have(&self) -> KeelResult<()> {
        // the commit ancestors already carry THEY_HAVE from the negotiation;
        // what is left is spreading the flag over their trees and blobs
        let mut stack: Vec<NodeId> = {
            let graph = self.repo.graph();
            graph
                .sorted_nodes()
                .into_iter()
                .filter(|&node| graph.flags(node).contains(NodeFlags::THEY_HAVE))
                .collect()
        };
        while let Some(node) = stack.pop() {
            if self.repo.parse_node(node).is_err() {
                // a missing object simply bounds the exclusion set
                continue;
            }
            for child in self.children_of(node) {
                if !self.repo.graph_mut().test_and_set(child, NodeFlags::THEY_HAVE) {
                    stack.push(child);
                }
            }
        }
        Ok(())
    }

    /// the pack stream covering the closure of WANTED minus the closure of
    /// THEY_HAVE, written unframed over the same output stream
    async fn send_pack(&mut self) -> KeelResult<()> {
        self.close_over_they_have()?;

        let mut objects: Vec<KeelRawObj> = vec![];
        let mut stack = self.wants.clone();
        while let Some(node) = stack.pop() {
            let flags = self.repo.graph().flags(node);
            if flags.contains(NodeFlags::THEY_HAVE) || flags.contains(NodeFlags::SEEN) {
                continue;
            }
            self.repo.graph_mut().insert_flags(node, NodeFlags::SEEN);

            // an object needed to serve a want must be readable
            self.repo.parse_node(node)?;
            let oid = self.repo.graph().oid(node);
            objects.push(self.repo.odb()?.read_raw(oid.into())?);

            stack.extend(self.children_of(node));
        }

        debug!("send_pack: sending {} objects", objects.len());
        let mut buf = vec![];
        pack::write_pack(&objects, &mut buf)?;
        self.writer.write_all(&buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
