use crate::error::{KeelError, KeelResult};
use crate::graph::NodeFlags;
use crate::obj::Oid;
use crate::protocol::{strip_line, KeelProtocolRead, KeelProtocolWrite};
use crate::repo::KeelRepo;
use std::str::FromStr;
use tokio::io::AsyncReadExt;

/// haves are sent in batches of this size, one flush per batch
const HAVE_BATCH: usize = 32;
/// bound on negotiation rounds; together with the finite local commit set
/// this guarantees termination
const MAX_ROUNDS: usize = 32;

/// which advertised refs the client asks for
#[derive(Debug, Clone)]
pub enum WantSelection {
    /// everything advertised that is not already present locally
    AllMissing,
    /// refs whose name matches one of these (by trailing path component)
    Names(Vec<String>),
    /// explicit object ids
    Ids(Vec<Oid>),
}

/// a ref line from the peer's advertisement
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRef {
    pub oid: Oid,
    pub name: String,
}

#[derive(Debug, Default)]
pub struct FetchSummary {
    pub refs: Vec<RemoteRef>,
    pub wanted: Vec<Oid>,
    pub common: Vec<Oid>,
    pub unpacked: Vec<Oid>,
}

enum Ack {
    Nak,
    Continue(Oid),
    Terminal(Oid),
}

/// the client side of the negotiation: consumes the advertisement, sends
/// wants, alternates have-batches with ACK/NAK reads, then streams the pack
/// into the object store
pub struct Fetch<R, W> {
    repo: KeelRepo,
    reader: R,
    writer: W,
    selection: WantSelection,
    server_capabilities: String,
    multi_ack: bool,
}

impl<R, W> Fetch<R, W>
where
    R: KeelProtocolRead,
    W: KeelProtocolWrite,
{
    pub fn new(repo: KeelRepo, reader: R, writer: W, selection: WantSelection) -> Self {
        Self {
            repo,
            reader,
            writer,
            selection,
            server_capabilities: String::new(),
            multi_ack: false,
        }
    }

    /// whether the peer advertised `feature`
    pub fn server_supports(&self, feature: &str) -> bool {
        self.server_capabilities.split(' ').any(|cap| cap == feature)
    }

    pub async fn run(mut self) -> KeelResult<FetchSummary> {
        let refs = self.read_advertised_refs().await?;
        let wanted = self.select_wants(&refs)?;
        if wanted.is_empty() {
            // nothing to ask for: terminate the conversation cleanly
            self.writer.write_flush_packet().await?;
            return Ok(FetchSummary { refs, ..Default::default() });
        }

        self.send_wants(&wanted).await?;
        let common = self.negotiate_haves().await?;
        let unpacked = self.receive_pack().await?;
        Ok(FetchSummary { refs, wanted, common, unpacked })
    }

    /// one frame per ref; the first frame carries the capability list after a
    /// NUL. the advertisement ends at the flush.
    async fn read_advertised_refs(&mut self) -> KeelResult<Vec<RemoteRef>> {
        let mut refs = vec![];
        loop {
            let line = self.reader.recv_packet().await?;
            if line.is_empty() {
                break;
            }
            let line = strip_line(&line);

            ensure!(
                line.len() >= 42 && line[40] == b' ',
                KeelError::ProtocolError(format!(
                    "expected sha/ref, got `{}`",
                    String::from_utf8_lossy(line)
                ))
            );
            let oid = std::str::from_utf8(&line[..40])
                .ok()
                .and_then(|hex| Oid::from_str(hex).ok())
                .ok_or_else(|| {
                    anyhow!(KeelError::ProtocolError(format!(
                        "expected sha/ref, got `{}`",
                        String::from_utf8_lossy(line)
                    )))
                })?;

            let rest = &line[41..];
            // the first advertised ref carries the capability list after a NUL
            let (name, caps) = match rest.iter().position(|&b| b == 0) {
                Some(idx) => (&rest[..idx], Some(&rest[idx + 1..])),
                None => (rest, None),
            };
            if let Some(caps) = caps {
                self.server_capabilities = String::from_utf8_lossy(caps).into_owned();
            }

            refs.push(RemoteRef { oid, name: String::from_utf8_lossy(name).into_owned() });
        }
        ensure!(
            !refs.is_empty(),
            KeelError::ProtocolError("peer advertised no refs".to_owned())
        );
        Ok(refs)
    }

    fn select_wants(&self, refs: &[RemoteRef]) -> KeelResult<Vec<Oid>> {
        let mut wanted = vec![];
        match &self.selection {
            WantSelection::AllMissing => {
                for reference in refs {
                    if !self.repo.obj_exists(reference.oid)? && !wanted.contains(&reference.oid) {
                        wanted.push(reference.oid);
                    }
                }
            }
            WantSelection::Names(names) => {
                for name in names {
                    let matched = refs.iter().find(|r| {
                        r.name == *name
                            || r.name
                                .strip_suffix(name.as_str())
                                .map_or(false, |prefix| prefix.ends_with('/'))
                    });
                    match matched {
                        Some(reference) if !wanted.contains(&reference.oid) =>
                            wanted.push(reference.oid),
                        Some(..) => {}
                        None => bail!("no matching remote ref for `{}`", name),
                    }
                }
            }
            WantSelection::Ids(ids) => wanted.extend(ids.iter().copied()),
        }
        Ok(wanted)
    }

    async fn send_wants(&mut self, wanted: &[Oid]) -> KeelResult<()> {
        // announce the capability we will honor on the first want line
        let multi_ack = self.server_supports("multi_ack");
        for (i, &oid) in wanted.iter().enumerate() {
            if i == 0 && multi_ack {
                self.writer.want_with_capabilities(oid, "multi_ack").await?;
            } else {
                self.writer.want(oid).await?;
            }
        }
        self.multi_ack = multi_ack;
        self.writer.write_flush_packet().await?;
        Ok(())
    }

    /// local commits in date-descending order seed the have stream
    fn local_commit_roots(&self) -> KeelResult<Vec<crate::graph::NodeId>> {
        let mut oids = vec![];
        if let Ok(head) = self.repo.resolve_head() {
            oids.push(head);
        }
        self.repo.for_each_ref(|_, oid| {
            if !oids.contains(&oid) {
                oids.push(oid);
            }
            Ok(())
        })?;

        let mut roots = vec![];
        for oid in oids {
            // refs may point at tags; haves are commits
            let commit_oid = match self.repo.peel_to(oid, Some(crate::obj::KeelObjType::Commit)) {
                Ok(oid) => oid,
                Err(..) => continue,
            };
            let node = self.repo.parse_oid(commit_oid)?;
            if !self.repo.graph_mut().test_and_set(node, NodeFlags::SEEN) {
                roots.push(node);
            }
        }
        self.repo.graph().sort_by_date(&mut roots)?;
        Ok(roots)
    }

    async fn negotiate_haves(&mut self) -> KeelResult<Vec<Oid>> {
        let mut list = self.local_commit_roots()?;
        let mut common = vec![];

        'rounds: for _ in 0..MAX_ROUNDS {
            let mut sent = 0;
            while sent < HAVE_BATCH {
                match self.repo.pop_most_recent(&mut list, NodeFlags::SEEN)? {
                    Some(node) => {
                        let oid = self.repo.graph().oid(node);
                        self.writer.have(oid).await?;
                        sent += 1;
                    }
                    None => break,
                }
            }
            if sent == 0 {
                break;
            }
            self.writer.write_flush_packet().await?;

            if self.multi_ack {
                // per batch: any number of `ACK <id> continue`, then the NAK
                loop {
                    match self.read_ack().await? {
                        Ack::Nak => continue 'rounds,
                        Ack::Continue(oid) => common.push(oid),
                        Ack::Terminal(oid) => {
                            common.push(oid);
                            break 'rounds;
                        }
                    }
                }
            } else {
                // exactly one response per flush: NAK, or the single ACK
                match self.read_ack().await? {
                    Ack::Nak => {}
                    Ack::Continue(oid) | Ack::Terminal(oid) => {
                        common.push(oid);
                        break 'rounds;
                    }
                }
            }
        }

        self.writer.done().await?;
        // final response: under multi_ack a terminal ACK (or NAK when nothing
        // was common); without multi_ack only a NAK when nothing was common
        if self.multi_ack || common.is_empty() {
            match self.read_ack().await? {
                Ack::Nak => {}
                Ack::Continue(oid) | Ack::Terminal(oid) =>
                    if !common.contains(&oid) {
                        common.push(oid);
                    },
            }
        }

        Ok(common)
    }

    async fn read_ack(&mut self) -> KeelResult<Ack> {
        let line = self.reader.recv_packet().await?;
        ensure!(
            !line.is_empty(),
            KeelError::ProtocolError("expected ACK/NAK, got EOF".to_owned())
        );
        let line = strip_line(&line);
        let line = std::str::from_utf8(line)
            .map_err(|_| anyhow!(KeelError::ProtocolError("non-utf8 ack line".to_owned())))?;

        if line == "NAK" {
            return Ok(Ack::Nak);
        }
        if let Some(rest) = line.strip_prefix("ACK ") {
            let oid = Oid::from_str(rest.get(..40).unwrap_or(rest)).map_err(|_| {
                anyhow!(KeelError::ProtocolError(format!("expected ACK/NAK, got `{}`", line)))
            })?;
            if rest[40.min(rest.len())..].contains("continue") {
                return Ok(Ack::Continue(oid));
            }
            return Ok(Ack::Terminal(oid));
        }
        bail!(KeelError::ProtocolError(format!("expected ACK/NAK, got `{}`", line)))
    }

    /// the pack arrives unframed after the negotiation; it is read to EOF and
    /// unpacked into loose objects
    async fn receive_pack(&mut self) -> KeelResult<Vec<Oid>> {
        let mut bytes = vec![];
        self.reader.read_to_end(&mut bytes).await?;
        self.repo.unpack_objects(&bytes)
    }
}

#[cfg(test)]
mod tests;
