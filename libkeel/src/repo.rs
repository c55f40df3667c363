use crate::config::KeelConfig;
use crate::error::{KeelError, KeelResult};
use crate::graft::Grafts;
use crate::graph::{NodeFlags, NodeId, ObjGraph};
use crate::hash;
use crate::obj::*;
use crate::odb::KeelObjDb;
use crate::refs::{KeelRef, KeelRefDb, RefExpectation, SymbolicRef};
use anyhow::Context;
use once_cell::sync::OnceCell;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

pub const KEEL_DIR: &str = ".keel";
pub const KEEL_HEAD_FILE_PATH: &str = "HEAD";
pub const KEEL_CONFIG_FILE_PATH: &str = "config";
pub const KEEL_OBJECTS_DIR_PATH: &str = "objects";
pub const KEEL_GRAFTS_FILE_PATH: &str = "info/grafts";
/// overrides the object directory; propagated to spawned peers
pub const KEEL_OBJECT_DIRECTORY_ENV: &str = "KEEL_OBJECT_DIRECTORY";

#[derive(Debug, Clone, Copy, Default)]
pub struct RepoOpts {
    /// verify object identities on read and make corruption fatal
    pub strict: bool,
    /// record outbound references at parse time (needed for reachability)
    pub track_refs: bool,
}

/// the explicit context value threaded through every operation: paths plus
/// the process-wide mutable state (node table, grafts, lazily-opened stores)
#[derive(Clone)]
pub struct KeelRepo {
    rcx: Arc<RepoCtxt>,
}

impl PartialEq for KeelRepo {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.rcx, &other.rcx)
    }
}

pub struct RepoCtxt {
    pub workdir: PathBuf,
    pub keeldir: PathBuf,
    objects_dir: PathBuf,
    config_path: PathBuf,
    opts: RepoOpts,
    odb_cell: OnceCell<KeelObjDb>,
    refdb_cell: OnceCell<KeelRefDb>,
    grafts_cell: OnceCell<Grafts>,
    graph: RwLock<ObjGraph>,
}

impl Deref for KeelRepo {
    type Target = RepoCtxt;

    fn deref(&self) -> &Self::Target {
        &self.rcx
    }
}

impl std::fmt::Debug for KeelRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeelRepo")
            .field("workdir", &self.workdir)
            .field("keeldir", &self.keeldir)
            .finish_non_exhaustive()
    }
}

impl RepoCtxt {
    fn new(workdir: PathBuf, keeldir: PathBuf, opts: RepoOpts) -> Self {
        // the environment override takes precedence over `<keeldir>/objects`
        let objects_dir = std::env::var(KEEL_OBJECT_DIRECTORY_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| keeldir.join(KEEL_OBJECTS_DIR_PATH));
        let config_path = keeldir.join(KEEL_CONFIG_FILE_PATH);
        Self {
            workdir,
            keeldir,
            objects_dir,
            config_path,
            opts,
            odb_cell: Default::default(),
            refdb_cell: Default::default(),
            grafts_cell: Default::default(),
            graph: RwLock::new(ObjGraph::new(opts.track_refs)),
        }
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn grafts_path(&self) -> PathBuf {
        self.keeldir.join(KEEL_GRAFTS_FILE_PATH)
    }
}

impl KeelRepo {
    /// initializes an empty repository at `path`
    pub fn init(path: impl AsRef<Path>) -> KeelResult<()> {
        let workdir = path.as_ref();
        std::fs::create_dir_all(workdir)?;
        let workdir = workdir.canonicalize()?;

        if workdir.is_file() {
            bail!("`{}` is not a directory", workdir.display())
        }

        let keeldir = workdir.join(KEEL_DIR);
        if keeldir.exists() {
            info!("reinitialized existing repository in `{}`", workdir.display());
            return Ok(());
        }

        std::fs::create_dir(&keeldir)?;
        for dir in [KEEL_OBJECTS_DIR_PATH, "objects/pack", "objects/info", "refs/heads", "refs/tags", "info"]
        {
            std::fs::create_dir_all(keeldir.join(dir))?;
        }

        let mut head = std::fs::File::create(keeldir.join(KEEL_HEAD_FILE_PATH))?;
        writeln!(head, "ref: refs/heads/master")?;

        let config = KeelConfig::new(keeldir.join(KEEL_CONFIG_FILE_PATH));
        config.set("core.repositoryformatversion", Some("0"), None, false)?;

        info!("initialized empty repository in `{}`", workdir.display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> KeelResult<Self> {
        Self::load_opts(path, RepoOpts::default())
    }

    pub fn load_opts(path: impl AsRef<Path>, opts: RepoOpts) -> KeelResult<Self> {
        let workdir = path
            .as_ref()
            .canonicalize()
            .with_context(|| anyhow!("failed to load repository in nonexistent directory"))?;
        let keeldir = workdir.join(KEEL_DIR);
        ensure!(keeldir.exists(), "`{}` is not a keel repository", workdir.display());

        let rcx = RepoCtxt::new(workdir, keeldir, opts);
        let repo = Self { rcx: Arc::new(rcx) };

        let version: i64 =
            repo.config().get("core.repositoryformatversion")?.unwrap_or_default();
        ensure!(
            version == 0,
            "unsupported repositoryformatversion `{}`, expected version 0",
            version
        );

        Ok(repo)
    }

    /// recursively searches parent directories for a repository
    pub fn find(path: impl AsRef<Path>) -> KeelResult<Self> {
        Self::find_opts(path, RepoOpts::default())
    }

    pub fn find_opts(path: impl AsRef<Path>, opts: RepoOpts) -> KeelResult<Self> {
        let path = path.as_ref();
        let canonical = path.canonicalize().with_context(|| {
            format!("failed to find repository in nonexistent path `{}`", path.display())
        })?;
        let mut current = canonical.as_path();
        loop {
            if current.join(KEEL_DIR).exists() {
                return Self::load_opts(current, opts);
            }
            match current.parent() {
                Some(parent) => current = parent,
                None =>
                    bail!("not a keel repository (or any of the parent directories)"),
            }
        }
    }

    pub fn strict(&self) -> bool {
        self.opts.strict
    }

    pub fn odb(&self) -> KeelResult<&KeelObjDb> {
        self.rcx
            .odb_cell
            .get_or_try_init(|| KeelObjDb::new(self.objects_dir.clone(), self.opts.strict))
    }

    pub fn refdb(&self) -> KeelResult<&KeelRefDb> {
        self.rcx.refdb_cell.get_or_try_init(|| Ok(KeelRefDb::new(self.keeldir.clone())))
    }

    pub fn config(&self) -> KeelConfig {
        KeelConfig::new(self.config_path.clone())
    }

    /// grafts are loaded once per process; an absent file is an empty list
    pub fn grafts(&self) -> KeelResult<&Grafts> {
        self.rcx.grafts_cell.get_or_try_init(|| Grafts::load(&self.grafts_path()))
    }

    pub fn graph(&self) -> RwLockReadGuard<'_, ObjGraph> {
        self.rcx.graph.read()
    }

    pub fn graph_mut(&self) -> RwLockWriteGuard<'_, ObjGraph> {
        self.rcx.graph.write()
    }

    // ===== object store =====

    pub fn read_obj(&self, id: impl Into<KeelId>) -> KeelResult<KeelObjKind> {
        let raw = self.odb()?.read_raw(id.into())?;
        KeelObjKind::deserialize(&raw)
    }

    pub fn read_obj_header(&self, id: impl Into<KeelId>) -> KeelResult<KeelObjHeader> {
        self.odb()?.read_header(id.into())
    }

    pub fn obj_exists(&self, id: impl Into<KeelId>) -> KeelResult<bool> {
        self.odb()?.exists(id.into())
    }

    pub fn ensure_obj_exists(&self, id: impl Into<KeelId>) -> KeelResult<()> {
        let id = id.into();
        ensure!(self.odb()?.exists(id)?, KeelError::ObjectNotFound(id));
        Ok(())
    }

    /// writes `obj` into the store returning its identity
    pub fn write_obj(&self, obj: &dyn WritableObject) -> KeelResult<Oid> {
        self.odb()?.write(obj)
    }

    pub fn write_raw(&self, obj_type: KeelObjType, bytes: &[u8]) -> KeelResult<Oid> {
        self.odb()?.write_raw(obj_type, bytes)
    }

    pub fn expand_id(&self, id: impl Into<KeelId>) -> KeelResult<Oid> {
        self.odb()?.expand_id(id.into())
    }

    pub fn expand_prefix(&self, prefix: PartialOid) -> KeelResult<Oid> {
        self.odb()?.expand_prefix(prefix)
    }

    /// shortest unique abbreviation of `oid` with length at least `min_len`;
    /// `None` when the object cannot be uniquely abbreviated (it is not
    /// present in the store)
    pub fn abbrev_for(&self, oid: Oid, min_len: usize) -> KeelResult<Option<String>> {
        let hex = oid.to_hex();
        let mut len = min_len.clamp(PartialOid::MIN_LEN, 40);
        while len < 40 {
            let prefix = PartialOid::from_str(&hex[..len])?;
            let candidates = self.odb()?.prefix_candidates(prefix)?;
            if !candidates.contains(&oid) {
                return Ok(None);
            }
            if candidates.len() == 1 {
                return Ok(Some(hex[..len].to_owned()));
            }
            len += 1;
        }
        if self.obj_exists(oid)? { Ok(Some(hex)) } else { Ok(None) }
    }

    // ===== graph =====

    /// interns `oid` in the node table
    pub fn node_for(&self, oid: Oid) -> NodeId {
        self.graph_mut().lookup(oid)
    }

    /// parses the node's object, filling in kind-specific fields; idempotent
    pub fn parse_node(&self, node: NodeId) -> KeelResult<()> {
        let (oid, parsed) = {
            let graph = self.graph();
            (graph.oid(node), graph.is_parsed(node))
        };
        if parsed {
            return Ok(());
        }

        let raw = self.odb()?.read_raw(oid.into())?;
        // in lenient mode an identity mismatch is reported but not fatal
        if !self.opts.strict {
            let actual = hash::hash_obj_bytes(raw.obj_type, &raw.bytes);
            if actual != oid {
                warn!("sha1 mismatch {}", oid);
            }
        }
        let obj = KeelObjKind::deserialize(&raw)
            .map_err(|err| anyhow!(KeelError::CorruptObject(oid, err.to_string())))?;
        let grafts = self.grafts()?;
        self.graph_mut().parse_raw(node, &obj, grafts)
    }

    /// lookup + parse in one step
    pub fn parse_oid(&self, oid: Oid) -> KeelResult<NodeId> {
        let node = self.node_for(oid);
        self.parse_node(node)?;
        Ok(node)
    }

    /// removes and returns the newest commit of the date-sorted `list`,
    /// enqueueing its parents unless they carry `mark`
    pub fn pop_most_recent(
        &self,
        list: &mut Vec<NodeId>,
        mark: NodeFlags,
    ) -> KeelResult<Option<NodeId>> {
        if list.is_empty() {
            return Ok(None);
        }
        let node = list.remove(0);
        let parents = self.graph().commit(node)?.parents.clone();
        for parent in parents {
            self.parse_node(parent)?;
            let mut graph = self.graph_mut();
            if !graph.test_and_set(parent, mark) {
                graph.insert_by_date(list, parent)?;
            }
        }
        Ok(Some(node))
    }

    // ===== refs =====

    /// reads the contents of `HEAD` without resolving through to an oid
    pub fn read_head(&self) -> KeelResult<KeelRef> {
        self.refdb()?.read(&SymbolicRef::head())
    }

    /// the fully resolved oid of `HEAD`
    pub fn resolve_head(&self) -> KeelResult<Oid> {
        self.refdb()?.read_resolved(&SymbolicRef::head())
    }

    pub fn read_ref(&self, sym: &SymbolicRef) -> KeelResult<KeelRef> {
        self.refdb()?.read(sym)
    }

    pub fn resolve_ref(&self, reference: &KeelRef) -> KeelResult<Oid> {
        self.refdb()?.resolve(reference)
    }

    pub fn update_ref(
        &self,
        sym: &SymbolicRef,
        to: Oid,
        expected: RefExpectation,
    ) -> KeelResult<()> {
        self.refdb()?.update(sym, to, expected)
    }

    pub fn create_symref(&self, sym: &SymbolicRef, target: &SymbolicRef) -> KeelResult<()> {
        self.refdb()?.create_symref(sym, target)
    }

    pub fn for_each_ref(
        &self,
        f: impl FnMut(&SymbolicRef, Oid) -> KeelResult<()>,
    ) -> KeelResult<()> {
        self.refdb()?.for_each_ref(f)
    }
}

#[cfg(test)]
mod tests;
