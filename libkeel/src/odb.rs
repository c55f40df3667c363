use crate::error::{KeelError, KeelResult, KeelResultExt};
use crate::hash;
use crate::lockfile::{Lockfile, LockfileFlags};
use crate::obj::{self, *};
use crate::pack::{Pack, PACK_EXT, PACK_IDX_EXT};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::fs::File;
use std::io::{prelude::*, BufReader};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const ALTERNATES_FILE_PATH: &str = "info/alternates";

/// searches backends in order: the loose directory, then each packfile, then
/// every alternate object directory (recursively)
pub struct KeelObjDb {
    loose: KeelLooseObjDb,
    packed: KeelPackedObjDb,
    alternates: Vec<KeelObjDb>,
    strict: bool,
}

impl KeelObjDb {
    pub fn new(objects_path: impl Into<PathBuf>, strict: bool) -> KeelResult<Self> {
        // the fingerprint set breaks alternate cycles
        let mut seen = vec![];
        Self::new_inner(objects_path.into(), strict, &mut seen)
    }

    fn new_inner(
        objects_path: PathBuf,
        strict: bool,
        seen: &mut Vec<PathBuf>,
    ) -> KeelResult<Self> {
        let fingerprint =
            objects_path.canonicalize().unwrap_or_else(|_| objects_path.to_path_buf());
        seen.push(fingerprint);

        let loose = KeelLooseObjDb::new(objects_path.clone());
        let packed = KeelPackedObjDb::new(&objects_path)?;

        let mut alternates = vec![];
        let alternates_file = objects_path.join(ALTERNATES_FILE_PATH);
        if alternates_file.exists() {
            for line in std::fs::read_to_string(&alternates_file)?.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let alt = PathBuf::from(line);
                let alt_fingerprint = alt.canonicalize().unwrap_or_else(|_| alt.clone());
                if seen.contains(&alt_fingerprint) {
                    continue;
                }
                alternates.push(Self::new_inner(alt, strict, seen)?);
            }
        }

        Ok(Self { loose, packed, alternates, strict })
    }

    pub fn read_raw(&self, id: KeelId) -> KeelResult<KeelRawObj> {
        let oid = self.expand_id(id)?;
        let raw = self.read_raw_inner(oid)?;
        if self.strict {
            let actual = hash::hash_obj_bytes(raw.obj_type, &raw.bytes);
            ensure!(
                actual == oid,
                KeelError::CorruptObject(oid, format!("stored bytes hash to `{}`", actual))
            );
        }
        Ok(raw)
    }

    fn read_raw_inner(&self, oid: Oid) -> KeelResult<KeelRawObj> {
        match self.loose.read_raw(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        match self.packed.read_raw(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        for alt in &self.alternates {
            match alt.read_raw_inner(oid) {
                Err(err) if err.is_not_found_err() => continue,
                result => return result,
            }
        }
        bail!(KeelError::ObjectNotFound(oid.into()))
    }

    pub fn read_header(&self, id: KeelId) -> KeelResult<KeelObjHeader> {
        let oid = self.expand_id(id)?;
        match self.loose.read_header(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        match self.packed.read_header(oid) {
            Err(err) if err.is_not_found_err() => {}
            result => return result,
        }
        for alt in &self.alternates {
            match alt.read_header(oid.into()) {
                Err(err) if err.is_not_found_err() => continue,
                result => return result,
            }
        }
        bail!(KeelError::ObjectNotFound(oid.into()))
    }

    /// writes a loose object, returning its identity; writing an id that
    /// already exists is a no-op
    pub fn write(&self, obj: &dyn WritableObject) -> KeelResult<Oid> {
        let mut bytes = vec![];
        obj.serialize(&mut bytes)?;
        self.write_raw(obj.obj_ty(), &bytes)
    }

    pub fn write_raw(&self, obj_type: KeelObjType, bytes: &[u8]) -> KeelResult<Oid> {
        self.loose.write_raw(obj_type, bytes)
    }

    pub fn exists(&self, id: KeelId) -> KeelResult<bool> {
        match self.expand_id(id) {
            Ok(..) => Ok(true),
            Err(err) if err.is_not_found_err() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// candidate oids with the given prefix across loose, packed and alternates;
    /// an empty result is not an error here
    pub fn prefix_candidates(&self, prefix: PartialOid) -> KeelResult<Vec<Oid>> {
        let mut candidates = self.loose.prefix_candidates(prefix)?;
        candidates.extend(self.packed.prefix_candidates(prefix)?);
        for alt in &self.alternates {
            candidates.extend(alt.prefix_candidates(prefix)?);
        }
        candidates.sort_unstable();
        candidates.dedup();
        Ok(candidates)
    }

    pub fn expand_prefix(&self, prefix: PartialOid) -> KeelResult<Oid> {
        trace!("expand_prefix(prefix: {})", prefix);
        let candidates = self.prefix_candidates(prefix)?;
        trace!("expand_prefix(..) :: candidates = {:?}", candidates);
        match candidates.len() {
            0 => Err(anyhow!(KeelError::ObjectNotFound(prefix.into()))),
            1 => Ok(candidates[0]),
            _ => Err(anyhow!(KeelError::AmbiguousPrefix(prefix, candidates))),
        }
    }

    pub fn expand_id(&self, id: KeelId) -> KeelResult<Oid> {
        match id {
            KeelId::Full(oid) => {
                // full ids are only checked for existence, not expanded
                if self.loose.contains(oid)
                    || self.packed.contains(oid)?
                    || self.alternates.iter().any(|alt| alt.expand_id(id).is_ok())
                {
                    Ok(oid)
                } else {
                    Err(anyhow!(KeelError::ObjectNotFound(id)))
                }
            }
            KeelId::Partial(partial) => self.expand_prefix(partial),
        }
    }

    /// yields every loose oid (this directory only, not alternates), sorted
    pub fn enumerate_loose(&self) -> KeelResult<Vec<Oid>> {
        self.loose.enumerate()
    }

    /// runs `f` over each pack in this object directory
    pub fn with_packs<R>(&self, f: impl FnOnce(&mut [Pack]) -> KeelResult<R>) -> KeelResult<R> {
        f(&mut self.packed.packs.write())
    }
}

pub(crate) struct KeelLooseObjDb {
    /// path to the objects directory
    objects_path: PathBuf,
}

impl KeelLooseObjDb {
    pub fn new(objects_path: PathBuf) -> Self {
        Self { objects_path }
    }

    // infallible, used by write; must *not* check for existence
    fn obj_path(&self, oid: Oid) -> PathBuf {
        let hex = oid.to_hex();
        self.objects_path.join(&hex[0..2]).join(&hex[2..])
    }

    fn contains(&self, oid: Oid) -> bool {
        self.obj_path(oid).exists()
    }

    fn locate_obj(&self, oid: Oid) -> KeelResult<PathBuf> {
        let path = self.obj_path(oid);
        if path.exists() { Ok(path) } else { Err(anyhow!(KeelError::ObjectNotFound(oid.into()))) }
    }

    fn read_stream(&self, oid: Oid) -> KeelResult<impl BufRead> {
        let reader = File::open(self.locate_obj(oid)?)?;
        Ok(BufReader::new(ZlibDecoder::new(reader)))
    }

    pub fn read_raw(&self, oid: Oid) -> KeelResult<KeelRawObj> {
        trace!("KeelLooseObjDb::read_raw(oid: {})", oid);
        let mut stream = self.read_stream(oid)?;
        let KeelObjHeader { obj_type, size } = obj::read_obj_header(&mut stream)?;
        let mut bytes = Vec::with_capacity(size as usize);
        stream.read_to_end(&mut bytes)?;
        ensure_eq!(
            bytes.len() as u64,
            size,
            KeelError::CorruptObject(oid, "loose object payload shorter than header".into())
        );
        Ok(KeelRawObj { obj_type, bytes })
    }

    pub fn read_header(&self, oid: Oid) -> KeelResult<KeelObjHeader> {
        let mut stream = self.read_stream(oid)?;
        obj::read_obj_header(&mut stream)
    }

    pub fn write_raw(&self, obj_type: KeelObjType, bytes: &[u8]) -> KeelResult<Oid> {
        let oid = hash::hash_obj_bytes(obj_type, bytes);
        let path = self.obj_path(oid);

        if path.exists() {
            // content addressed: same id means same bytes, nothing to do
            return Ok(oid);
        }

        let mut buf = vec![];
        write!(buf, "{} {}\0", obj_type, bytes.len())?;
        buf.extend_from_slice(bytes);

        let written = Lockfile::with_mut(&path, LockfileFlags::SET_READONLY, |lockfile| {
            Ok(ZlibEncoder::new(lockfile, Compression::default()).write_all(&buf)?)
        });
        match written {
            Ok(()) => Ok(oid),
            // losing the race means another writer is storing the same
            // content-named object, which is as good as having written it
            Err(err) if err.is_lock_busy() => Ok(oid),
            Err(err) => Err(err),
        }
    }

    pub fn prefix_candidates(&self, prefix: PartialOid) -> KeelResult<Vec<Oid>> {
        let (dir, file_prefix) = prefix.split();
        let full_dir = self.objects_path.join(dir);
        if !full_dir.exists() {
            return Ok(vec![]);
        }

        // look at the two-hex-digit directory named by the prefix and
        // reconstruct oids by concatenating dir and filename
        let mut candidates = vec![];
        for entry in std::fs::read_dir(full_dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let filename = entry.file_name();
            let filename = match filename.to_str() {
                Some(name) if name.len() == 38 => name,
                _ => continue,
            };
            if !filename.starts_with(file_prefix) {
                continue;
            }
            if let Ok(oid) = Oid::from_str(&format!("{}{}", dir, filename)) {
                candidates.push(oid);
            }
        }
        Ok(candidates)
    }

    /// every 40-hex entry across every two-letter subdirectory, sorted
    pub fn enumerate(&self) -> KeelResult<Vec<Oid>> {
        let mut oids = vec![];
        for byte in 0u16..256 {
            let dir = self.objects_path.join(format!("{:02x}", byte));
            if !dir.exists() {
                continue;
            }
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let filename = entry.file_name();
                let filename = match filename.to_str() {
                    Some(name) if name.len() == 38 => name,
                    _ => {
                        warn!("bad loose object file: {}", entry.path().display());
                        continue;
                    }
                };
                match Oid::from_str(&format!("{:02x}{}", byte, filename)) {
                    Ok(oid) => oids.push(oid),
                    Err(..) => warn!("bad loose object file: {}", entry.path().display()),
                }
            }
        }
        oids.sort_unstable();
        Ok(oids)
    }
}

pub(crate) struct KeelPackedObjDb {
    /// [(packfile, idxfile)]
    packs: RwLock<SmallVec<[Pack; 1]>>,
}

impl KeelPackedObjDb {
    pub fn new(objects_path: &Path) -> KeelResult<Self> {
        let pack_dir = objects_path.join("pack");
        let packs: RwLock<SmallVec<[Pack; 1]>> = Default::default();

        if !pack_dir.exists() {
            return Ok(Self { packs });
        }

        for entry in std::fs::read_dir(pack_dir)? {
            let entry = entry?;
            let pack = entry.path();
            if pack.extension() != Some(PACK_EXT.as_ref()) {
                continue;
            }

            let idx = pack.with_extension(PACK_IDX_EXT);
            ensure!(
                idx.exists(),
                "packfile `{}` is missing a corresponding index file",
                pack.display()
            );
            packs.write().push(Pack::new(pack, idx)?);
        }

        Ok(Self { packs })
    }

    pub fn read_raw(&self, oid: Oid) -> KeelResult<KeelRawObj> {
        trace!("KeelPackedObjDb::read_raw(oid: {})", oid);
        for pack in self.packs.write().iter_mut() {
            match pack.read_obj_raw(oid) {
                Err(err) if err.is_not_found_err() => continue,
                result => return result,
            }
        }
        bail!(KeelError::ObjectNotFound(oid.into()))
    }

    pub fn read_header(&self, oid: Oid) -> KeelResult<KeelObjHeader> {
        for pack in self.packs.write().iter_mut() {
            match pack.read_obj_header(oid) {
                Err(err) if err.is_not_found_err() => continue,
                result => return result,
            }
        }
        bail!(KeelError::ObjectNotFound(oid.into()))
    }

    pub fn contains(&self, oid: Oid) -> KeelResult<bool> {
        Ok(self.packs.write().iter_mut().any(|pack| pack.obj_exists(oid).unwrap_or_default()))
    }

    pub fn prefix_candidates(&self, prefix: PartialOid) -> KeelResult<Vec<Oid>> {
        let mut candidates = vec![];
        for pack in self.packs.write().iter_mut() {
            candidates.extend(pack.prefix_matches(prefix)?);
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests;
