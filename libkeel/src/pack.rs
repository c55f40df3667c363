mod writer;

pub use self::writer::write_pack;

use crate::delta::Delta;
use crate::error::{KeelError, KeelErrorExt, KeelResult, KeelResultExt};
use crate::hash::OID_SIZE;
use crate::io::*;
use crate::obj::*;
use crate::serialize::{BufReadSeek, Deserialize, DeserializeSized, Serialize};
use flate2::{Decompress, FlushDecompress};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_EXT: &str = "pack";
pub const PACK_IDX_EXT: &str = "idx";
const FANOUT_ENTRYC: usize = 256;
const FANOUT_ENTRY_SIZE: u64 = 4;
const FANOUT_SIZE: u64 = FANOUT_ENTRYC as u64 * FANOUT_ENTRY_SIZE;
const RECORD_SIZE: u64 = OID_SIZE as u64 + 4;

impl KeelRawObj {
    fn expand_with_delta_bytes(&self, delta_bytes: &[u8]) -> KeelResult<Self> {
        let delta = Delta::deserialize_from_slice(delta_bytes)?;
        self.expand_with_delta(&delta)
    }

    fn expand_with_delta(&self, delta: &Delta) -> KeelResult<Self> {
        trace!("KeelRawObj::expand_with_delta(..)");
        // the expanded base of a delta always has the base's type
        let &Self { obj_type, ref bytes } = self;
        Ok(Self { obj_type, bytes: delta.expand(bytes)? })
    }
}

/// a raw packed record; the delta variants carry their (already inflated)
/// delta payload plus the back-reference to their base
pub enum KeelPackObjRawDeltified {
    Raw(KeelRawObj),
    Ofs(u64, Vec<u8>),
    Ref(Oid, Vec<u8>),
}

impl std::fmt::Debug for KeelPackObjRawDeltified {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(raw) => write!(f, "KeelPackObjRawDeltified::Raw({:?})", raw),
            Self::Ofs(offset, _) => write!(f, "KeelPackObjRawDeltified::Ofs({}, ..)", offset),
            Self::Ref(oid, _) => write!(f, "KeelPackObjRawDeltified::Ref({}, ..)", oid),
        }
    }
}

pub struct Pack {
    pack_reader: PackfileReader<BufferedFileStream>,
    idx_reader: PackIndexReader<BufferedFileStream>,
    pack_obj_cache: FxHashMap<u64, KeelRawObj>,
}

impl Pack {
    pub fn new(pack: impl AsRef<Path>, idx: impl AsRef<Path>) -> KeelResult<Self> {
        let pack_reader = File::open(pack)
            .map(BufReader::new)
            .map_err(Into::into)
            .and_then(PackfileReader::new)?;
        let idx_reader = File::open(idx)
            .map(BufReader::new)
            .map_err(Into::into)
            .and_then(PackIndexReader::new)?;
        Ok(Self { pack_reader, idx_reader, pack_obj_cache: Default::default() })
    }

    #[inline]
    pub fn pack_reader(&mut self) -> &mut PackfileReader<BufferedFileStream> {
        &mut self.pack_reader
    }

    #[inline]
    pub fn idx_reader(&mut self) -> &mut PackIndexReader<BufferedFileStream> {
        &mut self.idx_reader
    }

    #[inline]
    pub fn obj_offset(&mut self, oid: Oid) -> KeelResult<u64> {
        self.idx_reader().find_oid_offset(oid)
    }

    pub fn objectc(&self) -> u64 {
        self.idx_reader.n
    }

    /// returns every oid in the pack whose hex starts with `prefix`
    pub fn prefix_matches(&mut self, prefix: PartialOid) -> KeelResult<Vec<Oid>> {
        trace!("prefix_matches(prefix: {})", prefix);
        let extended = prefix.into_oid()?;
        match self.obj_offset(extended) {
            // in the unlikely event that zero-extending the prefix produced a
            // real oid it is the first candidate, the scan below finds the rest
            Ok(..) => {
                let idx = self.idx_reader().find_oid_index(extended)?;
                self.scan_prefix_from(idx, prefix)
            }
            Err(err) => {
                // `idx` is the insertion point of the zero-extended prefix, so
                // scanning forward from it visits exactly the candidates
                let (_, idx) = err.try_into_obj_not_found_in_pack_index_err()?;
                self.scan_prefix_from(idx, prefix)
            }
        }
    }

    fn scan_prefix_from(&mut self, start: u64, prefix: PartialOid) -> KeelResult<Vec<Oid>> {
        let mut candidates = vec![];
        for idx in start..self.idx_reader.n {
            let oid = self.idx_reader.read_oid_at(idx)?;
            if !oid.has_prefix(prefix)? {
                break;
            }
            candidates.push(oid);
        }
        Ok(candidates)
    }

    pub fn obj_exists(&mut self, oid: Oid) -> KeelResult<bool> {
        match self.obj_offset(oid) {
            Ok(..) => Ok(true),
            Err(err) if err.is_not_found_err() => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// yields all oids in index order
    pub fn oid_iter(&mut self) -> impl Iterator<Item = KeelResult<Oid>> + '_ {
        let n = self.idx_reader.n;
        let reader = self.idx_reader();
        (0..n).map(move |idx| reader.read_oid_at(idx))
    }

    fn expand_raw_obj(
        &mut self,
        raw_kind: KeelPackObjRawDeltified,
        base_offset: u64,
        visited: &mut FxHashSet<u64>,
    ) -> KeelResult<KeelRawObj> {
        trace!("expand_raw_obj(raw_kind: {:?}, base_offset: {})", raw_kind, base_offset);
        let (base, delta_bytes) = match raw_kind {
            KeelPackObjRawDeltified::Raw(raw) => return Ok(raw),
            KeelPackObjRawDeltified::Ofs(offset, delta) =>
                (self.read_obj_raw_at_inner(base_offset - offset, visited)?, delta),
            KeelPackObjRawDeltified::Ref(base_oid, delta) => {
                let offset = self.obj_offset(base_oid).map_err(|err| {
                    if err.is_not_found_err() {
                        anyhow!("delta base `{}` missing from pack", base_oid)
                    } else {
                        err
                    }
                })?;
                (self.read_obj_raw_at_inner(offset, visited)?, delta)
            }
        };

        base.expand_with_delta_bytes(&delta_bytes)
    }

    /// returns the fully expanded raw object at `offset`
    pub fn read_obj_raw_at(&mut self, offset: u64) -> KeelResult<KeelRawObj> {
        self.read_obj_raw_at_inner(offset, &mut Default::default())
    }

    fn read_obj_raw_at_inner(
        &mut self,
        offset: u64,
        visited: &mut FxHashSet<u64>,
    ) -> KeelResult<KeelRawObj> {
        trace!("read_obj_raw_at(offset: {})", offset);
        // a delta chain revisiting an offset is a loop, which is forbidden
        ensure!(visited.insert(offset), "cyclic delta chain at pack offset `{}`", offset);
        match self.pack_obj_cache.get(&offset) {
            Some(raw) => Ok(raw.clone()),
            None => {
                let raw = self.pack_reader().read_obj_from_offset_raw(offset)?;
                let expanded = self.expand_raw_obj(raw, offset, visited)?;
                self.pack_obj_cache.insert(offset, expanded.clone());
                Ok(expanded)
            }
        }
    }

    /// returns the fully expanded raw object with oid
    pub fn read_obj_raw(&mut self, oid: Oid) -> KeelResult<KeelRawObj> {
        trace!("read_obj_raw(oid: {})", oid);
        let offset = self.obj_offset(oid)?;
        self.read_obj_raw_at(offset)
    }

    pub fn read_obj_header(&mut self, oid: Oid) -> KeelResult<KeelObjHeader> {
        let offset = self.obj_offset(oid)?;
        self.read_obj_header_at(offset)
    }

    fn read_obj_header_at(&mut self, offset: u64) -> KeelResult<KeelObjHeader> {
        trace!("read_obj_header_at(offset: {})", offset);
        let reader = self.pack_reader();
        let header = reader.read_header_from_offset(offset)?;
        // the ultimate base of a delta chain determines the type
        let base_header = match header.obj_type {
            KeelPackObjType::Commit
            | KeelPackObjType::Tree
            | KeelPackObjType::Blob
            | KeelPackObjType::Tag => return Ok(header.into()),
            KeelPackObjType::OfsDelta => {
                let ofs = reader.read_offset()?;
                self.read_obj_header_at(offset - ofs)
            }
            KeelPackObjType::RefDelta => {
                let oid = self.pack_reader().read_oid()?;
                self.read_obj_header(oid)
            }
        }?;
        Ok(KeelObjHeader { size: header.size, obj_type: base_header.obj_type })
    }
}

/// the in-memory form of a pack index:
/// 256-entry fanout, records sorted by oid, then the pack checksum and the
/// index's own checksum trailer
#[derive(Debug)]
#[cfg_attr(test, derive(Clone, PartialEq))]
pub struct PackIndex {
    pub fanout: [u32; FANOUT_ENTRYC],
    pub oids: Vec<Oid>,
    pub offsets: Vec<u32>,
    pub pack_hash: Oid,
}

impl PackIndex {
    pub fn from_offsets(mut entries: Vec<(Oid, u32)>, pack_hash: Oid) -> Self {
        entries.sort_by_key(|&(oid, _)| oid);
        let oids = entries.iter().map(|&(oid, _)| oid).collect::<Vec<_>>();
        let offsets = entries.iter().map(|&(_, offset)| offset).collect();
        let fanout = Self::build_fanout(&oids);
        Self { fanout, oids, offsets, pack_hash }
    }

    fn build_fanout(oids: &[Oid]) -> [u32; FANOUT_ENTRYC] {
        let mut fanout = [0; FANOUT_ENTRYC];
        for oid in oids {
            fanout[oid[0] as usize] += 1;
        }
        for i in 1..FANOUT_ENTRYC {
            fanout[i] += fanout[i - 1];
        }
        fanout
    }
}

impl Serialize for PackIndex {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        let mut writer = BufWriter::new(HashWriter::new_sha1(writer));
        for n in self.fanout {
            writer.write_u32(n)?;
        }
        for (&oid, &offset) in self.oids.iter().zip(&self.offsets) {
            writer.write_oid(oid)?;
            writer.write_u32(offset)?;
        }
        writer.write_oid(self.pack_hash)?;

        match writer.into_inner() {
            Ok(writer) => writer.write_hash()?,
            Err(..) => bail!("hash writer flush failed while writing pack index"),
        };
        Ok(())
    }
}

impl Deserialize for PackIndex {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        let mut r = HashReader::new_sha1(reader);
        let fanout = r.read_fanout()?;
        // the fanout is cumulative so its last entry is the record count
        let n = fanout[FANOUT_ENTRYC - 1] as usize;

        let mut oids = Vec::with_capacity(n);
        let mut offsets = Vec::with_capacity(n);
        for _ in 0..n {
            oids.push(r.read_oid()?);
            offsets.push(r.read_u32()?);
        }
        ensure!(oids.windows(2).all(|w| w[0] < w[1]), "pack index records are not sorted");

        let pack_hash = r.read_oid()?;
        let hash = r.finalize_sha1();
        let idx_hash = r.read_oid()?;
        ensure_eq!(idx_hash, hash, "pack index checksum mismatch");
        Ok(Self { fanout, oids, offsets, pack_hash })
    }
}

pub struct PackIndexReader<R> {
    reader: R,
    fanout: [u32; FANOUT_ENTRYC],
    offset_cache: FxHashMap<Oid, u64>,
    /// number of records
    n: u64,
}

impl<R: BufReadSeek> PackIndexReader<R> {
    pub fn new(mut reader: R) -> KeelResult<Self> {
        let fanout = reader.read_fanout()?;
        let n = fanout[FANOUT_ENTRYC - 1] as u64;
        // sanity check the fanout is consistent with the record list by
        // checking the index file is exactly the expected size
        let len = reader.seek(SeekFrom::End(0))?;
        ensure_eq!(
            len,
            FANOUT_SIZE + n * RECORD_SIZE + 2 * OID_SIZE as u64,
            "pack index has inconsistent fanout or truncated records"
        );
        Ok(Self { reader, fanout, n, offset_cache: Default::default() })
    }

    /// the checksum of the pack this index describes, from the trailer
    pub fn pack_hash(&mut self) -> KeelResult<Oid> {
        let offset = FANOUT_SIZE + self.n * RECORD_SIZE;
        self.seek(SeekFrom::Start(offset))?;
        Ok(self.reader.read_oid()?)
    }

    /// returns the offset of the object with oid `oid` in the packfile
    pub fn find_oid_offset(&mut self, oid: Oid) -> KeelResult<u64> {
        match self.offset_cache.get(&oid) {
            Some(&offset) => Ok(offset),
            None => {
                let index = self.find_oid_index(oid)?;
                let offset = self.read_offset_at(index)?;
                self.offset_cache.insert(oid, offset);
                Ok(offset)
            }
        }
    }

    pub fn read_oid_at(&mut self, index: u64) -> KeelResult<Oid> {
        debug_assert!(index < self.n);
        self.seek(SeekFrom::Start(FANOUT_SIZE + index * RECORD_SIZE))?;
        Ok(self.reader.read_oid()?)
    }

    fn read_offset_at(&mut self, index: u64) -> KeelResult<u64> {
        self.seek(SeekFrom::Start(FANOUT_SIZE + index * RECORD_SIZE + OID_SIZE as u64))?;
        Ok(self.reader.read_u32()? as u64)
    }

    /// returns the record index of `oid`, or the insertion point wrapped in
    /// [`KeelError::ObjectNotFoundInPackIndex`]
    fn find_oid_index(&mut self, oid: Oid) -> KeelResult<u64> {
        // the fanout entry for byte b is the number of oids whose first byte is <= b,
        // which brackets the binary search
        let prefix = oid[0] as usize;
        let mut low = if prefix == 0 { 0 } else { self.fanout[prefix - 1] } as u64;
        let mut high = self.fanout[prefix] as u64;

        while low < high {
            let mid = (low + high) / 2;
            let mid_oid = self.read_oid_at(mid)?;
            match oid.cmp(&mid_oid) {
                std::cmp::Ordering::Equal => return Ok(mid),
                std::cmp::Ordering::Less => high = mid,
                std::cmp::Ordering::Greater => low = mid + 1,
            }
        }
        Err(anyhow!(KeelError::ObjectNotFoundInPackIndex(oid, low)))
    }
}

impl<R> Deref for PackIndexReader<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl<R> DerefMut for PackIndexReader<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reader
    }
}

pub struct PackfileReader<R> {
    pub(crate) reader: R,
    objectc: u32,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromPrimitive, ToPrimitive)]
pub enum KeelPackObjType {
    Commit   = 1,
    Tree     = 2,
    Blob     = 3,
    Tag      = 4,
    OfsDelta = 6,
    RefDelta = 7,
}

impl KeelPackObjType {
    pub fn try_from_u8(ty: u8) -> KeelResult<Self> {
        KeelPackObjType::from_u8(ty).ok_or_else(|| anyhow!("invalid pack object type `{}`", ty))
    }
}

impl From<KeelObjType> for KeelPackObjType {
    fn from(obj_type: KeelObjType) -> KeelPackObjType {
        match obj_type {
            KeelObjType::Commit => KeelPackObjType::Commit,
            KeelObjType::Tree => KeelPackObjType::Tree,
            KeelObjType::Blob => KeelPackObjType::Blob,
            KeelObjType::Tag => KeelPackObjType::Tag,
        }
    }
}

impl From<KeelPackObjType> for KeelObjType {
    fn from(obj_type: KeelPackObjType) -> KeelObjType {
        match obj_type {
            KeelPackObjType::Commit => KeelObjType::Commit,
            KeelPackObjType::Tree => KeelObjType::Tree,
            KeelPackObjType::Blob => KeelObjType::Blob,
            KeelPackObjType::Tag => KeelObjType::Tag,
            KeelPackObjType::OfsDelta | KeelPackObjType::RefDelta =>
                bug!("found delta object type"),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq)]
pub struct KeelPackObjHeader {
    pub obj_type: KeelPackObjType,
    pub size: u64,
}

impl From<KeelPackObjHeader> for KeelObjHeader {
    fn from(header: KeelPackObjHeader) -> KeelObjHeader {
        let KeelPackObjHeader { obj_type, size } = header;
        Self { obj_type: obj_type.into(), size }
    }
}

impl<R: BufRead> PackfileReader<R> {
    pub fn new(mut reader: R) -> KeelResult<Self> {
        let objectc = Self::parse_header(&mut reader)?;
        Ok(Self { reader, objectc })
    }

    fn parse_header(mut reader: impl BufRead) -> KeelResult<u32> {
        let mut sig = [0u8; 4];
        reader.read_exact(&mut sig)?;
        ensure_eq!(&sig, PACK_SIGNATURE, "invalid packfile signature");
        let version = reader.read_u32()?;
        ensure_eq!(version, PACK_VERSION, "invalid packfile version `{}`", version);
        Ok(reader.read_u32()?)
    }

    pub fn objectc(&self) -> u32 {
        self.objectc
    }

    // 3 bits of object type folded into the first byte of the size varint
    #[inline]
    pub fn read_pack_obj_header(&mut self) -> KeelResult<KeelPackObjHeader> {
        let (ty, size) = self.read_le_varint_with_shift(3)?;
        let obj_type = KeelPackObjType::try_from_u8(ty)?;
        Ok(KeelPackObjHeader { obj_type, size })
    }

    fn inflate(&mut self, size: u64) -> KeelResult<Vec<u8>> {
        let mut decompressor = Decompress::new(true);
        let mut output = Vec::with_capacity(size as usize);
        loop {
            let input = self.fill_buf()?;
            let at_eof = input.is_empty();
            let in_so_far = decompressor.total_in();
            let flush = if at_eof { FlushDecompress::Finish } else { FlushDecompress::None };
            let status = decompressor.decompress_vec(input, &mut output, flush)?;
            let consumed = decompressor.total_in() - in_so_far;
            self.consume(consumed as usize);
            match status {
                flate2::Status::Ok | flate2::Status::BufError => continue,
                flate2::Status::StreamEnd => break,
            }
        }
        ensure_eq!(
            output.len() as u64,
            size,
            "inflated packed object has size `{}`, expected `{}`",
            output.len(),
            size
        );
        Ok(output)
    }

    pub fn read_pack_obj(&mut self) -> KeelResult<KeelPackObjRawDeltified> {
        let KeelPackObjHeader { obj_type, size } = self.read_pack_obj_header()?;
        // the delta back-reference itself is stored uncompressed, only the
        // delta payload is deflated
        let raw = match obj_type {
            KeelPackObjType::Commit
            | KeelPackObjType::Tree
            | KeelPackObjType::Blob
            | KeelPackObjType::Tag => KeelPackObjRawDeltified::Raw(KeelRawObj {
                obj_type: KeelObjType::from(obj_type),
                bytes: self.inflate(size)?,
            }),
            KeelPackObjType::OfsDelta =>
                KeelPackObjRawDeltified::Ofs(self.read_offset()?, self.inflate(size)?),
            KeelPackObjType::RefDelta =>
                KeelPackObjRawDeltified::Ref(self.read_oid()?, self.inflate(size)?),
        };

        Ok(raw)
    }
}

impl<R: BufReadSeek> PackfileReader<R> {
    /// seek to `offset` and read the pack object header
    #[inline]
    fn read_header_from_offset(&mut self, offset: u64) -> KeelResult<KeelPackObjHeader> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_pack_obj_header()
    }

    pub fn read_obj_from_offset_raw(&mut self, offset: u64) -> KeelResult<KeelPackObjRawDeltified> {
        trace!("read_obj_from_offset_raw(offset: {})", offset);
        self.seek(SeekFrom::Start(offset))?;
        self.read_pack_obj()
    }
}

impl<R> Deref for PackfileReader<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        &self.reader
    }
}

impl<R> DerefMut for PackfileReader<R> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.reader
    }
}

impl crate::repo::KeelRepo {
    /// reads an incoming pack stream and writes each object loose, resolving
    /// deltas against earlier pack entries (or the local store for base-oid
    /// references); the trailing checksum is verified first
    pub fn unpack_objects(&self, bytes: &[u8]) -> KeelResult<Vec<Oid>> {
        ensure!(bytes.len() >= 12 + OID_SIZE, "pack stream too short");
        let (body, trailer) = bytes.split_at(bytes.len() - OID_SIZE);
        let checksum = crate::hash::hash_bytes(body);
        ensure_eq!(checksum.as_ref(), trailer, "pack checksum mismatch");

        let mut reader = PackfileReader::new(BufReader::new(std::io::Cursor::new(bytes)))?;
        let objectc = reader.objectc();
        let mut by_offset: FxHashMap<u64, KeelRawObj> = Default::default();
        let mut oids = Vec::with_capacity(objectc as usize);

        for _ in 0..objectc {
            let offset = reader.stream_position()?;
            let resolved = match reader.read_pack_obj()? {
                KeelPackObjRawDeltified::Raw(raw) => raw,
                KeelPackObjRawDeltified::Ofs(ofs, delta) => {
                    let base = by_offset.get(&(offset - ofs)).ok_or_else(|| {
                        anyhow!("missing delta base at pack offset `{}`", offset - ofs)
                    })?;
                    base.expand_with_delta_bytes(&delta)?
                }
                KeelPackObjRawDeltified::Ref(base_oid, delta) => {
                    // the base is either earlier in this pack (already written
                    // loose) or was present locally before the fetch
                    let base = self.odb()?.read_raw(base_oid.into())?;
                    base.expand_with_delta_bytes(&delta)?
                }
            };
            let oid = self.write_raw(resolved.obj_type, &resolved.bytes)?;
            by_offset.insert(offset, resolved);
            oids.push(oid);
        }
        Ok(oids)
    }
}
