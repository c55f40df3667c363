use crate::error::KeelResult;
use crate::io::{BufReadExt, BufReadExtSized, ReadExt};
use crate::serialize::{Deserialize, DeserializeSized};
use std::io::BufRead;

/// a parsed delta: copy/insert instructions against a base byte sequence
#[derive(PartialEq, Clone, Debug)]
pub struct Delta {
    source_size: u64,
    target_size: u64,
    ops: Vec<DeltaOp>,
}

impl Delta {
    /// reconstructs the target bytes from the base; a pure function of
    /// `(base, instructions)` so cyclic chains are caught by the caller's
    /// visited set, not in here
    pub fn expand(&self, bytes: impl AsRef<[u8]>) -> KeelResult<Vec<u8>> {
        trace!(
            "Delta::expand(..) (source_size: {} -> target_size: {})",
            self.source_size,
            self.target_size
        );
        let bytes = bytes.as_ref();
        ensure_eq!(
            self.source_size as usize,
            bytes.len(),
            "expected source size to be `{}`, but given source with size `{}`",
            self.source_size,
            bytes.len()
        );

        let mut expanded = Vec::with_capacity(self.target_size as usize);
        for op in &self.ops {
            let slice = match op {
                &DeltaOp::Copy(offset, size) => {
                    let (offset, size) = (offset as usize, size as usize);
                    ensure!(
                        offset + size <= bytes.len(),
                        "delta copy op out of bounds (offset {} size {} of {} base bytes)",
                        offset,
                        size,
                        bytes.len()
                    );
                    &bytes[offset..offset + size]
                }
                DeltaOp::Insert(slice) => slice.as_slice(),
            };
            expanded.extend_from_slice(slice)
        }

        ensure_eq!(
            self.target_size as usize,
            expanded.len(),
            "expected target size to be `{}`, but got expanded target with size `{}`",
            self.target_size,
            expanded.len()
        );

        Ok(expanded)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum DeltaOp {
    /// copy (offset, size) out of the base
    Copy(u64, u64),
    Insert(Vec<u8>),
}

impl Deserialize for DeltaOp {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        // the MSB of the first byte selects `Copy` or `Insert`
        let byte = reader.read_u8()?;
        if byte & 0x80 != 0 {
            let n = reader.read_le_packed(byte)?;
            let (offset, mut size) = (n & 0xFFFFFFFF, n >> 32);
            // a size of zero on disk means 0x10000
            if size == 0 {
                size = 0x10000
            }
            Ok(Self::Copy(offset, size))
        } else {
            let n = byte as usize & 0x7f;
            ensure!(n > 0, "delta insert op with zero length");
            reader.read_vec::<u8>(n).map(Self::Insert)
        }
    }
}

impl DeserializeSized for Delta {
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> KeelResult<Self> {
        let source_size = r.read_size()?;
        let target_size = r.read_size()?;
        trace!(
            "Delta::deserialize_sized(size: {}); source_size: {}; target_size: {}",
            size,
            source_size,
            target_size
        );
        let mut taken = std::io::Read::take(&mut *r, size);
        let r = &mut taken;
        let mut ops = vec![];

        while !r.is_at_eof()? {
            ops.push(DeltaOp::deserialize(r)?);
        }

        Ok(Self { source_size, target_size, ops })
    }
}

#[cfg(test)]
mod tests;
