use crate::error::{KeelGenericError, KeelResult};
use crate::hash::Sha1Hash;
use crate::obj::Oid;
use crate::serialize::Deserialize;
use sha1::{Digest, Sha1};
use std::fmt::Display;
use std::fs::File;
use std::io::{self, prelude::*, BufReader};
use std::str::FromStr;

pub type BufferedFileStream = BufReader<File>;

// all integers are big-endian unless noted otherwise
pub(crate) trait ReadExt: Read {
    #[inline]
    fn read_u8(&mut self) -> io::Result<u8> {
        let mut i = 0u8;
        self.read_exact(std::slice::from_mut(&mut i))?;
        Ok(i)
    }

    /// read the offset encoding used by delta records that reference their base
    /// by a back-offset; each continuation adds one to the accumulated value
    fn read_offset(&mut self) -> io::Result<u64> {
        let mut byte = self.read_u8()? as u64;
        let mut offset = byte & 0x7f;
        while byte & 0x80 != 0 {
            offset += 1;
            byte = self.read_u8()? as u64;
            offset = (offset << 7) | (byte & 0x7f);
        }
        Ok(offset)
    }

    #[inline]
    /// alias for `read_le_varint` with a more intuitive name
    fn read_size(&mut self) -> io::Result<u64> {
        self.read_le_varint()
    }

    #[inline]
    // variable length little-endian integer encoding
    // read the next byte while the MSB is 1
    fn read_le_varint(&mut self) -> io::Result<u64> {
        self.read_le_varint_with_shift(0).map(|x| x.1)
    }

    // `init_shift` extracts a second small number from the leading bits of the
    // first byte (the pack object type lives in bits 4..7 of the first byte)
    fn read_le_varint_with_shift(&mut self, init_shift: u64) -> io::Result<(u8, u64)> {
        // cannot shift more than 7 as the MSB is reserved
        assert!(init_shift < 8);
        let mut n = 0;
        let byte = self.read_u8()?;
        let anti_shift = 7 - init_shift;
        let k_mask = ((1u32 << init_shift) - 1) << anti_shift;
        let k = (byte & k_mask as u8) >> anti_shift;

        let mask = (1 << anti_shift) - 1;
        n |= (byte & mask) as u64;

        if byte & 0x80 != 0 {
            let mut shift = 7 - init_shift;
            loop {
                let byte = self.read_u8()? as u64;
                n |= (byte & 0x7f) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
        }

        Ok((k, n))
    }

    /// format used for the delta copy operation
    /// the header byte must have its MSB set; bit i of the header says whether
    /// byte i of the packed little-endian value is present on disk
    fn read_le_packed(&mut self, header: u8) -> io::Result<u64> {
        debug_assert!(header & 1 << 7 != 0);
        let mut value = 0;
        for i in 0..7 {
            if header & 1 << i == 0 {
                continue;
            }

            let byte = self.read_u8()? as u64;
            value |= byte << (i * 8)
        }
        Ok(value)
    }

    #[inline]
    fn read_u32(&mut self) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    #[inline]
    fn read_u64(&mut self) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    #[inline]
    fn read_oid(&mut self) -> io::Result<Oid> {
        let mut buf = [0u8; 20];
        self.read_exact(&mut buf)?;
        Ok(Oid::new(buf))
    }

    #[inline]
    fn read_to_str(&mut self) -> io::Result<String> {
        let mut buf = String::new();
        self.read_to_string(&mut buf)?;
        Ok(buf)
    }

    #[inline]
    fn read_to_vec(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![];
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl<R: Read + ?Sized> ReadExt for R {
}

impl Deserialize for u8 {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        Ok(reader.read_u8()?)
    }
}

impl Deserialize for u32 {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        Ok(reader.read_u32()?)
    }
}

impl Deserialize for u64 {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        Ok(reader.read_u64()?)
    }
}

impl Deserialize for Oid {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        Ok(reader.read_oid()?)
    }
}

impl Deserialize for Vec<u8> {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self> {
        Ok(reader.read_to_vec()?)
    }
}

pub trait BufReadExtSized: BufRead + Sized {
    fn read_type<T: Deserialize>(&mut self) -> KeelResult<T> {
        T::deserialize(self)
    }

    fn read_vec<T: Deserialize>(&mut self, n: usize) -> KeelResult<Vec<T>> {
        let mut vec = Vec::with_capacity(n);
        for _ in 0..n {
            vec.push(T::deserialize(&mut *self)?);
        }
        Ok(vec)
    }

    fn read_fanout(&mut self) -> KeelResult<[u32; 256]> {
        let mut fanout = [0u32; 256];
        for entry in fanout.iter_mut() {
            *entry = self.read_u32()?;
        }
        Ok(fanout)
    }
}

impl<R: BufRead> BufReadExtSized for R {
}

pub trait BufReadExt: BufRead {
    /// read the bytes up to `sep` parsing them as a base10 ascii number
    fn read_ascii_num(&mut self, sep: u8) -> KeelResult<i64> {
        let mut buf = vec![];
        let i = self.read_until(sep, &mut buf)?;
        ensure!(i > 0, "unexpected eof reading ascii number");
        let end = if buf[i - 1] == sep { i - 1 } else { i };
        Ok(std::str::from_utf8(&buf[..end])?.parse()?)
    }

    /// read the bytes up to `sep` parsing them as an ascii str
    fn read_ascii_str<T: FromStr<Err = KeelGenericError>>(&mut self, sep: u8) -> KeelResult<T> {
        let mut buf = vec![];
        let i = self.read_until(sep, &mut buf)?;
        ensure!(i > 0, "unexpected eof reading ascii str");
        let end = if buf[i - 1] == sep { i - 1 } else { i };
        std::str::from_utf8(&buf[..end])?.parse()
    }

    fn read_null_terminated_bytes(&mut self) -> KeelResult<Vec<u8>> {
        let mut buf = vec![];
        let i = self.read_until(0, &mut buf)?;
        ensure!(i > 0, "unexpected eof reading null terminated bytes");
        if buf.last() == Some(&0) {
            buf.pop();
        }
        Ok(buf)
    }

    fn is_at_eof(&mut self) -> io::Result<bool> {
        Ok(self.fill_buf()?.is_empty())
    }
}

impl<R: BufRead + ?Sized> BufReadExt for R {
}

pub trait WriteExt: Write {
    fn write_u8(&mut self, u: u8) -> io::Result<()> {
        self.write_all(std::slice::from_ref(&u))
    }

    fn write_u32(&mut self, u: u32) -> io::Result<()> {
        self.write_all(&u.to_be_bytes())
    }

    fn write_u64(&mut self, u: u64) -> io::Result<()> {
        self.write_all(&u.to_be_bytes())
    }

    fn write_ascii_num(&mut self, i: impl Display, sep: u8) -> io::Result<()> {
        self.write_all(i.to_string().as_bytes())?;
        self.write_u8(sep)
    }

    fn write_oid(&mut self, oid: Oid) -> io::Result<()> {
        self.write_all(oid.as_bytes())
    }

    /// write the `(type, size)` header of a packed record: the pack object type
    /// occupies bits 4..7 of the first byte, the size continues little-endian
    /// varint style
    fn write_pack_obj_header(&mut self, obj_type: u8, size: u64) -> io::Result<()> {
        let mut size = size;
        let mut byte = (obj_type << 4) | (size & 0x0f) as u8;
        size >>= 4;
        while size != 0 {
            self.write_u8(byte | 0x80)?;
            byte = (size & 0x7f) as u8;
            size >>= 7;
        }
        self.write_u8(byte)
    }
}

impl<W: Write + ?Sized> WriteExt for W {
}

/// hashes all the bytes read through the reader
pub(crate) struct HashReader<'a, D> {
    reader: &'a mut dyn BufRead,
    hasher: D,
}

impl<'a, D: Digest> BufRead for HashReader<'a, D> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl<'a, D: Digest> Read for HashReader<'a, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

impl<'a, D: Digest> HashReader<'a, D> {
    pub fn new(reader: &'a mut dyn BufRead) -> Self {
        Self { reader, hasher: D::new() }
    }
}

impl<'a> HashReader<'a, Sha1> {
    pub fn new_sha1(reader: &'a mut dyn BufRead) -> Self {
        Self::new(reader)
    }

    pub fn finalize_sha1(&mut self) -> Sha1Hash {
        Sha1Hash::new(self.hasher.finalize_reset().into())
    }
}

/// hashes all the bytes written into the writer
pub(crate) struct HashWriter<'a, D> {
    writer: &'a mut dyn Write,
    hasher: D,
}

impl<'a, D: Digest> Write for HashWriter<'a, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl<'a, D: Digest> HashWriter<'a, D> {
    pub fn new(writer: &'a mut dyn Write) -> Self {
        Self { writer, hasher: D::new() }
    }
}

impl<'a> HashWriter<'a, Sha1> {
    pub fn new_sha1(writer: &'a mut dyn Write) -> Self {
        Self::new(writer)
    }

    /// append the accumulated hash to the stream (the trailer of packs and indexes)
    pub fn write_hash(self) -> io::Result<()> {
        let hash = Sha1Hash::new(self.hasher.finalize().into());
        self.writer.write_oid(hash)
    }
}

#[cfg(test)]
mod tests;
