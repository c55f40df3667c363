use crate::error::KeelResult;
use std::io::{prelude::*, BufReader};

pub trait Serialize {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()>;

    fn serialize_to_vec(&self) -> KeelResult<Vec<u8>> {
        let mut buf = vec![];
        self.serialize(&mut buf)?;
        Ok(buf)
    }
}

pub trait BufReadSeek: BufRead + Seek {}

impl<R: BufRead + Seek> BufReadSeek for R {
}

pub trait Deserialize {
    fn deserialize(reader: &mut impl BufRead) -> KeelResult<Self>
    where
        Self: Sized;

    fn deserialize_unbuffered(reader: impl Read) -> KeelResult<Self>
    where
        Self: Sized,
    {
        Self::deserialize(&mut BufReader::new(reader))
    }
}

/// deserialize trait where the number of payload bytes must be known up front
/// (the size comes from the object header, not from the reader itself)
pub trait DeserializeSized {
    fn deserialize_sized(reader: &mut impl BufRead, size: u64) -> KeelResult<Self>
    where
        Self: Sized;

    fn deserialize_from_slice(slice: &[u8]) -> KeelResult<Self>
    where
        Self: Sized,
    {
        Self::deserialize_sized_unbuffered(slice, slice.len() as u64)
    }

    fn deserialize_sized_unbuffered(reader: impl Read, size: u64) -> KeelResult<Self>
    where
        Self: Sized,
    {
        Self::deserialize_sized(&mut BufReader::new(reader), size)
    }
}

impl<D: Deserialize> DeserializeSized for D {
    fn deserialize_sized(reader: &mut impl BufRead, _size: u64) -> KeelResult<Self>
    where
        Self: Sized,
    {
        Self::deserialize(reader)
    }
}
