use crate::error::KeelResult;
use crate::io::ReadExt;
use crate::obj::{KeelObjType, WritableObject};
use crate::serialize::{DeserializeSized, Serialize};
use std::fmt::{self, Debug, Display, Formatter};
use std::io::{BufRead, Read, Write};

/// opaque byte sequence
#[derive(PartialEq, Clone)]
pub struct Blob {
    bytes: Vec<u8>,
}

impl Blob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Debug for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.bytes.len())
    }
}

impl Display for Blob {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

impl Serialize for Blob {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        Ok(writer.write_all(&self.bytes)?)
    }
}

impl DeserializeSized for Blob {
    fn deserialize_sized(reader: &mut impl BufRead, size: u64) -> KeelResult<Self> {
        let bytes = reader.take(size).read_to_vec()?;
        ensure_eq!(bytes.len() as u64, size, "blob payload shorter than its header size");
        Ok(Self { bytes })
    }
}

impl WritableObject for Blob {
    fn obj_ty(&self) -> KeelObjType {
        KeelObjType::Blob
    }
}
