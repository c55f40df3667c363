use crate::error::KeelGenericError;
use crate::obj::{KeelObjType, Oid};
use rustc_hex::{FromHex, ToHex};
use sha1::{Digest, Sha1};
use std::fmt::{self, Debug, Display, Formatter};
use std::ops::Index;
use std::slice::SliceIndex;
use std::str::FromStr;

pub const OID_SIZE: usize = std::mem::size_of::<Oid>();

#[derive(PartialEq, Eq, Hash, Clone, Ord, PartialOrd, Copy)]
#[repr(transparent)]
pub struct Sha1Hash([u8; 20]);

impl Sha1Hash {
    /// hash of an empty blob
    // e69de29bb2d1d6434b8b29ae775ad8c2e48c5391
    pub const EMPTY_BLOB: Self = Self([
        0xe6, 0x9d, 0xe2, 0x9b, 0xb2, 0xd1, 0xd6, 0x43, 0x4b, 0x8b, 0x29, 0xae, 0x77, 0x5a, 0xd8,
        0xc2, 0xe4, 0x8c, 0x53, 0x91,
    ]);
    /// hash of an empty tree
    // 4b825dc642cb6eb9a060e54bf8d69288fbee4904
    pub const EMPTY_TREE: Self = Self([
        0x4b, 0x82, 0x5d, 0xc6, 0x42, 0xcb, 0x6e, 0xb9, 0xa0, 0x60, 0xe5, 0x4b, 0xf8, 0xd6, 0x92,
        0x88, 0xfb, 0xee, 0x49, 0x04,
    ]);
    /// the all-zero hash representing an unknown identity
    pub const UNKNOWN: Self = Self([0; 20]);

    #[inline]
    pub fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    #[inline]
    pub fn is_unknown(self) -> bool {
        self == Self::UNKNOWN
    }

    #[inline]
    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex()
    }

    pub fn short(&self) -> String {
        self.to_hex()[0..7].to_owned()
    }
}

#[cfg(test)]
impl<'a> From<&'a str> for Sha1Hash {
    fn from(s: &'a str) -> Self {
        Self::from_str(s).unwrap()
    }
}

#[cfg(test)]
impl quickcheck::Arbitrary for Sha1Hash {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
        let mut bytes = [0u8; 20];
        for byte in &mut bytes {
            *byte = u8::arbitrary(g);
        }
        Self(bytes)
    }
}

impl FromStr for Sha1Hash {
    type Err = KeelGenericError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_end();
        ensure!(s.len() == 40, "creating oid with invalid hex string (incorrect length)");
        let bytes = s.from_hex::<Vec<u8>>()?;
        Ok(Self(bytes.as_slice().try_into().expect("length checked above")))
    }
}

impl AsRef<[u8]> for Sha1Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl<I> Index<I> for Sha1Hash
where
    I: SliceIndex<[u8]>,
{
    type Output = I::Output;

    fn index(&self, index: I) -> &Self::Output {
        &self.0[index]
    }
}

impl Debug for Sha1Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for Sha1Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = self.0.to_hex::<String>();
        if f.alternate() { write!(f, "{}", &hex[..7]) } else { write!(f, "{}", hex) }
    }
}

pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    Sha1Hash::new(hasher.finalize().into())
}

/// identity of an object is the hash of its serialized form including the
/// `<kind> <len>\0` header
pub fn hash_obj_bytes(obj_type: KeelObjType, bytes: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(format!("{} {}\0", obj_type, bytes.len()));
    hasher.update(bytes);
    Sha1Hash::new(hasher.finalize().into())
}
