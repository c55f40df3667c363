use crate::error::KeelResult;
use crate::obj::{self, KeelObjType, Oid, WritableObject};
use crate::serialize::{DeserializeSized, Serialize};
use crate::signature::KeelSignature;
use std::fmt::{self, Display, Formatter};
use std::io::{prelude::*, BufRead};

/// annotated tag: points at a target object of a stated type
#[derive(PartialEq, Clone, Debug)]
pub struct Tag {
    pub target: Oid,
    pub target_type: KeelObjType,
    pub name: String,
    pub tagger: KeelSignature,
    pub message: String,
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut buf = vec![];
        self.serialize(&mut buf).map_err(|_| fmt::Error)?;
        write!(f, "{}", String::from_utf8_lossy(&buf))
    }
}

impl Serialize for Tag {
    fn serialize(&self, writer: &mut dyn Write) -> KeelResult<()> {
        writeln!(writer, "object {}", self.target)?;
        writeln!(writer, "type {}", self.target_type)?;
        writeln!(writer, "tag {}", self.name)?;
        writeln!(writer, "tagger {}", self.tagger)?;
        writeln!(writer)?;
        write!(writer, "{}", self.message)?;
        Ok(())
    }
}

impl DeserializeSized for Tag {
    fn deserialize_sized(r: &mut impl BufRead, size: u64) -> KeelResult<Self> {
        let mut buf = String::new();
        r.take(size).read_to_string(&mut buf)?;
        let mut pos = 0;

        fn expect<'a>(buf: &'a str, pos: &mut usize, key: &str) -> KeelResult<&'a str> {
            obj::next_header_line(buf, pos)
                .and_then(|line| line.strip_prefix(key))
                .ok_or_else(|| anyhow!("bogus tag object, expected `{}` line", key.trim_end()))
        }

        let target = expect(&buf, &mut pos, "object ")?.parse()?;
        let target_type = expect(&buf, &mut pos, "type ")?.parse()?;
        let name = expect(&buf, &mut pos, "tag ")?.to_owned();
        let tagger = expect(&buf, &mut pos, "tagger ")?.parse()?;

        let message = match obj::next_header_line(&buf, &mut pos) {
            Some("") => buf[pos..].to_owned(),
            Some(line) => bail!("expected blank line before tag message, found `{}`", line),
            None => String::new(),
        };

        Ok(Self { target, target_type, name, tagger, message })
    }
}

impl WritableObject for Tag {
    fn obj_ty(&self) -> KeelObjType {
        KeelObjType::Tag
    }
}
