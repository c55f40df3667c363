use crate::error::KeelResult;
use crate::io::{HashWriter, WriteExt};
use crate::obj::KeelRawObj;
use crate::pack::{KeelPackObjType, PACK_SIGNATURE, PACK_VERSION};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::Write;

/// serializes a pack stream of plain (non-delta) records:
/// `PACK` magic, version, object count, one deflated record per object, and
/// the sha1 trailer over everything written
pub fn write_pack(objects: &[KeelRawObj], writer: &mut dyn Write) -> KeelResult<()> {
    let mut writer = HashWriter::new_sha1(writer);
    writer.write_all(PACK_SIGNATURE)?;
    writer.write_u32(PACK_VERSION)?;
    writer.write_u32(objects.len() as u32)?;

    for obj in objects {
        let obj_type = KeelPackObjType::from(obj.obj_type);
        writer.write_pack_obj_header(obj_type as u8, obj.bytes.len() as u64)?;
        let mut encoder = ZlibEncoder::new(&mut writer, Compression::default());
        encoder.write_all(&obj.bytes)?;
        encoder.finish()?;
    }

    writer.write_hash()?;
    Ok(())
}
