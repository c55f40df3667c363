use super::*;
use crate::error::KeelResult;
use std::io::Write;

#[test]
fn pack_obj_header_round_trips() -> KeelResult<()> {
    for &(ty, size) in
        &[(1u8, 0u64), (3, 15), (2, 16), (7, 123456), (6, u32::MAX as u64), (4, 1)]
    {
        let mut buf = vec![];
        buf.write_pack_obj_header(ty, size)?;
        let (read_ty, read_size) = buf.as_slice().read_le_varint_with_shift(3)?;
        assert_eq!((read_ty, read_size), (ty, size), "failed for type {} size {}", ty, size);
    }
    Ok(())
}

#[test]
fn read_ascii_num_stops_at_separator() -> KeelResult<()> {
    let mut reader = &b"1234\0rest"[..];
    assert_eq!(reader.read_ascii_num(0x00)?, 1234);
    assert_eq!(reader, b"rest");
    Ok(())
}

#[test]
fn read_ascii_num_at_eof_without_separator() -> KeelResult<()> {
    let mut reader = &b"42"[..];
    assert_eq!(reader.read_ascii_num(0x00)?, 42);
    Ok(())
}

#[test]
fn null_terminated_bytes() -> KeelResult<()> {
    let mut reader = &b"hello\0world"[..];
    assert_eq!(reader.read_null_terminated_bytes()?, b"hello");
    assert_eq!(reader, b"world");
    Ok(())
}

#[test]
fn big_endian_ints() -> KeelResult<()> {
    let mut buf = vec![];
    buf.write_u32(0xdeadbeef)?;
    buf.write_u64(0x0123456789abcdef)?;
    let mut reader = buf.as_slice();
    assert_eq!(reader.read_u32()?, 0xdeadbeef);
    assert_eq!(reader.read_u64()?, 0x0123456789abcdef);
    Ok(())
}

#[test]
fn hash_writer_appends_trailer() -> KeelResult<()> {
    let mut buf = vec![];
    let mut writer = HashWriter::new_sha1(&mut buf);
    writer.write_all(b"some data")?;
    writer.write_hash()?;

    assert_eq!(buf.len(), 9 + 20);
    assert_eq!(&buf[9..], crate::hash::hash_bytes(b"some data").as_bytes());
    Ok(())
}
