use crate::error::{KeelError, KeelResult};
use crate::obj::Oid;
use std::time::Duration;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// a frame is a 4-hex-digit length header (counting itself) followed by the
/// payload; `0000` is the flush frame. the length must lie in {0} ∪ [4, 65520].
pub const MAX_PKT_LEN: usize = 65520;
const PKT_HEADER_LEN: usize = 4;

#[async_trait]
pub trait KeelProtocolRead: AsyncRead + Unpin + Send {
    /// reads one frame; a flush frame yields an empty payload
    async fn recv_packet(&mut self) -> KeelResult<Vec<u8>> {
        let mut buf = [0; PKT_HEADER_LEN];
        self.read_exact(&mut buf).await?;
        let n = parse_pkt_len(&buf)?;
        if n == 0 {
            // flush
            return Ok(vec![]);
        }
        let mut contents = vec![0; n - PKT_HEADER_LEN];
        self.read_exact(&mut contents).await?;
        Ok(contents)
    }

    /// reads one frame, bounding the wait; `None` timeout waits forever
    async fn recv_packet_timeout(&mut self, timeout: Option<Duration>) -> KeelResult<Vec<u8>> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, self.recv_packet())
                .await
                .map_err(|_| anyhow!(KeelError::ProtocolError("read timed out".to_owned())))?,
            None => self.recv_packet().await,
        }
    }

    /// receives frames until a flush, yielding the payloads
    async fn recv_message(&mut self) -> KeelResult<Vec<Vec<u8>>> {
        let mut packets = vec![];
        loop {
            let packet = self.recv_packet().await?;
            if packet.is_empty() {
                break Ok(packets);
            }
            packets.push(packet);
        }
    }
}

impl<R: AsyncRead + Unpin + Send> KeelProtocolRead for R {
}

fn parse_pkt_len(header: &[u8; 4]) -> KeelResult<usize> {
    let s = std::str::from_utf8(header)
        .map_err(|_| anyhow!(KeelError::ProtocolError("non-ascii frame length".to_owned())))?;
    let n = usize::from_str_radix(s, 16)
        .map_err(|_| anyhow!(KeelError::ProtocolError(format!("bad frame length `{}`", s))))?;
    // malformed lengths are fatal for the receiver
    ensure!(
        n == 0 || (PKT_HEADER_LEN..=MAX_PKT_LEN).contains(&n),
        KeelError::ProtocolError(format!("frame length `{:#x}` out of range", n))
    );
    Ok(n)
}

#[async_trait]
pub trait KeelProtocolWrite: AsyncWrite + Unpin + Send {
    async fn write_packet(&mut self, bytes: &[u8]) -> io::Result<()> {
        assert!(PKT_HEADER_LEN + bytes.len() <= MAX_PKT_LEN);
        let length = format!("{:04x}", PKT_HEADER_LEN + bytes.len());
        debug_assert_eq!(length.len(), 4);
        self.write_all(length.as_bytes()).await?;
        self.write_all(bytes).await?;
        Ok(())
    }

    #[inline]
    async fn write_flush_packet(&mut self) -> io::Result<()> {
        self.write_all(b"0000").await?;
        self.flush().await
    }

    async fn want(&mut self, oid: Oid) -> io::Result<()> {
        self.write_packet(format!("want {}\n", oid).as_bytes()).await
    }

    async fn want_with_capabilities(&mut self, oid: Oid, caps: &str) -> io::Result<()> {
        self.write_packet(format!("want {} {}\n", oid, caps).as_bytes()).await
    }

    async fn have(&mut self, oid: Oid) -> io::Result<()> {
        self.write_packet(format!("have {}\n", oid).as_bytes()).await
    }

    async fn done(&mut self) -> io::Result<()> {
        self.write_packet(b"done\n").await?;
        self.flush().await
    }
}

impl<W: AsyncWrite + Unpin + Send> KeelProtocolWrite for W {
}

/// strips the trailing newline the way the wire peers do
pub fn strip_line(line: &[u8]) -> &[u8] {
    match line.split_last() {
        Some((&b'\n', rest)) => rest,
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeelResult;

    #[tokio::test]
    async fn packet_round_trip() -> KeelResult<()> {
        let mut buf = vec![];
        buf.write_packet(b"want cafebabe\n").await?;
        buf.write_flush_packet().await?;

        let mut reader = buf.as_slice();
        assert_eq!(reader.recv_packet().await?, b"want cafebabe\n");
        assert_eq!(reader.recv_packet().await?, b"");
        Ok(())
    }

    #[tokio::test]
    async fn flush_frame_is_length_zero() -> KeelResult<()> {
        let mut buf = vec![];
        buf.write_flush_packet().await?;
        assert_eq!(buf, b"0000");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_length_is_fatal() {
        let mut reader = b"zzzz".as_slice();
        assert!(reader.recv_packet().await.is_err());

        // 1..3 are not representable lengths
        let mut reader = b"0002".as_slice();
        assert!(reader.recv_packet().await.is_err());
    }

    #[tokio::test]
    async fn recv_message_collects_until_flush() -> KeelResult<()> {
        let mut buf = vec![];
        buf.write_packet(b"a").await?;
        buf.write_packet(b"b").await?;
        buf.write_flush_packet().await?;
        buf.write_packet(b"after").await?;

        let mut reader = buf.as_slice();
        assert_eq!(reader.recv_message().await?, vec![b"a".to_vec(), b"b".to_vec()]);
        Ok(())
    }
}
