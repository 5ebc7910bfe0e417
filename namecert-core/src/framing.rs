//! Length-delimited packet framing for stream transports.
//!
//! One interest or data packet per frame: a 4-byte big-endian length
//! prefix followed by the packet wire encoding.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single packet; certificates and sealed payloads stay
/// far below this.
const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Read one framed packet.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Bytes> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }

    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

/// Write one framed packet.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, packet: &[u8]) -> io::Result<()> {
    if packet.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit", packet.len()),
        ));
    }
    writer.write_all(&(packet.len() as u32).to_be_bytes()).await?;
    writer.write_all(packet).await?;
    writer.flush().await?;
    Ok(())
}
