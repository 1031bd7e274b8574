//! Network Module
//!
//! Framed TCP communication between pair processes and clients.

mod client;
mod server;

pub use client::NetClient;
pub use server::{MessageHandler, NetServer};

use crate::error::{Error, Result};
use crate::replication::{FrameHeader, Message};

/// Read a framed message from a reader
pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    use tokio::io::AsyncReadExt;

    // Read header
    let mut header_bytes = [0u8; FrameHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes);

    // Read body
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;

    // Verify checksum
    let computed_checksum = crc32fast::hash(&body);
    if computed_checksum != header.checksum {
        return Err(Error::Network("Message checksum mismatch".into()));
    }

    let message = Message::deserialize(&body)?;
    Ok(message)
}

/// Write a framed message to a writer
pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = message.serialize()?;
    let header = FrameHeader::new(&body);

    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_framed_roundtrip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let msg = Message::RoleQuery;
        write_message(&mut a, &msg).await.unwrap();

        let restored = read_message(&mut b).await.unwrap();
        assert!(matches!(restored, Message::RoleQuery));
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        use tokio::io::AsyncWriteExt;

        let (mut a, mut b) = tokio::io::duplex(4096);

        let body = Message::RoleQuery.serialize().unwrap();
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 0xdead_beef;

        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&body).await.unwrap();

        let err = read_message(&mut b).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
    }
}
