//! Length-prefixed JSON framing
//!
//! Wire format:  [4-byte big-endian length][JSON payload]
//!
//! Reading and decoding are separate steps so a frame that arrives intact but
//! does not parse can be dropped without tearing the stream down.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Default maximum frame size
pub const DEFAULT_MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Read one frame body from a stream
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R, max_len: u32) -> anyhow::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > max_len {
        return Err(anyhow::anyhow!(
            "Frame too large: {} bytes (max {})",
            len,
            max_len
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Decode a frame body
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> anyhow::Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Read and decode one frame
pub async fn read_framed<R, T>(reader: &mut R, max_len: u32) -> anyhow::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: DeserializeOwned,
{
    let body = read_frame(reader, max_len).await?;
    decode(&body)
}

/// Write a length-prefixed JSON message to a stream
pub async fn write_framed<W, T>(writer: &mut W, msg: &T, max_len: u32) -> anyhow::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let json = serde_json::to_vec(msg)?;
    let len = u32::try_from(json.len()).unwrap_or(u32::MAX);
    if len > max_len {
        return Err(anyhow::anyhow!(
            "Frame too large: {} bytes (max {})",
            json.len(),
            max_len
        ));
    }

    writer.write_u32(len).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DirectMessage;

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        for i in 0..3 {
            let msg = DirectMessage::Task {
                task_id: format!("task-{i}"),
                code: "true".into(),
            };
            write_framed(&mut client, &msg, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        }

        for i in 0..3 {
            let msg: DirectMessage = read_framed(&mut server, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
            assert_eq!(msg.task_id(), format!("task-{i}"));
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(1024).await.unwrap();

        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (mut client, _server) = tokio::io::duplex(64);
        let msg = DirectMessage::Task {
            task_id: "t".into(),
            code: "x".repeat(100),
        };
        assert!(write_framed(&mut client, &msg, 16).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_body_reads_but_does_not_decode() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(3).await.unwrap();
        client.write_all(b"{x}").await.unwrap();

        let body = read_frame(&mut server, 64).await.unwrap();
        assert!(decode::<DirectMessage>(&body).is_err());
    }

    #[tokio::test]
    async fn test_eof_is_error() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_frame(&mut server, 64).await.is_err());
    }
}
