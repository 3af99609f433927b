// -- framed I/O --
//
// every message on the wire is `[len: u32 big-endian][bincode payload]`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, Result};

/// Upper bound on a single frame; a larger length prefix is treated as a
/// corrupt stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(NetworkError::Protocol(format!(
            "frame of {} bytes exceeds limit of {}",
            payload.len(),
            MAX_FRAME_LEN
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Returns `Ok(None)` when the peer closed the stream
/// cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::Protocol(format!(
            "incoming frame of {} bytes exceeds limit of {}",
            len, MAX_FRAME_LEN
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(bincode::deserialize(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RpcRequest, RpcResponse};

    #[tokio::test]
    async fn frames_survive_a_duplex_pipe() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = RpcRequest::parse("PUT a 'b c' EX 5").unwrap();
        write_frame(&mut client, &request).await.unwrap();
        let received: RpcRequest = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(received, request);

        let response = RpcResponse::ok_with("1").with_correlation_id("abc");
        write_frame(&mut server, &response).await.unwrap();
        let received: RpcResponse = read_frame(&mut client).await.unwrap().unwrap();
        assert_eq!(received, response);
    }

    #[tokio::test]
    async fn clean_close_yields_none() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        let frame: Option<RpcResponse> = read_frame(&mut server).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client
            .write_all(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes())
            .await
            .unwrap();
        let result: Result<Option<RpcResponse>> = read_frame(&mut server).await;
        assert!(matches!(result, Err(NetworkError::Protocol(_))));
    }
}
