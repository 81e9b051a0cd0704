//! Framed message exchange over a connected byte stream.
//!
//! A frame is one bincode-encoded message plus an optional raw attachment:
//! `[msg_len: u32 le][att_len: u32 le][message][attachment]`. The receive
//! side bounds the attachment with a caller-provided limit so a rogue peer
//! cannot force an arbitrary allocation.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Sanity bound for the typed message portion of a frame. Attachments are
/// bounded separately by the receive limit.
pub const MAX_MSG_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("stream failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("attachment of {got} bytes exceeds limit of {limit} bytes")]
    TooLarge { got: usize, limit: usize },
}

/// One received frame: the typed message and its (possibly empty)
/// attachment.
#[derive(Debug)]
pub struct Frame<T> {
    pub msg: T,
    pub attachment: Bytes,
}

/// Encode a frame into a single buffer, for callers that need to write it
/// with their own discipline (e.g. a non-blocking one-shot send).
pub fn encode_frame<T: Serialize>(msg: &T, attachment: &[u8]) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(msg).map_err(|err| WireError::Malformed(err.to_string()))?;
    let mut buf = Vec::with_capacity(8 + body.len() + attachment.len());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(attachment.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(attachment);
    Ok(buf)
}

/// Send one frame.
pub async fn send_frame<W, T>(stream: &mut W, msg: &T, attachment: &[u8]) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
    T: Serialize,
{
    let buf = encode_frame(msg, attachment)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Receive one complete frame. An attachment larger than `max_attachment`
/// rejects the frame without reading it.
pub async fn recv_frame<R, T>(stream: &mut R, max_attachment: usize) -> Result<Frame<T>, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
    T: DeserializeOwned,
{
    let msg_len = stream.read_u32_le().await? as usize;
    let att_len = stream.read_u32_le().await? as usize;
    if msg_len == 0 || msg_len > MAX_MSG_SIZE {
        return Err(WireError::Malformed(format!(
            "message length {msg_len} out of range"
        )));
    }
    if att_len > max_attachment {
        return Err(WireError::TooLarge {
            got: att_len,
            limit: max_attachment,
        });
    }
    let mut body = vec![0u8; msg_len];
    stream.read_exact(&mut body).await?;
    let mut attachment = vec![0u8; att_len];
    stream.read_exact(&mut attachment).await?;
    let msg = bincode::deserialize(&body).map_err(|err| WireError::Malformed(err.to_string()))?;
    Ok(Frame {
        msg,
        attachment: Bytes::from(attachment),
    })
}
