//! Length-framed JSON envelopes.
//!
//! Every message on the wire is a 4-byte big-endian length followed by a JSON
//! document. Both the plaintext pre-TLS exchange and the encrypted session use
//! the same framing, so upgrading the transport never changes the codec.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::rpc::messages::Fault;

/// Upper bound on a single frame. DHCP configurations for large deployments
/// run to a few megabytes of JSON; anything past this is a protocol error.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    Oversized(usize),
}

/// One message on the wire. `id` correlates a response or fault with the
/// request that caused it; ids are assigned per-connection by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Request {
        id: u64,
        command: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        result: Value,
    },
    Fault {
        id: u64,
        #[serde(flatten)]
        fault: Fault,
    },
}

/// Read one envelope. `Ok(None)` means the peer closed the stream cleanly at
/// a frame boundary; EOF mid-frame is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Envelope>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}

/// Serialize and write one envelope, flushing the stream.
pub async fn write_frame<W>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(body.len()));
    }
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    while buf.has_remaining() {
        writer.write_buf(&mut buf).await?;
    }
    writer.flush().await?;
    Ok(())
}
