use crate::replication::peer::PeerEnvelope;
use crate::{ChatError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Frames larger than this are rejected outright.
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;

/// Writes one length-prefixed JSON frame: a 4-byte big-endian length
/// followed by the document.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = serde_json::to_vec(value)?;
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. Ok(None) means the peer closed cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ChatError::OversizedFrame(len));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(serde_json::from_slice(&buf)?))
}

/// One unary exchange with `addr`: connect, send, read a single response.
pub async fn request<Req, Resp>(addr: &str, value: &Req, deadline: Duration) -> Result<Resp>
where
    Req: Serialize + Sync,
    Resp: DeserializeOwned,
{
    timeout(deadline, async {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(&mut stream, value).await?;
        read_frame(&mut stream)
            .await?
            .ok_or(ChatError::ConnectionClosed)
    })
    .await
    .map_err(|_| ChatError::Transient(format!("deadline to {} expired", addr)))?
}

/// The seam between the replication manager and the wire, so the state
/// machine can be exercised against an in-memory cluster in tests.
#[async_trait]
pub trait PeerTransport: Send + Sync + 'static {
    async fn send(&self, peer: &str, envelope: PeerEnvelope) -> Result<PeerEnvelope>;
}

/// Production transport: one framed TCP exchange per peer RPC.
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(timeout: Duration) -> Self {
        TcpTransport { timeout }
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn send(&self, peer: &str, envelope: PeerEnvelope) -> Result<PeerEnvelope> {
        request(peer, &envelope, self.timeout).await
    }
}
