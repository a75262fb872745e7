//! Connection handshake.
//!
//! Each side writes its preamble (4 bytes) and a protocol version (2 bytes).
//! The client offers its latest version; the server answers with that
//! version when it knows it and with its own latest otherwise.

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{MessagingError, ProtocolVersion, Result};

pub(crate) const HANDSHAKE_LENGTH: usize = 6;

/// Cluster identity checksum exchanged at handshake.
pub fn preamble(cluster_id: &str) -> i32 {
    let digest = Sha256::digest(cluster_id.as_bytes());
    i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn encode(preamble: i32, version: u16) -> [u8; HANDSHAKE_LENGTH] {
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    buf[..4].copy_from_slice(&preamble.to_be_bytes());
    buf[4..].copy_from_slice(&version.to_be_bytes());
    buf
}

async fn read<S>(stream: &mut S) -> Result<(i32, u16)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LENGTH];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| MessagingError::HandshakeFailed(format!("reading handshake: {e}")))?;
    let preamble = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let version = u16::from_be_bytes([buf[4], buf[5]]);
    Ok((preamble, version))
}

/// Client side: offer the latest version, accept what the server picks.
pub(crate) async fn client_handshake<S>(stream: &mut S, preamble: i32) -> Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let offered = ProtocolVersion::latest();
    stream
        .write_all(&encode(preamble, offered.version()))
        .await
        .map_err(|e| MessagingError::HandshakeFailed(format!("writing handshake: {e}")))?;
    stream.flush().await?;

    let (remote_preamble, version) = read(stream).await?;
    if remote_preamble != preamble {
        warn!(expected = preamble, received = remote_preamble, "Received invalid handshake, closing connection");
        return Err(MessagingError::HandshakeFailed(format!(
            "preamble mismatch: expected {preamble}, received {remote_preamble}"
        )));
    }
    let version = ProtocolVersion::from_version(version).ok_or_else(|| {
        MessagingError::HandshakeFailed(format!("server chose unknown protocol version {version}"))
    })?;
    debug!(version = version.version(), "Client handshake complete");
    Ok(version)
}

/// Server side: validate the client's preamble and pick the version.
pub(crate) async fn server_handshake<S>(stream: &mut S, preamble: i32) -> Result<ProtocolVersion>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (remote_preamble, offered) = read(stream).await?;
    if remote_preamble != preamble {
        warn!(expected = preamble, received = remote_preamble, "Received invalid handshake, closing connection");
        return Err(MessagingError::HandshakeFailed(format!(
            "preamble mismatch: expected {preamble}, received {remote_preamble}"
        )));
    }

    let version = ProtocolVersion::from_version(offered).unwrap_or_else(ProtocolVersion::latest);
    stream
        .write_all(&encode(preamble, version.version()))
        .await
        .map_err(|e| MessagingError::HandshakeFailed(format!("writing handshake: {e}")))?;
    stream.flush().await?;
    debug!(offered, version = version.version(), "Server handshake complete");
    Ok(version)
}
