//! The peer wire protocol.
//!
//! Every frame is a `u32` little-endian length prefix followed by the rkyv
//! serialized message with a CRC32 checksum attached to the last 4 bytes
//! of the payload.

use std::io;

use rkyv::de::deserializers::SharedDeserializeMap;
use rkyv::{AlignedVec, Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// The hard cap on a single frame's payload.
pub(crate) const MAX_FRAME_SIZE: usize = 8 << 20;

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
/// A gossip announcement of a known peer.
pub(crate) struct PeerAnnouncement {
    pub id: String,
    /// The peer's advertised (dialable) address, not the socket address the
    /// announcing node happens to see it on.
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
#[archive_attr(derive(Debug))]
pub(crate) enum WireMessage {
    /// Identity exchange sent by both sides as soon as the socket is up.
    Verify { id: String, addr: String },
    /// The sender's full known-peer list, sent when a link becomes active.
    PeerList { peers: Vec<PeerAnnouncement> },
    /// Replication of a local write. The expiry is absolute (unix millis,
    /// `0` = never) so replicas expire in lock-step with the origin.
    Put {
        key: String,
        data: Vec<u8>,
        expiry: u64,
    },
    /// A key lookup on behalf of another node's cache miss.
    GetReq { request_id: u64, key: String },
    /// The reply to a [`WireMessage::GetReq`]; `data` is `None` when the
    /// peer has no live value for the key.
    GetRsp {
        request_id: u64,
        data: Option<Vec<u8>>,
    },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum WireError {
    #[error("failed to serialize message")]
    Serialize,
    #[error("frame payload is corrupted or malformed")]
    Corrupted,
    #[error("frame length {0} is out of bounds")]
    FrameTooLarge(usize),
}

/// Produces the frame payload: rkyv bytes with a CRC32 checksum attached to
/// the last 4 bytes.
pub(crate) fn encode(msg: &WireMessage) -> Result<AlignedVec, WireError> {
    let mut buffer = rkyv::to_bytes::<_, 1024>(msg).map_err(|_| WireError::Serialize)?;

    let checksum = crc32fast::hash(&buffer);
    buffer.extend_from_slice(&checksum.to_le_bytes());

    Ok(buffer)
}

/// Validates the checksum and deserializes the payload into an owned message.
pub(crate) fn decode(buffer: &AlignedVec) -> Result<WireMessage, WireError> {
    if buffer.len() < 4 {
        return Err(WireError::Corrupted);
    }

    let end = buffer.len();
    let checksum_bytes = buffer[end - 4..]
        .try_into()
        .map_err(|_| WireError::Corrupted)?;
    let expected_checksum = u32::from_le_bytes(checksum_bytes);

    let payload = &buffer[..end - 4];
    if crc32fast::hash(payload) != expected_checksum {
        return Err(WireError::Corrupted);
    }

    let archived = rkyv::check_archived_root::<WireMessage>(payload)
        .map_err(|_| WireError::Corrupted)?;

    archived
        .deserialize(&mut SharedDeserializeMap::default())
        .map_err(|_| WireError::Corrupted)
}

pub(crate) async fn write_frame<W>(writer: &mut W, msg: &WireMessage) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = encode(msg).map_err(invalid_data)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(invalid_data(WireError::FrameTooLarge(payload.len())));
    }

    writer.write_u32_le(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<WireMessage>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32_le().await? as usize;
    if len < 4 || len > MAX_FRAME_SIZE {
        return Err(invalid_data(WireError::FrameTooLarge(len)));
    }

    let mut scratch = vec![0u8; len];
    reader.read_exact(&mut scratch).await?;

    // Copy into an aligned buffer before validating the archived root.
    let mut buffer = AlignedVec::with_capacity(len);
    buffer.extend_from_slice(&scratch);

    decode(&buffer).map_err(invalid_data)
}

fn invalid_data(error: WireError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, error)
}
