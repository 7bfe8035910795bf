//! Wire framing.
//!
//! Both channels carry `(ChunkHeader, payload)` frames. The header occupies
//! exactly 4096 bytes on the wire so header+payload transfers stay block
//! aligned; only the first 32 bytes carry meaning. All integers are
//! little-endian.
//!
//! The control channel carries exactly one frame whose payload is the
//! CBOR-encoded transfer request; data channels carry raw file bytes at
//! `(file_id, file_offset)`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{DraftError, Result};
use crate::fileinfo::FileInfo;

/// Identifies a draft chunk; the low 16 bits carry the protocol version.
pub const CHUNK_MAGIC: u64 = 0x55aa_aa55_da7a_0000;

pub const MAGIC_VERSION_MASK: u64 = 0xffff;
pub const MAGIC_MASK: u64 = !MAGIC_VERSION_MASK;

/// Transfer block granularity; reads and writes are rounded up to this.
pub const BLOCK_SIZE: usize = 4096;

/// Bytes a header occupies on the wire.
pub const CHUNK_HEADER_SIZE: usize = 4096;

/// Leading bytes of the header that carry fields; the rest is padding,
/// zero on send and ignored on receive.
pub const CHUNK_HEADER_DATA_SIZE: usize = 32;

/// Upper bound on the control-channel payload (CBOR transfer request).
pub const MAX_CONTROL_PAYLOAD: u64 = 64 * 1024 * 1024;

pub const fn round_block_size(len: u64) -> u64 {
    (len + BLOCK_SIZE as u64 - 1) & !(BLOCK_SIZE as u64 - 1)
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChunkFlags: u8 {
        /// Reserved continuation bit; carried through unchanged.
        const MORE = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub magic: u64,
    pub file_offset: u64,
    pub payload_length: u64,
    pub file_id: u16,
    pub flags: ChunkFlags,
}

impl ChunkHeader {
    pub fn new(file_id: u16, file_offset: u64, payload_length: u64) -> Self {
        Self {
            magic: CHUNK_MAGIC,
            file_offset,
            payload_length,
            file_id,
            flags: ChunkFlags::empty(),
        }
    }

    /// True when the top 48 bits identify a draft chunk, whatever the
    /// version bits say.
    pub fn magic_valid(&self) -> bool {
        self.magic & MAGIC_MASK == CHUNK_MAGIC & MAGIC_MASK
    }

    pub fn version(&self) -> u16 {
        (self.magic & MAGIC_VERSION_MASK) as u16
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE);
        buf.put_u64_le(self.magic);
        buf.put_u64_le(self.file_offset);
        buf.put_u64_le(self.payload_length);
        buf.put_u16_le(self.file_id);
        buf.put_u8(self.flags.bits());
        buf.put_bytes(0, CHUNK_HEADER_SIZE - buf.len());
        buf.freeze()
    }

    /// Parse a header from the leading bytes of `buf`, validating the magic.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < CHUNK_HEADER_DATA_SIZE {
            return Err(DraftError::InvalidFrame(format!(
                "short chunk header: {} bytes",
                buf.len()
            )));
        }

        let magic = buf.get_u64_le();
        let file_offset = buf.get_u64_le();
        let payload_length = buf.get_u64_le();
        let file_id = buf.get_u16_le();
        let flags = ChunkFlags::from_bits_truncate(buf.get_u8());

        let header = Self {
            magic,
            file_offset,
            payload_length,
            file_id,
            flags,
        };

        if !header.magic_valid() {
            return Err(DraftError::InvalidFrame(format!(
                "bad chunk magic: {magic:#018x}"
            )));
        }

        Ok(header)
    }
}

/// The control-channel message: announces every file in the transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    #[serde(rename = "type")]
    pub kind: u8,
    pub client: u8,
    pub info: Vec<FileInfo>,
}

impl TransferRequest {
    pub fn new(info: Vec<FileInfo>) -> Self {
        Self {
            kind: 0,
            client: 0,
            info,
        }
    }
}

/// Frame a transfer request: one chunk header, CBOR body.
pub fn encode_transfer_request(info: &[FileInfo]) -> Result<Bytes> {
    let req = TransferRequest::new(info.to_vec());

    let mut payload = Vec::new();
    ciborium::into_writer(&req, &mut payload)
        .map_err(|e| DraftError::InvalidFrame(format!("transfer request encode: {e}")))?;

    let header = ChunkHeader::new(0, 0, payload.len() as u64);

    let mut buf = BytesMut::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    buf.put(header.encode());
    buf.put_slice(&payload);

    Ok(buf.freeze())
}

pub async fn send_transfer_request<W>(writer: &mut W, info: &[FileInfo]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let msg = encode_transfer_request(info)?;
    writer.write_all(&msg).await?;
    writer.flush().await?;

    tracing::debug!(len = msg.len(), files = info.len(), "sent transfer request");

    Ok(())
}

/// Read exactly one framed transfer request from the control channel.
pub async fn read_transfer_request<R>(reader: &mut R) -> Result<Vec<FileInfo>>
where
    R: AsyncRead + Unpin,
{
    let mut hdr = vec![0u8; CHUNK_HEADER_SIZE];
    reader.read_exact(&mut hdr).await?;

    let header = ChunkHeader::decode(&hdr)?;

    if header.payload_length > MAX_CONTROL_PAYLOAD {
        return Err(DraftError::InvalidFrame(format!(
            "transfer request payload too large: {}",
            header.payload_length
        )));
    }

    let mut payload = vec![0u8; header.payload_length as usize];
    reader.read_exact(&mut payload).await?;

    let req: TransferRequest = ciborium::from_reader(payload.as_slice())
        .map_err(|e| DraftError::InvalidFrame(format!("transfer request decode: {e}")))?;

    tracing::debug!(files = req.info.len(), "received transfer request");

    Ok(req.info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileinfo::FileStatus;

    #[test]
    fn test_header_roundtrip() {
        let header = ChunkHeader::new(42, 0x1000, 0x2000);
        let encoded = header.encode();

        assert_eq!(encoded.len(), CHUNK_HEADER_SIZE);
        // padding is zero
        assert!(encoded[CHUNK_HEADER_DATA_SIZE..].iter().all(|&b| b == 0));

        let decoded = ChunkHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.version(), 0);
    }

    #[test]
    fn test_magic_masks_version_bits() {
        let mut header = ChunkHeader::new(1, 0, 512);
        header.magic = CHUNK_MAGIC | 0x0003;

        let decoded = ChunkHeader::decode(&header.encode()).unwrap();
        assert!(decoded.magic_valid());
        assert_eq!(decoded.version(), 3);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut header = ChunkHeader::new(1, 0, 512);
        header.magic = 0xdead_beef_dead_beef;

        match ChunkHeader::decode(&header.encode()) {
            Err(DraftError::InvalidFrame(_)) => {}
            other => panic!("expected InvalidFrame, got {other:?}"),
        }
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(ChunkHeader::decode(&[0u8; 16]).is_err());
    }

    #[test]
    fn test_round_block_size() {
        assert_eq!(round_block_size(0), 0);
        assert_eq!(round_block_size(1), 4096);
        assert_eq!(round_block_size(4096), 4096);
        assert_eq!(round_block_size(4097), 8192);
    }

    #[tokio::test]
    async fn test_transfer_request_roundtrip() {
        let info = vec![FileInfo {
            path: "a/b.txt".to_string(),
            target_suffix: String::new(),
            status: FileStatus {
                mode: 0o100644,
                uid: 1000,
                gid: 1000,
                dev: 0,
                blk_size: 4096,
                blk_count: 8,
                size: 12289,
            },
            id: 1,
        }];

        let msg = encode_transfer_request(&info).unwrap();
        assert!(msg.len() > CHUNK_HEADER_SIZE);

        let mut cursor = std::io::Cursor::new(msg.to_vec());
        let parsed = read_transfer_request(&mut cursor).await.unwrap();

        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].path, "a/b.txt");
        assert_eq!(parsed[0].status.size, 12289);
        assert_eq!(parsed[0].id, 1);
    }

    #[tokio::test]
    async fn test_transfer_request_frame_shape() {
        let msg = encode_transfer_request(&[]).unwrap();

        let header = ChunkHeader::decode(&msg).unwrap();
        assert_eq!(
            header.payload_length as usize,
            msg.len() - CHUNK_HEADER_SIZE
        );
    }
}
